use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    /// Role as sent to the model. Anything that is not `system` or `assistant` is a user turn.
    pub fn wire_role(&self) -> &'static str {
        match self.role.trim().to_ascii_lowercase().as_str() {
            "system" => "system",
            "assistant" => "assistant",
            _ => "user",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_roles_are_sent_as_user() {
        assert_eq!(ChatMessage::new("Assistant", "x").wire_role(), "assistant");
        assert_eq!(ChatMessage::new("system", "x").wire_role(), "system");
        assert_eq!(ChatMessage::new("tool", "x").wire_role(), "user");
        assert_eq!(ChatMessage::new("", "x").wire_role(), "user");
    }
}
