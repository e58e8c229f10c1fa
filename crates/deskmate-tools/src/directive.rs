use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use deskmate_types::NativeToolCall;

pub const DIRECTIVE_OPEN: &str = "[TOOL_CALL]";
pub const DIRECTIVE_CLOSE: &str = "[/TOOL_CALL]";

/// A tool request before normalization, tagged with the channel it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub enum RawToolCall {
    /// `[TOOL_CALL]{"name": ..., "params": ...}[/TOOL_CALL]` written into the text.
    Directive { name: String, params: Value },
    /// A `message.tool_calls` entry; `arguments` may still be a JSON-encoded string.
    Native { name: String, arguments: Value },
}

impl RawToolCall {
    pub fn name(&self) -> &str {
        match self {
            RawToolCall::Directive { name, .. } | RawToolCall::Native { name, .. } => name,
        }
    }
}

fn directive_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)\[TOOL_CALL\]\s*(.*?)\s*\[/TOOL_CALL\]")
            .unwrap_or_else(|_| Regex::new("$^").expect("regex"))
    })
}

/// Every well-formed directive block in `text`, in order of appearance. Blocks whose body is
/// not a JSON object with `name` and `params` are logged and skipped.
pub fn extract_directives(text: &str) -> Vec<RawToolCall> {
    directive_regex()
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .filter_map(|body| parse_directive_body(body.as_str()))
        .collect()
}

fn parse_directive_body(body: &str) -> Option<RawToolCall> {
    let body = strip_code_fence(body);
    let value = match serde_json::from_str::<Value>(body) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(
                "skipping tool directive with invalid JSON ({}): {}",
                err,
                body.chars().take(200).collect::<String>()
            );
            return None;
        }
    };
    let name = value
        .get("name")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|name| !name.is_empty());
    let params = value.get("params").filter(|p| !p.is_null());
    match (name, params) {
        (Some(name), Some(params)) => Some(RawToolCall::Directive {
            name: name.to_string(),
            params: params.clone(),
        }),
        _ => {
            tracing::warn!(
                "skipping tool directive without name/params: {}",
                body.chars().take(200).collect::<String>()
            );
            None
        }
    }
}

fn strip_code_fence(body: &str) -> &str {
    let mut inner = body.trim();
    if let Some(rest) = inner.strip_prefix("```") {
        // drop the info string (`json`) along with the opening fence
        inner = rest.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
    }
    if let Some(rest) = inner.trim_end().strip_suffix("```") {
        inner = rest;
    }
    inner.trim()
}

/// Removes every directive block, markers included. Removal repeats until nothing matches, so
/// a block spliced together by an earlier removal is removed too.
pub fn mask(text: &str) -> String {
    let mut current = text.to_string();
    loop {
        let next = directive_regex().replace_all(&current, "").into_owned();
        if next == current {
            return next;
        }
        current = next;
    }
}

/// `mask`, then drops everything from a leftover `[TOOL_CALL]` to the end. After masking, an
/// open marker that remains has no close marker after it, so it is a directive the model never
/// finished.
pub fn visible_text(text: &str) -> String {
    let mut masked = mask(text);
    if let Some(start) = masked.find(DIRECTIVE_OPEN) {
        masked.truncate(start);
        masked.truncate(masked.trim_end().len());
    }
    masked
}

pub fn native_calls(calls: &[NativeToolCall]) -> Vec<RawToolCall> {
    calls
        .iter()
        .map(|call| RawToolCall::Native {
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        })
        .collect()
}

/// Directive calls win; native calls are used only when the text carried none.
pub fn select_calls(directives: Vec<RawToolCall>, native: Vec<RawToolCall>) -> Vec<RawToolCall> {
    if directives.is_empty() {
        native
    } else {
        directives
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn contains_directive(text: &str) -> bool {
        directive_regex().is_match(text)
    }

    const TWO_BLOCKS: &str = "Let me look.\n[TOOL_CALL]\n{\"name\": \"search_private_desk\", \"params\": {\"query\": \"進捗\", \"limit\": 3}}\n[/TOOL_CALL]\nand\n[TOOL_CALL]{\"name\":\"read_diary\",\"params\":{\"id\":42}}[/TOOL_CALL] done";

    #[test]
    fn extracts_blocks_in_order() {
        let calls = extract_directives(TWO_BLOCKS);
        assert_eq!(
            calls,
            vec![
                RawToolCall::Directive {
                    name: "search_private_desk".to_string(),
                    params: json!({"query": "進捗", "limit": 3}),
                },
                RawToolCall::Directive {
                    name: "read_diary".to_string(),
                    params: json!({"id": 42}),
                },
            ]
        );
    }

    #[test]
    fn malformed_block_is_skipped_and_scanning_continues() {
        let text = "[TOOL_CALL]{not json}[/TOOL_CALL][TOOL_CALL]{\"name\":\"x\"}[/TOOL_CALL][TOOL_CALL]{\"name\":\"read_wiki\",\"params\":{\"id\":1}}[/TOOL_CALL]";
        let calls = extract_directives(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name(), "read_wiki");
    }

    #[test]
    fn fenced_body_is_unwrapped() {
        let text = "[TOOL_CALL]\n```json\n{\"name\":\"read_diary\",\"params\":{\"id\":7}}\n```\n[/TOOL_CALL]";
        let calls = extract_directives(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name(), "read_diary");
    }

    #[test]
    fn mask_removes_blocks_and_markers() {
        let masked = mask(TWO_BLOCKS);
        assert_eq!(masked, "Let me look.\n\nand\n done");
        assert!(!masked.contains(DIRECTIVE_OPEN));
        assert!(!masked.contains(DIRECTIVE_CLOSE));
    }

    #[test]
    fn mask_is_idempotent() {
        let samples = [
            TWO_BLOCKS,
            "no directives at all",
            "[TOOL_CALL]unterminated",
            "[TOOL_[TOOL_CALL]x[/TOOL_CALL]CALL]inner[/TOOL_CALL]",
            "[TOOL_CALL][TOOL_CALL]a[/TOOL_CALL]b[/TOOL_CALL]",
            "",
        ];
        for sample in samples {
            let once = mask(sample);
            assert_eq!(mask(&once), once, "sample: {sample}");
            assert!(!contains_directive(&once), "sample: {sample}");
        }
    }

    #[test]
    fn mask_keeps_unterminated_blocks_visible() {
        assert_eq!(mask("see [TOOL_CALL] soon"), "see [TOOL_CALL] soon");
    }

    #[test]
    fn visible_text_drops_a_cut_off_directive() {
        let cut_off = "Let me check.\n[TOOL_CALL]\n{\"name\": \"search_private_desk\", \"par";
        assert_eq!(visible_text(cut_off), "Let me check.");
        assert_eq!(
            visible_text("a [TOOL_CALL]{}[/TOOL_CALL] b [TOOL_CALL] c"),
            "a  b"
        );
        assert_eq!(visible_text("stray [/TOOL_CALL] marker"), "stray [/TOOL_CALL] marker");
        assert_eq!(visible_text("plain answer"), "plain answer");
        let once = visible_text(cut_off);
        assert_eq!(visible_text(&once), once);
        assert!(!once.contains(DIRECTIVE_OPEN));
    }

    #[test]
    fn directives_win_over_native_calls() {
        let native = native_calls(&[NativeToolCall {
            name: "read_wiki".to_string(),
            arguments: json!({"id": 1}),
        }]);
        let directives = extract_directives(TWO_BLOCKS);
        let chosen = select_calls(directives.clone(), native.clone());
        assert_eq!(chosen, directives);
        assert_eq!(select_calls(Vec::new(), native.clone()), native);
        assert!(select_calls(Vec::new(), Vec::new()).is_empty());
    }
}
