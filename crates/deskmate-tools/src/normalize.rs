use serde_json::{json, Map, Value};

use deskmate_types::ToolCall;

use crate::directive::RawToolCall;

pub const SEARCH_TOOL: &str = "search_private_desk";
pub const DEFAULT_SEARCH_QUERY: &str = "最近";
pub const DEFAULT_SEARCH_LIMIT: u64 = 5;

const TOOL_ALIASES: &[(&str, &str)] = &[("search_diary", SEARCH_TOOL)];

pub fn canonical_tool_name(name: &str) -> String {
    let trimmed = name.trim();
    TOOL_ALIASES
        .iter()
        .find(|(alias, _)| *alias == trimmed)
        .map(|(_, canonical)| (*canonical).to_string())
        .unwrap_or_else(|| trimmed.to_string())
}

/// Turns raw tool requests into executable calls. Applying it to its own output changes
/// nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterNormalizer {
    default_search_query: String,
    default_search_limit: u64,
}

impl Default for ParameterNormalizer {
    fn default() -> Self {
        Self {
            default_search_query: DEFAULT_SEARCH_QUERY.to_string(),
            default_search_limit: DEFAULT_SEARCH_LIMIT,
        }
    }
}

impl ParameterNormalizer {
    pub fn new(default_search_query: &str, default_search_limit: u64) -> Self {
        let defaults = Self::default();
        let query = default_search_query.trim();
        Self {
            default_search_query: if query.is_empty() {
                defaults.default_search_query
            } else {
                query.to_string()
            },
            default_search_limit: if default_search_limit == 0 {
                defaults.default_search_limit
            } else {
                default_search_limit
            },
        }
    }

    pub fn normalize(&self, raw: RawToolCall) -> ToolCall {
        let (name, payload) = match raw {
            RawToolCall::Directive { name, params } => (name, params),
            RawToolCall::Native { name, arguments } => (name, arguments),
        };
        let name = canonical_tool_name(&name);
        let params = coerce_params(&name, payload);
        self.finish(name, params)
    }

    pub fn normalize_call(&self, call: ToolCall) -> ToolCall {
        let name = canonical_tool_name(&call.name);
        self.finish(name, call.params)
    }

    pub fn normalize_all(&self, raw: Vec<RawToolCall>) -> Vec<ToolCall> {
        raw.into_iter().map(|call| self.normalize(call)).collect()
    }

    fn finish(&self, name: String, mut params: Map<String, Value>) -> ToolCall {
        if name == SEARCH_TOOL {
            self.apply_search_defaults(&mut params);
        }
        ToolCall::new(name, params)
    }

    fn apply_search_defaults(&self, params: &mut Map<String, Value>) {
        let query = match params.get("query") {
            Some(Value::String(query)) if !query.trim().is_empty() => Value::String(query.clone()),
            Some(Value::Number(n)) => Value::String(n.to_string()),
            _ => Value::String(self.default_search_query.clone()),
        };
        params.insert("query".to_string(), query);

        let limit = params
            .get("limit")
            .and_then(positive_limit)
            .unwrap_or(self.default_search_limit);
        params.insert("limit".to_string(), json!(limit));
    }
}

fn positive_limit(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 1.0).map(|f| f as u64))
            .filter(|limit| *limit > 0),
        Value::String(raw) => raw.trim().parse::<u64>().ok().filter(|limit| *limit > 0),
        _ => None,
    }
}

fn coerce_params(name: &str, payload: Value) -> Map<String, Value> {
    match payload {
        Value::Object(map) => map,
        Value::String(raw) => match serde_json::from_str::<Value>(raw.trim()) {
            Ok(Value::Object(map)) => map,
            Ok(Value::String(inner)) => bare_query(name, &inner),
            Ok(_) => Map::new(),
            Err(_) => bare_query(name, &raw),
        },
        _ => Map::new(),
    }
}

/// A plain-text argument only means something to the search tool.
fn bare_query(name: &str, raw: &str) -> Map<String, Value> {
    let mut params = Map::new();
    let trimmed = raw.trim();
    if name == SEARCH_TOOL && !trimmed.is_empty() {
        params.insert("query".to_string(), Value::String(trimmed.to_string()));
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directive(name: &str, params: Value) -> RawToolCall {
        RawToolCall::Directive {
            name: name.to_string(),
            params,
        }
    }

    #[test]
    fn search_alias_gets_default_query_and_limit() {
        let call = ParameterNormalizer::default().normalize(directive("search_diary", json!({})));
        assert_eq!(call.name, SEARCH_TOOL);
        assert_eq!(
            Value::Object(call.params),
            json!({"query": "最近", "limit": 5})
        );
    }

    #[test]
    fn search_limit_is_coerced() {
        let normalizer = ParameterNormalizer::default();
        for (limit, expected) in [
            (json!("3"), 3),
            (json!(0), 5),
            (json!(-2), 5),
            (json!("many"), 5),
            (json!(null), 5),
            (json!(7), 7),
        ] {
            let call =
                normalizer.normalize(directive(SEARCH_TOOL, json!({"query": "x", "limit": limit})));
            assert_eq!(call.params["limit"], json!(expected));
        }
    }

    #[test]
    fn blank_query_falls_back_to_default() {
        let call = ParameterNormalizer::new("today", 2)
            .normalize(directive(SEARCH_TOOL, json!({"query": "   "})));
        assert_eq!(call.params["query"], json!("today"));
        assert_eq!(call.params["limit"], json!(2));
    }

    #[test]
    fn native_string_arguments_are_parsed() {
        let normalizer = ParameterNormalizer::default();
        let call = normalizer.normalize(RawToolCall::Native {
            name: "read_diary".to_string(),
            arguments: json!("{\"id\": 12}"),
        });
        assert_eq!(Value::Object(call.params), json!({"id": 12}));

        let call = normalizer.normalize(RawToolCall::Native {
            name: "search_diary".to_string(),
            arguments: json!("weekly report"),
        });
        assert_eq!(call.params["query"], json!("weekly report"));

        let call = normalizer.normalize(RawToolCall::Native {
            name: "read_wiki".to_string(),
            arguments: json!("not json"),
        });
        assert!(call.params.is_empty());
    }

    #[test]
    fn non_object_payloads_become_empty_params() {
        let call = ParameterNormalizer::default().normalize(directive("read_wiki", json!([1, 2])));
        assert!(call.params.is_empty());
    }

    #[test]
    fn normalization_is_idempotent() {
        let normalizer = ParameterNormalizer::default();
        let inputs = vec![
            directive("search_diary", json!({})),
            directive(SEARCH_TOOL, json!({"query": 12, "limit": "4"})),
            directive("read_diary", json!({"id": 3})),
            RawToolCall::Native {
                name: " search_diary ".to_string(),
                arguments: json!("\"quoted\""),
            },
        ];
        for raw in inputs {
            let once = normalizer.normalize(raw);
            let twice = normalizer.normalize_call(once.clone());
            assert_eq!(twice, once);
            let via_raw = normalizer.normalize(directive(
                &once.name,
                Value::Object(once.params.clone()),
            ));
            assert_eq!(via_raw, once);
        }
    }
}
