//! Everything between model text and an executable tool call: the catalog offered to the
//! model, directive extraction and masking, parameter normalization, and result rendering.

pub mod catalog;
pub mod directive;
pub mod format;
pub mod normalize;

pub use catalog::{
    follow_up_prompt, resolve_proxy_action, system_prompt, tool_catalog, validate_tool_schemas,
    ProxyAction, ProxyRequestError, ToolSchemaValidationError, FOLLOW_UP_INSTRUCTION,
    PROXY_ACTIONS,
};
pub use directive::{
    extract_directives, mask, native_calls, select_calls, visible_text, RawToolCall,
    DIRECTIVE_CLOSE, DIRECTIVE_OPEN,
};
pub use format::format_tool_results;
pub use normalize::{
    canonical_tool_name, ParameterNormalizer, DEFAULT_SEARCH_LIMIT, DEFAULT_SEARCH_QUERY,
    SEARCH_TOOL,
};
