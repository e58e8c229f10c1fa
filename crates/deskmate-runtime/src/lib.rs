pub mod mcp;

pub use mcp::{
    parse_rpc_body, McpToolInvoker, ToolBackend, UnconfiguredToolBackend, DEFAULT_MCP_TIMEOUT,
    MCP_PROTOCOL_VERSION, MCP_SESSION_HEADER,
};
