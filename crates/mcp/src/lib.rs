//! MCP adapter: tools, resources and prompts exposed to an external LLM
//! host over a JSON-RPC-like envelope.

mod adapter;
mod prompts;
mod resources;
mod types;

pub use adapter::McpAdapter;
pub use prompts::{PromptCatalog, PromptTemplate};
pub use resources::ResourceCatalog;
pub use types::{
    CallToolResult, ContentBlock, McpErrorBody, McpRequest, McpResponse, PromptDescriptor,
    ResourceDescriptor, PROTOCOL_VERSION, SERVER_NAME,
};

/// Exit codes for standalone invocations of the adapter binary.
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const CONFIG_ERROR: i32 = 2;
    pub const RUNTIME_FAILURE: i32 = 3;
}
