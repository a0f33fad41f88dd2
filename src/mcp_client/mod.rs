//! MCP client: connections to tool providers and the aggregated tool set.
//!
//! This module handles:
//! - JSON-RPC 2.0 over provider stdio and over an HTTP event stream
//! - The per-provider connection state machine and `initialize` handshake
//! - Tool discovery (`tools/list`) and remote invocation (`tools/call`)
//! - Opening, aggregating and tearing down a named set of providers

pub mod connection;
pub mod errors;
pub mod loader;
pub mod manager;
pub mod sse;
pub mod tool;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use connection::{Connection, ConnectionState, Session, Timeouts};
pub use errors::McpError;
pub use manager::{AggregateState, MultiProviderManager};
pub use tool::{ToolDescriptor, ToolTarget};
pub use types::{McpToolDefinition, ProviderSpec, TransportKind};
