//! toolbridge: one tool set over many MCP providers.
//!
//! - [`mcp_client`]: provider connections, capability loading and the
//!   multi-provider manager.
//! - [`providers`]: the self-hosted math and weather providers.
//! - [`tracker`]: usage tracking around tool descriptors.
//! - [`launcher`]: HTTP API for starting and stopping helper processes.

pub mod config;
pub mod launcher;
pub mod logging;
pub mod mcp_client;
pub mod process;
pub mod providers;
pub mod tracker;

pub use config::Settings;
pub use mcp_client::{McpError, MultiProviderManager, ToolDescriptor};
pub use tracker::UsageTracker;
