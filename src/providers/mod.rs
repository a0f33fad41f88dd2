//! Self-hosted tool providers and the transports that serve them.
//!
//! Each provider is an explicit `ProviderRegistry` table. `server` binds a
//! registry to an HTTP event-stream endpoint; `stdio` binds it to the
//! process's standard streams.

pub mod math;
pub mod registry;
pub mod server;
pub mod stdio;
pub mod weather;

pub use registry::{handle_message, ProviderRegistry, ToolFailure};
pub use server::{serve_sse, SseServer};
pub use stdio::serve_stdio;

/// Registry for a self-hosted provider name, if there is one.
pub fn builtin(name: &str) -> Option<ProviderRegistry> {
    match name {
        "math" => Some(math::registry()),
        "weather" => Some(weather::registry()),
        _ => None,
    }
}
