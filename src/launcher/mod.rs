//! Process launcher: starts arbitrary commands on request, tracks them by id,
//! exposes their output, and terminates them.

pub mod api;
pub mod errors;
pub mod table;

pub use api::{router, serve};
pub use errors::LauncherError;
pub use table::{LaunchRequest, ProcessDetail, ProcessEvent, ProcessInfo, ProcessTable};
