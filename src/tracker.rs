//! In-memory tool usage tracking.
//!
//! `UsageTracker::wrap` returns descriptors with the same invocation
//! contract whose target first records the call and then delegates to the
//! original target. Counters are process-local and not persisted.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::mcp_client::{McpError, ToolDescriptor, ToolTarget};

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageRecord {
    pub tool_name: String,
    pub arguments: serde_json::Value,
    /// Position in this tracker's call order, starting at 1.
    pub ordinal: u64,
    pub called_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct TrackerState {
    totals: BTreeMap<String, u64>,
    session: Vec<UsageRecord>,
    next_ordinal: u64,
}

/// Records tool invocations. Cloning yields another handle to the same state.
#[derive(Debug, Clone)]
pub struct UsageTracker {
    name: Arc<str>,
    state: Arc<Mutex<TrackerState>>,
}

impl UsageTracker {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            state: Arc::new(Mutex::new(TrackerState::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wrap every descriptor so its invocations are recorded here.
    pub fn wrap(&self, tools: Vec<ToolDescriptor>) -> Vec<ToolDescriptor> {
        let wrapped: Vec<ToolDescriptor> = tools
            .into_iter()
            .map(|tool| {
                let target = TrackedTarget {
                    tracker: self.clone(),
                    tool_name: tool.name().to_string(),
                    inner: tool.target(),
                };
                tool.with_target(Arc::new(target))
            })
            .collect();
        tracing::info!(tracker = %self.name, tools = wrapped.len(), "wrapped tools with tracking");
        wrapped
    }

    /// Record one call of `tool_name`.
    pub fn track(&self, tool_name: &str, arguments: &serde_json::Value) {
        let ordinal = {
            let mut state = self.lock();
            state.next_ordinal += 1;
            let ordinal = state.next_ordinal;
            *state.totals.entry(tool_name.to_string()).or_default() += 1;
            state.session.push(UsageRecord {
                tool_name: tool_name.to_string(),
                arguments: arguments.clone(),
                ordinal,
                called_at: Utc::now(),
            });
            ordinal
        };
        tracing::info!(
            tracker = %self.name,
            tool = %tool_name,
            ordinal,
            args = %arguments,
            "tool called"
        );
    }

    /// Session records in invocation order.
    pub fn records(&self) -> Vec<UsageRecord> {
        self.lock().session.clone()
    }

    /// Tool names of the session, in invocation order.
    pub fn used_tools(&self) -> Vec<String> {
        self.lock()
            .session
            .iter()
            .map(|r| r.tool_name.clone())
            .collect()
    }

    /// Running totals per tool, kept across `clear()`.
    pub fn usage_stats(&self) -> BTreeMap<String, u64> {
        self.lock().totals.clone()
    }

    pub fn total_for(&self, tool_name: &str) -> u64 {
        self.lock().totals.get(tool_name).copied().unwrap_or(0)
    }

    /// Start a new session; totals and ordinals carry on.
    pub fn clear(&self) {
        self.lock().session.clear();
    }

    /// Forget everything.
    pub fn reset(&self) {
        *self.lock() = TrackerState::default();
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        // Every update completes before the guard drops, so poisoned state is still whole.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct TrackedTarget {
    tracker: UsageTracker,
    tool_name: String,
    inner: Arc<dyn ToolTarget>,
}

#[async_trait]
impl ToolTarget for TrackedTarget {
    async fn call(&self, arguments: serde_json::Value) -> Result<serde_json::Value, McpError> {
        self.tracker.track(&self.tool_name, &arguments);
        self.inner.call(arguments).await
    }
}
