//! Multi-provider manager: one unified tool set over many providers.
//!
//! Orchestrates provider connections, capability aggregation and teardown.
//! From the caller's point of view the manager is either fully open or fully
//! closed: a failed `open()` rolls back every connection it started before
//! returning, and `close()` always attempts every connection.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;

use super::connection::{Connection, ConnectionState};
use super::errors::McpError;
use super::loader;
use super::tool::ToolDescriptor;
use super::types::ProviderSpec;
use crate::config::{ProviderResolution, Settings};

/// Whether the manager currently holds an open provider set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateState {
    Closed,
    Open,
}

/// Holds a named set of provider connections and their aggregated tools.
pub struct MultiProviderManager {
    settings: Settings,
    /// Open connections, in open (declaration) order.
    connections: Vec<Connection>,
    /// Aggregated tools, cached until the next `open()`/`close()`.
    tools: Option<Vec<ToolDescriptor>>,
    state: AggregateState,
}

impl MultiProviderManager {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            connections: Vec::new(),
            tools: None,
            state: AggregateState::Closed,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn state(&self) -> AggregateState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == AggregateState::Open
    }

    /// Names of the open providers, in open order.
    pub fn providers(&self) -> Vec<&str> {
        self.connections.iter().map(Connection::name).collect()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect to every named provider.
    ///
    /// Every name is resolved before any connection is attempted. Providers
    /// missing a credential are dropped with a warning. Opens run
    /// concurrently; if any fails, all are closed again in reverse order and
    /// the first failure (in declaration order) is returned.
    pub async fn open<S: AsRef<str>>(&mut self, names: &[S]) -> Result<(), McpError> {
        // A rejected name list leaves the current set untouched.
        let specs = self.resolve_all(names)?;

        if self.is_open() {
            tracing::info!("reopening provider set");
            if let Err(e) = self.close().await {
                tracing::warn!(error = %e, "errors closing previous provider set");
            }
        }

        let mut connections: Vec<Connection> = specs
            .into_iter()
            .map(|spec| Connection::new(Arc::new(spec), self.settings.timeouts()))
            .collect();

        let results = join_all(connections.iter_mut().map(Connection::open)).await;

        let first_failure = connections
            .iter()
            .zip(results)
            .find_map(|(conn, result)| result.err().map(|e| (conn.name().to_string(), e)));

        if let Some((provider, source)) = first_failure {
            tracing::error!(
                provider = %provider,
                error = %source,
                "provider set failed to open, rolling back"
            );
            let failures = close_in_reverse(&mut connections).await;
            for (name, reason) in &failures {
                tracing::error!(provider = %name, reason = %reason, "rollback close failed");
            }
            return Err(McpError::ManagerConnect {
                provider,
                source: Box::new(source),
            });
        }

        tracing::info!(
            providers = ?connections.iter().map(Connection::name).collect::<Vec<_>>(),
            "provider set open"
        );
        self.connections = connections;
        self.tools = None;
        self.state = AggregateState::Open;
        Ok(())
    }

    /// Close every connection in reverse open order. Idempotent.
    ///
    /// Failures are collected so one provider cannot block another's close.
    pub async fn close(&mut self) -> Result<(), McpError> {
        self.tools = None;
        self.state = AggregateState::Closed;

        let mut connections = std::mem::take(&mut self.connections);
        if connections.is_empty() {
            return Ok(());
        }

        let failures = close_in_reverse(&mut connections).await;
        if failures.is_empty() {
            tracing::info!(count = connections.len(), "provider set closed");
            Ok(())
        } else {
            Err(McpError::CloseFailed { failures })
        }
    }

    // ─── Aggregation ─────────────────────────────────────────────────────

    /// The merged tool set of every open provider, in declaration order.
    ///
    /// Local names that collide across providers are qualified as
    /// `<provider>_<local>`.
    pub async fn get_tools(&mut self) -> Result<Vec<ToolDescriptor>, McpError> {
        if !self.is_open() {
            return Err(McpError::NotConnected {
                reason: "provider set is not open".into(),
            });
        }
        if let Some(tools) = &self.tools {
            return Ok(tools.clone());
        }

        let loaded = join_all(self.connections.iter().map(loader::load)).await;

        let mut per_provider = Vec::with_capacity(loaded.len());
        for (conn, result) in self.connections.iter().zip(loaded) {
            let tools = result?;
            tracing::info!(provider = %conn.name(), tools = tools.len(), "loaded tools");
            per_provider.push(tools);
        }

        let tools = qualify_collisions(per_provider);
        tracing::info!(total = tools.len(), "total tools loaded");

        self.tools = Some(tools.clone());
        Ok(tools)
    }

    // ─── Scoped Use ──────────────────────────────────────────────────────

    /// Open `names`, hand the tool set to `f`, and always close afterwards.
    ///
    /// Returns `f`'s error if it failed, otherwise the close error if closing
    /// failed, otherwise `f`'s value.
    pub async fn scoped<S, F, Fut, T, E>(settings: Settings, names: &[S], f: F) -> Result<T, E>
    where
        S: AsRef<str>,
        F: FnOnce(Vec<ToolDescriptor>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<McpError>,
    {
        let mut manager = Self::new(settings);
        manager.open(names).await?;

        let tools = match manager.get_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                if let Err(close_err) = manager.close().await {
                    tracing::error!(error = %close_err, "close after failed tool load");
                }
                return Err(e.into());
            }
        };

        let outcome = f(tools).await;
        let closed = manager.close().await;

        match (outcome, closed) {
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    tracing::error!(error = %close_err, "close after failed scope");
                }
                Err(e)
            }
            (Ok(_), Err(close_err)) => Err(close_err.into()),
            (Ok(value), Ok(())) => Ok(value),
        }
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn resolve_all<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<ProviderSpec>, McpError> {
        let mut seen = HashSet::new();
        let mut specs = Vec::new();

        for name in names.iter().map(AsRef::as_ref) {
            if !seen.insert(name) {
                tracing::debug!(provider = %name, "ignoring duplicate provider name");
                continue;
            }
            match self.settings.resolve_provider(name)? {
                ProviderResolution::Ready(spec) => specs.push(spec),
                ProviderResolution::MissingCredential(var) => {
                    tracing::warn!(
                        provider = %name,
                        credential = %var,
                        "provider requires a credential that is not set, skipping"
                    );
                }
            }
        }

        if specs.is_empty() {
            return Err(McpError::NoProvidersConfigured {
                requested: names.iter().map(|n| n.as_ref().to_string()).collect(),
            });
        }
        Ok(specs)
    }
}

impl Drop for MultiProviderManager {
    fn drop(&mut self) {
        let still_open = self
            .connections
            .iter()
            .filter(|c| c.state() == ConnectionState::Open)
            .count();
        if still_open > 0 {
            tracing::warn!(
                connections = still_open,
                "provider manager dropped while open; child processes are killed on drop"
            );
        }
    }
}

/// Close connections last-to-first, collecting failures.
async fn close_in_reverse(connections: &mut [Connection]) -> Vec<(String, String)> {
    let mut failures = Vec::new();
    for conn in connections.iter_mut().rev() {
        if let Err(e) = conn.close().await {
            failures.push((conn.name().to_string(), e.to_string()));
        }
    }
    failures
}

/// Flatten per-provider tool lists, qualifying names seen more than once.
fn qualify_collisions(per_provider: Vec<Vec<ToolDescriptor>>) -> Vec<ToolDescriptor> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for tool in per_provider.iter().flatten() {
        *counts.entry(tool.name().to_string()).or_default() += 1;
    }

    per_provider
        .into_iter()
        .flatten()
        .map(|tool| {
            if counts.get(tool.name()).copied().unwrap_or(0) > 1 {
                tool.qualified()
            } else {
                tool
            }
        })
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
