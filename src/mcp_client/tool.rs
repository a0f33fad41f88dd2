//! Uniform invocable tool descriptors handed to the agent.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::errors::McpError;

/// Something a descriptor can dispatch an invocation to.
///
/// Remote provider tools, in-process closures and the usage tracker's
/// recording adapter all implement this, so callers never see a difference.
#[async_trait]
pub trait ToolTarget: Send + Sync {
    async fn call(&self, arguments: serde_json::Value) -> Result<serde_json::Value, McpError>;
}

/// One tool in the aggregated set.
#[derive(Clone)]
pub struct ToolDescriptor {
    name: String,
    provider: String,
    description: String,
    parameter_schema: serde_json::Value,
    target: Arc<dyn ToolTarget>,
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        provider: impl Into<String>,
        description: impl Into<String>,
        parameter_schema: serde_json::Value,
        target: Arc<dyn ToolTarget>,
    ) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            description: description.into(),
            parameter_schema,
            target,
        }
    }

    /// A descriptor backed by an in-process function.
    pub fn local<F>(
        name: &str,
        provider: &str,
        description: &str,
        parameter_schema: serde_json::Value,
        func: F,
    ) -> Self
    where
        F: Fn(serde_json::Value) -> Result<serde_json::Value, McpError> + Send + Sync + 'static,
    {
        Self::new(
            name,
            provider,
            description,
            parameter_schema,
            Arc::new(LocalTarget(func)),
        )
    }

    /// Name the agent calls the tool by.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provider the tool came from.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn parameter_schema(&self) -> &serde_json::Value {
        &self.parameter_schema
    }

    pub fn target(&self) -> Arc<dyn ToolTarget> {
        Arc::clone(&self.target)
    }

    /// Same tool, dispatched through `target` instead.
    pub fn with_target(&self, target: Arc<dyn ToolTarget>) -> Self {
        Self {
            target,
            ..self.clone()
        }
    }

    /// Prefix the name with its provider: `<provider>_<local>`.
    pub fn qualified(mut self) -> Self {
        self.name = format!("{}_{}", self.provider, self.name);
        self
    }

    /// Invoke the tool with JSON arguments.
    pub async fn invoke(&self, arguments: serde_json::Value) -> Result<serde_json::Value, McpError> {
        self.target.call(arguments).await
    }

    /// OpenAI function-calling representation.
    pub fn to_openai_tool(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameter_schema,
            }
        })
    }
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("provider", &self.provider)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

struct LocalTarget<F>(F);

#[async_trait]
impl<F> ToolTarget for LocalTarget<F>
where
    F: Fn(serde_json::Value) -> Result<serde_json::Value, McpError> + Send + Sync,
{
    async fn call(&self, arguments: serde_json::Value) -> Result<serde_json::Value, McpError> {
        (self.0)(arguments)
    }
}
