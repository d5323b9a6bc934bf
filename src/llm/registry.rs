use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

use crate::llm::types::{ToolDef, ToolFunctionDef};

/// Execution side of a tool. Implementations live with the caller; the core
/// only ever passes decoded argument maps through.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn execute(&self, args: serde_json::Value) -> Result<serde_json::Value>;
}

/// Validator-object parameter form: anything that can render itself as a
/// canonical JSON-Schema value.
pub trait CanonicalSchema: Send + Sync {
    fn to_canonical_schema(&self) -> serde_json::Value;
}

/// Tool parameter shapes arrive in two forms; both normalize to one
/// JSON-Schema value before anything is put on the wire.
#[derive(Clone)]
pub enum ToolParameters {
    /// Plain JSON-Schema object.
    Schema(serde_json::Value),
    /// Validator object exposing its schema on demand.
    Validator(Arc<dyn CanonicalSchema>),
}

impl ToolParameters {
    pub fn canonical(&self) -> serde_json::Value {
        match self {
            ToolParameters::Schema(v) => v.clone(),
            ToolParameters::Validator(v) => v.to_canonical_schema(),
        }
    }
}

impl fmt::Debug for ToolParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolParameters::Schema(v) => f.debug_tuple("Schema").field(v).finish(),
            ToolParameters::Validator(_) => f.write_str("Validator(..)"),
        }
    }
}

#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: ToolParameters,
    pub handler: Arc<dyn ToolHandler>,
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("parameters", &self.parameters)
            .finish()
    }
}

/// Per-run tool set. Names are unique within a run; on collision the first
/// registration wins.
pub struct ToolRegistry {
    tools: Vec<ToolDescriptor>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<ToolDescriptor>) -> Self {
        let mut kept = Vec::with_capacity(tools.len());
        let mut by_name = HashMap::new();
        for tool in tools {
            if by_name.contains_key(&tool.name) {
                warn!(tool = %tool.name, "duplicate tool name ignored");
                continue;
            }
            by_name.insert(tool.name.clone(), kept.len());
            kept.push(tool);
        }
        Self {
            tools: kept,
            by_name,
        }
    }

    pub fn empty() -> Self {
        Self::new(vec![])
    }

    pub fn resolve(&self, name: &str) -> Option<&ToolDescriptor> {
        self.by_name.get(name).map(|&i| &self.tools[i])
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Wire-shape tool definitions with normalized parameter schemas.
    pub fn to_defs(&self) -> Vec<ToolDef> {
        self.tools
            .iter()
            .map(|t| ToolDef {
                kind: "function".into(),
                function: ToolFunctionDef {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.canonical(),
                },
            })
            .collect()
    }
}
