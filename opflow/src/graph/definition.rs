//! Typed port schemas.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Opaque schema descriptor for record-shaped values.
///
/// The engine never reconstructs native types from this; implementations
/// interpret it at their boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSpec {
    pub name: String,
    /// Field name to primitive tag.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub defaults: BTreeMap<String, serde_json::Value>,
}

impl RecordSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
            defaults: BTreeMap::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, primitive: impl Into<String>) -> Self {
        self.fields.insert(name.into(), primitive.into());
        self
    }
}

/// A named typed port. The name is the network-wide identity: values whose
/// definitions share a name may be routed between operations.
///
/// `lock` marks inputs of this definition as requiring exclusive acquisition
/// for the duration of an operation invocation within a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    /// May be omitted in a linked descriptor's definitions table, where the
    /// table key supplies it.
    #[serde(default)]
    pub name: String,
    pub primitive: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub lock: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<RecordSpec>,
}

impl Definition {
    pub fn new(name: impl Into<String>, primitive: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            primitive: primitive.into(),
            lock: false,
            spec: None,
        })
    }

    /// A definition whose inputs require exclusive acquisition.
    pub fn new_locked(name: impl Into<String>, primitive: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            primitive: primitive.into(),
            lock: true,
            spec: None,
        })
    }

    pub fn with_spec(name: impl Into<String>, primitive: impl Into<String>, spec: RecordSpec) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            primitive: primitive.into(),
            lock: false,
            spec: Some(spec),
        })
    }
}
