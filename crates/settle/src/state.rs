//! Local view of a managed resource
//!
//! `ResourceData` is what the lifecycle controller reads from and writes
//! back to: the identifier tying it to a remote resource, the last observed
//! lifecycle state, and a loose attribute map filled by the kind's
//! flattening code.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// State of a single resource as seen by the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceData {
    /// Remote identifier; `None` until created, or once the resource is gone
    id: Option<String>,

    /// Resource kind (e.g. "ebs_volume")
    pub kind: String,

    /// Set while the resource is being created in this run
    #[serde(default)]
    pub is_new: bool,

    /// Last observed lifecycle state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// Resource attributes (size, zone, tags, ...)
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl ResourceData {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: None,
            kind: kind.into(),
            is_new: false,
            status: None,
            attributes: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    /// Data for an already existing resource
    pub fn existing(kind: impl Into<String>, id: impl Into<String>) -> Self {
        let mut data = Self::new(kind);
        data.set_id(id);
        data
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        let id = id.into();
        self.id = (!id.is_empty()).then_some(id);
        self.updated_at = Utc::now();
    }

    /// Forget the remote resource; the host treats this as "gone"
    pub fn clear_id(&mut self) {
        self.id = None;
        self.status = None;
        self.updated_at = Utc::now();
    }

    pub fn set_status(&mut self, status: Option<&str>) {
        self.status = status.map(str::to_string);
        self.updated_at = Utc::now();
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.attributes.insert(key.into(), value);
        self.updated_at = Utc::now();
    }

    pub fn attribute(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }

    pub fn get_attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Whether `key` differs from `prior`. A missing attribute and an
    /// explicit null compare equal.
    pub fn has_change(&self, prior: &ResourceData, key: &str) -> bool {
        let null = serde_json::Value::Null;
        self.attribute(key).unwrap_or(&null) != prior.attribute(key).unwrap_or(&null)
    }

    /// Whether any of `keys` differs from `prior`
    pub fn has_changes<S: AsRef<str>>(&self, prior: &ResourceData, keys: &[S]) -> bool {
        keys.iter().any(|k| self.has_change(prior, k.as_ref()))
    }
}
