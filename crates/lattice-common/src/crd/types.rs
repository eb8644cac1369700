//! Shared status types for Lattice Azure CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Per-resource condition whose status is a free-form value
///
/// Used to persist content checksums (`status` holds the hex digest) so that
/// resubmission decisions survive operator restarts.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCondition {
    /// Condition kind (e.g., "DeploymentTemplateChecksum")
    #[serde(rename = "type")]
    pub type_: String,

    /// Condition value
    pub status: String,

    /// Last time `status` changed
    pub last_transition_time: DateTime<Utc>,
}

/// Status entry for one named resource managed on behalf of a cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ResourceStatus {
    /// Resource name (e.g., the cloud deployment name)
    pub name: String,

    /// Conditions recorded for this resource
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ResourceCondition>,
}

impl ResourceStatus {
    /// Create an empty status entry for the named resource
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            conditions: Vec::new(),
        }
    }

    /// Look up the value of a condition by type
    pub fn condition(&self, type_: &str) -> Option<&str> {
        self.conditions
            .iter()
            .find(|c| c.type_ == type_)
            .map(|c| c.status.as_str())
    }

    /// Set a condition value, returning true if anything changed
    ///
    /// `lastTransitionTime` only moves when the value actually changes.
    pub fn set_condition(&mut self, type_: &str, status: &str) -> bool {
        match self.conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) if existing.status == status => false,
            Some(existing) => {
                existing.status = status.to_string();
                existing.last_transition_time = Utc::now();
                true
            }
            None => {
                self.conditions.push(ResourceCondition {
                    type_: type_.to_string(),
                    status: status.to_string(),
                    last_transition_time: Utc::now(),
                });
                true
            }
        }
    }
}
