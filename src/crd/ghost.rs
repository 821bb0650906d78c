//! Ghost Custom Resource Definition
//!
//! A Ghost describes one blog instance inside a tenant namespace. The operator
//! derives a PersistentVolumeClaim, a Deployment and a Service from it.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, GhostPhase};

/// Specification for a Ghost blog instance
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "blog.example.com",
    version = "v1",
    kind = "Ghost",
    plural = "ghosts",
    shortname = "gh",
    status = "GhostStatus",
    namespaced,
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.imageTag"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GhostSpec {
    /// Tag of the `ghost` container image to run (e.g. "5.1.0")
    pub image_tag: String,
}

impl GhostSpec {
    /// Validate the Ghost specification
    ///
    /// Tag format is not checked beyond producing a usable image reference.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.image_tag.is_empty() {
            return Err(crate::Error::validation("imageTag must not be empty"));
        }
        if self.image_tag.chars().any(char::is_whitespace) {
            return Err(crate::Error::validation(format!(
                "imageTag '{}' must not contain whitespace",
                self.image_tag
            )));
        }
        Ok(())
    }
}

impl Ghost {
    /// `namespace/name` key used in logs, errors and backoff bookkeeping
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }
}

/// Status for a Ghost
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GhostStatus {
    /// Current phase
    #[serde(default)]
    pub phase: GhostPhase,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Generation of the spec last reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Image reference currently requested from the Deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Conditions representing the Ghost state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl GhostStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: GhostPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Set the observed generation and return self for chaining
    pub fn observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// Set the image and return self for chaining
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Add a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }
}
