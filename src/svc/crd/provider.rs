//! # Provider
//!
//! This module provide the provider custom resource which references the
//! secret holding the cloud provider credentials. A provider is shared by any
//! number of instances of the same namespace.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------------
// Constants

pub const DEFAULT_CREDENTIALS_KEY: &str = "credentials";

// -----------------------------------------------------------------------------
// SecretKeyReference structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct SecretKeyReference {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "key", default = "SecretKeyReference::default_key")]
    pub key: String,
}

impl SecretKeyReference {
    fn default_key() -> String {
        DEFAULT_CREDENTIALS_KEY.to_string()
    }
}

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
#[kube(group = "azure.database-operator.dev")]
#[kube(version = "v1alpha1")]
#[kube(kind = "Provider")]
#[kube(singular = "provider")]
#[kube(plural = "providers")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
#[kube(
    printcolumn = r#"{"name":"secret", "type":"string", "description":"Secret", "jsonPath":".spec.authSecret.name"}"#
)]
pub struct Spec {
    #[serde(rename = "authSecret")]
    pub auth_secret: SecretKeyReference,
}
