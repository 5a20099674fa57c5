//! # Secret module
//!
//! This module provide helpers to generate and publish the connection secret
//! of a custom resource

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{ObjectMeta, Patch, PatchParams, PostParams},
    Api, Client, CustomResourceExt, ResourceExt,
};
use rand::{distr::Alphanumeric, Rng};
use tracing::debug;

use crate::svc::k8s::resource;

// -----------------------------------------------------------------------------
// Constants

pub const PASSWORD_LENGTH: usize = 32;

// -----------------------------------------------------------------------------
// Helpers functions

/// returns a secret owned by the given object, kubernetes garbage collects it
/// alongside its owner
pub fn new<T>(obj: &T, name: &str, entries: BTreeMap<String, String>) -> Secret
where
    T: ResourceExt + CustomResourceExt,
{
    let metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: obj.namespace(),
        owner_references: resource::owner_reference(obj).map(|owner| vec![owner]),
        ..Default::default()
    };

    Secret {
        metadata,
        string_data: Some(entries),
        ..Default::default()
    }
}

/// returns a random alphanumeric password of the given length
pub fn password(length: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// returns the entries of the secret, `stringData` takes precedence over
/// `data` as the api server does on write
pub fn decode(secret: &Secret) -> BTreeMap<String, String> {
    let mut entries: BTreeMap<String, String> = secret
        .data
        .iter()
        .flatten()
        .map(|(key, value)| (key.to_owned(), String::from_utf8_lossy(&value.0).to_string()))
        .collect();

    if let Some(string_data) = &secret.string_data {
        entries.extend(string_data.to_owned());
    }

    entries
}

/// returns if every entry of `desired` is already part of `current`
pub fn contains(current: &Secret, desired: &Secret) -> bool {
    let current = decode(current);

    decode(desired)
        .iter()
        .all(|(key, value)| current.get(key) == Some(value))
}

/// create the secret or merge its entries into the existing one, entries
/// that are not part of the given secret are kept
pub async fn upsert(client: Client, secret: &Secret) -> Result<Secret, kube::Error> {
    let (namespace, name) = resource::namespaced_name(secret);
    let api: Api<Secret> = Api::namespaced(client, &namespace);

    match api.get_opt(&name).await? {
        None => {
            debug!(
                kind = "Secret",
                namespace = &namespace,
                name = &name,
                "Execute a request to create secret",
            );

            api.create(&PostParams::default(), secret).await
        }
        Some(existing) if contains(&existing, secret) => {
            debug!(
                kind = "Secret",
                namespace = &namespace,
                name = &name,
                "Skip secret update, entries are already up to date",
            );

            Ok(existing)
        }
        Some(_) => {
            debug!(
                kind = "Secret",
                namespace = &namespace,
                name = &name,
                "Execute a request to patch secret",
            );

            let patch = serde_json::json!({ "stringData": decode(secret) });
            api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
        }
    }
}
