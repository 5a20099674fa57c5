//! # Resource module
//!
//! This module provide helpers on kubernetes [`Resource`]

use std::fmt::Debug;

use k8s_openapi::{
    api::core::v1::ObjectReference,
    apimachinery::pkg::apis::meta::v1::OwnerReference,
    NamespaceResourceScope,
};
use kube::{
    api::{Patch, PatchParams},
    Api, Client, CustomResourceExt, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

// -----------------------------------------------------------------------------
// Helpers functions

/// returns if the resource is considered from kubernetes point of view as deleted
pub fn deleted<T>(obj: &T) -> bool
where
    T: Resource,
{
    obj.meta().deletion_timestamp.is_some()
}

/// returns the namespace and name of the kubernetes resource, cluster scoped
/// resources have an empty namespace
pub fn namespaced_name<T>(obj: &T) -> (String, String)
where
    T: ResourceExt,
{
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

/// returns difference between the two given object serialize as json patch
pub fn diff<T>(origin: &T, modified: &T) -> Result<json_patch::Patch, serde_json::Error>
where
    T: Serialize,
{
    Ok(json_patch::diff(
        &serde_json::to_value(origin)?,
        &serde_json::to_value(modified)?,
    ))
}

/// make a patch request on the given resource using the given patch
pub async fn patch<T>(client: Client, obj: &T, patch: json_patch::Patch) -> Result<T, kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Serialize + Clone + Debug,
    <T as Resource>::DynamicType: Default,
{
    let (namespace, name) = namespaced_name(obj);

    if patch.0.is_empty() {
        debug!(
            namespace = &namespace,
            name = &name,
            "Skip patch request on resource, no operation to apply",
        );
        return Ok(obj.to_owned());
    }

    debug!(
        namespace = &namespace,
        name = &name,
        operations = patch.0.len(),
        "Execute patch request on resource",
    );

    Api::namespaced(client, &namespace)
        .patch(&name, &PatchParams::default(), &Patch::Json::<()>(patch))
        .await
}

/// returns the resource with the given name, if it exists
pub async fn get<T>(client: Client, namespace: &str, name: &str) -> Result<Option<T>, kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Clone + Debug,
    <T as Resource>::DynamicType: Default,
{
    debug!(
        kind = T::kind(&Default::default()).to_string(),
        namespace = namespace,
        name = name,
        "Execute a request to retrieve resource",
    );

    Api::namespaced(client, namespace).get_opt(name).await
}

/// returns a owner references object pointing to the given resource, if it
/// has already been given an unique identifier
pub fn owner_reference<T>(obj: &T) -> Option<OwnerReference>
where
    T: ResourceExt + CustomResourceExt,
{
    let api_resource = T::api_resource();

    obj.uid().map(|uid| OwnerReference {
        api_version: api_resource.api_version,
        block_owner_deletion: Some(true),
        controller: Some(true),
        kind: api_resource.kind,
        name: obj.name_any(),
        uid,
    })
}

/// returns an object reference pointing to the given resource
pub fn object_reference<T>(obj: &T) -> ObjectReference
where
    T: ResourceExt + CustomResourceExt,
{
    let api_resource = T::api_resource();

    ObjectReference {
        api_version: Some(api_resource.api_version),
        kind: Some(api_resource.kind),
        name: Some(obj.name_any()),
        namespace: obj.namespace(),
        resource_version: obj.resource_version(),
        uid: obj.uid(),
        ..Default::default()
    }
}
