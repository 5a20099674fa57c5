//! # Finalizer module
//!
//! This module provide helpers methods to interact with kubernetes' resource
//! finalizer, the finalizer is the deletion guard of an instance.

use kube::Resource;

/// returns if there is the given finalizer on the resource
pub fn contains<T>(obj: &T, finalizer: &str) -> bool
where
    T: Resource,
{
    obj.meta()
        .finalizers
        .as_ref()
        .map(|finalizers| finalizers.iter().any(|f| f == finalizer))
        .unwrap_or(false)
}

/// add finalizer to the resource, if not already present
pub fn add<T>(mut obj: T, finalizer: &str) -> T
where
    T: Resource,
{
    if !contains(&obj, finalizer) {
        obj.meta_mut()
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(finalizer.to_string());
    }

    obj
}

/// remove finalizer from the resource
pub fn remove<T>(mut obj: T, finalizer: &str) -> T
where
    T: Resource,
{
    if let Some(finalizers) = obj.meta_mut().finalizers.as_mut() {
        finalizers.retain(|f| f != finalizer);
    }

    obj
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::ConfigMap;

    use super::*;

    #[test]
    fn add_is_idempotent() {
        let obj = add(add(ConfigMap::default(), "guard"), "guard");

        assert!(contains(&obj, "guard"));
        assert_eq!(obj.metadata.finalizers, Some(vec!["guard".to_string()]));
    }

    #[test]
    fn remove_keeps_other_finalizers() {
        let obj = add(add(ConfigMap::default(), "other"), "guard");
        let obj = remove(obj, "guard");

        assert!(!contains(&obj, "guard"));
        assert!(contains(&obj, "other"));
    }
}
