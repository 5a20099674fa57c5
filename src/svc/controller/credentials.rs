//! # Credentials module
//!
//! This module resolves the chain instance → provider → secret → key into the
//! raw credential bytes used to build a cloud client. Nothing is written.

use std::fmt::{self, Debug, Formatter};

use kube::ResourceExt;
use tracing::debug;

use crate::svc::k8s::store::{self, Store};

// -----------------------------------------------------------------------------
// Error enumeration

/// every variant is retryable, the referenced objects may be created after
/// the instance
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("provider '{0}/{1}' not found")]
    ProviderNotFound(String, String),
    #[error("secret '{0}/{1}' not found")]
    SecretNotFound(String, String),
    #[error("key '{0}' is missing in secret '{1}/{2}'")]
    SecretKeyMissing(String, String, String),
    #[error("failed to read credentials, {0}")]
    Store(store::Error),
}

impl From<store::Error> for Error {
    fn from(err: store::Error) -> Self {
        Self::Store(err)
    }
}

// -----------------------------------------------------------------------------
// Credentials structure

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub bytes: Vec<u8>,
    /// resource versions of the provider and the secret, a change means the
    /// credentials may have been rotated
    pub revision: String,
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("bytes", &"<redacted>")
            .field("revision", &self.revision)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Helpers functions

pub async fn resolve<S>(store: &S, namespace: &str, provider: &str) -> Result<Credentials, Error>
where
    S: Store + ?Sized,
{
    let provider = store
        .provider(namespace, provider)
        .await?
        .ok_or_else(|| Error::ProviderNotFound(namespace.to_string(), provider.to_string()))?;

    let reference = &provider.spec.auth_secret;
    let secret = store
        .secret(namespace, &reference.name)
        .await?
        .ok_or_else(|| Error::SecretNotFound(namespace.to_string(), reference.name.to_owned()))?;

    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get(&reference.key))
        .map(|value| value.0.to_owned())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|data| data.get(&reference.key))
                .map(|value| value.as_bytes().to_vec())
        })
        .ok_or_else(|| {
            Error::SecretKeyMissing(
                reference.key.to_owned(),
                namespace.to_string(),
                reference.name.to_owned(),
            )
        })?;

    let revision = format!(
        "{}/{}",
        provider.resource_version().unwrap_or_default(),
        secret.resource_version().unwrap_or_default()
    );

    debug!(
        namespace = namespace,
        provider = provider.name_any(),
        secret = &reference.name,
        revision = &revision,
        "Resolved credentials of provider",
    );

    Ok(Credentials { bytes, revision })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::{api::core::v1::Secret, ByteString};
    use kube::api::ObjectMeta;
    use mockall::predicate::eq;

    use super::*;
    use crate::svc::{
        crd::provider::{Provider, SecretKeyReference, Spec},
        k8s::store::MockStore,
    };

    fn provider() -> Provider {
        let mut obj = Provider::new(
            "test-provider",
            Spec {
                auth_secret: SecretKeyReference {
                    name: "azure-credentials".to_string(),
                    key: "credentials".to_string(),
                },
            },
        );

        obj.metadata.namespace = Some("test-db-namespace".to_string());
        obj.metadata.resource_version = Some("12".to_string());
        obj
    }

    fn secret(key: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("azure-credentials".to_string()),
                namespace: Some("test-db-namespace".to_string()),
                resource_version: Some("34".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                key.to_string(),
                ByteString(b"{\"clientId\":\"id\"}".to_vec()),
            )])),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn resolves_credential_bytes() {
        let mut store = MockStore::new();
        store
            .expect_provider()
            .with(eq("test-db-namespace"), eq("test-provider"))
            .times(1)
            .returning(|_, _| Ok(Some(provider())));
        store
            .expect_secret()
            .with(eq("test-db-namespace"), eq("azure-credentials"))
            .times(1)
            .returning(|_, _| Ok(Some(secret("credentials"))));

        let credentials = resolve(&store, "test-db-namespace", "test-provider")
            .await
            .unwrap();

        assert_eq!(credentials.bytes, b"{\"clientId\":\"id\"}".to_vec());
        assert_eq!(credentials.revision, "12/34");
        assert!(!format!("{credentials:?}").contains("clientId"));
    }

    #[tokio::test]
    async fn missing_provider_is_reported() {
        let mut store = MockStore::new();
        store.expect_provider().returning(|_, _| Ok(None));
        store.expect_secret().never();

        let err = resolve(&store, "test-db-namespace", "test-provider")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ProviderNotFound(ns, name) if ns == "test-db-namespace" && name == "test-provider"));
    }

    #[tokio::test]
    async fn missing_secret_is_reported() {
        let mut store = MockStore::new();
        store.expect_provider().returning(|_, _| Ok(Some(provider())));
        store.expect_secret().returning(|_, _| Ok(None));

        let err = resolve(&store, "test-db-namespace", "test-provider")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::SecretNotFound(_, name) if name == "azure-credentials"));
    }

    #[tokio::test]
    async fn missing_key_is_reported() {
        let mut store = MockStore::new();
        store.expect_provider().returning(|_, _| Ok(Some(provider())));
        store.expect_secret().returning(|_, _| Ok(Some(secret("other"))));

        let err = resolve(&store, "test-db-namespace", "test-provider")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::SecretKeyMissing(key, _, _) if key == "credentials"));
    }
}
