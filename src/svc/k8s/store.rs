//! # Store module
//!
//! This module provide the desired-state store the reconciler reads instances
//! and their references from, and writes status, finalizers, connection
//! secrets and events to.

use std::fmt::{self, Display, Formatter};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{Api, PostParams},
    Client, ResourceExt,
};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, warn};

use crate::svc::{
    crd::{
        mysql::{MysqlServer, Status},
        provider::Provider,
    },
    k8s::{
        finalizer,
        recorder::{self, Level},
        resource, secret,
    },
};

// -----------------------------------------------------------------------------
// ObjectKey structure

/// namespace and name of an instance, the unit of serialization
#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl ObjectKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn from_resource<T>(obj: &T) -> Self
    where
        T: ResourceExt,
    {
        let (namespace, name) = resource::namespaced_name(obj);
        Self { namespace, name }
    }
}

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(kube::Error),
    #[error("resource '{0}' has been modified concurrently")]
    Conflict(ObjectKey),
    #[error("failed to serialize resource, {0}")]
    Serialize(serde_json::Error),
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Self::KubeClient(err)
    }
}

// -----------------------------------------------------------------------------
// Store trait

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Store: Send + Sync {
    async fn instance(&self, key: &ObjectKey) -> Result<Option<MysqlServer>, Error>;

    async fn provider(&self, namespace: &str, name: &str) -> Result<Option<Provider>, Error>;

    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// creates the secret or merges its entries into the existing one
    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error>;

    /// returns [`Error::Conflict`] if the instance changed since it was read
    async fn write_status(&self, obj: &MysqlServer, status: &Status) -> Result<MysqlServer, Error>;

    async fn add_finalizer(&self, obj: &MysqlServer, finalizer: &str) -> Result<MysqlServer, Error>;

    async fn remove_finalizer(&self, obj: &MysqlServer, finalizer: &str) -> Result<(), Error>;

    /// best effort, failures are logged and swallowed
    async fn record(&self, obj: &MysqlServer, level: Level, action: &str, message: &str);
}

// -----------------------------------------------------------------------------
// KubeStore structure

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl From<Client> for KubeStore {
    fn from(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Store for KubeStore {
    async fn instance(&self, key: &ObjectKey) -> Result<Option<MysqlServer>, Error> {
        Ok(resource::get(self.client.to_owned(), &key.namespace, &key.name).await?)
    }

    async fn provider(&self, namespace: &str, name: &str) -> Result<Option<Provider>, Error> {
        Ok(resource::get(self.client.to_owned(), namespace, name).await?)
    }

    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        Ok(resource::get(self.client.to_owned(), namespace, name).await?)
    }

    async fn apply_secret(&self, obj: &Secret) -> Result<(), Error> {
        secret::upsert(self.client.to_owned(), obj).await?;
        Ok(())
    }

    async fn write_status(&self, obj: &MysqlServer, status: &Status) -> Result<MysqlServer, Error> {
        let key = ObjectKey::from_resource(obj);
        let api: Api<MysqlServer> = Api::namespaced(self.client.to_owned(), &key.namespace);

        // The resource version travels with the body, the api server refuses
        // the write if the instance moved in the meantime.
        let mut modified = obj.to_owned();
        modified.status = Some(status.to_owned());

        debug!(
            namespace = &key.namespace,
            name = &key.name,
            phase = status.phase.to_string(),
            "Execute a request to replace status of resource",
        );

        let body = serde_json::to_vec(&modified).map_err(Error::Serialize)?;
        match api.replace_status(&key.name, &PostParams::default(), body).await {
            Ok(obj) => Ok(obj),
            Err(kube::Error::Api(err)) if err.code == 409 => Err(Error::Conflict(key)),
            Err(err) => Err(Error::KubeClient(err)),
        }
    }

    async fn add_finalizer(&self, obj: &MysqlServer, name: &str) -> Result<MysqlServer, Error> {
        let modified = finalizer::add(obj.to_owned(), name);
        let patch = resource::diff(obj, &modified).map_err(Error::Serialize)?;

        Ok(resource::patch(self.client.to_owned(), &modified, patch).await?)
    }

    async fn remove_finalizer(&self, obj: &MysqlServer, name: &str) -> Result<(), Error> {
        let modified = finalizer::remove(obj.to_owned(), name);
        let patch = resource::diff(obj, &modified).map_err(Error::Serialize)?;

        match resource::patch(self.client.to_owned(), &modified, patch).await {
            Ok(_) => Ok(()),
            // the instance is gone as soon as its last finalizer is released
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(err) => Err(Error::KubeClient(err)),
        }
    }

    async fn record(&self, obj: &MysqlServer, level: Level, action: &str, message: &str) {
        if let Err(err) = recorder::record(self.client.to_owned(), obj, level, action, message).await
        {
            let key = ObjectKey::from_resource(obj);
            warn!(
                namespace = &key.namespace,
                name = &key.name,
                action = action,
                error = err.to_string(),
                "Failed to record event for resource",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_displayed_as_namespaced_name() {
        assert_eq!(
            ObjectKey::new("test-db-namespace", "test-db-instance").to_string(),
            "test-db-namespace/test-db-instance"
        );
    }
}
