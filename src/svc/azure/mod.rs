//! # Azure module
//!
//! This module provide the capability interface the reconciler uses to drive
//! a managed mysql server on the cloud provider, the error taxonomy surfaced
//! to callers and an implementation over the azure resource manager api.

use std::fmt::{self, Debug, Display, Formatter};

use async_trait::async_trait;

use crate::svc::crd::mysql::PricingTier;

pub mod client;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, PartialEq, Eq, Clone, Debug)]
pub enum Error {
    /// transient failure, the caller backs off and retries
    #[error("transient failure on cloud provider, {0}")]
    Retryable(String),
    /// the provider rejected the request, retrying without a change is useless
    #[error("cloud provider rejected the request, {0}")]
    Fatal(String),
    #[error("cloud resource '{0}' not found")]
    NotFound(String),
}

// -----------------------------------------------------------------------------
// ServerRef structure

/// locates a server on the cloud provider
#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub struct ServerRef {
    pub resource_group: String,
    pub name: String,
}

impl Display for ServerRef {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.resource_group, self.name)
    }
}

// -----------------------------------------------------------------------------
// ServerConfig structure

#[derive(PartialEq, Eq, Clone, Debug)]
pub struct StorageConfig {
    pub storage_mb: i32,
    pub backup_retention_days: i32,
    pub geo_redundant_backup: bool,
}

/// desired configuration of a server, the administrator password is only
/// required to create it
#[derive(PartialEq, Eq, Clone)]
pub struct ServerConfig {
    pub server: ServerRef,
    pub location: String,
    pub admin_login: String,
    pub admin_password: Option<String>,
    pub version: String,
    pub ssl_enforced: bool,
    pub pricing_tier: PricingTier,
    pub storage: StorageConfig,
}

impl Debug for ServerConfig {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("server", &self.server)
            .field("location", &self.location)
            .field("admin_login", &self.admin_login)
            .field(
                "admin_password",
                &self.admin_password.as_ref().map(|_| "<redacted>"),
            )
            .field("version", &self.version)
            .field("ssl_enforced", &self.ssl_enforced)
            .field("pricing_tier", &self.pricing_tier)
            .field("storage", &self.storage)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// ObservedServer structure

#[derive(PartialEq, Eq, Clone, Debug)]
pub enum ServerState {
    Provisioning(String),
    Ready,
    Failed(String),
}

/// state of a server as reported by the cloud provider
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct ObservedServer {
    pub id: String,
    pub state: ServerState,
    pub fqdn: Option<String>,
    pub version: Option<String>,
    pub pricing_tier: PricingTier,
}

// -----------------------------------------------------------------------------
// DatabaseClient trait

#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// creates the server, returns the identifier of the existing one if a
    /// server with the same name already exists
    async fn create(&self, config: &ServerConfig) -> Result<String, Error>;

    /// returns [`Error::NotFound`] if the server does not exist
    async fn get(&self, server: &ServerRef) -> Result<ObservedServer, Error>;

    /// applies the pricing tier of the given configuration
    async fn update(&self, server: &ServerRef, config: &ServerConfig) -> Result<(), Error>;

    /// deleting an absent server is a success
    async fn delete(&self, server: &ServerRef) -> Result<(), Error>;

    fn is_ready(&self, observed: &ObservedServer) -> bool {
        observed.state == ServerState::Ready
    }
}

// -----------------------------------------------------------------------------
// Connector trait

/// builds an authenticated [`DatabaseClient`] from raw credential bytes, a
/// new client is built for each reconciliation to pick up rotations
#[async_trait]
pub trait Connector: Send + Sync {
    type Client: DatabaseClient;

    async fn connect(&self, credentials: &[u8]) -> Result<Self::Client, Error>;
}
