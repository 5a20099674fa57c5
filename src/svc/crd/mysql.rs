//! # MySQL server
//!
//! This module provide the mysql server custom resource, its definition and
//! the glue between the kubernetes controller runtime and the reconciler.

use std::{
    fmt::{self, Display, Formatter},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use futures::StreamExt;
use kube::{
    runtime::{
        reflector::{self, reflector, ObjectRef, Store},
        watcher, Controller, WatchStreamExt,
    },
    Api, CustomResource, Resource, ResourceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::svc::{
    azure::{ServerConfig, ServerRef, StorageConfig},
    controller,
    crd::provider::Provider,
    k8s::{self, store::ObjectKey, Context, ControllerBuilder},
};

// -----------------------------------------------------------------------------
// Constants

pub const DEFAULT_VERSION: &str = "5.7";
pub const SERVER_PREFIX: &str = "mysql-";
pub const CONNECTION_SECRET_SUFFIX: &str = "-connection";

// -----------------------------------------------------------------------------
// PricingTier structure

/// pricing tier of the server, the only part of the configuration compared
/// against the cloud provider to detect drift
#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct PricingTier {
    #[serde(rename = "tier")]
    pub tier: String,
    #[serde(rename = "vcores")]
    pub vcores: i32,
    #[serde(rename = "family")]
    pub family: String,
}

impl Display for PricingTier {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tier, self.family, self.vcores)
    }
}

impl PricingTier {
    /// returns if both tiers designate the same offer, providers are free to
    /// change the case of tier and family
    pub fn matches(&self, other: &Self) -> bool {
        self.vcores == other.vcores
            && self.tier.eq_ignore_ascii_case(&other.tier)
            && self.family.eq_ignore_ascii_case(&other.family)
    }
}

// -----------------------------------------------------------------------------
// StorageProfile structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct StorageProfile {
    #[serde(rename = "storageGB", default = "StorageProfile::default_storage_gb")]
    pub storage_gb: i32,
    #[serde(
        rename = "backupRetentionDays",
        default = "StorageProfile::default_backup_retention_days"
    )]
    pub backup_retention_days: i32,
    #[serde(rename = "geoRedundantBackup", default)]
    pub geo_redundant_backup: bool,
}

impl Default for StorageProfile {
    fn default() -> Self {
        Self {
            storage_gb: Self::default_storage_gb(),
            backup_retention_days: Self::default_backup_retention_days(),
            geo_redundant_backup: false,
        }
    }
}

impl StorageProfile {
    fn default_storage_gb() -> i32 {
        5
    }

    fn default_backup_retention_days() -> i32 {
        7
    }
}

// -----------------------------------------------------------------------------
// ProviderReference structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct ProviderReference {
    #[serde(rename = "name")]
    pub name: String,
}

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
#[kube(group = "azure.database-operator.dev")]
#[kube(version = "v1alpha1")]
#[kube(kind = "MysqlServer")]
#[kube(singular = "mysqlserver")]
#[kube(plural = "mysqlservers")]
#[kube(shortname = "mysql")]
#[kube(status = "Status")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
#[kube(
    printcolumn = r#"{"name":"phase", "type":"string", "description":"Phase", "jsonPath":".status.phase"}"#
)]
#[kube(
    printcolumn = r#"{"name":"endpoint", "type":"string", "description":"Endpoint", "jsonPath":".status.endpoint"}"#
)]
pub struct Spec {
    #[serde(rename = "providerRef")]
    pub provider_ref: ProviderReference,
    #[serde(rename = "resourceGroupName")]
    pub resource_group_name: String,
    #[serde(rename = "location")]
    pub location: String,
    #[serde(rename = "adminLoginName")]
    pub admin_login_name: String,
    #[serde(rename = "pricingTier")]
    pub pricing_tier: PricingTier,
    #[serde(rename = "version", default = "Spec::default_version")]
    pub version: String,
    #[serde(rename = "sslEnforced", default = "Spec::default_ssl_enforced")]
    pub ssl_enforced: bool,
    #[serde(rename = "storageProfile", default)]
    pub storage_profile: StorageProfile,
    #[serde(rename = "connectionSecretName", default)]
    pub connection_secret_name: Option<String>,
}

impl Spec {
    fn default_version() -> String {
        DEFAULT_VERSION.to_string()
    }

    fn default_ssl_enforced() -> bool {
        true
    }
}

// -----------------------------------------------------------------------------
// Phase enumeration

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum Phase {
    #[default]
    Pending,
    Creating,
    Ready,
    Failed,
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Creating => write!(f, "Creating"),
            Self::Ready => write!(f, "Ready"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

// -----------------------------------------------------------------------------
// Status structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Status {
    #[serde(rename = "phase", default)]
    pub phase: Phase,
    #[serde(rename = "endpoint", default)]
    pub endpoint: Option<String>,
    #[serde(rename = "resourceId", default)]
    pub resource_id: Option<String>,
    #[serde(rename = "resourceVersion", default)]
    pub resource_version: Option<String>,
    #[serde(rename = "message", default)]
    pub message: Option<String>,
    #[serde(rename = "lastTransitionTime", default)]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(rename = "observedGeneration", default)]
    pub observed_generation: Option<i64>,
    #[serde(rename = "credentialsRevision", default)]
    pub credentials_revision: Option<String>,
}

// -----------------------------------------------------------------------------
// MysqlServer implementation

impl MysqlServer {
    /// returns the name of the server on the cloud provider, derived from the
    /// kubernetes unique identifier so that every instance maps to exactly one
    /// server
    pub fn server_name(&self) -> Option<String> {
        self.uid().map(|uid| format!("{SERVER_PREFIX}{uid}"))
    }

    pub fn server_ref(&self) -> Option<ServerRef> {
        self.server_name().map(|name| ServerRef {
            resource_group: self.spec.resource_group_name.to_owned(),
            name,
        })
    }

    pub fn connection_secret_name(&self) -> String {
        self.spec
            .connection_secret_name
            .to_owned()
            .unwrap_or_else(|| format!("{}{CONNECTION_SECRET_SUFFIX}", self.name_any()))
    }

    /// returns the login applications have to use, azure expects the server
    /// name as suffix
    pub fn admin_username(&self, server: &ServerRef) -> String {
        format!("{}@{}", self.spec.admin_login_name, server.name)
    }

    pub fn server_config(&self, server: ServerRef, admin_password: Option<String>) -> ServerConfig {
        ServerConfig {
            server,
            location: self.spec.location.to_owned(),
            admin_login: self.spec.admin_login_name.to_owned(),
            admin_password,
            version: self.spec.version.to_owned(),
            ssl_enforced: self.spec.ssl_enforced,
            pricing_tier: self.spec.pricing_tier.to_owned(),
            storage: StorageConfig {
                storage_mb: self.spec.storage_profile.storage_gb.saturating_mul(1024),
                backup_retention_days: self.spec.storage_profile.backup_retention_days,
                geo_redundant_backup: self.spec.storage_profile.geo_redundant_backup,
            },
        }
    }
}

// -----------------------------------------------------------------------------
// ReconcilerError enum

#[derive(thiserror::Error, Debug)]
pub enum ReconcilerError {
    #[error("failed to reconcile resource, {0}")]
    Reconcile(String),
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(kube::Error),
    #[error("{0}")]
    Controller(controller::Error),
}

impl From<kube::Error> for ReconcilerError {
    fn from(err: kube::Error) -> Self {
        Self::KubeClient(err)
    }
}

impl From<controller::Error> for ReconcilerError {
    fn from(err: controller::Error) -> Self {
        Self::Controller(err)
    }
}

impl From<kube::runtime::controller::Error<Self, watcher::Error>> for ReconcilerError {
    fn from(err: kube::runtime::controller::Error<ReconcilerError, watcher::Error>) -> Self {
        Self::Reconcile(err.to_string())
    }
}

// -----------------------------------------------------------------------------
// Reconciler structure

#[derive(Clone, Default, Debug)]
pub struct Reconciler {}

impl ControllerBuilder<MysqlServer> for Reconciler {
    fn build(&self, ctx: Arc<Context>) -> Controller<MysqlServer> {
        let client = ctx.kube.to_owned();
        let controller = Controller::new(
            Api::<MysqlServer>::all(client.to_owned()),
            watcher::Config::default(),
        );

        // Providers and secrets are referenced by name, map their events back
        // to the instances that depend on them.
        let by_provider = controller.store();
        let by_secret = controller.store();
        let providers = providers(client.to_owned());

        controller
            .watches(
                Api::<Provider>::all(client.to_owned()),
                watcher::Config::default(),
                move |provider: Provider| dependents_of_provider(&by_provider.state(), &provider),
            )
            .watches(
                Api::<Secret>::all(client),
                watcher::Config::default(),
                move |secret: Secret| {
                    dependents_of_secret(&by_secret.state(), &providers.state(), &secret)
                },
            )
    }
}

/// returns a cache of providers kept up to date by a background reflector
fn providers(client: kube::Client) -> Store<Provider> {
    let (reader, writer) = reflector::store();
    let stream = reflector(
        writer,
        watcher(Api::<Provider>::all(client), watcher::Config::default()),
    )
    .default_backoff()
    .touched_objects();

    tokio::spawn(stream.for_each(|result| async move {
        if let Err(err) = result {
            warn!(error = err.to_string(), "Failed to watch providers");
        }
    }));

    reader
}

/// returns instances referencing the given provider
pub fn dependents_of_provider(
    instances: &[Arc<MysqlServer>],
    provider: &Provider,
) -> Vec<ObjectRef<MysqlServer>> {
    instances
        .iter()
        .filter(|obj| {
            obj.namespace() == provider.namespace()
                && obj.spec.provider_ref.name == provider.name_any()
        })
        .map(|obj| ObjectRef::from_obj(obj.as_ref()))
        .collect()
}

/// returns instances whose provider points at the given secret, secrets
/// owned by an instance are the ones this operator writes and trigger nothing
pub fn dependents_of_secret(
    instances: &[Arc<MysqlServer>],
    providers: &[Arc<Provider>],
    secret: &Secret,
) -> Vec<ObjectRef<MysqlServer>> {
    let owned = secret
        .owner_references()
        .iter()
        .any(|owner| owner.kind == MysqlServer::kind(&()));

    if owned {
        return vec![];
    }

    let names = providers
        .iter()
        .filter(|provider| {
            provider.namespace() == secret.namespace()
                && provider.spec.auth_secret.name == secret.name_any()
        })
        .map(|provider| provider.name_any())
        .collect::<Vec<_>>();

    instances
        .iter()
        .filter(|obj| {
            obj.namespace() == secret.namespace() && names.contains(&obj.spec.provider_ref.name)
        })
        .map(|obj| ObjectRef::from_obj(obj.as_ref()))
        .collect()
}

#[async_trait]
impl k8s::Reconciler<MysqlServer> for Reconciler {
    type Error = ReconcilerError;

    async fn apply(ctx: Arc<Context>, key: ObjectKey) -> Result<Option<Duration>, Self::Error> {
        Ok(ctx.reconciler.reconcile(&key).await?.requeue)
    }

    fn retry(obj: Arc<MysqlServer>, err: &Self::Error, ctx: Arc<Context>) -> Duration {
        let key = ObjectKey::from_resource(obj.as_ref());
        let delay = ctx.reconciler.failure_delay(&key);

        trace!(
            namespace = &key.namespace,
            name = &key.name,
            duration = delay.as_millis() as u64,
            error = err.to_string(),
            "Requeue failed reconciliation",
        );

        delay
    }
}
