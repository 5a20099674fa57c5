// Test code is allowed to panic on failure
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

//! Common test utilities shared across integration tests
//!
//! This module provides an in-memory desired-state store, an in-memory cloud
//! provider and fixtures building instances, providers and secrets.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use azure_database_operator::svc::{
    azure::{self, Connector, DatabaseClient, ObservedServer, ServerConfig, ServerRef, ServerState},
    crd::{
        mysql::{MysqlServer, PricingTier, ProviderReference, Spec, Status, StorageProfile},
        provider::{self, Provider, SecretKeyReference},
    },
    k8s::{
        finalizer,
        recorder::Level,
        secret,
        store::{Error, ObjectKey, Store},
    },
};
use chrono::Utc;
use k8s_openapi::{api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::Time, ByteString};
use kube::{api::ObjectMeta, ResourceExt};

// -----------------------------------------------------------------------------
// Constants

pub const NAMESPACE: &str = "test-db-namespace";
pub const INSTANCE_NAME: &str = "test-db-instance";
pub const INSTANCE_UID: &str = "0b6e43c6-4f5c-4b8d-9a4e-0d1f0f3c5a01";
pub const SERVER_NAME: &str = "mysql-0b6e43c6-4f5c-4b8d-9a4e-0d1f0f3c5a01";
pub const SECRET_NAME: &str = "test-secret";
pub const SECRET_DATA_KEY: &str = "credentials";
pub const PROVIDER_NAME: &str = "test-provider";
pub const CONNECTION_SECRET_NAME: &str = "test-db-instance-connection";

// -----------------------------------------------------------------------------
// Fixtures

pub fn key() -> ObjectKey {
    ObjectKey::new(NAMESPACE, INSTANCE_NAME)
}

pub fn instance() -> MysqlServer {
    let mut obj = MysqlServer::new(
        INSTANCE_NAME,
        Spec {
            provider_ref: ProviderReference {
                name: PROVIDER_NAME.to_string(),
            },
            resource_group_name: "group".to_string(),
            location: "westeurope".to_string(),
            admin_login_name: "myadmin".to_string(),
            pricing_tier: PricingTier {
                tier: "Basic".to_string(),
                vcores: 1,
                family: "Gen4".to_string(),
            },
            version: "5.7".to_string(),
            ssl_enforced: true,
            storage_profile: StorageProfile::default(),
            connection_secret_name: None,
        },
    );

    obj.metadata = ObjectMeta {
        namespace: Some(NAMESPACE.to_string()),
        uid: Some(INSTANCE_UID.to_string()),
        ..obj.metadata
    };

    obj
}

pub fn provider() -> Provider {
    let mut obj = Provider::new(
        PROVIDER_NAME,
        provider::Spec {
            auth_secret: SecretKeyReference {
                name: SECRET_NAME.to_string(),
                key: SECRET_DATA_KEY.to_string(),
            },
        },
    );

    obj.metadata.namespace = Some(NAMESPACE.to_string());
    obj
}

pub fn credentials_secret() -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(SECRET_NAME.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            SECRET_DATA_KEY.to_string(),
            ByteString(br#"{"clientId":"id","clientSecret":"secret","subscriptionId":"sub","tenantId":"tenant"}"#.to_vec()),
        )])),
        ..Default::default()
    }
}

// -----------------------------------------------------------------------------
// FakeStore structure

#[derive(Default)]
struct StoreState {
    revision: u64,
    instances: HashMap<ObjectKey, MysqlServer>,
    providers: HashMap<ObjectKey, Provider>,
    secrets: HashMap<ObjectKey, Secret>,
    events: Vec<(Level, String)>,
    status_writes: usize,
}

impl StoreState {
    fn next_revision(&mut self) -> Option<String> {
        self.revision += 1;
        Some(self.revision.to_string())
    }
}

/// in-memory desired-state store, bumps resource versions on every write and
/// refuses status writes based on a stale read
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<StoreState>,
}

impl FakeStore {
    pub fn with_instance(obj: MysqlServer) -> Self {
        let store = Self::default();
        store.insert_instance(obj);
        store
    }

    pub fn insert_instance(&self, mut obj: MysqlServer) {
        let mut state = self.state.lock().unwrap();
        obj.metadata.resource_version = state.next_revision();
        obj.metadata.generation = Some(obj.metadata.generation.unwrap_or(0) + 1);
        state.instances.insert(ObjectKey::from_resource(&obj), obj);
    }

    pub fn insert_provider(&self, mut obj: Provider) {
        let mut state = self.state.lock().unwrap();
        obj.metadata.resource_version = state.next_revision();
        state.providers.insert(ObjectKey::from_resource(&obj), obj);
    }

    pub fn insert_secret(&self, mut obj: Secret) {
        let mut state = self.state.lock().unwrap();
        obj.metadata.resource_version = state.next_revision();
        state.secrets.insert(ObjectKey::from_resource(&obj), obj);
    }

    /// edits the spec like a user would, the generation is bumped
    pub fn update_spec(&self, key: &ObjectKey, f: impl FnOnce(&mut Spec)) {
        let mut state = self.state.lock().unwrap();
        let revision = state.next_revision();
        let obj = state.instances.get_mut(key).unwrap();

        f(&mut obj.spec);
        obj.metadata.resource_version = revision;
        obj.metadata.generation = obj.metadata.generation.map(|g| g + 1);
    }

    /// marks the instance for deletion, it is removed once no finalizer holds
    /// it anymore
    pub fn delete_instance(&self, key: &ObjectKey) {
        let mut state = self.state.lock().unwrap();
        let revision = state.next_revision();
        let obj = state.instances.get_mut(key).unwrap();

        obj.metadata.deletion_timestamp = Some(Time(Utc::now()));
        obj.metadata.resource_version = revision;

        if obj.finalizers().is_empty() {
            state.instances.remove(key);
        }
    }

    pub fn get(&self, key: &ObjectKey) -> Option<MysqlServer> {
        self.state.lock().unwrap().instances.get(key).cloned()
    }

    pub fn status(&self, key: &ObjectKey) -> Status {
        self.get(key)
            .and_then(|obj| obj.status)
            .unwrap_or_default()
    }

    pub fn connection_secret(&self) -> BTreeMap<String, String> {
        self.state
            .lock()
            .unwrap()
            .secrets
            .get(&ObjectKey::new(NAMESPACE, CONNECTION_SECRET_NAME))
            .map(secret::decode)
            .unwrap_or_default()
    }

    pub fn status_writes(&self) -> usize {
        self.state.lock().unwrap().status_writes
    }

    pub fn events(&self) -> Vec<(Level, String)> {
        self.state.lock().unwrap().events.to_owned()
    }
}

#[async_trait]
impl Store for FakeStore {
    async fn instance(&self, key: &ObjectKey) -> Result<Option<MysqlServer>, Error> {
        Ok(self.get(key))
    }

    async fn provider(&self, namespace: &str, name: &str) -> Result<Option<Provider>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .providers
            .get(&ObjectKey::new(namespace, name))
            .cloned())
    }

    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .secrets
            .get(&ObjectKey::new(namespace, name))
            .cloned())
    }

    async fn apply_secret(&self, obj: &Secret) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let key = ObjectKey::from_resource(obj);

        let mut entries = state.secrets.get(&key).map(secret::decode).unwrap_or_default();
        entries.extend(secret::decode(obj));

        let mut stored = obj.to_owned();
        stored.string_data = None;
        stored.data = Some(
            entries
                .into_iter()
                .map(|(k, v)| (k, ByteString(v.into_bytes())))
                .collect(),
        );
        stored.metadata.resource_version = state.next_revision();
        state.secrets.insert(key, stored);

        Ok(())
    }

    async fn write_status(&self, obj: &MysqlServer, status: &Status) -> Result<MysqlServer, Error> {
        tokio::task::yield_now().await;

        let mut state = self.state.lock().unwrap();
        let key = ObjectKey::from_resource(obj);
        let revision = state.next_revision();
        let stored = state
            .instances
            .get_mut(&key)
            .ok_or_else(|| Error::Conflict(key.to_owned()))?;

        if stored.metadata.resource_version != obj.metadata.resource_version {
            return Err(Error::Conflict(key));
        }

        stored.status = Some(status.to_owned());
        stored.metadata.resource_version = revision;
        let updated = stored.to_owned();
        state.status_writes += 1;

        Ok(updated)
    }

    async fn add_finalizer(&self, obj: &MysqlServer, name: &str) -> Result<MysqlServer, Error> {
        let mut state = self.state.lock().unwrap();
        let key = ObjectKey::from_resource(obj);
        let revision = state.next_revision();
        let stored = state
            .instances
            .get_mut(&key)
            .ok_or_else(|| Error::Conflict(key.to_owned()))?;

        *stored = finalizer::add(stored.to_owned(), name);
        stored.metadata.resource_version = revision;

        Ok(stored.to_owned())
    }

    async fn remove_finalizer(&self, obj: &MysqlServer, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let key = ObjectKey::from_resource(obj);

        if let Some(stored) = state.instances.get_mut(&key) {
            *stored = finalizer::remove(stored.to_owned(), name);
            if stored.metadata.deletion_timestamp.is_some() && stored.finalizers().is_empty() {
                state.instances.remove(&key);
            }
        }

        Ok(())
    }

    async fn record(&self, _obj: &MysqlServer, level: Level, action: &str, _message: &str) {
        self.state
            .lock()
            .unwrap()
            .events
            .push((level, action.to_string()));
    }
}

// -----------------------------------------------------------------------------
// FakeCloud structure

#[derive(Default)]
struct CloudState {
    servers: HashMap<String, ObservedServer>,
    connects: usize,
    creates: usize,
    created: usize,
    updates: usize,
    deletes: usize,
    fail_connect: Option<azure::Error>,
    fail_create: Option<azure::Error>,
    fail_delete: Option<azure::Error>,
    lagging_reads: bool,
    credentials: Vec<Vec<u8>>,
}

/// in-memory cloud provider, servers are provisioning until told otherwise
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<CloudState>,
}

impl FakeCloud {
    pub fn connector(self: &Arc<Self>) -> FakeConnector {
        FakeConnector {
            cloud: self.to_owned(),
        }
    }

    pub fn set_state(&self, name: &str, server_state: ServerState) {
        if let Some(server) = self.state.lock().unwrap().servers.get_mut(name) {
            server.state = server_state;
        }
    }

    pub fn set_ready(&self, name: &str) {
        self.set_state(name, ServerState::Ready);
    }

    pub fn server(&self, name: &str) -> Option<ObservedServer> {
        self.state.lock().unwrap().servers.get(name).cloned()
    }

    pub fn fail_connect(&self, err: Option<azure::Error>) {
        self.state.lock().unwrap().fail_connect = err;
    }

    pub fn fail_create(&self, err: Option<azure::Error>) {
        self.state.lock().unwrap().fail_create = err;
    }

    pub fn fail_delete(&self, err: Option<azure::Error>) {
        self.state.lock().unwrap().fail_delete = err;
    }

    /// reads report every server as absent, like an accepted create not yet
    /// visible on the provider api
    pub fn lag_reads(&self, lagging: bool) {
        self.state.lock().unwrap().lagging_reads = lagging;
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    /// number of create requests received
    pub fn creates(&self) -> usize {
        self.state.lock().unwrap().creates
    }

    /// number of servers actually brought into existence
    pub fn created(&self) -> usize {
        self.state.lock().unwrap().created
    }

    pub fn updates(&self) -> usize {
        self.state.lock().unwrap().updates
    }

    pub fn deletes(&self) -> usize {
        self.state.lock().unwrap().deletes
    }

    pub fn credentials(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().credentials.to_owned()
    }
}

pub struct FakeConnector {
    cloud: Arc<FakeCloud>,
}

#[async_trait]
impl Connector for FakeConnector {
    type Client = FakeClient;

    async fn connect(&self, credentials: &[u8]) -> Result<Self::Client, azure::Error> {
        let mut state = self.cloud.state.lock().unwrap();
        state.connects += 1;
        state.credentials.push(credentials.to_vec());

        match &state.fail_connect {
            Some(err) => Err(err.to_owned()),
            None => Ok(FakeClient {
                cloud: self.cloud.to_owned(),
            }),
        }
    }
}

pub struct FakeClient {
    cloud: Arc<FakeCloud>,
}

impl FakeClient {
    fn id(server: &ServerRef) -> String {
        format!(
            "/subscriptions/sub/resourceGroups/{}/providers/Microsoft.DBforMySQL/servers/{}",
            server.resource_group, server.name
        )
    }
}

#[async_trait]
impl DatabaseClient for FakeClient {
    async fn create(&self, config: &ServerConfig) -> Result<String, azure::Error> {
        tokio::task::yield_now().await;

        let mut state = self.cloud.state.lock().unwrap();
        state.creates += 1;

        if let Some(err) = &state.fail_create {
            return Err(err.to_owned());
        }

        assert!(config.admin_password.is_some(), "create without password");

        let id = Self::id(&config.server);
        if !state.servers.contains_key(&config.server.name) {
            state.created += 1;
            state.servers.insert(
                config.server.name.to_owned(),
                ObservedServer {
                    id: id.to_owned(),
                    state: ServerState::Provisioning("Creating".to_string()),
                    fqdn: Some(format!("{}.mysql.database.azure.com", config.server.name)),
                    version: Some(config.version.to_owned()),
                    pricing_tier: config.pricing_tier.to_owned(),
                },
            );
        }

        Ok(id)
    }

    async fn get(&self, server: &ServerRef) -> Result<ObservedServer, azure::Error> {
        tokio::task::yield_now().await;

        let state = self.cloud.state.lock().unwrap();
        if state.lagging_reads {
            return Err(azure::Error::NotFound(server.to_string()));
        }

        state
            .servers
            .get(&server.name)
            .cloned()
            .ok_or_else(|| azure::Error::NotFound(server.to_string()))
    }

    async fn update(&self, server: &ServerRef, config: &ServerConfig) -> Result<(), azure::Error> {
        let mut state = self.cloud.state.lock().unwrap();
        state.updates += 1;

        let observed = state
            .servers
            .get_mut(&server.name)
            .ok_or_else(|| azure::Error::NotFound(server.to_string()))?;

        observed.pricing_tier = config.pricing_tier.to_owned();
        observed.state = ServerState::Provisioning("Updating".to_string());

        Ok(())
    }

    async fn delete(&self, server: &ServerRef) -> Result<(), azure::Error> {
        let mut state = self.cloud.state.lock().unwrap();
        state.deletes += 1;

        if let Some(err) = &state.fail_delete {
            return Err(err.to_owned());
        }

        state
            .servers
            .remove(&server.name)
            .map(|_| ())
            .ok_or_else(|| azure::Error::NotFound(server.to_string()))
    }
}
