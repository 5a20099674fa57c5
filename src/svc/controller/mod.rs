//! # Controller module
//!
//! This module provide the reconciler, it drives one pass for one instance:
//! load it, resolve its credentials, observe the cloud server, consult the
//! state machine, issue at most one action, persist the status when it
//! changed and decide when to come back.

use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::svc::{
    azure::{self, Connector, DatabaseClient, ObservedServer, ServerRef},
    cfg::{self, FailedRetry},
    controller::{
        backoff::Backoff,
        credentials::Credentials,
        machine::{Action, Observation},
    },
    crd::mysql::{MysqlServer, Phase, Status},
    k8s::{
        finalizer,
        recorder::Level,
        resource, secret,
        store::{self, ObjectKey, Store},
    },
};

pub mod backoff;
pub mod credentials;
pub mod machine;

// -----------------------------------------------------------------------------
// Constants

pub const FINALIZER: &str = "azure.database-operator.dev/mysqlserver";

pub const USERNAME_KEY: &str = "username";
pub const PASSWORD_KEY: &str = "password";
pub const ENDPOINT_KEY: &str = "endpoint";

pub const CREATE_SERVER_EVENT: &str = "CreateServer";
pub const UPDATE_SERVER_EVENT: &str = "UpdateServer";
pub const DELETE_SERVER_EVENT: &str = "DeleteServer";
pub const RECONCILE_FAILED_EVENT: &str = "ReconcileFailed";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to interact with kubernetes, {0}")]
    Store(store::Error),
    #[error("failed to interact with cloud provider, {0}")]
    Cloud(azure::Error),
    #[error("failed to resolve credentials, {0}")]
    Credentials(credentials::Error),
    #[error("instance '{0}' has not been given an unique identifier yet")]
    MissingUid(ObjectKey),
}

impl From<store::Error> for Error {
    fn from(err: store::Error) -> Self {
        Self::Store(err)
    }
}

impl From<azure::Error> for Error {
    fn from(err: azure::Error) -> Self {
        Self::Cloud(err)
    }
}

impl From<credentials::Error> for Error {
    fn from(err: credentials::Error) -> Self {
        Self::Credentials(err)
    }
}

// -----------------------------------------------------------------------------
// Outcome structure

#[derive(PartialEq, Eq, Clone, Copy, Debug, Default)]
pub struct Outcome {
    /// `None` waits for a change of the instance or of its references
    pub requeue: Option<Duration>,
}

impl Outcome {
    pub fn done() -> Self {
        Self { requeue: None }
    }

    pub fn after(duration: Duration) -> Self {
        Self {
            requeue: Some(duration),
        }
    }
}

// -----------------------------------------------------------------------------
// Gate enumeration

/// whether a failed instance is attempted again during this pass
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Gate {
    Open,
    Closed(Option<Duration>),
}

/// a failed instance is attempted again as soon as its spec or its
/// credentials changed, otherwise the configured policy decides
pub fn gate(
    config: &cfg::Reconciler,
    status: &Status,
    generation: Option<i64>,
    revision: &str,
    now: DateTime<Utc>,
) -> Gate {
    if status.phase != Phase::Failed
        || status.observed_generation != generation
        || status.credentials_revision.as_deref() != Some(revision)
    {
        return Gate::Open;
    }

    match config.failed_retry {
        FailedRetry::Never => Gate::Closed(None),
        FailedRetry::Backoff => {
            let after = config.failed_retry_after();
            let elapsed = status
                .last_transition_time
                .and_then(|at| (now - at).to_std().ok());

            match elapsed {
                Some(elapsed) if elapsed < after => Gate::Closed(Some(after - elapsed)),
                _ => Gate::Open,
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Observed enumeration

enum Observed {
    Absent,
    Present(ObservedServer, bool),
    Fatal(String),
}

impl Observed {
    fn as_observation(&self) -> Observation<'_> {
        match self {
            Self::Absent => Observation::Absent,
            Self::Present(server, ready) => Observation::Present {
                server,
                ready: *ready,
            },
            Self::Fatal(message) => Observation::Fatal(message),
        }
    }
}

/// retryable errors are returned, the others are part of the observation
async fn observe<D>(client: &D, server: &ServerRef) -> Result<Observed, azure::Error>
where
    D: DatabaseClient,
{
    match client.get(server).await {
        Ok(observed) => {
            let ready = client.is_ready(&observed);
            Ok(Observed::Present(observed, ready))
        }
        Err(azure::Error::NotFound(_)) => Ok(Observed::Absent),
        Err(azure::Error::Fatal(message)) => Ok(Observed::Fatal(message)),
        Err(err) => Err(err),
    }
}

// -----------------------------------------------------------------------------
// Reconciler structure

pub struct Reconciler<S, C> {
    store: S,
    connector: C,
    config: cfg::Reconciler,
    backoff: Backoff<ObjectKey>,
}

impl<S, C> Reconciler<S, C>
where
    S: Store,
    C: Connector,
{
    pub fn new(store: S, connector: C, config: cfg::Reconciler) -> Self {
        Self {
            backoff: Backoff::from(&config),
            store,
            connector,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// returns the delay before retrying a pass which returned an error
    pub fn failure_delay(&self, key: &ObjectKey) -> Duration {
        self.backoff.next(key)
    }

    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome, Error> {
        let obj = match self.store.instance(key).await? {
            Some(obj) => obj,
            None => {
                debug!(
                    namespace = &key.namespace,
                    name = &key.name,
                    "Instance no longer exists, nothing to do",
                );
                self.backoff.reset(key);
                return Ok(Outcome::done());
            }
        };

        if resource::deleted(&obj) {
            return self.delete(key, obj).await;
        }

        let server = obj
            .server_ref()
            .ok_or_else(|| Error::MissingUid(key.to_owned()))?;

        // The guard is held before any cloud call so that a server is never
        // created for an instance that could vanish without us noticing.
        let obj = if finalizer::contains(&obj, FINALIZER) {
            obj
        } else {
            debug!(
                namespace = &key.namespace,
                name = &key.name,
                finalizer = FINALIZER,
                "Add deletion guard to instance",
            );
            self.store.add_finalizer(&obj, FINALIZER).await?
        };

        let previous = obj.status.to_owned().unwrap_or_default();
        let credentials = match credentials::resolve(
            &self.store,
            &key.namespace,
            &obj.spec.provider_ref.name,
        )
        .await
        {
            Ok(credentials) => credentials,
            Err(credentials::Error::Store(err)) => return Err(Error::Store(err)),
            Err(err) => {
                warn!(
                    namespace = &key.namespace,
                    name = &key.name,
                    error = err.to_string(),
                    "Failed to resolve credentials of instance",
                );

                let mut next = previous.to_owned();
                next.message = Some(err.to_string());
                self.persist(&obj, &previous, next).await?;

                return Ok(Outcome::after(self.backoff.next(key)));
            }
        };

        if let Gate::Closed(requeue) = gate(
            &self.config,
            &previous,
            obj.metadata.generation,
            &credentials.revision,
            Utc::now(),
        ) {
            debug!(
                namespace = &key.namespace,
                name = &key.name,
                "Instance failed and neither its spec nor its credentials changed, skip",
            );
            self.backoff.reset(key);
            return Ok(Outcome { requeue });
        }

        let next = self.converge(key, &obj, &server, &credentials, &previous).await?;
        let next = self.persist(&obj, &previous, next).await?;

        self.backoff.reset(key);
        Ok(self.requeue(&next))
    }

    /// observes the server, consults the state machine and issues its action,
    /// returns the status to persist
    async fn converge(
        &self,
        key: &ObjectKey,
        obj: &MysqlServer,
        server: &ServerRef,
        credentials: &Credentials,
        previous: &Status,
    ) -> Result<Status, Error> {
        let (client, observed) = match self.connector.connect(&credentials.bytes).await {
            Ok(client) => {
                let observed = observe(&client, server).await?;
                (Some(client), observed)
            }
            Err(azure::Error::Fatal(message)) => (None, Observed::Fatal(message)),
            Err(err) => return Err(Error::Cloud(err)),
        };

        let (action, mut next) =
            machine::step(&obj.spec, observed.as_observation(), previous, false);

        next.observed_generation = obj.metadata.generation;
        next.credentials_revision = Some(credentials.revision.to_owned());

        info!(
            namespace = &key.namespace,
            name = &key.name,
            server = server.to_string(),
            action = action.to_string(),
            phase = next.phase.to_string(),
            "Computed next step of instance",
        );

        match (action, &client) {
            (Action::Create, Some(client)) => {
                let password = self.admin_password(obj, server).await?;
                let config = obj.server_config(server.to_owned(), Some(password));

                match client.create(&config).await {
                    Ok(id) => {
                        let message = format!("Create server '{server}' in '{}'", config.location);
                        self.store
                            .record(obj, Level::Normal, CREATE_SERVER_EVENT, &message)
                            .await;
                        next.resource_id = Some(id);
                    }
                    Err(azure::Error::Fatal(message)) => {
                        self.fail(obj, &mut next, message).await;
                    }
                    Err(err) => return Err(Error::Cloud(err)),
                }
            }
            (Action::Update, Some(client)) => {
                let config = obj.server_config(server.to_owned(), None);

                match client.update(server, &config).await {
                    Ok(()) => {
                        let message = format!(
                            "Update pricing tier of server '{server}' to '{}'",
                            config.pricing_tier
                        );
                        self.store
                            .record(obj, Level::Normal, UPDATE_SERVER_EVENT, &message)
                            .await;
                    }
                    Err(azure::Error::Fatal(message)) => {
                        self.fail(obj, &mut next, message).await;
                    }
                    Err(err) => return Err(Error::Cloud(err)),
                }
            }
            (Action::RecordError, _) => {
                let message = next.message.to_owned().unwrap_or_default();
                self.store
                    .record(obj, Level::Warning, RECONCILE_FAILED_EVENT, &message)
                    .await;
            }
            _ => {}
        }

        if next.phase == Phase::Ready
            && (previous.phase != Phase::Ready || previous.endpoint != next.endpoint)
        {
            self.publish_endpoint(obj, server, &next).await?;
        }

        Ok(next)
    }

    async fn fail(&self, obj: &MysqlServer, next: &mut Status, message: String) {
        self.store
            .record(obj, Level::Warning, RECONCILE_FAILED_EVENT, &message)
            .await;

        next.phase = Phase::Failed;
        next.message = Some(message);
    }

    /// returns the administrator password stored in the connection secret,
    /// a new one is generated and stored before the first creation
    async fn admin_password(&self, obj: &MysqlServer, server: &ServerRef) -> Result<String, Error> {
        let (namespace, _) = resource::namespaced_name(obj);
        let name = obj.connection_secret_name();

        if let Some(existing) = self.store.secret(&namespace, &name).await? {
            if let Some(password) = secret::decode(&existing).remove(PASSWORD_KEY) {
                return Ok(password);
            }
        }

        debug!(
            namespace = &namespace,
            name = &name,
            "Generate administrator password into connection secret",
        );

        let password = secret::password(secret::PASSWORD_LENGTH);
        let entries = BTreeMap::from([
            (USERNAME_KEY.to_string(), obj.admin_username(server)),
            (PASSWORD_KEY.to_string(), password.to_owned()),
        ]);

        self.store
            .apply_secret(&secret::new(obj, &name, entries))
            .await?;

        Ok(password)
    }

    async fn publish_endpoint(
        &self,
        obj: &MysqlServer,
        server: &ServerRef,
        status: &Status,
    ) -> Result<(), Error> {
        let mut entries = BTreeMap::from([(USERNAME_KEY.to_string(), obj.admin_username(server))]);
        if let Some(endpoint) = &status.endpoint {
            entries.insert(ENDPOINT_KEY.to_string(), endpoint.to_owned());
        }

        let name = obj.connection_secret_name();
        self.store
            .apply_secret(&secret::new(obj, &name, entries))
            .await?;

        Ok(())
    }

    /// writes the status if it changed, the write is refused if the instance
    /// moved since it was read
    async fn persist(
        &self,
        obj: &MysqlServer,
        previous: &Status,
        mut next: Status,
    ) -> Result<Status, Error> {
        if next == *previous {
            return Ok(next);
        }

        if next.phase != previous.phase
            || (next.phase == Phase::Failed && next.message != previous.message)
        {
            next.last_transition_time = Some(Utc::now());
        }

        self.store.write_status(obj, &next).await?;
        Ok(next)
    }

    fn requeue(&self, status: &Status) -> Outcome {
        match status.phase {
            Phase::Pending | Phase::Creating => Outcome::after(self.config.creating_requeue()),
            Phase::Ready => Outcome::after(self.config.ready_requeue()),
            Phase::Failed => match self.config.failed_retry {
                FailedRetry::Never => Outcome::done(),
                FailedRetry::Backoff => Outcome::after(self.config.failed_retry_after()),
            },
        }
    }

    async fn delete(&self, key: &ObjectKey, obj: MysqlServer) -> Result<Outcome, Error> {
        if !finalizer::contains(&obj, FINALIZER) {
            debug!(
                namespace = &key.namespace,
                name = &key.name,
                "Instance is being deleted and does not hold the deletion guard",
            );
            return Ok(Outcome::done());
        }

        if let Err(err) = self.delete_server(key, &obj).await {
            warn!(
                namespace = &key.namespace,
                name = &key.name,
                error = err.to_string(),
                "Failed to delete server of instance, keep deletion guard",
            );
            return Ok(Outcome::after(self.config.deletion_requeue()));
        }

        info!(
            namespace = &key.namespace,
            name = &key.name,
            "Release deletion guard of instance",
        );
        self.store.remove_finalizer(&obj, FINALIZER).await?;
        self.backoff.reset(key);

        Ok(Outcome::done())
    }

    /// returns once the cloud provider accepted the deletion or reported the
    /// server as absent, reads may lag behind an accepted create so the delete
    /// request is always issued
    async fn delete_server(&self, key: &ObjectKey, obj: &MysqlServer) -> Result<(), Error> {
        // without an identifier no server has ever been derived
        let server = match obj.server_ref() {
            Some(server) => server,
            None => return Ok(()),
        };

        let credentials =
            credentials::resolve(&self.store, &key.namespace, &obj.spec.provider_ref.name).await?;
        let client = self.connector.connect(&credentials.bytes).await?;
        let observed = match observe(&client, &server).await? {
            Observed::Fatal(message) => return Err(Error::Cloud(azure::Error::Fatal(message))),
            observed => observed,
        };

        let previous = obj.status.to_owned().unwrap_or_default();
        let (action, _) = machine::step(&obj.spec, observed.as_observation(), &previous, true);
        debug!(
            namespace = &key.namespace,
            name = &key.name,
            server = server.to_string(),
            action = action.to_string(),
            "Request deletion of server",
        );

        match client.delete(&server).await {
            Ok(()) => {
                let message = format!("Delete server '{server}'");
                self.store
                    .record(obj, Level::Normal, DELETE_SERVER_EVENT, &message)
                    .await;
                Ok(())
            }
            Err(azure::Error::NotFound(_)) => Ok(()),
            Err(err) => Err(Error::Cloud(err)),
        }
    }
}
