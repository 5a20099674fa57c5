//! # Kubernetes module
//!
//! This module provide kubernetes helpers, the desired-state store, the
//! per-key serializer and the glue with the kubernetes controller runtime

use std::{error::Error, fmt::Debug, hash::Hash, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kube::{
    runtime::{
        controller::{self, Action},
        watcher, Controller,
    },
    CustomResourceExt, Resource, ResourceExt,
};
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter_vec, CounterVec};
use serde::de::DeserializeOwned;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace};

use crate::svc::{
    azure::client::AzureConnector,
    cfg::Configuration,
    k8s::{
        serial::Serializer,
        store::{KubeStore, ObjectKey},
    },
};

pub mod client;
pub mod finalizer;
pub mod recorder;
pub mod resource;
pub mod secret;
pub mod serial;
pub mod store;

// -----------------------------------------------------------------------------
// Constants

pub const RECONCILIATION_UPSERT_EVENT: &str = "upsert";
pub const RECONCILIATION_DELETE_EVENT: &str = "delete";

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static RECONCILIATION_SUCCESS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_reconciliation_success",
            "number of successful reconciliation"
        ),
        &["kind"]
    )
    .expect("metrics 'kubernetes_operator_reconciliation_success' to not be already initialized")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_FAILED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_reconciliation_failed",
            "number of failed reconciliation"
        ),
        &["kind"]
    )
    .expect("metrics 'kubernetes_operator_reconciliation_failed' to not be already initialized")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_EVENT: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_reconciliation_event",
            "number of upsert or delete event"
        ),
        &["kind", "namespace", "event"]
    )
    .expect("metrics 'kubernetes_operator_reconciliation_event' to not be already initialized")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_COALESCED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_reconciliation_coalesced",
            "number of event folded into an in-flight reconciliation"
        ),
        &["kind"]
    )
    .expect("metrics 'kubernetes_operator_reconciliation_coalesced' to not be already initialized")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_DURATION: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_reconciliation_duration",
            "duration of reconciliation"
        ),
        &["kind", "unit"]
    )
    .expect("metrics 'kubernetes_operator_reconciliation_duration' to not be already initialized")
});

// -----------------------------------------------------------------------------
// Context structure

/// contains the kubernetes client and the reconciler shared by every pass
pub struct Context {
    pub kube: kube::Client,
    pub reconciler: crate::svc::controller::Reconciler<KubeStore, AzureConnector>,
    pub serializer: Serializer<ObjectKey>,
}

impl Context {
    pub fn new(kube: kube::Client, connector: AzureConnector, config: Arc<Configuration>) -> Self {
        let reconciler = crate::svc::controller::Reconciler::new(
            KubeStore::from(kube.to_owned()),
            connector,
            config.reconciler.to_owned(),
        );

        Self {
            kube,
            reconciler,
            serializer: Serializer::default(),
        }
    }
}

// -----------------------------------------------------------------------------
// ControllerBuilder trait

/// provides a common way to create a kubernetes
/// controller [`Controller<T>`]
pub trait ControllerBuilder<T>
where
    T: Resource + Clone + Debug,
    <T as Resource>::DynamicType: Eq + Hash,
{
    /// returns a new created kubernetes controller
    fn build(&self, ctx: Arc<Context>) -> Controller<T>;
}

// -----------------------------------------------------------------------------
// Reconciler trait

/// provides the methods given to a kubernetes controller [`Controller<T>`]
#[async_trait]
pub trait Reconciler<T>
where
    T: ResourceExt + CustomResourceExt + Debug + Clone + Send + Sync + 'static,
{
    type Error: Error + Send + Sync;

    /// run one pass for the object with the given key, returns when the
    /// object has to be looked at again
    async fn apply(ctx: Arc<Context>, key: ObjectKey) -> Result<Option<Duration>, Self::Error>;

    /// returns the delay before retrying a pass which failed with the given
    /// error
    fn retry(obj: Arc<T>, err: &Self::Error, ctx: Arc<Context>) -> Duration;

    /// returns a [`Action`] to perform following the given error
    fn error_policy(obj: Arc<T>, err: &Self::Error, ctx: Arc<Context>) -> Action {
        Action::requeue(Self::retry(obj, err, ctx))
    }

    /// process the object, at most one pass runs for a given object at a time
    /// and events received in the meantime are folded into a single re-run
    async fn reconcile(obj: Arc<T>, ctx: Arc<Context>) -> Result<Action, Self::Error> {
        let key = ObjectKey::from_resource(&*obj);
        let api_resource = T::api_resource();
        let event = if resource::deleted(&*obj) {
            RECONCILIATION_DELETE_EVENT
        } else {
            RECONCILIATION_UPSERT_EVENT
        };

        info!(
            kind = &api_resource.kind,
            uid = &obj.meta().uid,
            namespace = &key.namespace,
            name = &key.name,
            event = event,
            "Received event for custom resource",
        );

        #[cfg(feature = "metrics")]
        RECONCILIATION_EVENT
            .with_label_values(&[&api_resource.kind, &key.namespace, event])
            .inc();

        let result = ctx
            .serializer
            .run(key.to_owned(), || Self::apply(ctx.to_owned(), key.to_owned()))
            .await;

        match result {
            None => {
                debug!(
                    kind = &api_resource.kind,
                    namespace = &key.namespace,
                    name = &key.name,
                    "Fold event into the in-flight reconciliation of custom resource",
                );

                #[cfg(feature = "metrics")]
                RECONCILIATION_COALESCED
                    .with_label_values(&[&api_resource.kind])
                    .inc();

                Ok(Action::await_change())
            }
            Some(Ok(Some(duration))) => Ok(Action::requeue(duration)),
            Some(Ok(None)) => Ok(Action::await_change()),
            Some(Err(err)) => {
                error!(
                    kind = &api_resource.kind,
                    uid = &obj.meta().uid,
                    namespace = &key.namespace,
                    name = &key.name,
                    error = err.to_string(),
                    "Failed to reconcile custom resource",
                );

                Err(err)
            }
        }
    }
}

// -----------------------------------------------------------------------------
// WatcherError trait

/// group other trait needed to provide a default
/// implementation for [`Watcher<T>`] trait
pub trait WatcherError:
    From<kube::Error> + From<controller::Error<Self, watcher::Error>> + Error
where
    Self: 'static,
{
}

/// Blanket implementation of [`WatcherError<T>`]
impl<T> WatcherError for T
where
    T: From<kube::Error> + From<controller::Error<Self, watcher::Error>> + Error,
    Self: 'static,
{
}

// -----------------------------------------------------------------------------
// Watcher trait

/// provides a watch method that listen to events of
/// kubernetes custom resource using a [`Controller<T>`]
#[async_trait]
pub trait Watcher<T>: ControllerBuilder<T> + Reconciler<T>
where
    T: DeserializeOwned + ResourceExt + CustomResourceExt + Clone + Debug + Send + Sync + 'static,
    <T as Resource>::DynamicType: Unpin + Eq + Hash + Clone + Debug + Send + Sync,
    Self: Send + Sync + 'static,
    <Self as Reconciler<T>>::Error: WatcherError + Send + Sync,
{
    type Error: WatcherError + Send + Sync;

    /// listen for events of the custom resource as generic parameter
    async fn watch(&self, ctx: Arc<Context>) -> Result<(), <Self as Watcher<T>>::Error> {
        let api_resource = T::api_resource();
        let mut stream = self
            .build(ctx.to_owned())
            .run(Self::reconcile, Self::error_policy, ctx)
            .boxed();

        loop {
            let instant = Instant::now();

            match stream.try_next().await {
                Ok(None) => {
                    debug!("We have reached the end of the infinite watch stream");
                    return Ok(());
                }
                Ok(Some((obj, _action))) => {
                    debug!(
                        kind = &api_resource.kind,
                        namespace = &obj.namespace,
                        name = &obj.name,
                        "Successfully reconcile resource",
                    );

                    #[cfg(feature = "metrics")]
                    RECONCILIATION_SUCCESS
                        .with_label_values(&[&api_resource.kind])
                        .inc();
                }
                Err(controller::Error::ObjectNotFound(obj_ref)) => {
                    debug!(
                        namespace = &obj_ref.namespace,
                        name = &obj_ref.name,
                        "Received an event about an already deleted resource",
                    );

                    #[cfg(feature = "metrics")]
                    RECONCILIATION_SUCCESS
                        .with_label_values(&[&api_resource.kind])
                        .inc();
                }
                Err(err) => {
                    error!(
                        kind = &api_resource.kind,
                        error = err.to_string(),
                        "Failed to reconcile resource",
                    );

                    #[cfg(feature = "metrics")]
                    RECONCILIATION_FAILED
                        .with_label_values(&[&api_resource.kind])
                        .inc();
                }
            }

            trace!(
                kind = &api_resource.kind,
                duration = Instant::now().duration_since(instant).as_micros() as u64,
                "Put watch event loop to bed",
            );

            #[cfg(feature = "metrics")]
            RECONCILIATION_DURATION
                .with_label_values(&[&api_resource.kind, "us"])
                .inc_by(Instant::now().duration_since(instant).as_micros() as f64);

            sleep_until(instant + Duration::from_millis(100)).await;
        }
    }
}

/// Blanket implementation for [`Watcher<T>`]
impl<T, U> Watcher<T> for U
where
    T: DeserializeOwned + ResourceExt + CustomResourceExt + Clone + Debug + Send + Sync + 'static,
    <T as Resource>::DynamicType: Unpin + Eq + Hash + Clone + Debug + Send + Sync,
    U: Reconciler<T> + ControllerBuilder<T>,
    U::Error: WatcherError + Send + Sync,
    Self: Send + Sync + 'static,
{
    type Error = U::Error;
}
