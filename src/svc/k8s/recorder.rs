//! # Event recorder module
//!
//! This module provide an alternative to the golang EventRecorder structure
//!
//! See following links for more details:
//! - <https://book-v1.book.kubebuilder.io/beyond_basics/creating_events.html>
//! - <https://github.com/kubernetes/client-go/blob/master/tools/record/event.go#L56>

use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use chrono::Utc;
use k8s_openapi::{
    api::core::v1::{Event, EventSource},
    apimachinery::pkg::apis::meta::v1::{MicroTime, Time},
};
use kube::{
    api::{ObjectMeta, PostParams},
    Api, Client, CustomResourceExt, ResourceExt,
};
use tracing::debug;

use crate::svc::k8s::resource;

// -----------------------------------------------------------------------------
// Constants

pub const REPORTING_COMPONENT: &str = env!("CARGO_PKG_NAME");

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to parse '{0}', available options are 'normal' or 'warning'")]
    Parse(String),
}

// -----------------------------------------------------------------------------
// Level enumeration

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug)]
pub enum Level {
    Warning,
    Normal,
}

impl FromStr for Level {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "warning" => Self::Warning,
            "normal" => Self::Normal,
            _ => {
                return Err(Error::Parse(s.to_string()));
            }
        })
    }
}

impl Display for Level {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Warning => write!(f, "Warning"),
            Self::Normal => write!(f, "Normal"),
        }
    }
}

// -----------------------------------------------------------------------------
// Helper functions

/// create a new event from the given parameters
pub fn event<T>(obj: &T, level: Level, action: &str, message: &str) -> Event
where
    T: ResourceExt + CustomResourceExt,
{
    let now = Utc::now();

    Event {
        metadata: ObjectMeta {
            namespace: obj.namespace(),
            name: Some(format!(
                "{}-{}-{}",
                obj.name_any(),
                action.to_lowercase(),
                now.timestamp_millis()
            )),
            ..Default::default()
        },
        type_: Some(level.to_string()),
        action: Some(action.to_string()),
        count: Some(1),
        event_time: Some(MicroTime(now)),
        first_timestamp: Some(Time(now)),
        involved_object: resource::object_reference(obj),
        last_timestamp: Some(Time(now)),
        message: Some(message.to_string()),
        reason: Some(action.to_string()),
        reporting_component: Some(REPORTING_COMPONENT.to_string()),
        reporting_instance: Some(format!(
            "{}/{}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        )),
        source: Some(source()),
        ..Default::default()
    }
}

/// returns the source of this operator
pub fn source() -> EventSource {
    let host = hostname::get()
        .ok()
        .map(|host| host.to_string_lossy().to_string());

    EventSource {
        component: Some(REPORTING_COMPONENT.to_string()),
        host,
    }
}

/// record an event for the given object
pub async fn record<T>(
    client: Client,
    obj: &T,
    level: Level,
    action: &str,
    message: &str,
) -> Result<Event, kube::Error>
where
    T: ResourceExt + CustomResourceExt + Debug,
{
    let (namespace, name) = resource::namespaced_name(obj);

    debug!(
        namespace = &namespace,
        name = &name,
        action = action,
        level = level.to_string(),
        "Create event for resource, {}",
        message
    );

    Api::<Event>::namespaced(client, &namespace)
        .create(&PostParams::default(), &event(obj, level, action, message))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::crd::provider::{Provider, SecretKeyReference, Spec};

    #[test]
    fn level_is_parsed_without_case() {
        assert_eq!(Level::from_str("WARNING").unwrap(), Level::Warning);
        assert_eq!(Level::from_str("normal").unwrap(), Level::Normal);
        assert!(Level::from_str("info").is_err());
    }

    #[test]
    fn event_points_to_the_object() {
        let mut obj = Provider::new(
            "azure",
            Spec {
                auth_secret: SecretKeyReference {
                    name: "azure-credentials".to_string(),
                    key: "credentials".to_string(),
                },
            },
        );
        obj.metadata.namespace = Some("default".to_string());

        let event = event(&obj, Level::Warning, "CredentialsInvalid", "bad secret");

        assert_eq!(event.type_.as_deref(), Some("Warning"));
        assert_eq!(event.reason.as_deref(), Some("CredentialsInvalid"));
        assert_eq!(event.involved_object.name.as_deref(), Some("azure"));
        assert_eq!(event.involved_object.kind.as_deref(), Some("Provider"));
        assert_eq!(event.metadata.namespace.as_deref(), Some("default"));
    }
}
