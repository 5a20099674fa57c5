//! # Configuration module
//!
//! This module provide utilities and helpers to interact with the configuration

use std::{
    convert::TryFrom,
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------------
// Constants

pub const DEFAULT_LISTEN_PORT: u16 = 8000;
pub const DEFAULT_API_VERSION: &str = "2017-12-01";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to load file '{0:?}', {1}")]
    File(PathBuf, ConfigError),
    #[error("failed to load configuration, {0}")]
    Cast(ConfigError),
    #[error("failed to set default for key '{0}', {1}")]
    Default(String, ConfigError),
    #[error("failed to build configuration, {0}")]
    Build(ConfigError),
}

// -----------------------------------------------------------------------------
// Operator structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Operator {
    #[serde(rename = "listen")]
    pub listen: SocketAddr,
}

impl Default for Operator {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_LISTEN_PORT),
        }
    }
}

// -----------------------------------------------------------------------------
// FailedRetry enumeration

/// what to do with an instance the cloud provider rejected
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum FailedRetry {
    /// wait for a change of the desired spec or of the credentials
    #[default]
    #[serde(rename = "never")]
    Never,
    /// re-attempt once `failed_retry_after` elapsed since the failure
    #[serde(rename = "backoff")]
    Backoff,
}

// -----------------------------------------------------------------------------
// Reconciler structure

/// durations are expressed in seconds
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Reconciler {
    #[serde(rename = "creating_requeue")]
    pub creating_requeue: u64,
    #[serde(rename = "ready_requeue")]
    pub ready_requeue: u64,
    #[serde(rename = "deletion_requeue")]
    pub deletion_requeue: u64,
    #[serde(rename = "backoff_initial")]
    pub backoff_initial: u64,
    #[serde(rename = "backoff_max")]
    pub backoff_max: u64,
    #[serde(rename = "failed_retry")]
    pub failed_retry: FailedRetry,
    #[serde(rename = "failed_retry_after")]
    pub failed_retry_after: u64,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self {
            creating_requeue: 10,
            ready_requeue: 300,
            deletion_requeue: 5,
            backoff_initial: 5,
            backoff_max: 300,
            failed_retry: FailedRetry::Never,
            failed_retry_after: 600,
        }
    }
}

impl Reconciler {
    pub fn creating_requeue(&self) -> Duration {
        Duration::from_secs(self.creating_requeue)
    }

    pub fn ready_requeue(&self) -> Duration {
        Duration::from_secs(self.ready_requeue)
    }

    pub fn deletion_requeue(&self) -> Duration {
        Duration::from_secs(self.deletion_requeue)
    }

    pub fn failed_retry_after(&self) -> Duration {
        Duration::from_secs(self.failed_retry_after)
    }
}

// -----------------------------------------------------------------------------
// Azure structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Azure {
    #[serde(rename = "api_version")]
    pub api_version: String,
    /// timeout of requests to the azure apis in seconds
    #[serde(rename = "timeout")]
    pub timeout: u64,
}

impl Default for Azure {
    fn default() -> Self {
        Self {
            api_version: DEFAULT_API_VERSION.to_string(),
            timeout: 30,
        }
    }
}

// -----------------------------------------------------------------------------
// Configuration structures

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Configuration {
    #[serde(rename = "operator")]
    pub operator: Operator,
    #[serde(rename = "reconciler")]
    pub reconciler: Reconciler,
    #[serde(rename = "azure")]
    pub azure: Azure,
}

impl TryFrom<PathBuf> for Configuration {
    type Error = Error;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        defaults()?
            .add_source(File::from(path.to_owned()).required(true))
            .add_source(environment())
            .build()
            .map_err(|err| Error::File(path, err))?
            .try_deserialize()
            .map_err(Error::Cast)
    }
}

impl Configuration {
    pub fn try_default() -> Result<Self, Error> {
        let mut paths = vec![PathBuf::from(format!(
            "/etc/{}/config",
            env!("CARGO_PKG_NAME")
        ))];

        if let Some(home) = env::var_os("HOME") {
            paths.push(
                PathBuf::from(home)
                    .join(".config")
                    .join(env!("CARGO_PKG_NAME"))
                    .join("config"),
            );
        }

        paths.push(PathBuf::from("config"));

        paths
            .into_iter()
            .fold(defaults()?, |builder, path| {
                builder.add_source(File::from(path).required(false))
            })
            .add_source(environment())
            .build()
            .map_err(Error::Build)?
            .try_deserialize()
            .map_err(Error::Cast)
    }
}

// -----------------------------------------------------------------------------
// Helpers

fn environment() -> Environment {
    Environment::with_prefix(&env!("CARGO_PKG_NAME").replace('-', "_")).separator("__")
}

fn defaults() -> Result<ConfigBuilder<DefaultState>, Error> {
    let operator = Operator::default();
    let reconciler = Reconciler::default();
    let azure = Azure::default();

    let defaults: [(&str, config::Value); 10] = [
        ("operator.listen", operator.listen.to_string().into()),
        (
            "reconciler.creating_requeue",
            (reconciler.creating_requeue as i64).into(),
        ),
        (
            "reconciler.ready_requeue",
            (reconciler.ready_requeue as i64).into(),
        ),
        (
            "reconciler.deletion_requeue",
            (reconciler.deletion_requeue as i64).into(),
        ),
        (
            "reconciler.backoff_initial",
            (reconciler.backoff_initial as i64).into(),
        ),
        ("reconciler.backoff_max", (reconciler.backoff_max as i64).into()),
        ("reconciler.failed_retry", "never".into()),
        (
            "reconciler.failed_retry_after",
            (reconciler.failed_retry_after as i64).into(),
        ),
        ("azure.api_version", azure.api_version.into()),
        ("azure.timeout", (azure.timeout as i64).into()),
    ];

    defaults
        .into_iter()
        .try_fold(Config::builder(), |builder, (key, value)| {
            builder
                .set_default(key, value)
                .map_err(|err| Error::Default(key.to_string(), err))
        })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_deserializable() {
        let config: Configuration = defaults()
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config, Configuration::default());
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[reconciler]\nfailed_retry = \"backoff\"\nready_requeue = 60\n\n[operator]\nlisten = \"127.0.0.1:9000\""
        )
        .unwrap();

        let config = Configuration::try_from(file.path().to_path_buf()).unwrap();

        assert_eq!(config.reconciler.failed_retry, FailedRetry::Backoff);
        assert_eq!(config.reconciler.ready_requeue(), Duration::from_secs(60));
        assert_eq!(config.reconciler.creating_requeue(), Duration::from_secs(10));
        assert_eq!(config.operator.listen.port(), 9000);
        assert_eq!(config.azure.api_version, DEFAULT_API_VERSION);
    }
}
