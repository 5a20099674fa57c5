//! # Command module
//!
//! This module provide command line interface structures and helpers
use std::{io, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use clap::{ArgAction, Parser, Subcommand};
use tracing::{error, info};

use crate::svc::{
    azure::client::AzureConnector,
    cfg::Configuration,
    crd::mysql,
    k8s::{client, Context, Watcher},
    telemetry,
};

pub mod crd;

// -----------------------------------------------------------------------------
// Executor trait

#[async_trait]
pub trait Executor {
    type Error;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error>;
}

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute command '{0}', {1}")]
    Execution(String, Arc<Error>),
    #[error("failed to execute command, {0}")]
    CustomResourceDefinition(crd::Error),
    #[error("failed to run daemon, {0}")]
    Daemon(DaemonError),
}

// -----------------------------------------------------------------------------
// Command enum

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Interact with custom resource definition
    #[clap(name = "custom-resource-definition", aliases = &["crd"], subcommand)]
    CustomResourceDefinition(crd::CustomResourceDefinition),
}

#[async_trait]
impl Executor for Command {
    type Error = Error;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error> {
        match self {
            Self::CustomResourceDefinition(crd) => crd
                .execute(config)
                .await
                .map_err(Error::CustomResourceDefinition)
                .map_err(|err| Error::Execution("custom-resource-definition".into(), Arc::new(err))),
        }
    }
}

// -----------------------------------------------------------------------------
// Args struct

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Args {
    /// Increase log verbosity
    #[clap(short = 'v', global = true, action = ArgAction::Count)]
    pub verbosity: u8,
    /// Specify location of kubeconfig
    #[clap(short = 'k', long = "kubeconfig", global = true)]
    pub kubeconfig: Option<PathBuf>,
    /// Specify location of configuration
    #[clap(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Check if configuration is healthy
    #[clap(short = 't', long = "check", global = true)]
    pub check: bool,
    #[clap(subcommand)]
    pub command: Option<Command>,
}

// -----------------------------------------------------------------------------
// DaemonError enum

#[derive(thiserror::Error, Debug)]
pub enum DaemonError {
    #[error("failed to handle termination signal, {0}")]
    SigTerm(io::Error),
    #[error("failed to create kubernetes client, {0}")]
    Client(client::Error),
    #[error("failed to create azure http client, {0}")]
    Azure(reqwest::Error),
}

impl From<DaemonError> for Error {
    fn from(err: DaemonError) -> Self {
        Self::Daemon(err)
    }
}

// -----------------------------------------------------------------------------
// daemon function

pub async fn daemon(kubeconfig: Option<PathBuf>, config: Arc<Configuration>) -> Result<(), Error> {
    // -------------------------------------------------------------------------
    // Create a new kubernetes client from path if defined, or via the
    // environment or defaults locations
    let kube_client = client::try_new(kubeconfig)
        .await
        .map_err(DaemonError::Client)?;

    // -------------------------------------------------------------------------
    // Create the connector building azure clients from provider credentials
    let connector = AzureConnector::try_new(&config.azure).map_err(DaemonError::Azure)?;

    // -------------------------------------------------------------------------
    // Create context shared by every reconciliation
    let listen = config.operator.listen;
    let ctx = Arc::new(Context::new(kube_client, connector, config));

    // -------------------------------------------------------------------------
    // Start the reconciler and the telemetry server
    let handles = vec![
        tokio::spawn(async move {
            let reconciler = mysql::Reconciler::default();

            info!("Start to listen for events of mysql server custom resource");
            if let Err(err) = reconciler.watch(ctx).await {
                error!(
                    error = err.to_string(),
                    "Could not reconcile mysql server custom resource"
                );
            }
        }),
        tokio::spawn(async move {
            if let Err(err) = telemetry::serve(listen).await {
                error!(error = err.to_string(), "Could not serve telemetry endpoints");
            }
        }),
    ];

    // -------------------------------------------------------------------------
    // Wait for termination signal
    tokio::signal::ctrl_c()
        .await
        .map_err(DaemonError::SigTerm)?;

    info!("Received termination signal, cancel pending reconciliations");

    // -------------------------------------------------------------------------
    // Cancel tasks, in-flight cloud calls are dropped and every action is
    // safe to issue again on the next start
    handles.iter().for_each(|handle| handle.abort());

    for handle in handles {
        if let Err(err) = handle.await {
            if !err.is_cancelled() {
                error!(error = err.to_string(), "Could not wait for the task to complete");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn arguments_are_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn verbosity_is_counted() {
        let args = Args::parse_from(["azure-database-operator", "-vvv", "-c", "config.toml"]);

        assert_eq!(args.verbosity, 3);
        assert_eq!(args.config, Some(PathBuf::from("config.toml")));
        assert!(args.command.is_none());
    }

    #[test]
    fn view_subcommand_is_parsed() {
        let args = Args::parse_from([
            "azure-database-operator",
            "crd",
            "view",
            "provider",
        ]);

        assert!(matches!(
            args.command,
            Some(Command::CustomResourceDefinition(
                crd::CustomResourceDefinition::View {
                    custom_resource: Some(crd::CustomResource::Provider)
                }
            ))
        ));
    }
}
