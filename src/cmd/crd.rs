//! # Custom resource definition module
//!
//! This module provides the command line interface printing the custom
//! resource definitions the operator relies on

use std::{str::FromStr, sync::Arc};

use async_trait::async_trait;
use clap::Subcommand;
use kube::CustomResourceExt;

use crate::{
    cmd::Executor,
    svc::{
        cfg::Configuration,
        crd::{mysql::MysqlServer, provider::Provider},
    },
};

// -----------------------------------------------------------------------------
// CustomResource enum

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug)]
pub enum CustomResource {
    MysqlServer,
    Provider,
}

impl FromStr for CustomResource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mysqlserver" | "mysql" => Ok(Self::MysqlServer),
            "provider" => Ok(Self::Provider),
            _ => Err(format!(
                "failed to parse '{s}', available options are 'mysqlserver' or 'provider'"
            )),
        }
    }
}

impl CustomResource {
    pub fn to_yaml(self) -> Result<String, serde_yaml::Error> {
        match self {
            Self::MysqlServer => serde_yaml::to_string(&MysqlServer::crd()),
            Self::Provider => serde_yaml::to_string(&Provider::crd()),
        }
    }
}

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to serialize custom resource definition, {0}")]
    Serialize(serde_yaml::Error),
}

// -----------------------------------------------------------------------------
// CustomResourceDefinition enum

#[derive(Subcommand, Clone, Debug)]
pub enum CustomResourceDefinition {
    /// View custom resource definition
    #[clap(name = "view", aliases = &["v"])]
    View {
        #[clap(name = "custom-resource")]
        custom_resource: Option<CustomResource>,
    },
}

#[async_trait]
impl Executor for CustomResourceDefinition {
    type Error = Error;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error> {
        match self {
            Self::View { custom_resource } => view(config, *custom_resource).await,
        }
    }
}

// -----------------------------------------------------------------------------
// view function

pub async fn view(
    _config: Arc<Configuration>,
    custom_resource: Option<CustomResource>,
) -> Result<(), Error> {
    let resources = match custom_resource {
        Some(cr) => vec![cr],
        None => vec![CustomResource::MysqlServer, CustomResource::Provider],
    };

    let crds = resources
        .into_iter()
        .map(CustomResource::to_yaml)
        .collect::<Result<Vec<_>, _>>()
        .map_err(Error::Serialize)?;

    print!("{}", crds.join("---\n"));
    Ok(())
}
