//! # Service module
//!
//! This module provide services used by the operator

pub mod azure;
pub mod cfg;
pub mod controller;
pub mod crd;
pub mod k8s;
pub mod telemetry;
