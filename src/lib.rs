//! # Azure database operator
//!
//! A kubernetes operator that provisions azure managed mysql servers through
//! custom resource definition

pub mod cmd;
pub mod logging;
pub mod svc;
