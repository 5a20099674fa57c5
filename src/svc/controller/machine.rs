//! # Machine module
//!
//! This module provide the instance state machine, a pure function mapping the
//! desired spec, the observed cloud state and the previous status to the next
//! status and the single action the reconciler has to issue.

use std::fmt::{self, Display, Formatter};

use crate::svc::{
    azure::{ObservedServer, ServerState},
    crd::mysql::{Phase, Spec, Status},
};

// -----------------------------------------------------------------------------
// Action enumeration

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Action {
    NoOp,
    Create,
    Update,
    Delete,
    /// the cloud resource is gone, the deletion guard can be released
    ReleaseGuard,
    RecordError,
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::NoOp => write!(f, "NoOp"),
            Self::Create => write!(f, "Create"),
            Self::Update => write!(f, "Update"),
            Self::Delete => write!(f, "Delete"),
            Self::ReleaseGuard => write!(f, "ReleaseGuard"),
            Self::RecordError => write!(f, "RecordError"),
        }
    }
}

// -----------------------------------------------------------------------------
// Observation enumeration

/// what the cloud provider told about the server during this pass
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Observation<'a> {
    Absent,
    Present {
        server: &'a ObservedServer,
        ready: bool,
    },
    /// the provider rejected a request, retrying without a change is useless
    Fatal(&'a str),
}

// -----------------------------------------------------------------------------
// Helpers functions

/// returns if the observed server diverges from the desired spec, only the
/// fields managed by the controller are compared
pub fn drifted(desired: &Spec, server: &ObservedServer) -> bool {
    !desired.pricing_tier.matches(&server.pricing_tier)
}

/// returns the next status and the action to issue, this function does not
/// perform any side effect
pub fn step(
    desired: &Spec,
    observation: Observation,
    previous: &Status,
    deleting: bool,
) -> (Action, Status) {
    let mut next = previous.to_owned();

    if deleting {
        return match observation {
            Observation::Absent => (Action::ReleaseGuard, next),
            _ => (Action::Delete, next),
        };
    }

    match observation {
        Observation::Fatal(message) => {
            next.phase = Phase::Failed;
            next.message = Some(message.to_string());
            (Action::RecordError, next)
        }
        Observation::Absent => {
            next.phase = Phase::Creating;
            next.endpoint = None;
            next.resource_version = None;
            next.message = None;
            (Action::Create, next)
        }
        Observation::Present { server, ready } => {
            next.resource_id = Some(server.id.to_owned());
            next.resource_version = server.version.to_owned();

            if let ServerState::Failed(state) = &server.state {
                next.phase = Phase::Failed;
                next.message = Some(format!("server '{}' is in state '{}'", server.id, state));
                return (Action::RecordError, next);
            }

            next.message = None;
            if !ready {
                next.phase = Phase::Creating;
                return (Action::NoOp, next);
            }

            if drifted(desired, server) {
                next.phase = Phase::Creating;
                return (Action::Update, next);
            }

            next.phase = Phase::Ready;
            next.endpoint = server.fqdn.to_owned();
            (Action::NoOp, next)
        }
    }
}
