// ABOUTME: The phase pipeline: phase descriptors, run state, lock, and engine.
// ABOUTME: Everything that sequences a deployment lives under this module.

mod engine;
mod error;
mod lock;
mod phase;
mod run;

pub use engine::{Collaborators, Engine, EngineOptions};
pub use error::{FailureAction, PhaseError, classify};
pub use lock::{DeployLock, LockError, LockInfo};
pub use phase::{
    Criticality, PhaseName, PhaseResult, PhaseSpec, PhaseStatus, SkipCondition, standard_phases,
};
pub use run::{DeploymentRun, InvalidTransition, RunMode, RunState};
