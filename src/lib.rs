#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::cast_precision_loss
)]

pub mod audit;
pub mod config;
pub mod decision;
pub mod error;
pub mod matcher;
pub mod policy;
pub mod pool;
pub mod resilience;
pub mod session;

pub use config::Config;
pub use decision::{DecidedBy, DecisionEvent, DecisionPipeline, Verdict};
pub use error::{PilotError, Result};
pub use matcher::{Category, ConfirmationRequest, OutputEvent, PatternMatcher, RiskLevel};
pub use pool::{Task, TaskHandle, TaskOptions, TaskResult, TaskStatus, WorkerPool};
pub use session::{PseudoSession, WorkerState};
