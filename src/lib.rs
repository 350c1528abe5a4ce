pub mod adapters;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod ports;
pub mod retry;
pub mod types;
pub mod validation;
pub mod vcs;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_config, SwarmConfig};
pub use db::SwarmDb;
pub use error::{Result, SwarmError};
pub use pipeline::{PipelineOutcome, PipelineRunner};
pub use pool::{InvocationBudget, RunResult, WorkerPool};
pub use ports::Collaborators;
pub use types::*;
pub use validation::{PhaseGateValidator, RunValidator};
pub use worker::{TaskReport, Worker};
