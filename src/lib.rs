//! HTTP/HTTPS load-generation engine.
//!
//! A test plan (total iterations, duration, load shape or an explicit
//! time/count program, and a multi-step scenario) is compiled into a
//! per-tick schedule; workers execute scenario iterations against one or
//! more endpoints, threading captured variables between steps and timing
//! every protocol phase; a single aggregator task folds the result stream
//! into live counters and averages.

pub mod config;
pub mod engine;
pub mod error;
pub mod extract;
pub mod inject;
pub mod plan;
pub mod proxy;
pub mod report;
pub mod requester;
pub mod result;
pub mod runner;
pub mod scenario;
pub mod schedule;
pub mod summary;

pub use engine::Engine;
pub use error::{EngineError, ErrorKind, RequestError};
pub use plan::{LoadPlan, LoadShape, ProgramEntry};
pub use report::AggregateSummary;
pub use result::{ScenarioResult, StepResult};
pub use scenario::{Scenario, ScenarioStep};
