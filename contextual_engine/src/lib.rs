//! Contextual Reasoning Engine - Core Library
//!
//! Adaptive reasoning over a query and its context: a complexity assessment
//! selects which subsystems run, their contributions are aggregated into one
//! response with a confidence and a trace, and successful cycles feed a
//! persistent semantic field and a budgeted memory store.

pub mod aggregator;
pub mod batch;
pub mod capability;
pub mod cli;
pub mod complexity;
pub mod error;
pub mod field;
pub mod interpretation;
pub mod memory;
pub mod monitoring;
pub mod orchestrator;
pub mod settings;
pub mod symbolic;
pub mod telemetry;
pub mod text;
pub mod tools;
pub mod types;

pub use capability::Capability;
pub use error::{EngineError, EngineResult, FailureClass, SubsystemFailure};
pub use orchestrator::Orchestrator;
pub use settings::Settings;
pub use types::{ComplexityLevel, ContextualResponse, ReasoningOptions, SubsystemKind};
