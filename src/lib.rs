//! Lab lifecycle orchestration for containerized student dev environments.
//!
//! One container-backed lab per student per course: the controller drives
//! each lab through an explicit state machine, the registry enforces the
//! uniqueness guarantee under concurrent requests, and the reaper reclaims
//! labs that sit idle. All container engine and storage access goes through
//! the `driver` traits, so the lifecycle layer runs unchanged against
//! Docker or an in-memory double.

pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod logging;
pub mod models;
pub mod ports;
pub mod reaper;
pub mod registry;

pub use config::OrchestratorConfig;
pub use controller::LifecycleController;
pub use error::{LabError, Result};
pub use models::{IdeType, LabConfig, LabEnvironment, LabOperationResult, LabStatus};
pub use reaper::{IdleReaper, ReaperHandle};
pub use registry::LabRegistry;
