//! Probes for every kind of scored service, and the registry that maps a type tag to them.
//!
//! A probe is configured once from the engine configuration ([Runner::verify]), shipped to a
//! probe buddy as JSON inside a task, rebuilt there with [registry::build] and then run.

pub use outcome::{CheckContext, Failure, Outcome, ProbeEnv, ProbeResult};
pub use registry::{build, Check, RegistryError, ServiceLists, ServiceType};
pub use runner::{Probe, Runner};
pub use service::{Service, ServiceDefaults, VerifyError};

pub mod probe;
pub mod registry;

mod matching;
mod outcome;
mod runner;
mod service;
mod wire;
