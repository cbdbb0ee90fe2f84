//! Capability-matched routing of tasks to execution instances.
//!
//! The pipeline is: [`RequirementsExtractor`] turns a task submission into
//! normalized requirements, [`InstanceProfileBuilder`] turns each registered
//! instance into a comparable profile, [`RouteScorer`] rejects or scores every
//! candidate, and the [`Router`] picks the winner and records a
//! [`RouteDecision`](orca_core::RouteDecision) before returning it.

#![warn(missing_docs)]

pub mod error;
pub mod profile;
pub mod registry;
pub mod requirements;
pub mod router;
pub mod scorer;
pub mod version;

pub use error::{Result, RoutingError};
pub use profile::{InstanceDescriptor, InstanceProfile, InstanceProfileBuilder};
pub use registry::{InstanceRegistry, RegistryError, StaticRegistry};
pub use requirements::{CapabilityRequirement, RequirementsExtractor, TaskRequirements};
pub use router::{Dispatch, RouteHistory, Router};
pub use scorer::{RouteScorer, ScoreOutcome};
pub use version::{VersionConstraint, VersionError};
