//! Data model for the simulation engine: subjects, event schedules, and
//! time-varying covariates.

pub mod builder;
pub mod covariate;
pub mod event;
pub mod structs;

pub use builder::{SubjectBuilder, SubjectBuilderExt};
pub use covariate::{Covariate, Covariates, Interpolation};
pub use event::{Bolus, Event, Infusion, Observation, Protocol, Reset};
pub use structs::{Data, Subject};
