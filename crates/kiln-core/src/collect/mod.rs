//! Requirement collection
//!
//! Each service runs in a sandbox pointed at its own [`CollectionServer`];
//! the recorded [`ServiceRequirements`] feed the spec synthesizer.

pub mod aggregate;
pub mod requirements;
pub mod server;
pub mod stream;

pub use aggregate::{
    CollectError, CollectFailure, CollectOptions, DEFAULT_COLLECT_TIMEOUT, collect_requirements,
};
pub use requirements::{
    RegistrationError, RequirementsRecorder, ServiceErrors, ServiceRequirements,
};
pub use server::{CollectionServer, illegal_call};
pub use stream::{RegistrationStreamMachine, StreamState, Transition};
