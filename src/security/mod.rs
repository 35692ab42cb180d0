//! Guards around long-running server launches.

pub mod identity;
pub mod validator;

pub use identity::{IdentityCheck, IdentityVerifier, PortReport};
pub use validator::{LaunchValidator, ValidatedCommand};
