//! Module validation
//!
//! Manifest structure checks applied at discovery and install.

pub mod manifest_validator;

pub use manifest_validator::{ManifestValidator, ValidationResult};
