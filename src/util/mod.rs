//! Shared utilities.
//!
//! Currently just security-focused URL validation, applied to every
//! configured source URL before it enters the registry.

mod url_validator;

pub use url_validator::{validate_url, UrlValidationError};
