//! # stratus-id
//!
//! Typed identifiers for cloud provider resources.
//!
//! ## Design Principles
//!
//! - IDs are assigned by the provider; we only validate and carry them
//! - All IDs have a canonical string representation with strict parsing
//! - IDs are typed to prevent mixing different resource kinds
//!
//! ## ID Format
//!
//! All resource IDs use the provider's prefixed format: `{prefix}-{suffix}`
//! where the suffix is lowercase ASCII alphanumeric.
//!
//! Examples:
//! - `i-0a1b2c3d`
//! - `vol-12345678`
//! - `sir-12345c`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

#[doc(hidden)]
pub use rand as __rand;
