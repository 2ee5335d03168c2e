//! Convergence loop primitives.
//!
//! This library provides the pieces every provider-facing wait is built from.
//! Key concepts:
//!
//! - **Backoff policy**: how long to sleep between attempts ([`BackoffPolicy`]).
//! - **Terminal states**: which observed states end a wait, successfully or
//!   not ([`TerminalStates`]).
//! - **Convergence**: polling a resource until it reaches a target state or
//!   the attempt budget runs out ([`wait_for`]).
//!
//! # Invariants
//!
//! - A poll loop never sleeps after its last permitted attempt
//! - At least one and at most `max_attempts()` reads are made
//! - Only errors the caller listed as tolerated are absorbed; everything
//!   else surfaces unchanged

mod backoff;
mod error;
mod poll;
mod retry;
mod state;

pub use backoff::{delay, Backoff, BackoffPolicy, DEFAULT_MAX_DELAY_SECS, DEFAULT_TRIES};
pub use error::{ConvergeError, ProviderError, ProviderErrorKind};
pub use poll::{wait_for, Converged, ConvergenceStatus, Observable, ResourceKind, TerminalStates};
pub use retry::retry_on;
pub use state::ResourceState;

/// Default number of consecutive unmapped states tolerated before a wait fails.
pub const DEFAULT_UNKNOWN_GRACE: u32 = 3;
