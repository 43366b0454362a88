//! # Latch Platform
//!
//! Shared types for the latch SSH engine.
//!
//! This crate provides:
//! - The unified error type (`LatchError`, `LatchResult`)
//! - Error classification (`ErrorClass`) so callers can decide whether to
//!   retry, report, or tear down
//!
//! # Examples
//!
//! ```
//! use latch_platform::{ErrorClass, LatchError, LatchResult};
//!
//! fn example_function() -> LatchResult<String> {
//!     Err(LatchError::Timeout("channel open".to_string()))
//! }
//!
//! let err = example_function().unwrap_err();
//! assert_eq!(err.class(), ErrorClass::Timeout);
//! assert!(!err.is_fatal());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{AlgorithmNegotiationFailure, ErrorClass, LatchError, LatchResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
