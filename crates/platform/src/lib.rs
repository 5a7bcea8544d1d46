//! # Kiln Platform
//!
//! Core platform types and traits shared by the Kiln protocol crates.
//!
//! This crate provides:
//! - Unified error types (`KilnError`, `KilnResult`)
//! - Injected environment traits (`SecureRandom`, `Clock`) with OS-backed implementations
//! - Deterministic mock implementations for tests ([`mock`])
//!
//! # Examples
//!
//! ```
//! use kiln_platform::{KilnError, KilnResult};
//!
//! fn example_function() -> KilnResult<String> {
//!     Ok("Hello, Kiln!".to_string())
//! }
//!
//! # fn main() -> KilnResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, Kiln!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod mock;
pub mod traits;

pub use error::{KilnError, KilnResult};
pub use traits::{Clock, OsRandom, SecureRandom, SystemClock};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
