//! Structured logging facility for Stateline
//!
//! - Single initialization point via `init(profile)`
//! - Operation macros (`log_op_start!`, `log_op_end!`, `log_op_error!`)
//! - Test capture layer for deterministic assertions
//!
//! Only public context operations (persist, find, flush, commit, rollback,
//! detach, attach, close) emit start/end events. Internal helpers log at
//! `debug!`/`trace!` so each boundary is reported exactly once.
//!
//! # Usage
//!
//! ```rust
//! use stateline_core::logging_facility::{init, Profile};
//!
//! init(Profile::Development);
//! ```

pub mod init;
pub mod macros;
pub mod test_capture;

pub use init::{init, Profile};
pub use test_capture::{init_test_capture, CapturedEvent, TestCapture};
