//! Common utilities for remote-usb
//!
//! Shared error handling and logging setup used by the backend crate and
//! by anything embedding it.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
pub use logging::setup_logging;
