#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Shared models, API types, and input validation for the cardscan
//! recognition service.

pub mod api;
pub mod model;
pub mod validation;

mod util;

pub use util::{new_ulid, now_ms};
