//! Shared building blocks for the credential pool workspace

mod error;
mod secret;
mod time;

pub use error::{Error, Result};
pub use secret::Secret;
pub use time::now_millis;
