pub mod config;
pub mod error;
pub mod handler;
pub mod inference;

pub use error::InferenceError;
pub use handler::{Outcome, handle, handle_with};
