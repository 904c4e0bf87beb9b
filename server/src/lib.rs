pub mod auth;
pub mod document_api;
pub mod error;
pub mod handlers;
pub mod observability;
pub mod router;
pub mod state;
pub mod worker;
pub mod ws;

pub use error::AppError;
pub use state::{AppState, build_state, build_state_with};

#[cfg(test)]
pub(crate) mod test_support;
