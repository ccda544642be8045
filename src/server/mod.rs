//! HTTP surface: health, metrics and the authenticated VM API

pub mod handlers;
pub mod state;

pub use handlers::{create_router, CreateForm, DeleteForm, ErrorResponse};
pub use state::{AppState, RequestScope};
