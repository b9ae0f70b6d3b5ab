//! HTTP API.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use handlers::{ClientIdentity, ExecuteRequest, ExtendRequest, ExtendResponse, StartResponse};
pub use routes::{MAX_BODY_BYTES, create_router};
pub use state::AppState;
