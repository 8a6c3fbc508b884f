//! HTTP API access: request descriptions, the session-aware client and
//! failure normalization.

mod client;
pub mod errors;
mod request;

pub use client::ApiClient;
pub use errors::{ErrorShape, FailedExchange, FieldError, GENERAL_ERRORS, Normalized, normalize};
pub use request::{
    INVALID_RESPONSE_CODE, Outcome, PreparedRequest, RequestConfig, RequestConfigError,
};
pub use reqwest::Method;
