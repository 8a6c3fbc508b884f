//! Core backoffice library (session, API client, request lifecycle, config).

pub mod api;
mod atomic;
pub mod config;
pub mod lifecycle;
pub mod session;
pub mod store;
