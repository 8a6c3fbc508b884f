use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use url::Url;

use super::errors::{FailedExchange, normalize};
use super::request::{Outcome, PreparedRequest, RequestConfig, RequestConfigError};
use crate::config::ApiConfig;
use crate::session::SessionController;

/// Session-aware API client.
///
/// Cheap to clone; clones share the HTTP connection pool and the session.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    timeout: Option<Duration>,
    session: Arc<SessionController>,
}

impl ApiClient {
    /// Creates a client rooted at `base_url`. Relative request paths are
    /// joined onto it, so it should end with a slash
    /// (see [`crate::config::parse_base_url`]).
    pub fn new(base_url: Url, session: Arc<SessionController>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            timeout: None,
            session,
        }
    }

    /// Creates a client from the `[api]` config section.
    ///
    /// # Errors
    /// Returns an error if the configured base URL is invalid.
    pub fn from_config(config: &ApiConfig, session: Arc<SessionController>) -> Result<Self> {
        Ok(Self::new(config.effective_base_url()?, session).with_timeout(config.timeout()))
    }

    /// Sets the per-request timeout. A timed-out call is a transport failure.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn session(&self) -> &Arc<SessionController> {
        &self.session
    }

    /// Validates a config against this client's base URL.
    ///
    /// # Errors
    /// Returns [`RequestConfigError`] when the config is malformed.
    pub fn prepare(&self, config: &RequestConfig) -> Result<PreparedRequest, RequestConfigError> {
        config.prepare(&self.base_url)
    }

    /// Validates and executes one call.
    ///
    /// # Errors
    /// Only for malformed configs; request failures are `Outcome::Errors`.
    pub async fn dispatch(
        &self,
        config: &RequestConfig,
    ) -> Result<Outcome<Value>, RequestConfigError> {
        let prepared = self.prepare(config)?;
        Ok(self.execute(prepared).await)
    }

    /// Executes a prepared call.
    ///
    /// The bearer token is read from the session at send time. When the
    /// failure carries the Unauthorized signal the session is logged out
    /// before this returns.
    pub async fn execute(&self, request: PreparedRequest) -> Outcome<Value> {
        let PreparedRequest { method, url, body } = request;
        let token = self.session.token();

        let mut builder = self.http.request(method.clone(), url.clone());
        if let Some(token) = token.as_deref() {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &body {
            builder = builder.json(body);
        }
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        tracing::debug!(%method, %url, authenticated = token.is_some(), "dispatching request");

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => return self.fail(&FailedExchange::transport(transport_reason(&err))),
        };

        let status = response.status();
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => return self.fail(&FailedExchange::transport(transport_reason(&err))),
        };
        let body = parse_body(&bytes);

        if status.is_success() {
            tracing::debug!(%method, %url, status = status.as_u16(), "request succeeded");
            Outcome::Data(unwrap_envelope(body))
        } else {
            tracing::debug!(%method, %url, status = status.as_u16(), "request failed");
            self.fail(&FailedExchange::response(status.as_u16(), body))
        }
    }

    fn fail(&self, failure: &FailedExchange) -> Outcome<Value> {
        if let FailedExchange::Transport { reason } = failure {
            tracing::warn!(reason = %reason, "request did not complete");
        }

        let normalized = normalize(failure);
        if normalized.is_unauthorized {
            tracing::warn!("server rejected the session, logging out");
            self.session.logout();
        }
        Outcome::Errors(normalized.field_errors)
    }
}

fn transport_reason(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "request timed out".to_string()
    } else if err.is_connect() {
        "connection failed".to_string()
    } else {
        err.to_string()
    }
}

/// Empty bodies become `null`; non-JSON bodies are kept as a string.
fn parse_body(bytes: &[u8]) -> Value {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

/// Success responses wrap the payload as `{ "data": ... }`.
fn unwrap_envelope(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}
