//! Request descriptions and call outcomes.

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use super::errors::FieldError;

/// Error code used when a 2xx payload does not match the expected type.
pub const INVALID_RESPONSE_CODE: &str = "INVALID_RESPONSE";

/// Contract violations in a [`RequestConfig`]. These are caller bugs, not
/// request failures, so they are returned before any I/O happens.
#[derive(Debug, thiserror::Error)]
pub enum RequestConfigError {
    #[error("no request URL: set one on the config or bind the lifecycle to an endpoint")]
    MissingUrl,
    #[error("{method} requests cannot carry a body")]
    BodyNotAllowed { method: Method },
    #[error("invalid request URL `{target}`")]
    InvalidUrl {
        target: String,
        #[source]
        source: url::ParseError,
    },
}

/// One HTTP call as described by the caller. Never retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestConfig {
    method: Method,
    url: Option<String>,
    query: Vec<(String, String)>,
    body: Option<Value>,
}

impl RequestConfig {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            url: None,
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    pub fn post() -> Self {
        Self::new(Method::POST)
    }

    pub fn put() -> Self {
        Self::new(Method::PUT)
    }

    pub fn patch() -> Self {
        Self::new(Method::PATCH)
    }

    pub fn delete() -> Self {
        Self::new(Method::DELETE)
    }

    /// Overrides the target. Relative paths are joined onto the client's
    /// base URL; absolute URLs are used as-is.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Appends a query parameter. Order is preserved.
    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Sets the JSON body.
    #[must_use]
    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Uses `url` as the target unless one was already set.
    #[must_use]
    pub fn or_url(mut self, url: &str) -> Self {
        if self.url.is_none() {
            self.url = Some(url.to_string());
        }
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn target(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Checks the config and resolves it against `base`.
    ///
    /// # Errors
    /// Returns [`RequestConfigError`] when the config is malformed.
    pub fn prepare(&self, base: &Url) -> Result<PreparedRequest, RequestConfigError> {
        if self.body.is_some() && matches!(self.method, Method::GET | Method::HEAD) {
            return Err(RequestConfigError::BodyNotAllowed {
                method: self.method.clone(),
            });
        }

        let target = self
            .url
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(RequestConfigError::MissingUrl)?;

        let mut url = resolve_target(base, target).map_err(|source| {
            RequestConfigError::InvalidUrl {
                target: target.to_string(),
                source,
            }
        })?;

        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&self.query);
        }

        Ok(PreparedRequest {
            method: self.method.clone(),
            url,
            body: self.body.clone(),
        })
    }
}

fn resolve_target(base: &Url, target: &str) -> Result<Url, url::ParseError> {
    match Url::parse(target) {
        Ok(absolute) => Ok(absolute),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            // Paths are relative to the API root even with a leading slash.
            base.join(target.trim_start_matches('/'))
        }
        Err(err) => Err(err),
    }
}

/// A validated request, ready to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    pub body: Option<Value>,
}

/// What a call resolved to: the payload or the normalized errors, never both.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Data(T),
    Errors(Vec<FieldError>),
}

impl<T> Outcome<T> {
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Data(_))
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            Self::Data(data) => Some(data),
            Self::Errors(_) => None,
        }
    }

    pub fn errors(&self) -> Option<&[FieldError]> {
        match self {
            Self::Data(_) => None,
            Self::Errors(errors) => Some(errors),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Data(data) => Outcome::Data(f(data)),
            Self::Errors(errors) => Outcome::Errors(errors),
        }
    }

    /// # Errors
    /// Returns the field errors when the call failed.
    pub fn into_result(self) -> Result<T, Vec<FieldError>> {
        match self {
            Self::Data(data) => Ok(data),
            Self::Errors(errors) => Err(errors),
        }
    }
}

impl Outcome<Value> {
    /// Deserializes the payload; a mismatch becomes a general error.
    pub fn decode<T: DeserializeOwned>(self) -> Outcome<T> {
        match self {
            Self::Data(value) => match serde_json::from_value(value) {
                Ok(data) => Outcome::Data(data),
                Err(err) => Outcome::Errors(vec![FieldError::general(
                    INVALID_RESPONSE_CODE,
                    format!("Unexpected response payload: {err}"),
                )]),
            },
            Self::Errors(errors) => Outcome::Errors(errors),
        }
    }
}
