//! Per-consumer request lifecycle: idle -> loading -> success | error.
//!
//! A [`RequestLifecycle`] tracks one logical endpoint. State changes go
//! through the pure [`RequestState::transition`] reducer and are published
//! on a `watch` channel.

use std::sync::{Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::api::{ApiClient, FieldError, Outcome, RequestConfig, RequestConfigError};

/// Which resolved response may write a lifecycle's state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitPolicy {
    /// Every response commits; the one that resolves last wins, even after
    /// a reset.
    #[default]
    LastResolved,
    /// Only the most recently issued send commits. Reset drops in-flight sends.
    LatestIssued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Idle,
    Loading,
    Success,
    Error,
}

/// Lifecycle state. Data and errors are mutually exclusive by construction.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestState<T> {
    Idle,
    Loading,
    Success(T),
    Error(Vec<FieldError>),
}

// Not derived: that would require `T: Default`.
impl<T> Default for RequestState<T> {
    fn default() -> Self {
        Self::Idle
    }
}

/// Inputs to [`RequestState::transition`].
#[derive(Debug, Clone, PartialEq)]
pub enum RequestEvent<T> {
    Start,
    Resolve(Outcome<T>),
    Reset,
}

impl<T> RequestState<T> {
    #[must_use]
    pub fn transition(self, event: RequestEvent<T>) -> Self {
        match event {
            RequestEvent::Start => Self::Loading,
            RequestEvent::Resolve(Outcome::Data(data)) => Self::Success(data),
            RequestEvent::Resolve(Outcome::Errors(errors)) => Self::Error(errors),
            RequestEvent::Reset => Self::Idle,
        }
    }

    pub fn status(&self) -> RequestStatus {
        match self {
            Self::Idle => RequestStatus::Idle,
            Self::Loading => RequestStatus::Loading,
            Self::Success(_) => RequestStatus::Success,
            Self::Error(_) => RequestStatus::Error,
        }
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            Self::Success(data) => Some(data),
            _ => None,
        }
    }

    pub fn errors(&self) -> Option<&[FieldError]> {
        match self {
            Self::Error(errors) => Some(errors),
            _ => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }
}

/// Opaque id of one issued send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SendId(u64);

/// Tracks the latest issued send and rejects stale ones.
#[derive(Debug, Default)]
struct LatestOnly {
    next: u64,
    active: Option<SendId>,
}

impl LatestOnly {
    fn begin(&mut self) -> SendId {
        let id = SendId(self.next);
        self.next += 1;
        self.active = Some(id);
        id
    }

    fn cancel(&mut self) {
        self.active = None;
    }

    fn finish_if_active(&mut self, id: SendId) -> bool {
        if self.active == Some(id) {
            self.active = None;
            true
        } else {
            false
        }
    }
}

/// Request-cycle tracker for one logical endpoint.
///
/// Create one per consumer; instances never share state.
pub struct RequestLifecycle<T> {
    client: ApiClient,
    endpoint: Option<String>,
    policy: CommitPolicy,
    state: watch::Sender<RequestState<T>>,
    sends: Mutex<LatestOnly>,
}

impl<T> RequestLifecycle<T>
where
    T: DeserializeOwned + Clone + Send + Sync,
{
    pub fn new(client: ApiClient) -> Self {
        Self {
            client,
            endpoint: None,
            policy: CommitPolicy::default(),
            state: watch::Sender::new(RequestState::Idle),
            sends: Mutex::new(LatestOnly::default()),
        }
    }

    /// Binds a default target, used when a config sets no URL.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: CommitPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> CommitPolicy {
        self.policy
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> RequestState<T> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RequestState<T>> {
        self.state.subscribe()
    }

    /// Runs one call: Loading, then Success or Error.
    ///
    /// Request failures never escape; they are committed as `Error` and
    /// returned as [`Outcome::Errors`]. Whether the result is committed
    /// depends on the [`CommitPolicy`]; it is always returned.
    ///
    /// # Errors
    /// Returns [`RequestConfigError`] for a malformed config, before any
    /// state change.
    pub async fn send(&self, config: RequestConfig) -> Result<Outcome<T>, RequestConfigError> {
        let config = match &self.endpoint {
            Some(endpoint) => config.or_url(endpoint),
            None => config,
        };
        let prepared = self.client.prepare(&config)?;

        let id = self.lock_sends().begin();
        self.apply(RequestEvent::Start);

        let outcome = self.client.execute(prepared).await.decode::<T>();

        let commit = match self.policy {
            CommitPolicy::LastResolved => true,
            CommitPolicy::LatestIssued => self.lock_sends().finish_if_active(id),
        };
        if commit {
            self.apply(RequestEvent::Resolve(outcome.clone()));
        } else {
            tracing::debug!(send = id.0, "dropping stale response");
        }

        Ok(outcome)
    }

    /// Returns to Idle. Idempotent.
    pub fn reset(&self) {
        self.lock_sends().cancel();
        self.apply(RequestEvent::Reset);
    }

    fn apply(&self, event: RequestEvent<T>) {
        self.state.send_modify(|state| {
            let current = std::mem::take(state);
            *state = current.transition(event);
        });
    }

    fn lock_sends(&self) -> std::sync::MutexGuard<'_, LatestOnly> {
        self.sends.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
