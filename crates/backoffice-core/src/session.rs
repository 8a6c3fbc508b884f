//! Authenticated session state.
//!
//! [`SessionController`] is the only writer of the [`Session`]. Every
//! mutation is persisted through a [`PersistedStore`] and broadcast to
//! subscribers over a `watch` channel, so independent consumers always see
//! the same identity. Tokens are never logged.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::api::{ApiClient, Outcome, RequestConfig, RequestConfigError};
use crate::config::Config;
use crate::store::{PersistedStore, SetOptions};

/// Opaque user profile. Round-trips verbatim; only `role` is interpreted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserRecord(Map<String, Value>);

impl UserRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn role(&self) -> Option<&str> {
        self.0.get("role").and_then(Value::as_str)
    }

    /// Overwrites the `role` field, leaving every other field untouched.
    pub fn set_role(&mut self, role: &str) {
        self.0.insert("role".to_string(), Value::String(role.to_string()));
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for UserRecord {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// The authenticated identity. A user without a token cannot be built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    token: Option<String>,
    user: Option<UserRecord>,
}

impl Session {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn authenticated(token: impl Into<String>, user: Option<UserRecord>) -> Self {
        Self {
            token: Some(token.into()),
            user,
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn user(&self) -> Option<&UserRecord> {
        self.user.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }
}

/// Store keys and endpoints the controller works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub token_key: String,
    pub user_key: String,
    /// Max age requested for persisted entries
    pub max_age: Option<Duration>,
    /// Current-user endpoint for [`SessionController::fetch_user`]
    pub user_path: String,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            token_key: config.session.token_key.clone(),
            user_key: config.session.user_key.clone(),
            max_age: config.session.max_age(),
            user_path: config.api.user_path.clone(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Owner of the process-wide [`Session`].
pub struct SessionController {
    store: Arc<dyn PersistedStore>,
    settings: SessionSettings,
    state: watch::Sender<Session>,
}

impl SessionController {
    /// Restores the session from `store`. Authenticated iff a token is stored.
    ///
    /// A cached user without a token is discarded (and removed from the store).
    pub fn restore(store: Arc<dyn PersistedStore>, settings: SessionSettings) -> Self {
        let token = store
            .get(&settings.token_key)
            .and_then(|value| match value {
                Value::String(token) if !token.is_empty() => Some(token),
                _ => None,
            });
        let cached_user = store.get(&settings.user_key);

        let session = match token {
            Some(token) => {
                let user = cached_user.and_then(|value| {
                    serde_json::from_value::<UserRecord>(value)
                        .inspect_err(|err| {
                            tracing::warn!(error = %err, "ignoring malformed cached user");
                        })
                        .ok()
                });
                Session::authenticated(token, user)
            }
            None => {
                if cached_user.is_some() {
                    tracing::debug!("dropping cached user without a token");
                    store.remove(&settings.user_key);
                }
                Session::anonymous()
            }
        };

        tracing::debug!(
            authenticated = session.is_authenticated(),
            "session restored"
        );

        Self {
            store,
            settings,
            state: watch::Sender::new(session),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Snapshot of the current session.
    pub fn session(&self) -> Session {
        self.state.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated()
    }

    pub fn token(&self) -> Option<String> {
        self.state.borrow().token.clone()
    }

    pub fn user(&self) -> Option<UserRecord> {
        self.state.borrow().user.clone()
    }

    pub fn role(&self) -> Option<String> {
        self.state
            .borrow()
            .user
            .as_ref()
            .and_then(UserRecord::role)
            .map(str::to_string)
    }

    /// Receives every session change from now on.
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.state.subscribe()
    }

    /// Records a successful login. Replaces any existing session.
    ///
    /// Returns false (and changes nothing) for an empty token, which
    /// [`SessionController::restore`] would not accept either.
    pub fn logged(&self, token: impl Into<String>, user: UserRecord) -> bool {
        let token = token.into();
        if token.is_empty() {
            tracing::warn!("ignoring login with an empty token");
            return false;
        }
        self.store.set(
            &self.settings.token_key,
            Value::String(token.clone()),
            self.set_options(),
        );
        self.persist_user(&user);

        self.state
            .send_replace(Session::authenticated(token, Some(user)));
        tracing::info!("session established");
        true
    }

    /// Clears the session. Returns false if it was already anonymous.
    ///
    /// The in-memory session is cleared first; persistence is best-effort.
    pub fn logout(&self) -> bool {
        let cleared = self.state.send_if_modified(|session| {
            if session.is_authenticated() {
                *session = Session::anonymous();
                true
            } else {
                false
            }
        });

        self.store.remove(&self.settings.token_key);
        self.store.remove(&self.settings.user_key);

        if cleared {
            tracing::info!("session cleared");
        }
        cleared
    }

    /// Overwrites the current user's role locally. No network call.
    ///
    /// Returns false (and changes nothing) when there is no user.
    pub fn set_role(&self, role: &str) -> bool {
        let mut updated = None;
        self.state.send_if_modified(|session| match session.user.as_mut() {
            Some(user) => {
                user.set_role(role);
                updated = Some(user.clone());
                true
            }
            None => false,
        });

        match updated {
            Some(user) => {
                self.persist_user(&user);
                true
            }
            None => {
                tracing::debug!("set_role ignored: no current user");
                false
            }
        }
    }

    /// Re-reads the current user from the server.
    ///
    /// Returns `Ok(None)` without any request when anonymous. On success the
    /// user is replaced (token unchanged), unless the session changed while
    /// the request was in flight. An Unauthorized response logs out through
    /// `client`, which should be bound to this controller.
    ///
    /// # Errors
    /// Returns [`RequestConfigError`] if the configured user path is invalid.
    pub async fn fetch_user(
        &self,
        client: &ApiClient,
    ) -> Result<Option<Outcome<UserRecord>>, RequestConfigError> {
        let Some(issued_with) = self.token() else {
            tracing::debug!("fetch_user skipped: not authenticated");
            return Ok(None);
        };

        let config = RequestConfig::get().url(self.settings.user_path.as_str());
        let outcome = client.dispatch(&config).await?.decode::<UserRecord>();

        if let Outcome::Data(user) = &outcome {
            let committed = self.state.send_if_modified(|session| {
                if session.token.as_deref() == Some(issued_with.as_str()) {
                    session.user = Some(user.clone());
                    true
                } else {
                    false
                }
            });
            if committed {
                self.persist_user(user);
            } else {
                tracing::debug!("discarding user fetched for a previous session");
            }
        }

        Ok(Some(outcome))
    }

    fn persist_user(&self, user: &UserRecord) {
        self.store.set(
            &self.settings.user_key,
            Value::Object(user.fields().clone()),
            self.set_options(),
        );
    }

    fn set_options(&self) -> SetOptions {
        SetOptions::with_max_age(self.settings.max_age)
    }
}

/// Display-safe preview of a token: the first 8 chars, or `***` for short ones.
pub fn mask_token(token: &str) -> String {
    if token.chars().count() <= 12 {
        return "***".to_string();
    }
    let prefix: String = token.chars().take(8).collect();
    format!("{prefix}...")
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::config::parse_base_url;
    use crate::store::{FileStore, MemoryStore};

    fn user(value: Value) -> UserRecord {
        serde_json::from_value(value).unwrap()
    }

    fn seeded_store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::with_entries([
            ("auth_token", json!("tok-1")),
            ("auth_user", json!({"id": 1, "email": "ops@example.com", "role": "admin"})),
        ]))
    }

    fn controller(store: Arc<MemoryStore>) -> Arc<SessionController> {
        Arc::new(SessionController::restore(store, SessionSettings::default()))
    }

    fn client_for(server: &MockServer, session: &Arc<SessionController>) -> ApiClient {
        ApiClient::new(parse_base_url(&server.uri()).unwrap(), Arc::clone(session))
    }

    #[test]
    fn test_restore_from_populated_store() {
        let session = controller(seeded_store());

        assert!(session.is_authenticated());
        assert_eq!(session.token().as_deref(), Some("tok-1"));
        assert_eq!(
            session.user(),
            Some(user(json!({"id": 1, "email": "ops@example.com", "role": "admin"})))
        );
        assert_eq!(session.role().as_deref(), Some("admin"));
    }

    #[test]
    fn test_restore_empty_store_is_anonymous() {
        let session = controller(Arc::new(MemoryStore::new()));

        assert!(!session.is_authenticated());
        assert_eq!(session.session(), Session::anonymous());
    }

    #[test]
    fn test_restore_drops_user_without_token() {
        let store = Arc::new(MemoryStore::with_entries([(
            "auth_user",
            json!({"id": 1}),
        )]));

        let session = controller(Arc::clone(&store));

        assert!(!session.is_authenticated());
        assert!(session.user().is_none());
        assert_eq!(store.get("auth_user"), None);
    }

    #[test]
    fn test_restore_ignores_non_string_token() {
        let store = Arc::new(MemoryStore::with_entries([("auth_token", Value::Null)]));
        assert!(!controller(store).is_authenticated());
    }

    #[test]
    fn test_restore_with_token_only_is_authenticated_without_user() {
        let store = Arc::new(MemoryStore::with_entries([
            ("auth_token", json!("tok-1")),
            ("auth_user", json!("not an object")),
        ]));

        let session = controller(store);

        assert!(session.is_authenticated());
        assert!(session.user().is_none());
    }

    #[test]
    fn test_logged_persists_and_notifies() {
        let store = Arc::new(MemoryStore::new());
        let session = controller(Arc::clone(&store));
        let mut changes = session.subscribe();

        assert!(session.logged("tok-9", user(json!({"id": 9, "role": "editor"}))));

        assert!(session.is_authenticated());
        assert_eq!(store.get("auth_token"), Some(json!("tok-9")));
        assert_eq!(store.get("auth_user"), Some(json!({"id": 9, "role": "editor"})));
        assert!(changes.has_changed().unwrap());
        assert_eq!(changes.borrow_and_update().token(), Some("tok-9"));
    }

    #[test]
    fn test_logged_rejects_empty_token() {
        let store = Arc::new(MemoryStore::new());
        let session = controller(Arc::clone(&store));
        let mut changes = session.subscribe();

        assert!(!session.logged("", user(json!({"id": 1}))));

        assert!(!session.is_authenticated());
        assert_eq!(store.get("auth_token"), None);
        assert_eq!(store.get("auth_user"), None);
        assert!(!changes.has_changed().unwrap());

        let restored = controller(store);
        assert_eq!(restored.session(), session.session());
    }

    #[test]
    fn test_empty_token_keeps_existing_session() {
        let store = seeded_store();
        let session = controller(Arc::clone(&store));

        assert!(!session.logged("", user(json!({"id": 2}))));

        assert_eq!(session.token().as_deref(), Some("tok-1"));
        assert_eq!(store.get("auth_token"), Some(json!("tok-1")));
        assert_eq!(controller(store).session(), session.session());
    }

    #[test]
    fn test_logged_session_survives_restore() {
        let store = Arc::new(MemoryStore::new());
        let session = controller(Arc::clone(&store));

        assert!(session.logged("tok-7", user(json!({"id": 7, "role": "admin"}))));

        assert_eq!(controller(store).session(), session.session());
    }

    #[test]
    fn test_logout_clears_store_and_memory_once() {
        let store = seeded_store();
        let session = controller(Arc::clone(&store));
        let mut changes = session.subscribe();

        assert!(session.logout());
        assert!(!session.is_authenticated());
        assert!(session.user().is_none());
        assert_eq!(store.get("auth_token"), None);
        assert_eq!(store.get("auth_user"), None);
        assert!(changes.has_changed().unwrap());
        changes.borrow_and_update();

        assert!(!session.logout());
        assert!(!changes.has_changed().unwrap());
    }

    #[test]
    fn test_logout_clears_memory_when_store_is_unavailable() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn PersistedStore> = Arc::new(FileStore::new(dir.path()));
        let session = SessionController::restore(store, SessionSettings::default());

        assert!(session.logged("tok", user(json!({"id": 1}))));
        assert!(session.is_authenticated());

        assert!(session.logout());
        assert!(!session.is_authenticated());
    }

    #[test]
    fn test_set_role_only_touches_role() {
        let store = seeded_store();
        let session = controller(Arc::clone(&store));

        assert!(session.set_role("viewer"));

        let expected = json!({"id": 1, "email": "ops@example.com", "role": "viewer"});
        assert_eq!(session.user(), Some(user(expected.clone())));
        assert_eq!(store.get("auth_user"), Some(expected));
        assert_eq!(session.token().as_deref(), Some("tok-1"));
    }

    #[test]
    fn test_set_role_is_noop_when_anonymous() {
        let store = Arc::new(MemoryStore::new());
        let session = controller(Arc::clone(&store));

        assert!(!session.set_role("admin"));
        assert!(!session.is_authenticated());
        assert_eq!(store.get("auth_user"), None);
    }

    #[test]
    fn test_max_age_is_forwarded_to_store() {
        let store = Arc::new(MemoryStore::new());
        let settings = SessionSettings {
            max_age: Some(Duration::ZERO),
            ..SessionSettings::default()
        };
        let session = SessionController::restore(Arc::clone(&store) as Arc<dyn PersistedStore>, settings);

        assert!(session.logged("tok", user(json!({"id": 1}))));

        // In memory the session is live; the persisted copy already expired.
        assert!(session.is_authenticated());
        assert_eq!(store.get("auth_token"), None);
    }

    #[test]
    fn test_mask_token() {
        assert_eq!(mask_token("short"), "***");
        assert_eq!(mask_token("eyJhbGciOiJIUzI1NiJ9.payload"), "eyJhbGci...");
    }

    #[test]
    fn test_user_record_roundtrip_keeps_unknown_fields() {
        let record = user(json!({"id": 1, "role": "admin", "wallet": {"enabled": true}}));
        assert_eq!(record.role(), Some("admin"));
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({"id": 1, "role": "admin", "wallet": {"enabled": true}})
        );
    }

    #[tokio::test]
    async fn test_fetch_user_when_anonymous_is_noop() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let session = controller(Arc::new(MemoryStore::new()));
        let client = client_for(&server, &session);

        assert_eq!(session.fetch_user(&client).await.unwrap(), None);
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn test_fetch_user_overwrites_user_and_keeps_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/me"))
            .and(header("authorization", "Bearer tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"data": {"id": 1, "email": "new@example.com", "role": "admin"}}),
            ))
            .expect(1)
            .mount(&server)
            .await;

        let store = seeded_store();
        let session = controller(Arc::clone(&store));
        let client = client_for(&server, &session);

        let outcome = session.fetch_user(&client).await.unwrap().unwrap();

        let expected = json!({"id": 1, "email": "new@example.com", "role": "admin"});
        assert_eq!(outcome, Outcome::Data(user(expected.clone())));
        assert_eq!(session.user(), Some(user(expected.clone())));
        assert_eq!(store.get("auth_user"), Some(expected));
        assert_eq!(session.token().as_deref(), Some("tok-1"));
    }

    #[tokio::test]
    async fn test_fetch_user_unauthorized_logs_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/me"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(json!({"message": "Unauthorized"})),
            )
            .mount(&server)
            .await;

        let store = seeded_store();
        let session = controller(Arc::clone(&store));
        let client = client_for(&server, &session);

        let outcome = session.fetch_user(&client).await.unwrap().unwrap();

        assert!(!outcome.is_data());
        assert!(!session.is_authenticated());
        assert_eq!(store.get("auth_token"), None);
    }

    #[tokio::test]
    async fn test_fetch_user_result_discarded_after_logout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/me"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"data": {"id": 1, "role": "admin"}}))
                    .set_delay(Duration::from_millis(100)),
            )
            .mount(&server)
            .await;

        let store = seeded_store();
        let session = controller(Arc::clone(&store));
        let client = client_for(&server, &session);

        let (outcome, ()) = tokio::join!(session.fetch_user(&client), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            session.logout();
        });

        assert!(outcome.unwrap().unwrap().is_data());
        assert!(!session.is_authenticated());
        assert!(session.user().is_none());
        assert_eq!(store.get("auth_user"), None);
    }
}
