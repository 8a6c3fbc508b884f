//! CLI command handlers.

use std::sync::Arc;

use anyhow::{Context, Result};
use backoffice_core::api::{ApiClient, FieldError};
use backoffice_core::config::Config;
use backoffice_core::session::{SessionController, SessionSettings};
use backoffice_core::store::FileStore;

pub mod auth;
pub mod config;
pub mod request;

/// Everything a session-bound command needs, built once per invocation.
pub struct Backend {
    pub config: Config,
    pub session: Arc<SessionController>,
    pub client: ApiClient,
}

impl Backend {
    pub fn open() -> Result<Self> {
        let config = Config::load().context("load config")?;
        let store = Arc::new(FileStore::at_default_path());
        let session = Arc::new(SessionController::restore(
            store,
            SessionSettings::from_config(&config),
        ));
        let client = ApiClient::from_config(&config.api, Arc::clone(&session))?;
        tracing::debug!(
            base_url = %client.base_url(),
            authenticated = session.is_authenticated(),
            "backend ready"
        );

        Ok(Self {
            config,
            session,
            client,
        })
    }
}

fn print_field_errors(errors: &[FieldError]) {
    for error in errors {
        eprintln!("  {error}");
    }
}
