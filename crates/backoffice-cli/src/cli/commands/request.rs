//! Ad-hoc request command.

use anyhow::{Context, Result, bail};
use backoffice_core::api::{Method, Outcome, RequestConfig};
use backoffice_core::lifecycle::RequestLifecycle;
use serde_json::Value;

use super::{Backend, print_field_errors};

pub struct RequestArgs<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub query: Vec<(String, String)>,
    pub body: Option<&'a str>,
}

/// Parses a `KEY=VALUE` query argument.
pub fn parse_query(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}

pub async fn run(backend: &Backend, args: RequestArgs<'_>) -> Result<()> {
    let method = Method::from_bytes(args.method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("invalid HTTP method `{}`", args.method))?;

    let mut config = RequestConfig::new(method).url(args.path);
    for (key, value) in args.query {
        config = config.query(key, value);
    }
    if let Some(raw) = args.body {
        let body: Value = serde_json::from_str(raw).context("parse --body as JSON")?;
        config = config.body(body);
    }

    let was_authenticated = backend.session.is_authenticated();
    let lifecycle = RequestLifecycle::<Value>::new(backend.client.clone())
        .with_policy(backend.config.requests.commit_policy);

    match lifecycle.send(config).await? {
        Outcome::Data(payload) => {
            let rendered = serde_json::to_string_pretty(&payload).context("render response")?;
            println!("{rendered}");
            Ok(())
        }
        Outcome::Errors(errors) => {
            eprintln!("Request failed:");
            print_field_errors(&errors);
            if was_authenticated && !backend.session.is_authenticated() {
                eprintln!("Session expired; you have been logged out.");
            }
            bail!("{} {} failed", args.method.to_ascii_uppercase(), args.path);
        }
    }
}
