//! Auth command handlers.

use std::io::{self, BufRead, IsTerminal, Write};

use anyhow::{Context, Result, bail};
use backoffice_core::api::{Outcome, RequestConfig};
use backoffice_core::lifecycle::RequestLifecycle;
use backoffice_core::session::{UserRecord, mask_token};
use serde::Deserialize;
use serde_json::json;

use super::{Backend, print_field_errors};

/// Payload of a successful credentials exchange.
#[derive(Debug, Clone, Deserialize)]
struct LoginResponse {
    token: String,
    user: UserRecord,
}

pub async fn login(backend: &Backend, email: &str, password: Option<String>) -> Result<()> {
    let password = match password {
        Some(password) => password,
        None => read_password()?,
    };

    let lifecycle = RequestLifecycle::<LoginResponse>::new(backend.client.clone())
        .with_endpoint(backend.config.api.login_path.as_str())
        .with_policy(backend.config.requests.commit_policy);

    let body = json!({ "email": email, "password": password });
    match lifecycle.send(RequestConfig::post().body(body)).await? {
        Outcome::Data(LoginResponse { token, user }) => {
            let masked = mask_token(&token);
            if !backend.session.logged(token, user) {
                bail!("server returned an empty token for {email}");
            }
            println!("✓ Logged in as {email} (token: {masked})");
            Ok(())
        }
        Outcome::Errors(errors) => {
            eprintln!("Login failed:");
            print_field_errors(&errors);
            bail!("login rejected for {email}");
        }
    }
}

fn read_password() -> Result<String> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        eprint!("Password: ");
        io::stderr().flush()?;
    }

    let mut input = String::new();
    stdin.lock().read_line(&mut input).context("read password from stdin")?;
    let password = input.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        bail!("no password given");
    }
    Ok(password)
}

pub fn logout(backend: &Backend) -> Result<()> {
    if backend.session.logout() {
        println!("✓ Logged out");
    } else {
        println!("Not logged in.");
    }
    Ok(())
}

pub async fn whoami(backend: &Backend, refresh: bool) -> Result<()> {
    if refresh
        && let Some(Outcome::Errors(errors)) = backend.session.fetch_user(&backend.client).await?
    {
        eprintln!("Could not refresh the current user:");
        print_field_errors(&errors);
        if !backend.session.is_authenticated() {
            bail!("session expired, log in again");
        }
    }

    let session = backend.session.session();
    let Some(token) = session.token() else {
        println!("Not logged in.");
        return Ok(());
    };

    println!("token: {}", mask_token(token));
    match session.user() {
        Some(user) => {
            let rendered =
                serde_json::to_string_pretty(user).context("render current user")?;
            println!("{rendered}");
        }
        None => println!("(no cached user, try --refresh)"),
    }
    Ok(())
}

pub fn role(backend: &Backend, role: &str) -> Result<()> {
    if !backend.session.is_authenticated() {
        bail!("not logged in");
    }
    if !backend.session.set_role(role) {
        bail!("no cached user to update, run `backoffice whoami --refresh` first");
    }
    println!("Role set to {role}");
    Ok(())
}
