//! NASA Earthdata Login credentials and session tokens.
//!
//! Credentials resolve with the precedence explicit flag > netrc file >
//! interactive prompt. A [`TokenProvider`] exchanges them for a bearer
//! token at the URS token endpoint and hands the token out read-only to
//! every download worker; refreshing is single-flight so concurrent workers
//! that hit an expired token never race each other to log in again.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::SubsetError;

/// NASA Earthdata Login host.
pub const URS_HOST: &str = "urs.earthdata.nasa.gov";

const TOKEN_URL: &str = "https://urs.earthdata.nasa.gov/api/users/find_or_create_token";

/// Refresh tokens this close to their expiry instead of using them.
const EXPIRY_MARGIN_MINUTES: i64 = 5;

/// Resolved username/password pair for Earthdata Login.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Earthdata username.
    pub username: String,
    /// Earthdata password.
    pub password: String,
}

impl Credentials {
    /// Resolve credentials: explicit `--user` flag (password prompted),
    /// then the netrc entry for [`URS_HOST`], then an interactive prompt
    /// for both.
    pub fn resolve(user: Option<String>, netrc_path: &Path) -> Result<Self, SubsetError> {
        if let Some(username) = user {
            let password = prompt_password(&username)?;
            return Ok(Self { username, password });
        }
        match Self::from_netrc(netrc_path) {
            Ok(Some(credentials)) => {
                debug!(path = %netrc_path.display(), "Using netrc credentials");
                return Ok(credentials);
            }
            Ok(None) => {
                debug!(path = %netrc_path.display(), "No netrc entry for {URS_HOST}");
            }
            Err(e) => {
                warn!(path = %netrc_path.display(), error = %e, "Failed to read netrc file");
            }
        }
        let username = prompt_username()?;
        let password = prompt_password(&username)?;
        Ok(Self { username, password })
    }

    /// Look up the [`URS_HOST`] entry (or the `default` machine) in a
    /// netrc file. Returns `Ok(None)` when the file exists but carries no
    /// matching entry.
    pub fn from_netrc(path: &Path) -> Result<Option<Self>, SubsetError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        Ok(parse_netrc(&content, URS_HOST))
    }
}

fn prompt_username() -> Result<String, SubsetError> {
    print!("Username for {URS_HOST}: ");
    std::io::stdout()
        .flush()
        .map_err(|e| SubsetError::CredentialError(e.to_string()))?;
    let mut username = String::new();
    std::io::stdin()
        .read_line(&mut username)
        .map_err(|e| SubsetError::CredentialError(e.to_string()))?;
    let username = username.trim().to_string();
    if username.is_empty() {
        return Err(SubsetError::CredentialError(
            "no username provided".to_string(),
        ));
    }
    Ok(username)
}

fn prompt_password(username: &str) -> Result<String, SubsetError> {
    rpassword::prompt_password(format!("Password for {username}@{URS_HOST}: "))
        .map_err(|e| SubsetError::CredentialError(format!("failed to read password: {e}")))
}

/// Scan netrc tokens for a `machine`/`default` entry matching `host`.
fn parse_netrc(content: &str, host: &str) -> Option<Credentials> {
    let mut tokens = content.split_whitespace().peekable();
    let mut matched = false;
    let mut login: Option<String> = None;
    let mut password: Option<String> = None;
    while let Some(token) = tokens.next() {
        match token {
            "machine" => {
                if matched && login.is_some() && password.is_some() {
                    break;
                }
                matched = tokens.next() == Some(host);
                if matched {
                    login = None;
                    password = None;
                }
            }
            "default" => {
                if matched && login.is_some() && password.is_some() {
                    break;
                }
                matched = true;
                login = None;
                password = None;
            }
            "login" if matched => login = tokens.next().map(str::to_string),
            "password" if matched => password = tokens.next().map(str::to_string),
            _ => {}
        }
    }
    if matched {
        if let (Some(username), Some(password)) = (login, password) {
            return Some(Credentials { username, password });
        }
    }
    None
}

/// Opaque bearer credential with an expiry. Never persisted.
#[derive(Debug, Clone)]
pub struct SessionToken {
    access_token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl SessionToken {
    /// Value for the `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    /// Whether the token is within the refresh margin of its expiry.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now + Duration::minutes(EXPIRY_MARGIN_MINUTES) >= expires_at,
            None => false,
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    // URS reports expiry as "MM/DD/YYYY"
    expiration_date: Option<String>,
}

struct TokenState {
    token: SessionToken,
    generation: u64,
}

/// Owns the session token and serializes refreshes.
///
/// Workers call [`TokenProvider::current`] before each request and
/// [`TokenProvider::refresh`] when the server rejects the token; the
/// generation counter lets a worker that lost the refresh race reuse the
/// token its peer just fetched.
pub struct TokenProvider {
    client: reqwest::Client,
    credentials: Credentials,
    state: RwLock<TokenState>,
    refresh_gate: Mutex<()>,
}

impl TokenProvider {
    /// Log in and construct a provider holding the initial token.
    ///
    /// A rejected login is a [`SubsetError::CredentialError`], fatal for
    /// the whole run.
    pub async fn login(
        client: reqwest::Client,
        credentials: Credentials,
    ) -> Result<Arc<Self>, SubsetError> {
        let token = Self::fetch_token(&client, &credentials).await?;
        info!(username = %credentials.username, "Authenticated with {URS_HOST}");
        Ok(Arc::new(Self {
            client,
            credentials,
            state: RwLock::new(TokenState {
                token,
                generation: 0,
            }),
            refresh_gate: Mutex::new(()),
        }))
    }

    /// Current token and its generation. Refreshes proactively when the
    /// token is within the expiry margin.
    pub async fn current(&self) -> Result<(SessionToken, u64), SubsetError> {
        let (token, generation) = {
            let state = self.state.read().await;
            (state.token.clone(), state.generation)
        };
        if token.needs_refresh(Utc::now()) {
            let token = self.refresh(generation).await?;
            let state = self.state.read().await;
            return Ok((token, state.generation));
        }
        Ok((token, generation))
    }

    /// Replace the token unless another worker already did.
    ///
    /// `seen_generation` is the generation of the token the caller found
    /// stale; if the stored generation has moved past it the stored token
    /// is returned without a network call.
    pub async fn refresh(&self, seen_generation: u64) -> Result<SessionToken, SubsetError> {
        let _gate = self.refresh_gate.lock().await;
        {
            let state = self.state.read().await;
            if state.generation != seen_generation {
                debug!("Token already refreshed by another worker");
                return Ok(state.token.clone());
            }
        }
        info!("Refreshing session token");
        let token = Self::fetch_token(&self.client, &self.credentials).await?;
        let mut state = self.state.write().await;
        state.token = token.clone();
        state.generation += 1;
        Ok(token)
    }

    async fn fetch_token(
        client: &reqwest::Client,
        credentials: &Credentials,
    ) -> Result<SessionToken, SubsetError> {
        let response = client
            .post(TOKEN_URL)
            .basic_auth(&credentials.username, Some(&credentials.password))
            .send()
            .await
            .map_err(|e| SubsetError::CredentialError(format!("token request failed: {e}")))?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(SubsetError::CredentialError(format!(
                "{URS_HOST} rejected the supplied credentials (HTTP {status})"
            )));
        }
        if !status.is_success() {
            return Err(SubsetError::CredentialError(format!(
                "token request to {URS_HOST} failed with HTTP {status}"
            )));
        }
        let parsed: TokenResponse = response.json().await.map_err(|e| {
            SubsetError::CredentialError(format!("invalid token response: {e}"))
        })?;
        let expires_at = parsed.expiration_date.as_deref().and_then(parse_expiry);
        Ok(SessionToken {
            access_token: parsed.access_token,
            expires_at,
        })
    }
}

fn parse_expiry(date: &str) -> Option<DateTime<Utc>> {
    NaiveDate::parse_from_str(date, "%m/%d/%Y")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_parse_netrc_matching_machine() {
        let content = "machine urs.earthdata.nasa.gov login alice password s3cret\n";
        let credentials = parse_netrc(content, URS_HOST).unwrap();
        assert_eq!(credentials.username, "alice");
        assert_eq!(credentials.password, "s3cret");
    }

    #[test]
    fn test_parse_netrc_multiline_entry() {
        let content = "machine example.com\n  login bob\n  password hunter2\n\
                       machine urs.earthdata.nasa.gov\n  login alice\n  password s3cret\n";
        let credentials = parse_netrc(content, URS_HOST).unwrap();
        assert_eq!(credentials.username, "alice");
        assert_eq!(credentials.password, "s3cret");
    }

    #[test]
    fn test_parse_netrc_default_machine() {
        let content = "default login carol password pass\n";
        let credentials = parse_netrc(content, URS_HOST).unwrap();
        assert_eq!(credentials.username, "carol");
    }

    #[test]
    fn test_parse_netrc_no_match() {
        let content = "machine example.com login bob password hunter2\n";
        assert!(parse_netrc(content, URS_HOST).is_none());
        assert!(parse_netrc("", URS_HOST).is_none());
    }

    #[test]
    fn test_from_netrc_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".netrc");
        assert!(Credentials::from_netrc(&path).unwrap().is_none());
    }

    #[test]
    fn test_from_netrc_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".netrc");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "machine urs.earthdata.nasa.gov login alice password s3cret"
        )
        .unwrap();
        let credentials = Credentials::from_netrc(&path).unwrap().unwrap();
        assert_eq!(credentials.username, "alice");
    }

    #[test]
    fn test_token_needs_refresh_near_expiry() {
        let now = Utc::now();
        let fresh = SessionToken {
            access_token: "tok".into(),
            expires_at: Some(now + Duration::days(30)),
        };
        assert!(!fresh.needs_refresh(now));
        let stale = SessionToken {
            access_token: "tok".into(),
            expires_at: Some(now + Duration::minutes(1)),
        };
        assert!(stale.needs_refresh(now));
        let unknown = SessionToken {
            access_token: "tok".into(),
            expires_at: None,
        };
        assert!(!unknown.needs_refresh(now));
    }

    #[test]
    fn test_parse_expiry() {
        let expiry = parse_expiry("10/08/2026").unwrap();
        assert_eq!(expiry.format("%Y-%m-%d").to_string(), "2026-10-08");
        assert!(parse_expiry("2026-10-08").is_none());
    }
}
