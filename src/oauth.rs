//! OAuth credentials for the directory.
//!
//! The token file uses the same layout as google-auth's `authorized_user` json, so a
//! `token.json` written by other tooling keeps working and vice versa.
//!
//! 1. A stored, unexpired token with the right scopes is used as is.
//! 2. An expired token is refreshed with its refresh token.
//! 3. Otherwise the user is asked for consent in the browser (installed app flow with PKCE),
//!    and the redirect is caught on a loopback port.
//!
//! The resulting token is written back to the token file.

use std::path::{Path, PathBuf};

use base64::{Engine, prelude::BASE64_URL_SAFE_NO_PAD};
use chrono::{DateTime, TimeDelta, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

/// If modifying these scopes, delete the token file.
pub const SCOPES: [&str; 5] = [
    "https://www.googleapis.com/auth/admin.directory.user",
    "https://www.googleapis.com/auth/admin.directory.group",
    "https://www.googleapis.com/auth/admin.directory.group.member",
    "https://www.googleapis.com/auth/admin.directory.orgunit",
    "https://www.googleapis.com/auth/admin.directory.userschema",
];

const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Tokens expiring sooner than this are refreshed right away
const EXPIRY_GRACE_SECS: i64 = 300;

#[derive(Debug)]
pub enum OAuthError {
    ReadFile(PathBuf, std::io::Error),
    WriteFile(PathBuf, std::io::Error),
    ParseFile(PathBuf, serde_json::Error),
    Serialize(serde_json::Error),
    /// The client secrets file has neither an `installed` nor a `web` section
    NoClientSecrets(PathBuf),
    BadAuthUri(String),
    TokenRequest(reqwest::Error),
    /// status, body
    TokenRejected(u16, String),
    Deserialize,
    Listen(std::io::Error),
    /// The browser came back without a code
    Redirect(String),
    StateMismatch,
}
impl core::fmt::Display for OAuthError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Self::ReadFile(p, e) => write!(f, "Cannot read {}: {e}", p.display()),
            Self::WriteFile(p, e) => write!(f, "Cannot write {}: {e}", p.display()),
            Self::ParseFile(p, e) => write!(f, "{} is not valid: {e}", p.display()),
            Self::Serialize(e) => write!(f, "Cannot serialize the token: {e}"),
            Self::NoClientSecrets(p) => {
                write!(f, "{} contains no installed or web client.", p.display())
            }
            Self::BadAuthUri(e) => write!(f, "The authorization uri is not usable: {e}"),
            Self::TokenRequest(e) => write!(f, "Cannot reach the token endpoint: {e}"),
            Self::TokenRejected(status, body) => {
                write!(f, "The token endpoint answered {status}: {body}")
            }
            Self::Deserialize => write!(f, "Cannot deserialize the token response."),
            Self::Listen(e) => write!(f, "Cannot receive the consent redirect: {e}"),
            Self::Redirect(e) => write!(f, "The consent redirect carried no code: {e}"),
            Self::StateMismatch => {
                write!(f, "The consent redirect carried a foreign state parameter.")
            }
        }
    }
}
impl core::error::Error for OAuthError {}

/// An OAuth client as registered in the cloud console
#[derive(Clone, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}
impl std::fmt::Debug for ClientSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ClientSecrets")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[redacated]")
            .field("auth_uri", &self.auth_uri)
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

fn default_auth_uri() -> String {
    DEFAULT_AUTH_URI.to_string()
}
fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Debug, Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

/// The persisted token
#[derive(Clone, Serialize, Deserialize)]
pub struct StoredToken {
    /// The access token
    pub token: Option<String>,
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub expiry: Option<DateTime<Utc>>,
}
impl std::fmt::Debug for StoredToken {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("StoredToken")
            .field("client_id", &self.client_id)
            .field("scopes", &self.scopes)
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}
impl StoredToken {
    /// The access token, if it can be used for a while longer
    fn usable_token(&self, now: DateTime<Utc>) -> Option<&str> {
        let grace = TimeDelta::seconds(EXPIRY_GRACE_SECS);
        if self.expiry.is_none_or(|expiry| now + grace < expiry) {
            self.token.as_deref()
        } else {
            None
        }
    }

    fn covers_scopes(&self) -> bool {
        SCOPES.iter().all(|s| self.scopes.iter().any(|have| have == s))
    }

    fn from_response(
        response: TokenResponse,
        secrets: &ClientSecrets,
        previous_refresh_token: Option<String>,
        previous_scopes: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let scopes = match response.scope {
            Some(scope) => scope.split_whitespace().map(str::to_owned).collect(),
            None => previous_scopes,
        };
        Self {
            token: Some(response.access_token),
            // refresh responses usually do not repeat the refresh token
            refresh_token: response.refresh_token.or(previous_refresh_token),
            token_uri: secrets.token_uri.clone(),
            client_id: secrets.client_id.clone(),
            client_secret: secrets.client_secret.clone(),
            scopes,
            expiry: response
                .expires_in
                .map(|secs| now + TimeDelta::seconds(secs)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
    scope: Option<String>,
}

pub fn load_client_secrets(path: &Path) -> Result<ClientSecrets, OAuthError> {
    let text =
        std::fs::read_to_string(path).map_err(|e| OAuthError::ReadFile(path.to_owned(), e))?;
    let file: ClientSecretsFile =
        serde_json::from_str(&text).map_err(|e| OAuthError::ParseFile(path.to_owned(), e))?;
    file.installed
        .or(file.web)
        .ok_or_else(|| OAuthError::NoClientSecrets(path.to_owned()))
}

/// Read the token file. A missing file is not an error.
pub fn load_token(path: &Path) -> Result<Option<StoredToken>, OAuthError> {
    let text = match std::fs::read_to_string(path) {
        Ok(x) => x,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(OAuthError::ReadFile(path.to_owned(), e)),
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| OAuthError::ParseFile(path.to_owned(), e))
}

pub fn save_token(path: &Path, token: &StoredToken) -> Result<(), OAuthError> {
    let text = serde_json::to_string(token).map_err(OAuthError::Serialize)?;
    std::fs::write(path, text).map_err(|e| OAuthError::WriteFile(path.to_owned(), e))
}

/// Get a usable access token, going through refresh or consent as needed.
pub async fn access_token(
    http: &reqwest::Client,
    credentials_file: &Path,
    token_file: &Path,
) -> Result<String, OAuthError> {
    let now = Utc::now();
    let stored = match load_token(token_file) {
        Ok(x) => x,
        Err(e) => {
            warn!("Ignoring unusable token file: {e}");
            None
        }
    };
    if let Some(token) = stored
        .as_ref()
        .filter(|stored| stored.covers_scopes())
        .and_then(|stored| stored.usable_token(now))
    {
        debug!("Using stored access token");
        return Ok(token.to_owned());
    }
    let token = match stored {
        Some(stored) if stored.covers_scopes() && stored.refresh_token.is_some() => {
            debug!("Refreshing the stored access token");
            refresh(http, stored).await?
        }
        _ => {
            let secrets = load_client_secrets(credentials_file)?;
            consent(http, &secrets).await?
        }
    };
    save_token(token_file, &token)?;
    token.token.ok_or(OAuthError::Deserialize)
}

/// POST a form to the token endpoint and parse the answer
async fn token_request(
    http: &reqwest::Client,
    token_uri: &str,
    form: &[(&str, &str)],
) -> Result<TokenResponse, OAuthError> {
    let response = http
        .post(token_uri)
        .form(form)
        .send()
        .await
        .map_err(OAuthError::TokenRequest)?;
    let status = response.status();
    let text = match response.text().await {
        Ok(x) => x,
        Err(e) => {
            warn!("There was an error reading the token response as utf-8: {e}");
            return Err(OAuthError::Deserialize);
        }
    };
    if !status.is_success() {
        return Err(OAuthError::TokenRejected(status.as_u16(), text));
    }
    serde_json::from_str(&text).map_err(|e| {
        warn!("There was an error parsing the token response: {e}");
        OAuthError::Deserialize
    })
}

async fn refresh(http: &reqwest::Client, stored: StoredToken) -> Result<StoredToken, OAuthError> {
    let refresh_token = stored.refresh_token.clone().unwrap_or_default();
    let response = token_request(
        http,
        &stored.token_uri,
        &[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", stored.client_id.as_str()),
            ("client_secret", stored.client_secret.as_str()),
        ],
    )
    .await?;
    let secrets = ClientSecrets {
        client_id: stored.client_id,
        client_secret: stored.client_secret,
        auth_uri: default_auth_uri(),
        token_uri: stored.token_uri,
    };
    // the refresh response may omit the scope, in which case the old grant still holds
    Ok(StoredToken::from_response(
        response,
        &secrets,
        Some(refresh_token),
        stored.scopes,
        Utc::now(),
    ))
}

/// Random PKCE code verifier, 43 chars of base64url
fn pkce_verifier() -> String {
    let mut raw_bytes = [0_u8; 32];
    rand::rngs::ThreadRng::default().fill_bytes(&mut raw_bytes);
    BASE64_URL_SAFE_NO_PAD.encode(raw_bytes)
}

/// S256 challenge for a verifier
fn pkce_challenge(verifier: &str) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

fn random_state() -> String {
    let mut raw_bytes = [0_u8; 16];
    rand::rngs::ThreadRng::default().fill_bytes(&mut raw_bytes);
    hex::encode(raw_bytes)
}

fn authorization_url(
    secrets: &ClientSecrets,
    redirect_uri: &str,
    state: &str,
    challenge: &str,
) -> Result<reqwest::Url, OAuthError> {
    let scope = SCOPES.join(" ");
    reqwest::Url::parse_with_params(
        &secrets.auth_uri,
        &[
            ("response_type", "code"),
            ("client_id", secrets.client_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("scope", scope.as_str()),
            ("state", state),
            ("code_challenge", challenge),
            ("code_challenge_method", "S256"),
            ("access_type", "offline"),
            ("prompt", "consent"),
        ],
    )
    .map_err(|e| OAuthError::BadAuthUri(e.to_string()))
}

/// Pull the authorization code out of the request line of the redirect,
/// e.g. `GET /?state=abc&code=4/0Ab HTTP/1.1`
fn code_from_request_line(request_line: &str, expected_state: &str) -> Result<String, OAuthError> {
    let target = request_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| OAuthError::Redirect(format!("malformed request: {request_line}")))?;
    let url = reqwest::Url::parse(&format!("http://localhost{target}"))
        .map_err(|e| OAuthError::Redirect(e.to_string()))?;
    let mut code = None;
    let mut state = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "error" => return Err(OAuthError::Redirect(value.into_owned())),
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            _ => {}
        }
    }
    if state.as_deref() != Some(expected_state) {
        return Err(OAuthError::StateMismatch);
    }
    code.ok_or_else(|| OAuthError::Redirect("no code parameter".to_string()))
}

/// Ask the user for consent in the browser and exchange the resulting code.
async fn consent(http: &reqwest::Client, secrets: &ClientSecrets) -> Result<StoredToken, OAuthError> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(OAuthError::Listen)?;
    let port = listener.local_addr().map_err(OAuthError::Listen)?.port();
    let redirect_uri = format!("http://127.0.0.1:{port}/");
    let verifier = pkce_verifier();
    let state = random_state();
    let url = authorization_url(secrets, &redirect_uri, &state, &pkce_challenge(&verifier))?;
    info!("No usable token, asking for consent in the browser.");
    println!("Please visit this URL to authorize this application: {url}");

    let (stream, _) = listener.accept().await.map_err(OAuthError::Listen)?;
    let mut stream = BufReader::new(stream);
    let mut request_line = String::new();
    stream
        .read_line(&mut request_line)
        .await
        .map_err(OAuthError::Listen)?;
    let code = code_from_request_line(&request_line, &state);
    let body = match code {
        Ok(_) => "The authentication flow has completed. You may close this window.",
        Err(_) => "The authentication flow has failed. Check the log of the sync.",
    };
    let answer = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    if let Err(e) = stream.get_mut().write_all(answer.as_bytes()).await {
        warn!("Could not answer the browser: {e}");
    }
    let code = code?;

    let response = token_request(
        http,
        &secrets.token_uri,
        &[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("client_id", secrets.client_id.as_str()),
            ("client_secret", secrets.client_secret.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("code_verifier", verifier.as_str()),
        ],
    )
    .await?;
    let requested = SCOPES.iter().map(|s| s.to_string()).collect();
    Ok(StoredToken::from_response(
        response,
        secrets,
        None,
        requested,
        Utc::now(),
    ))
}
