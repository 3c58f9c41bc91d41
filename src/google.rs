//! Everything directly interfacing with the Google Admin SDK Directory API.

use reqwest::{StatusCode, header};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{trace, warn};

pub const DIRECTORY_API_BASE: &str = "https://admin.googleapis.com";

/// Something went wrong talking to the directory
#[derive(Debug)]
pub enum GoogleApiError {
    CannotCreateClient(reqwest::Error),
    /// The access token contains bytes that are not allowed in a header
    InvalidToken,
    NoResponse(reqwest::Error),
    Utf8Decode,
    Deserialize,
    /// 401. The token is not (or no longer) accepted.
    Unauthorized(String),
    /// 403 for a single account
    Forbidden(String),
    NotFound(String),
    /// Any other non-success status
    Status(u16, String),
}
impl GoogleApiError {
    /// Errors after which no other request can succeed either
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}
impl core::fmt::Display for GoogleApiError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Self::CannotCreateClient(e) => {
                write!(f, "Unable to create a reqwest client for the directory: {e}.")
            }
            Self::InvalidToken => {
                write!(f, "The access token cannot be sent as a header.")
            }
            Self::NoResponse(e) => {
                write!(f, "Did not get a response from the directory: {e}.")
            }
            Self::Utf8Decode => {
                write!(f, "Cannot decode the message bytes as utf-8.")
            }
            Self::Deserialize => {
                write!(f, "Cannot deserialize the response.")
            }
            Self::Unauthorized(body) => {
                write!(f, "The directory rejected our credentials: {body}")
            }
            Self::Forbidden(key) => {
                write!(f, "Not allowed to access account {key}.")
            }
            Self::NotFound(key) => {
                write!(f, "Account {key} does not exist.")
            }
            Self::Status(status, body) => {
                write!(f, "The directory answered with status {status}: {body}")
            }
        }
    }
}
impl core::error::Error for GoogleApiError {}

/// The parts of a directory account we care about
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DirectoryAccount {
    #[serde(rename = "primaryEmail")]
    pub primary_email: String,
    #[serde(default)]
    pub suspended: bool,
    #[serde(rename = "orgUnitPath", default)]
    pub org_unit_path: String,
}

#[derive(Debug, Deserialize)]
struct UserListResponse {
    /// missing entirely when nothing matched
    #[serde(default)]
    users: Vec<DirectoryAccount>,
}

/// Body of an account update. Only the set fields are changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountUpdate {
    pub suspended: bool,
    #[serde(rename = "orgUnitPath", skip_serializing_if = "Option::is_none")]
    pub org_unit_path: Option<String>,
}

/// The account management operations the sync needs.
pub(crate) trait Directory {
    /// Accounts matching a search query such as `Synchronization_Data.DCID=1234`.
    /// At most two are returned, which is enough to notice duplicates.
    async fn search(&self, query: &str) -> Result<Vec<DirectoryAccount>, GoogleApiError>;

    async fn get(&self, user_key: &str) -> Result<DirectoryAccount, GoogleApiError>;

    async fn update(&self, user_key: &str, update: &AccountUpdate) -> Result<(), GoogleApiError>;
}

/// Create a Client that sends the bearer token with each request
pub fn create_client(access_token: &str) -> Result<reqwest::Client, GoogleApiError> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::ACCEPT,
        header::HeaderValue::from_static("application/json"),
    );
    let mut auth_value = header::HeaderValue::from_str(&format!("Bearer {access_token}"))
        .map_err(|_| GoogleApiError::InvalidToken)?;
    auth_value.set_sensitive(true);
    headers.insert(header::AUTHORIZATION, auth_value);
    reqwest::Client::builder()
        .default_headers(headers)
        .use_rustls_tls()
        .build()
        .map_err(GoogleApiError::CannotCreateClient)
}

/// [`Directory`] backed by the Admin SDK REST API
pub(crate) struct GoogleDirectory {
    client: reqwest::Client,
    base_url: String,
    domain: String,
    customer: String,
}
impl GoogleDirectory {
    pub fn new(client: reqwest::Client, base_url: &str, domain: &str, customer: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            domain: domain.to_owned(),
            customer: customer.to_owned(),
        }
    }

    fn users_url(&self) -> String {
        format!("{}/admin/directory/v1/users", self.base_url)
    }
}

/// Check the status and deserialize the body of a directory response.
///
/// `user_key` is only used to make errors readable.
async fn read_response<T: DeserializeOwned>(
    response: reqwest::Response,
    user_key: &str,
) -> Result<T, GoogleApiError> {
    let status = response.status();
    let text = match response.text().await {
        Ok(text) => text,
        Err(e) => {
            warn!("There was an error reading the response from the directory as utf-8: {e}");
            return Err(GoogleApiError::Utf8Decode);
        }
    };
    match status {
        StatusCode::UNAUTHORIZED => return Err(GoogleApiError::Unauthorized(text)),
        StatusCode::FORBIDDEN => return Err(GoogleApiError::Forbidden(user_key.to_owned())),
        StatusCode::NOT_FOUND => return Err(GoogleApiError::NotFound(user_key.to_owned())),
        s if !s.is_success() => return Err(GoogleApiError::Status(s.as_u16(), text)),
        _ => {}
    }
    match serde_json::from_str(&text) {
        Ok(x) => Ok(x),
        Err(e) => {
            warn!("There was an error parsing the return value from the directory: {e}");
            warn!("The complete text received was: {text}");
            Err(GoogleApiError::Deserialize)
        }
    }
}

impl Directory for GoogleDirectory {
    async fn search(&self, query: &str) -> Result<Vec<DirectoryAccount>, GoogleApiError> {
        trace!("Searching the directory for {query}");
        let response = match self
            .client
            .get(self.users_url())
            .query(&[
                ("customer", self.customer.as_str()),
                ("domain", self.domain.as_str()),
                ("maxResults", "2"),
                ("orderBy", "email"),
                ("projection", "full"),
                ("query", query),
            ])
            .send()
            .await
        {
            Ok(x) => x,
            Err(e) => {
                warn!("There was a problem getting a response from the directory");
                return Err(GoogleApiError::NoResponse(e));
            }
        };
        let list: UserListResponse = read_response(response, query).await?;
        Ok(list.users)
    }

    async fn get(&self, user_key: &str) -> Result<DirectoryAccount, GoogleApiError> {
        let response = match self
            .client
            .get(format!("{}/{user_key}", self.users_url()))
            .send()
            .await
        {
            Ok(x) => x,
            Err(e) => {
                warn!("There was a problem getting a response from the directory");
                return Err(GoogleApiError::NoResponse(e));
            }
        };
        read_response(response, user_key).await
    }

    async fn update(&self, user_key: &str, update: &AccountUpdate) -> Result<(), GoogleApiError> {
        let response = match self
            .client
            .put(format!("{}/{user_key}", self.users_url()))
            .json(update)
            .send()
            .await
        {
            Ok(x) => x,
            Err(e) => {
                warn!("There was a problem getting a response from the directory");
                return Err(GoogleApiError::NoResponse(e));
            }
        };
        // the response is the full updated account, which we do not need
        let _: serde_json::Value = read_response(response, user_key).await?;
        Ok(())
    }
}
