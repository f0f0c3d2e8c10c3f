use std::{env, fs, path::Path, time::Duration};

use serde::Deserialize;

use crate::error::{ProKnowError, Result};

/// API key credentials, used as the user name and password for basic auth.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub id: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Credentials {
            id: id.into(),
            secret: secret.into(),
        }
    }

    /// Reads the credentials file downloaded when creating an API key in ProKnow.
    ///
    /// The file is a JSON object with the fields `id` and `secret`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ProKnowError::Credentials(format!("unable to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            ProKnowError::Credentials(format!("{} is not a credentials file: {}", path.display(), e))
        })
    }

    /// Reads the credentials file named by `PROKNOW_CREDENTIALS_FILE`, or else the
    /// `PROKNOW_CREDENTIALS_ID` and `PROKNOW_CREDENTIALS_SECRET` variables.
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = env::var("PROKNOW_CREDENTIALS_FILE") {
            return Credentials::from_file(path);
        }
        match (
            env::var("PROKNOW_CREDENTIALS_ID"),
            env::var("PROKNOW_CREDENTIALS_SECRET"),
        ) {
            (Ok(id), Ok(secret)) => Ok(Credentials::new(id, secret)),
            _ => Err(ProKnowError::Credentials(
                "set PROKNOW_CREDENTIALS_FILE or both PROKNOW_CREDENTIALS_ID and PROKNOW_CREDENTIALS_SECRET"
                    .to_string(),
            )),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Client configuration.
///
/// The environment variables read by [Config::from_env] are:
/// * `PROKNOW_BASE_URL`: the organization URL, e.g. `https://example.proknow.com`
/// * `PROKNOW_CREDENTIALS_FILE`: path to the credentials file, or
/// * `PROKNOW_CREDENTIALS_ID` and `PROKNOW_CREDENTIALS_SECRET`
#[derive(Clone, Debug)]
pub struct Config {
    pub base_url: String,
    pub credentials: Credentials,
    /// How long before a draft lock expires the renewer refreshes it.
    pub lock_renewal_buffer: Duration,
    /// Wait used for plan delivery information and dose analysis.
    pub entity_wait_timeout: Duration,
    /// Retries for requests that failed to connect.
    pub max_retries: u32,
    /// Upload polling fails when no upload resolves within this window.
    pub upload_timeout: Duration,
    pub upload_poll_interval: Duration,
    /// Maximum number of file transmissions in flight during an upload.
    pub upload_concurrency: usize,
    pub request_timeout: Duration,
}

impl Config {
    pub fn new(base_url: impl Into<String>, credentials: Credentials) -> Self {
        Config {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            lock_renewal_buffer: Duration::from_secs(30),
            entity_wait_timeout: Duration::from_secs(10),
            max_retries: 3,
            upload_timeout: Duration::from_secs(30),
            upload_poll_interval: Duration::from_millis(100),
            upload_concurrency: 4,
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Config::new(Config::base_url_from_env()?, Credentials::from_env()?))
    }

    /// Reads `PROKNOW_BASE_URL`.
    pub fn base_url_from_env() -> Result<String> {
        env::var("PROKNOW_BASE_URL").map_err(|_| {
            ProKnowError::Credentials("PROKNOW_BASE_URL environment variable not set".to_string())
        })
    }

    pub fn lock_renewal_buffer(mut self, buffer: Duration) -> Self {
        self.lock_renewal_buffer = buffer;
        self
    }

    pub fn entity_wait_timeout(mut self, timeout: Duration) -> Self {
        self.entity_wait_timeout = timeout;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout = timeout;
        self
    }

    pub fn upload_poll_interval(mut self, interval: Duration) -> Self {
        self.upload_poll_interval = interval;
        self
    }

    pub fn upload_concurrency(mut self, concurrency: usize) -> Self {
        self.upload_concurrency = concurrency.max(1);
        self
    }

    /// The prefix every API route is appended to.
    pub fn api_url(&self) -> String {
        format!("{}/api", self.base_url)
    }
}
