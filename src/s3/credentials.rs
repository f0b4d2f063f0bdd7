//! Signing credentials
//!
//! Resolves the access key, secret key and optional session token used to sign
//! requests.
//!
//! # Resolution order
//!
//! 1. Explicit values in the `s3` section of the configuration file
//! 2. `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, `AWS_SESSION_TOKEN`
//!
//! # Example
//!
//! ```
//! use s3_cli::s3::Credentials;
//!
//! let creds = Credentials::with_session_token("AKIDEXAMPLE", "secret", "token");
//! assert_eq!(creds.access_key_id(), "AKIDEXAMPLE");
//! assert_eq!(creds.session_token(), Some("token"));
//! ```

use crate::config::S3Config;
use std::fmt;
use thiserror::Error;

const ENV_ACCESS_KEY: &str = "AWS_ACCESS_KEY_ID";
const ENV_SECRET_KEY: &str = "AWS_SECRET_ACCESS_KEY";
const ENV_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";

#[derive(Error, Debug)]
pub enum CredentialsError {
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),
}

/// Access key pair plus an optional STS session token
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    /// Temporary credentials; the token is sent as `x-amz-security-token`
    pub fn with_session_token(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: impl Into<String>,
    ) -> Self {
        Self {
            session_token: Some(session_token.into()),
            ..Self::new(access_key_id, secret_access_key)
        }
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    /// Blank keys would only fail later as a signature mismatch
    fn validate(self) -> Result<Self, CredentialsError> {
        if self.access_key_id.trim().is_empty() {
            return Err(CredentialsError::InvalidCredentials(
                "access key is empty".into(),
            ));
        }
        if self.secret_access_key.is_empty() {
            return Err(CredentialsError::InvalidCredentials(
                "secret key is empty".into(),
            ));
        }
        Ok(self)
    }
}

// Never print the secret or the token
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Where credentials come from
pub struct CredentialsProvider;

impl CredentialsProvider {
    /// `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and, when set and
    /// non-empty, `AWS_SESSION_TOKEN`
    pub fn from_env() -> Result<Credentials, CredentialsError> {
        let env = |name: &str| std::env::var(name).ok();
        assemble(
            env(ENV_ACCESS_KEY).as_deref(),
            env(ENV_SECRET_KEY).as_deref(),
            env(ENV_SESSION_TOKEN).as_deref(),
        )
        .map_err(|missing| {
            CredentialsError::MissingCredentials(format!(
                "{} not set",
                match missing {
                    Part::AccessKey => ENV_ACCESS_KEY,
                    Part::SecretKey => ENV_SECRET_KEY,
                }
            ))
        })?
        .validate()
    }

    /// `access_key`, `secret_key` and `session_token` of the `s3` section
    pub fn from_config(config: &S3Config) -> Result<Credentials, CredentialsError> {
        assemble(
            config.access_key.as_deref(),
            config.secret_key.as_deref(),
            config.session_token.as_deref(),
        )
        .map_err(|missing| {
            CredentialsError::MissingCredentials(format!(
                "s3.{} not set in config",
                match missing {
                    Part::AccessKey => "access_key",
                    Part::SecretKey => "secret_key",
                }
            ))
        })?
        .validate()
    }

    /// Configuration when it names either key, otherwise the environment
    pub fn resolve(config: &S3Config) -> Result<Credentials, CredentialsError> {
        if config.access_key.is_some() || config.secret_key.is_some() {
            return Self::from_config(config);
        }
        Self::from_env()
    }
}

enum Part {
    AccessKey,
    SecretKey,
}

fn assemble(
    access_key: Option<&str>,
    secret_key: Option<&str>,
    session_token: Option<&str>,
) -> Result<Credentials, Part> {
    let access_key = access_key.ok_or(Part::AccessKey)?;
    let secret_key = secret_key.ok_or(Part::SecretKey)?;
    Ok(match session_token.filter(|token| !token.is_empty()) {
        Some(token) => Credentials::with_session_token(access_key, secret_key, token),
        None => Credentials::new(access_key, secret_key),
    })
}
