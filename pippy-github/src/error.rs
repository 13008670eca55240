//! GitHub client error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GithubError>;

#[derive(Debug, Error)]
pub enum GithubError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("github api returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("workflow yaml invalid: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("workflow content not decodable: {0}")]
    Content(String),

    #[error("credential cache failed: {0}")]
    Store(#[from] pippy_store::StoreError),

    #[error("login failed: {0}")]
    Login(String),
}

impl GithubError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        GithubError::Api {
            status,
            message: message.into(),
        }
    }
}
