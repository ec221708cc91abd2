//! Error types for the TPP client.

#[derive(Debug, thiserror::Error)]
pub enum TppError {
    #[error("API error: {0}")]
    Api(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("certificate request rejected: {0}")]
    Rejected(String),

    #[error("invalid configuration: {0}")]
    Config(&'static str),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid response body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl From<TppError> for sshcert_core::CaError {
    fn from(err: TppError) -> Self {
        match err {
            TppError::Auth(msg) => Self::Auth(msg),
            TppError::Rejected(msg) => Self::Rejected(msg),
            TppError::Http(e) if e.is_timeout() || e.is_connect() => {
                Self::Unavailable(e.to_string())
            }
            other => Self::Other(anyhow::anyhow!("{other}")),
        }
    }
}
