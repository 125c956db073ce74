use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid base64 in `{field}`: {source}")]
    Base64 {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },

    #[error("`{field}` has wrong length: expected {expected} bytes, got {got}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("backup blob too short: expected at least {expected} bytes, got {got}")]
    BlobTooShort { expected: usize, got: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
