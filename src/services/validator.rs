use crate::models::FetchResponse;

const STATUS_OK: &str = "ok";

/// The feed answered, but not with a usable log.
#[derive(Debug, thiserror::Error)]
pub enum ValidationFailure {
    #[error("malformed response: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("status is not `ok`: {status} ({message})")]
    BadStatus { status: String, message: String },
    #[error("error flag set, status: {status} ({message})")]
    ErrorFlag { status: String, message: String },
    #[error("log is empty, status: {status}")]
    EmptyLog { status: String },
}

/// Parses the feed payload and checks it is an `ok`, error-free, non-empty
/// log. Optional entry fields (names, serial, image, reason) default when
/// absent; every other missing or mistyped field is [`ValidationFailure::Malformed`].
pub fn validate(raw: &str) -> Result<FetchResponse, ValidationFailure> {
    let response: FetchResponse = serde_json::from_str(raw)?;

    if response.status != STATUS_OK {
        return Err(ValidationFailure::BadStatus {
            status: response.status,
            message: response.message,
        });
    }
    if response.err == Some(true) {
        return Err(ValidationFailure::ErrorFlag {
            status: response.status,
            message: response.message,
        });
    }
    if response.newest().is_none() {
        return Err(ValidationFailure::EmptyLog {
            status: response.status,
        });
    }

    Ok(response)
}
