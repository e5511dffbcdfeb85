// Module: Errors
// Domain errors for the upstream transport, template rendering and the git
// source manager. Configuration findings live in `config`.

use thiserror::Error;

/// Errors surfaced by the upstream HTTP client.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Connection, DNS, TLS or body-read failure.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-success status after retries were exhausted or skipped.
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    /// A 2xx response whose body did not match the expected shape.
    #[error("failed to decode upstream response: {0}")]
    Decode(String),
}

impl UpstreamError {
    /// Retriable: transport failures, 429 and any 5xx. Other 4xx statuses
    /// and decode failures are final for the call.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Decode(_) => false,
        }
    }
}

/// Errors produced while parsing or evaluating a template expression.
/// An unresolved variable is not an error; it renders as nil.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown filter '{0}'")]
    UnknownFilter(String),

    #[error("filter '{filter}' expects {expected}")]
    BadFilterArg { filter: String, expected: String },

    #[error("malformed template expression '{0}'")]
    Malformed(String),
}

/// Errors from the git-backed script source.
#[derive(Debug, Error)]
pub enum GitError {
    #[error(transparent)]
    Git(#[from] git2::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A script path resolved outside its repository checkout.
    #[error("script path '{path}' escapes the repository checkout '{root}'")]
    PathEscape { path: String, root: String },

    /// Lock or pull was requested for a URL never downloaded.
    #[error("no repository registered for '{url}'")]
    UnknownRepo { url: String },
}
