use thiserror::Error;

/// Errors surfaced to the operator as one-line messages, plus the fatal
/// configuration class. Everything here formats to something a chat user can
/// read; stack traces stay in the logs.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Already following \"{0}\" in this chat.")]
    AlreadyFollowing(String),

    #[error("Not following \"{0}\" in this chat.")]
    NotFollowing(String),

    #[error("\"{0}\" is protected and cannot be followed.")]
    ProtectedFeed(String),

    #[error("malformed registry file {path}: {source}")]
    Configuration {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("registry i/o error: {0}")]
    RegistryIo(#[from] std::io::Error),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

/// Failures talking to the upstream microblog API. A failure for one feed
/// never aborts work on its siblings.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("User \"{0}\" not found.")]
    UserNotFound(String),

    #[error("not authorized to read this feed")]
    NotAuthorized,

    #[error("upstream API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("undecodable upstream payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Outcome of one delivery attempt to one destination. `Forbidden` gets the
/// fallback-notify treatment; everything else is logged and dropped.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("missing permission to post in this chat")]
    Forbidden,

    #[error("delivery failed: {0}")]
    Other(String),
}
