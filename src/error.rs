//! Crate-wide error taxonomy.
//!
//! Connection failures are fatal to the current poll cycle and trigger
//! backoff; search/fetch failures abandon the batch; parse and delivery
//! failures are scoped to a single mail or sub-item and never stop the loop.

/// Why establishing (or re-establishing) the mailbox session failed.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("cannot reach {host}:{port}: {reason}")]
    Dns {
        host: String,
        port: u16,
        reason: String,
    },
    #[error("login rejected for '{user}': {reason}")]
    Auth { user: String, reason: String },
    #[error("IMAP protocol error: {0}")]
    Protocol(String),
    /// A reconnect attempt was suppressed because the backoff window is
    /// still open.
    #[error("reconnect suppressed, backoff window open")]
    BackoffActive,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("mailbox search failed with '{query}': {reason}")]
    Search { query: String, reason: String },

    #[error("fetch of UID {uid} failed: {reason}")]
    Fetch { uid: u32, reason: String },

    #[error("cannot parse mail with UID {uid}: {reason}")]
    Parse { uid: u32, reason: String },

    #[error("delivery of '{item}' failed: {reason}")]
    Delivery { item: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
