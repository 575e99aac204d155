//! Service-level errors.
//!
//! Entity operations report typed errors per entity class; this module is
//! the surface the HTTP layer maps onto status codes (not-found variants to
//! 404, invalid arguments to 400, the rest to 500).

use thiserror::Error;

use crate::{offset, pubsub, store};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("topic can not found")]
    TopicNotFound,

    #[error("subscription can not found")]
    SubscriptionNotFound,

    #[error("snapshot can not found")]
    SnapshotNotFound,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Commit lost to a concurrent writer. The operation may be retried
    /// wholesale by the caller.
    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(store::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::TopicNotFound | Self::SubscriptionNotFound | Self::SnapshotNotFound
        )
    }
}

impl From<store::Error> for Error {
    fn from(err: store::Error) -> Self {
        match err {
            store::Error::Conflict(msg) => Self::Conflict(msg),
            other => Self::Storage(other),
        }
    }
}

impl From<pubsub::Error> for Error {
    fn from(err: pubsub::Error) -> Self {
        match err {
            pubsub::Error::TopicNotFound => Self::TopicNotFound,
            pubsub::Error::SubscriptionNotFound => Self::SubscriptionNotFound,
            pubsub::Error::SnapshotNotFound => Self::SnapshotNotFound,
            pubsub::Error::Record(err) => Self::Internal(format!("record codec: {err}")),
            pubsub::Error::MalformedKey => Self::Internal("malformed message key".to_owned()),
            pubsub::Error::Store(err) => err.into(),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<offset::ParseError> for Error {
    fn from(err: offset::ParseError) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}
