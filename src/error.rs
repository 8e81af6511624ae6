//! Error taxonomy shared by the reactor, the worker pool and the pipeline.
//!
//! The variants mirror how a failure is treated at the channel level:
//!
//! - [`Error::Framing`], [`Error::Rejected`], [`Error::Io`] and
//!   [`Error::Unencoded`] are fatal to the channel: the exception callback
//!   fires and the channel is closed.
//! - [`Error::Filter`] and [`Error::Panicked`] are handler failures: they are
//!   caught at the pipeline boundary, logged and routed to the exception
//!   callback. The service decides what happens next.
//! - The remaining variants are returned synchronously to the caller.

use std::io;

use crate::channel::ChannelId;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket read, write, accept or connect failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A filter's boundary check reported corrupt input.
    #[error("framing error in filter `{filter}`")]
    Framing { filter: String },

    /// An inbound filter returned `false` without producing any output.
    #[error("filter `{filter}` rejected the message")]
    Rejected { filter: String },

    /// A filter callback returned an error of its own.
    #[error("filter `{filter}` failed: {reason}")]
    Filter { filter: String, reason: String },

    /// A filter or service callback panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("filter `{0}` is already present in the chain")]
    DuplicateFilter(String),

    #[error("no filter named `{0}` in the chain")]
    UnknownFilter(String),

    #[error("channel {0} is closed")]
    Closed(ChannelId),

    /// An object message reached the socket without being encoded to bytes.
    #[error("outbound message on channel {0} was not encoded to bytes")]
    Unencoded(ChannelId),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("reactor is shut down")]
    Shutdown,
}

impl Error {
    /// Whether the channel must be closed after this error is reported.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Framing { .. } | Error::Rejected { .. } | Error::Io(_) | Error::Unencoded(_)
        )
    }

    /// Builds an [`Error::Filter`] from any displayable reason.
    pub fn filter(filter: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Filter {
            filter: filter.into(),
            reason: reason.to_string(),
        }
    }

    /// Converts a caught panic payload into [`Error::Panicked`].
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Error::Panicked(message)
    }
}
