//! Errors surfaced by link construction and subscription.
//!
//! Sending never fails from the caller's point of view: transport problems
//! are logged by the layer that hit them and masked by the layers above.

use crate::Tag;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Listener error: {0}")]
    Listener(#[from] io::Error),

    #[error("Delivery channel already has a subscriber")]
    AlreadySubscribed,

    #[error("Tag {0} already has a subscriber")]
    TagAlreadySubscribed(Tag),
}

pub type Result<T> = std::result::Result<T, LinkError>;
