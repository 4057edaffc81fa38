//! Transport collaborator boundary and the peer handle.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use hopwire_core::TunnelMessage;

#[derive(Error, Debug)]
pub enum TransportError {
    /// The peer is not connected yet; the caller may retry.
    #[error("Peer is not connected")]
    NotConnected,

    #[error("Transport error: {0}")]
    Other(String),
}

/// The wire transport collaborator. Delivers opaque tunnel messages to
/// the entry node; inbound traffic for a tunnel is dispatched back via
/// [`crate::Tunnel::process`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_custom_message(&self, msg: TunnelMessage) -> Result<(), TransportError>;
}

/// Reference-counted handle on a transport peer.
///
/// The tunnel holds a strong reference for its lifetime and releases it
/// in `stop`; the transport must not hold a strong back-reference to the
/// tunnel, so dropping the tunnel always releases the peer.
pub struct Peer {
    transport: Arc<dyn Transport>,
    references: AtomicI32,
}

impl Peer {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            references: AtomicI32::new(0),
        }
    }

    pub fn add_reference(&self) {
        self.references.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference; returns true when the peer became unreferenced.
    pub fn dereference(&self) -> bool {
        self.references.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn reference_count(&self) -> i32 {
        self.references.load(Ordering::Acquire)
    }

    pub async fn send_custom_message(&self, msg: TunnelMessage) -> Result<(), TransportError> {
        self.transport.send_custom_message(msg).await
    }
}
