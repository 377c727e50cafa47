//! Persistent connection transports the connection manager streams over.

mod memory;
mod websocket;

pub use memory::{MemoryPeer, MemoryTransport, WriteFailure};
pub use websocket::{Incoming, WebsocketTransport};

use std::fmt::Debug;

use snafu::prelude::*;
use tokio_tungstenite::tungstenite;

/// Error when drive a transport
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum TransportError {
    /// peer closed the connection, not a fault
    #[snafu(display("client disconnected"))]
    Disconnected,

    /// protocol handshake failed
    #[snafu(display("handshake failed: {source}"))]
    Handshake {
        /// source error
        #[snafu(source(from(tungstenite::Error, Box::new)))]
        source: Box<tungstenite::Error>,
    },

    /// underlying websocket stream broken
    #[snafu(display("underlying websocket stream broken: {source}"))]
    Websocket {
        /// source error
        #[snafu(source(from(tungstenite::Error, Box::new)))]
        source: Box<tungstenite::Error>,
    },

    /// operation not valid in current transport state
    #[snafu(display("transport is {state}"))]
    InvalidState {
        /// current state name
        state: &'static str,
    },

    /// generic write fault
    #[snafu(display("transport fault: {message}"))]
    Fault {
        /// fault description
        message: String,
    },
}

impl TransportError {
    /// Check if this error means the client went away cleanly
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

/// A persistent, ordered, text frame channel to one client.
#[async_trait::async_trait]
pub trait Transport: Debug + Send {
    /// complete the protocol handshake
    async fn accept(&mut self) -> Result<(), TransportError>;
    /// write one text frame, returns [`TransportError::Disconnected`] if the peer is gone
    async fn send_text(&mut self, frame: String) -> Result<(), TransportError>;
    /// liveness probe
    async fn ping(&mut self) -> Result<(), TransportError>;
    /// close the channel
    async fn close(&mut self) -> Result<(), TransportError>;
}
