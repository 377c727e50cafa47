use std::{fmt::Debug, io::ErrorKind};

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use snafu::{prelude::*, IntoError};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::oneshot,
};
use tokio_tungstenite::{
    tungstenite::{self, error::ProtocolError, Message},
    WebSocketStream,
};

use super::{error, Transport, TransportError};

enum State<S> {
    Pending(S),
    Open(SplitSink<WebSocketStream<S>, Message>),
    Closed,
}

impl<S> State<S> {
    fn name(&self) -> &'static str {
        match self {
            Self::Pending(_) => "pending",
            Self::Open(_) => "open",
            Self::Closed => "closed",
        }
    }
}

/// Server side websocket transport.
///
/// Holds the write half of the socket, the read half is handed to the
/// [`Incoming`] returned by [`WebsocketTransport::new`] once the handshake completes.
pub struct WebsocketTransport<S> {
    state: State<S>,
    incoming_tx: Option<oneshot::Sender<SplitStream<WebSocketStream<S>>>>,
}

impl<S> Debug for WebsocketTransport<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebsocketTransport")
            .field("state", &self.state.name())
            .finish()
    }
}

impl<S> WebsocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an accepted raw stream, handshake happens in [`Transport::accept`]
    pub fn new(stream: S) -> (Self, Incoming<S>) {
        let (incoming_tx, incoming_rx) = oneshot::channel();

        (
            Self {
                state: State::Pending(stream),
                incoming_tx: Some(incoming_tx),
            },
            Incoming {
                pending: Some(incoming_rx),
                stream: None,
            },
        )
    }
}

fn classify(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            error::Disconnected.build()
        }
        tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            error::Disconnected.build()
        }
        tungstenite::Error::Io(ref e)
            if matches!(
                e.kind(),
                ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
            ) =>
        {
            error::Disconnected.build()
        }
        other => error::Websocket.into_error(other),
    }
}

#[async_trait::async_trait]
impl<S> Transport for WebsocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn accept(&mut self) -> Result<(), TransportError> {
        let stream = match std::mem::replace(&mut self.state, State::Closed) {
            State::Pending(stream) => stream,
            other => {
                let state = other.name();
                self.state = other;
                return error::InvalidState { state }.fail();
            }
        };

        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .context(error::Handshake)?;

        log::trace!("Websocket handshake done");

        let (sink, stream) = ws.split();
        if let Some(tx) = self.incoming_tx.take() {
            if tx.send(stream).is_err() {
                log::trace!("Incoming side dropped, inbound frames will be ignored");
            }
        }

        self.state = State::Open(sink);

        Ok(())
    }

    async fn send_text(&mut self, frame: String) -> Result<(), TransportError> {
        match self.state {
            State::Open(ref mut sink) => sink.send(Message::Text(frame)).await.map_err(classify),
            ref other => error::InvalidState {
                state: other.name(),
            }
            .fail(),
        }
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        match self.state {
            State::Open(ref mut sink) => sink.send(Message::Ping(Vec::new())).await.map_err(classify),
            ref other => error::InvalidState {
                state: other.name(),
            }
            .fail(),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let result = match std::mem::replace(&mut self.state, State::Closed) {
            State::Open(mut sink) => sink.close().await.map_err(classify),
            State::Pending(_) | State::Closed => Ok(()),
        };

        match result {
            Err(e) if e.is_disconnect() => Ok(()),
            other => other,
        }
    }
}

/// Inbound frames of a [`WebsocketTransport`].
///
/// The request layer drives it and reports traffic back to the connection
/// manager so the heartbeat sees the client alive.
pub struct Incoming<S> {
    pending: Option<oneshot::Receiver<SplitStream<WebSocketStream<S>>>>,
    stream: Option<SplitStream<WebSocketStream<S>>>,
}

impl<S> Debug for Incoming<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Incoming")
            .field("ready", &self.stream.is_some())
            .finish()
    }
}

impl<S> Incoming<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wait the next inbound frame.
    ///
    /// Returns `None` when the connection is gone or the handshake never completed.
    pub async fn next_frame(&mut self) -> Option<Result<Message, TransportError>> {
        if self.stream.is_none() {
            let rx = self.pending.take()?;
            self.stream = Some(rx.await.ok()?);
        }

        let stream = self.stream.as_mut()?;
        stream.next().await.map(|result| result.map_err(classify))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::{Envelope, Event};

    #[tokio::test]
    async fn test_websocket_transport_roundtrip_over_duplex() {
        let (server, client) = tokio::io::duplex(4096);

        let (mut transport, mut incoming) = WebsocketTransport::new(server);

        let client = tokio::spawn(async move {
            let (mut ws, _) = tokio_tungstenite::client_async("ws://localhost/ws", client)
                .await
                .unwrap();
            let frame = ws.next().await.unwrap().unwrap();
            ws.send(Message::Text("hello server".to_string()))
                .await
                .unwrap();
            frame
        });

        transport.accept().await.unwrap();

        let envelope = Envelope {
            event: Event::progress("working", Some(10.0)),
            session_id: "s1".to_string(),
            sequence_number: 1,
        };
        transport
            .send_text(envelope.encode().unwrap())
            .await
            .unwrap();

        let received = client.await.unwrap();
        let decoded = Envelope::decode(received.to_text().unwrap()).unwrap();
        assert_eq!(decoded, envelope);

        let inbound = incoming.next_frame().await.unwrap().unwrap();
        assert_eq!(inbound.to_text().unwrap(), "hello server");
    }

    #[tokio::test]
    async fn test_send_before_accept_is_invalid() {
        let (server, _client) = tokio::io::duplex(64);
        let (mut transport, _incoming) = WebsocketTransport::new(server);

        let err = transport.send_text("x".to_string()).await.unwrap_err();

        assert!(matches!(err, TransportError::InvalidState { state: "pending" }));
        assert!(transport.close().await.is_ok());
    }

    #[test]
    fn test_classify_closed_as_disconnect() {
        assert!(classify(tungstenite::Error::ConnectionClosed).is_disconnect());
        assert!(classify(tungstenite::Error::Io(std::io::Error::from(ErrorKind::BrokenPipe)))
            .is_disconnect());
        assert!(!classify(tungstenite::Error::Io(std::io::Error::from(ErrorKind::Other)))
            .is_disconnect());
    }
}
