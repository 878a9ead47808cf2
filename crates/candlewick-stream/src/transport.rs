//! Transport abstraction over a message-oriented duplex socket.

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use std::pin::Pin;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

use crate::StreamError;

/// A frame received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A text frame.
    Text(String),
    /// The server closed the socket.
    Close {
        /// Close code, if one was sent.
        code: Option<u16>,
        /// Close reason.
        reason: String,
    },
}

/// Outgoing half of a transport.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = StreamError> + Send>>;

/// Incoming half of a transport.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Inbound, StreamError>> + Send>>;

/// Opens transports to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connects to `endpoint`, returning the outgoing and incoming halves.
    async fn connect(&self, endpoint: &str) -> Result<(FrameSink, FrameStream), StreamError>;
}

/// Websocket connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str) -> Result<(FrameSink, FrameStream), StreamError> {
        let (socket, response) = tokio_tungstenite::connect_async(endpoint).await.map_err(|e| {
            StreamError::Connect { endpoint: endpoint.to_string(), message: e.to_string() }
        })?;
        debug!(endpoint, status = %response.status(), "websocket handshake complete");

        let (sink, stream) = socket.split();

        let sink = sink
            .with(|text: String| future::ready(Ok::<_, WsError>(Message::Text(text))))
            .sink_map_err(|e| StreamError::Transport(e.to_string()));

        let stream = stream.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(Inbound::Text(text))),
                Ok(Message::Binary(bytes)) => String::from_utf8(bytes).ok().map(|text| Ok(Inbound::Text(text))),
                Ok(Message::Close(frame)) => Some(Ok(match frame {
                    Some(frame) => Inbound::Close {
                        code: Some(u16::from(frame.code)),
                        reason: frame.reason.into_owned(),
                    },
                    None => Inbound::Close { code: None, reason: String::new() },
                })),
                Ok(_) => None,
                Err(e) => Some(Err(StreamError::Transport(e.to_string()))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}
