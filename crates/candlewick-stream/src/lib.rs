//! Websocket stream multiplexing for candlewick.
//!
//! This crate keeps a set of channel subscriptions alive across a pool of
//! combined-stream connections:
//!
//! - [`StreamMultiplexer`] - Subscribes and unsubscribes channels across the pool
//! - [`MultiplexerConfig`] - Per-connection caps, timeouts and backoff
//! - [`Connector`] - Transport seam, with [`WsConnector`] for real websockets
//! - [`StreamEvent`] / [`StreamData`] - Lifecycle events and channel payloads

#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/factordynamics/candlewick/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod connection;
mod error;
mod multiplexer;
pub mod protocol;
mod transport;

pub use connection::ConnectionId;
pub use error::StreamError;
pub use multiplexer::{MultiplexerConfig, StreamData, StreamEvent, StreamMultiplexer};
pub use protocol::Method;
pub use transport::{Connector, FrameSink, FrameStream, Inbound, WsConnector};
