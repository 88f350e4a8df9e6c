// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! Client transport: the connector that produces a raw stream, and the transport that
//! frames, secures and correlates messages over it.

pub mod pending;
pub mod tcp;

pub use pending::{PendingCalls, ResponseReceiver, ResponseSender};
pub use tcp::{Connector, TcpConnector, TcpTransport, TransportPollResult};

use tokio::io::{AsyncRead, AsyncWrite};

/// The stream a connector produces. Boxed so tests can connect over in-memory duplex pipes
/// with the same machinery that carries TCP in production.
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

/// A boxed transport stream.
pub type IoStream = Box<dyn AsyncIo>;
