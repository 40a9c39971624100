//! Robot link protocol and connection lifecycle.
//!
//! This module implements the link between a controller and the robot: a single
//! bidirectional byte stream to one fixed peer, carrying a lightweight framed text protocol.
//! It covers establishing the stream, running the concurrent read worker, framing and parsing
//! messages, detecting disconnects, and serializing writes against a session that may be
//! replaced at any time.
//!
//! # Overview
//!
//! The layers, leaf to root:
//!
//! - [`frame`]: stateless encode/decode of the wire format.
//! - [`TransportSession`]: one live stream pair, its read worker and its serialized write path.
//! - [`ConnectAttempt`]: one blocking connect performed on its own worker.
//! - [`ConnectionManager`]: the state machine that owns at most one attempt and one session,
//!   and delivers inbound frames to the registered consumer.
//!
//! # Wire Format
//!
//! Every message is printable text terminated by `;`. The first character is a tag and the
//! remaining fields are separated by `,`:
//!
//! - `S;` stop all motion.
//! - `A,<angle>;` / `H,<angle>;` set the arm or head angle.
//! - `E,<on>,<off>,...;` eye blink pattern in milliseconds.
//! - `F,<foot>,<direction>,<speed>,<ms>[,...];` one or more movement segments.
//!
//! Inbound frames are free-form text; the application inspects their payload.
//!
//! There is no escaping, no acknowledgement and no retransmission. A frame in progress when
//! the stream ends is discarded.
//!
//! # See Also
//!
//! - [`config`](crate::config): peer identity and link tuning.
//! - [`RobotCommand`](crate::RobotCommand): typed builders for outbound frames.
pub mod frame;
pub mod memory;

mod connect;
mod manager;
mod session;
mod thread;
mod transport;

pub use connect::{CancelToken, ConnectAttempt};
pub use error::LinkError;
pub use frame::{Frame, FrameDecoder, FrameError};
pub use manager::{ConnectionManager, ConnectionState, WeakConnectionManager};
pub use session::TransportSession;
pub use thread::WorkerCount;
pub use transport::{Close, Connector, PendingConnect, StreamPair, TcpConnector};

pub mod error {
    use std::io;

    use thiserror::Error;

    use super::FrameError;

    /// Failures surfaced by the link. None of them are fatal to the process; each one leaves
    /// the [`ConnectionManager`](super::ConnectionManager) in a consistent state.
    #[derive(Debug, Error)]
    pub enum LinkError {
        #[error("link is not connected")]
        NotConnected,

        #[error("failed to connect to peer: {0}")]
        ConnectFailed(#[source] io::Error),

        #[error("failed to write to peer: {0}")]
        WriteFailed(#[source] io::Error),

        #[error("read loop terminated: {0}")]
        ReadTerminated(#[source] io::Error),

        #[error("inbound frame exceeded {limit} bytes")]
        FrameTooLarge { limit: usize },
    }

    impl From<FrameError> for LinkError {
        fn from(value: FrameError) -> Self {
            match value {
                FrameError::Closed => LinkError::ReadTerminated(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed",
                )),
                FrameError::Io(e) => LinkError::ReadTerminated(e),
                FrameError::TooLarge { limit } => LinkError::FrameTooLarge { limit },
            }
        }
    }
}
