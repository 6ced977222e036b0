//! WebSocket transport: framing, channels and the multiplexed client.
//!
//! - [`frame`] - The byte-exact binary frame layout and the request,
//!   response and data-bin payload codecs.
//! - [`channel`] - The abstract full-duplex frame channel and HTTP channel
//!   the client runs over, plus an in-memory duplex pair for tests.
//! - [`client`] - The multiplexed client: request correlation, keepalive,
//!   exponential-backoff reconnection and the sticky HTTP fallback.

pub mod channel;
pub mod client;
pub mod frame;

pub use channel::{duplex_pair, DuplexChannel, FrameChannel, FrameChannelFactory, HttpChannel, HttpResponse};
pub use client::{ClientConfig, JpipClient, ReconnectConfig};
pub use frame::{Frame, FrameType, ResponsePayload, FRAME_HEADER_LEN};
