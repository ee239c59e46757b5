//! MQTT 3.1.1 client protocol engine with full QoS 0/1/2 support.
//!
//! This crate implements the client side of the MQTT 3.1.1 protocol: packet
//! framing over a reliable byte stream, packet-identifier correlation of
//! request/response exchanges, both directions of the QoS delivery
//! handshakes, and keep-alive liveness.
//!
//! ## Components
//!
//! - [`Session`]: connection lifecycle and the caller-facing operations
//!   (`send`, `send_receive`, `recv`, `cancel` plus publish/subscribe
//!   conveniences)
//! - [`protocol`]: bit-exact MQTT 3.1.1 packet encoding and decoding
//!
//! [`Session::connect`] dials plain TCP; [`Session::connect_with`] runs the
//! engine over any established byte stream (for example a TLS connection the
//! caller opened).
//!
//! Internally two pipelines run as detached tasks over bounded channels:
//! the outbound pipeline drains the frame queue onto the transport, while
//! the inbound pipeline dispatches decoded packets, delivering messages,
//! answering QoS handshakes and completing suspended callers.
//!
//! ## Example
//!
//! ```no_run
//! use mqttc::{QoS, Session, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> mqttc::Result<()> {
//!     let session = Session::connect(SessionConfig::new("127.0.0.1:1883", "client-1")).await?;
//!
//!     session.subscribe(&[("sensors/#", QoS::AtLeastOnce)]).await?;
//!     session.publish("sensors/kitchen", b"21.5", QoS::AtLeastOnce, false).await?;
//!
//!     let msg = session.recv().await?;
//!     println!("received {:?} on {}", msg.payload, msg.topic);
//!
//!     session.disconnect().await?;
//!     Ok(())
//! }
//! ```

mod config;
mod error;
mod inbound;
mod keepalive;
mod outbound;
mod pending;
pub mod protocol;
mod session;
mod types;

pub use config::{SessionConfig, DEFAULT_QUEUE_CAPACITY};
pub use error::{Error, Result};
pub use pending::Ack;
pub use protocol::v4::{Packet, SubscribeReasonCode, Will};
pub use session::Session;
pub use types::{ConnectReturnCode, Message, QoS};
