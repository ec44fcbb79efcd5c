//! Hawser agent
//!
//! Host-resident agent that keeps a persistent, authenticated link to
//! the Hawser control plane. Inbound commands and subscriptions are
//! dispatched to handlers; terminal sessions, telemetry streams, and
//! self-updates run on top of the same link.

pub mod admin;
pub mod dispatch;
pub mod logging;
pub mod pty;
pub mod telemetry;
pub mod transport;
pub mod update;

pub use transport::{OutboundSender, Transport};
