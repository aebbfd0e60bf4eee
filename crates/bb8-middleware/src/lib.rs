//! `bb8-middleware` – bus plumbing for the BB-8 bridge.
//!
//! The bridge never talks to a concrete broker directly.  It speaks to the
//! [`MessageBusClient`] capability and leaves the wire protocol to whichever
//! client is injected.
//!
//! # Modules
//!
//! - [`bus`] – the [`MessageBusClient`] trait, the [`BusEvent`] stream it
//!   yields, and [`InMemoryBus`], a broker-less implementation built on Tokio
//!   broadcast channels for tests and the bench REPL.
//! - [`topics`] – topic naming (`<base>/cmd/<name>`, `<base>/ack/<name>`, …)
//!   and MQTT wildcard matching.

pub mod bus;
pub mod topics;

pub use bus::{BusEvent, BusMessage, InMemoryBus, MessageBusClient};
pub use topics::{DEFAULT_BASE_TOPIC, DEFAULT_DISCOVERY_PREFIX, Topics, topic_matches};
