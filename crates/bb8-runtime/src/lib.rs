//! `bb8-runtime` – the running bridge.
//!
//! # Modules
//!
//! - [`dispatcher`] – [`Dispatcher`]: connection state machine, reconnect
//!   backoff, and the validate → gate → execute → acknowledge pipeline.
//! - [`discovery`] – [`DiscoveryPublisher`]: home-automation descriptors
//!   bound to one device identity, announced once per [`DiscoverySession`],
//!   with deterministic owner selection.
//! - [`light_sink`] – [`BusLightSink`]: mirrors LED transitions to
//!   `<base>/state/led`.
//! - [`bridge`] – start-up wiring: configured address, cache, or scan.
//! - [`config`] – [`BridgeConfig`]: `~/.bb8/config.toml` with `BB8_*`
//!   overrides.
//! - [`telemetry`] – `tracing` subscriber and optional OTLP export.

pub mod bridge;
pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod light_sink;
pub mod telemetry;

pub use bridge::{file_cache, locate_device};
pub use config::BridgeConfig;
pub use discovery::{
    DeviceBlock, DeviceIdentity, DiscoveryConfig, DiscoveryDescriptor, DiscoveryPublisher,
    DiscoverySession, select_owner,
};
pub use dispatcher::{BridgeStatus, ConnectionState, Dispatcher, ReconnectPolicy};
pub use light_sink::BusLightSink;
