//! Bus-backed [`LightStateSink`]: mirrors every lighting transition to
//! `<base>/state/led`.
//!
//! While [held](BusLightSink::hold), transitions are coalesced and only the
//! latest one is published on [`release`](BusLightSink::release).  The
//! dispatcher holds the sink around a command so the acknowledgment goes out
//! before the state echo.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bb8_hal::LightStateSink;
use bb8_middleware::{MessageBusClient, Topics};
use bb8_types::LightingState;
use serde_json::json;
use tracing::debug;

pub struct BusLightSink {
    bus: Arc<dyn MessageBusClient>,
    topic: String,
    /// `Some` while held; the inner value is the latest deferred state.
    held: Mutex<Option<Option<LightingState>>>,
}

impl BusLightSink {
    pub fn new(bus: Arc<dyn MessageBusClient>, topics: &Topics) -> Self {
        Self {
            bus,
            topic: topics.state("led"),
            held: Mutex::new(None),
        }
    }

    fn held(&self) -> MutexGuard<'_, Option<Option<LightingState>>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn hold(&self) {
        let mut held = self.held();
        if held.is_none() {
            *held = Some(None);
        }
    }

    /// Stop deferring and publish the latest held transition, if any.
    pub async fn release(&self) {
        let deferred = self.held().take().flatten();
        if let Some(state) = deferred {
            self.publish(&state).await;
        }
    }

    async fn publish(&self, state: &LightingState) {
        // Best effort: a dropped echo is corrected by the next transition.
        if let Err(e) = self
            .bus
            .publish(&self.topic, &led_state_payload(state), true)
            .await
        {
            debug!(error = %e, topic = %self.topic, "LED state echo not published");
        }
    }
}

/// `{"r","g","b","mode","source":"device"}`.
pub fn led_state_payload(state: &LightingState) -> String {
    json!({
        "r": state.rgb.r,
        "g": state.rgb.g,
        "b": state.rgb.b,
        "mode": state.mode.label(),
        "source": "device",
    })
    .to_string()
}

#[async_trait]
impl LightStateSink for BusLightSink {
    async fn light_state_changed(&self, state: &LightingState) {
        {
            let mut held = self.held();
            if let Some(deferred) = held.as_mut() {
                *deferred = Some(state.clone());
                return;
            }
        }
        self.publish(state).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bb8_middleware::InMemoryBus;
    use bb8_types::{LightingMode, Rgb};
    use serde_json::Value;

    #[tokio::test]
    async fn publishes_integer_channels_with_source_tag() {
        let bus = InMemoryBus::default();
        bus.connect().await.unwrap();
        let sink = BusLightSink::new(Arc::new(bus.clone()), &Topics::default());

        sink.light_state_changed(&LightingState {
            mode: LightingMode::Preset("rainbow".to_string()),
            rgb: Rgb::new(255, 0, 9),
        })
        .await;

        let sent = bus.published_to("bb8/state/led");
        assert_eq!(sent.len(), 1);
        let payload: Value = serde_json::from_str(&sent[0].payload).unwrap();
        assert_eq!(payload["r"], 255);
        assert_eq!(payload["g"], 0);
        assert_eq!(payload["b"], 9);
        assert_eq!(payload["mode"], "rainbow");
        assert_eq!(payload["source"], "device");
    }

    #[tokio::test]
    async fn held_transitions_collapse_to_the_latest() {
        let bus = InMemoryBus::default();
        bus.connect().await.unwrap();
        let sink = BusLightSink::new(Arc::new(bus.clone()), &Topics::default());

        sink.hold();
        sink.light_state_changed(&LightingState {
            mode: LightingMode::Static,
            rgb: Rgb::new(1, 2, 3),
        })
        .await;
        sink.light_state_changed(&LightingState::default()).await;
        assert!(bus.published().is_empty());

        sink.release().await;
        let sent = bus.published_to("bb8/state/led");
        assert_eq!(sent.len(), 1);
        let payload: Value = serde_json::from_str(&sent[0].payload).unwrap();
        assert_eq!(payload["mode"], "off");

        // Nothing held, nothing published; afterwards transitions flow again.
        sink.release().await;
        assert_eq!(bus.published().len(), 1);
        sink.light_state_changed(&LightingState::default()).await;
        assert_eq!(bus.published().len(), 2);
    }

    #[tokio::test]
    async fn offline_bus_is_not_an_error() {
        let bus = InMemoryBus::default();
        let sink = BusLightSink::new(Arc::new(bus.clone()), &Topics::default());
        sink.light_state_changed(&LightingState::default()).await;
        assert!(bus.published().is_empty());
    }
}
