//! [`LightingController`] – sole owner of the robot's LED.
//!
//! Two kinds of operation change the LED:
//!
//! * [`set_static`](LightingController::set_static) – one colour, applied
//!   immediately.
//! * [`run_preset`](LightingController::run_preset) – a named preset.  `off`
//!   and `white` are immediate; the animated presets run in a background task
//!   until something replaces them.
//!
//! At most one animation task is alive per controller.  Starting any new
//! operation first signals the running task through a `watch` channel and
//! then awaits its exit, bounded by [`CANCEL_BUDGET`].  The task checks the
//! signal once per [`ANIMATION_STEP`] and also wakes on it mid-sleep, so the
//! hand-off normally completes within one LED write.
//!
//! When the BLE link is down the controller still tracks state but skips the
//! hardware write, so re-attaching the link later finds a consistent view.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bb8_types::{LightingMode, LightingState, Rgb};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ble_link::BleLink;

/// Duration of one animation frame; also the worst-case wait before a running
/// preset notices it was cancelled.
pub const ANIMATION_STEP: Duration = Duration::from_millis(50);

/// Upper bound on cancelling a running preset before a new state is applied.
pub const CANCEL_BUDGET: Duration = Duration::from_millis(100);

/// Receives every lighting state transition.
#[async_trait]
pub trait LightStateSink: Send + Sync {
    async fn light_state_changed(&self, state: &LightingState);
}

// ────────────────────────────────────────────────────────────────────────────
// Presets
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    Off,
    White,
    Rainbow,
    Breathe,
    Police,
}

impl Preset {
    pub const ALL: [Preset; 5] = [
        Preset::Off,
        Preset::White,
        Preset::Rainbow,
        Preset::Breathe,
        Preset::Police,
    ];

    pub fn parse(name: &str) -> Option<Preset> {
        Preset::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(name.trim()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Preset::Off => "off",
            Preset::White => "white",
            Preset::Rainbow => "rainbow",
            Preset::Breathe => "breathe",
            Preset::Police => "police",
        }
    }

    pub fn is_animated(&self) -> bool {
        !matches!(self, Preset::Off | Preset::White)
    }

    /// Colour shown at animation step `step`.
    pub fn frame(&self, step: u32) -> Rgb {
        match self {
            Preset::Off => Rgb::BLACK,
            Preset::White => Rgb::WHITE,
            // Full hue cycle every 60 steps (3 s).
            Preset::Rainbow => hue_to_rgb(((step % 60) * 6) as u16),
            // Triangle ramp up and down over 40 steps.
            Preset::Breathe => {
                let t = step % 40;
                let ramp = if t < 20 { t } else { 40 - t };
                Rgb::new(0, 0, 255).dimmed((ramp * 255 / 20) as u8)
            }
            // Alternate every 5 steps (250 ms).
            Preset::Police => {
                if (step / 5) % 2 == 0 {
                    Rgb::new(255, 0, 0)
                } else {
                    Rgb::new(0, 0, 255)
                }
            }
        }
    }
}

/// Fully saturated colour for `hue` degrees (0–359).
fn hue_to_rgb(hue: u16) -> Rgb {
    let hue = hue % 360;
    let x = ((60 - (hue % 120).abs_diff(60)) * 255 / 60) as u8;
    match hue / 60 {
        0 => Rgb::new(255, x, 0),
        1 => Rgb::new(x, 255, 0),
        2 => Rgb::new(0, 255, x),
        3 => Rgb::new(0, x, 255),
        4 => Rgb::new(x, 0, 255),
        _ => Rgb::new(255, 0, x),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Controller
// ────────────────────────────────────────────────────────────────────────────

struct ActiveAnimation {
    preset: Preset,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct LightingController {
    link: Arc<dyn BleLink>,
    sink: Option<Arc<dyn LightStateSink>>,
    state: Arc<Mutex<LightingState>>,
    active: Option<ActiveAnimation>,
}

fn lock(state: &Mutex<LightingState>) -> MutexGuard<'_, LightingState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LightingController {
    /// `sink`, when present, is told about every state transition.
    pub fn new(link: Arc<dyn BleLink>, sink: Option<Arc<dyn LightStateSink>>) -> Self {
        Self {
            link,
            sink,
            state: Arc::new(Mutex::new(LightingState::default())),
            active: None,
        }
    }

    pub fn state(&self) -> LightingState {
        lock(&self.state).clone()
    }

    /// Name of the running animated preset, if any.
    pub fn active_preset(&self) -> Option<&'static str> {
        self.active
            .as_ref()
            .filter(|a| !a.handle.is_finished())
            .map(|a| a.preset.name())
    }

    /// Replace whatever is showing with a single colour.
    pub async fn set_static(&mut self, rgb: Rgb) {
        self.stop_animation().await;
        write_led(self.link.as_ref(), rgb).await;
        self.transition(LightingMode::Static, rgb).await;
    }

    /// Start the preset called `name`.  Returns `false`, touching nothing,
    /// when the name is not a known preset.
    pub async fn run_preset(&mut self, name: &str) -> bool {
        let Some(preset) = Preset::parse(name) else {
            warn!(preset = name, "unknown LED preset");
            return false;
        };
        self.stop_animation().await;

        match preset {
            Preset::Off => {
                write_led(self.link.as_ref(), Rgb::BLACK).await;
                self.transition(LightingMode::Off, Rgb::BLACK).await;
            }
            Preset::White => {
                write_led(self.link.as_ref(), Rgb::WHITE).await;
                self.transition(LightingMode::Preset(preset.name().to_string()), Rgb::WHITE)
                    .await;
            }
            _ => {
                let (cancel, cancelled) = watch::channel(false);
                let handle = tokio::spawn(animate(
                    preset,
                    Arc::clone(&self.link),
                    Arc::clone(&self.state),
                    cancelled,
                ));
                self.active = Some(ActiveAnimation {
                    preset,
                    cancel,
                    handle,
                });
                let first = preset.frame(0);
                self.transition(LightingMode::Preset(preset.name().to_string()), first)
                    .await;
                info!(preset = preset.name(), "LED animation started");
            }
        }
        true
    }

    /// Stop any running animation, leaving its last colour on the LED.
    /// Returns `true` when an animation was running.
    pub async fn cancel_active(&mut self) -> bool {
        if !self.stop_animation().await {
            return false;
        }
        let rgb = self.state().rgb;
        self.transition(LightingMode::Static, rgb).await;
        true
    }

    /// Signal the running task and wait for it to exit.
    async fn stop_animation(&mut self) -> bool {
        let Some(mut active) = self.active.take() else {
            return false;
        };
        // A send error only means the task already exited.
        let _ = active.cancel.send(true);
        if tokio::time::timeout(CANCEL_BUDGET, &mut active.handle)
            .await
            .is_err()
        {
            warn!(
                preset = active.preset.name(),
                budget_ms = CANCEL_BUDGET.as_millis() as u64,
                "animation ignored cancellation; aborting"
            );
            active.handle.abort();
        }
        debug!(preset = active.preset.name(), "LED animation stopped");
        true
    }

    async fn transition(&self, mode: LightingMode, rgb: Rgb) {
        let snapshot = {
            let mut state = lock(&self.state);
            state.mode = mode;
            state.rgb = rgb;
            state.clone()
        };
        if let Some(sink) = &self.sink {
            sink.light_state_changed(&snapshot).await;
        }
    }
}

impl Drop for LightingController {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.handle.abort();
        }
    }
}

async fn write_led(link: &dyn BleLink, rgb: Rgb) {
    if !link.is_connected() {
        debug!(?rgb, "BLE link down; LED write skipped");
        return;
    }
    if let Err(e) = link.set_led(rgb).await {
        warn!(error = %e, ?rgb, "LED write failed");
    }
}

async fn animate(
    preset: Preset,
    link: Arc<dyn BleLink>,
    state: Arc<Mutex<LightingState>>,
    mut cancelled: watch::Receiver<bool>,
) {
    let mut step: u32 = 0;
    loop {
        if *cancelled.borrow() {
            break;
        }
        let rgb = preset.frame(step);
        write_led(link.as_ref(), rgb).await;
        lock(&state).rgb = rgb;
        step = step.wrapping_add(1);

        tokio::select! {
            _ = tokio::time::sleep(ANIMATION_STEP) => {}
            // Fires on cancellation or when the controller is gone.
            _ = cancelled.changed() => break,
        }
    }
}
