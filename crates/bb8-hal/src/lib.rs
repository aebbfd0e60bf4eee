//! `bb8-hal` – device-side capabilities of the BB-8 bridge.
//!
//! # Modules
//!
//! - [`ble_link`] – the [`BleLink`] trait: the opaque short-range radio link
//!   to the robot (drive, stop, sleep, wake, LED).
//! - [`address_cache`] – persists the last resolved device address and
//!   serves it back while it is well-formed and fresh.
//! - [`locator`] – [`DeviceLocator`]: scans for an advertising BB-8, ranks
//!   candidates by signal strength, and resolves its address through the
//!   cache.
//! - [`lighting`] – [`LightingController`]: owns LED state and runs at most
//!   one cancellable preset animation at a time.
//! - [`sim`] – in-process link and scanner doubles for tests and the bench
//!   REPL.

pub mod address_cache;
pub mod ble_link;
pub mod lighting;
pub mod locator;
pub mod sim;

pub use address_cache::{AddressCache, FileAddressCache, load_cache, save_cache};
pub use ble_link::{BleLink, DriveCommand};
pub use lighting::{ANIMATION_STEP, CANCEL_BUDGET, LightStateSink, LightingController, Preset};
pub use locator::{Advertisement, DeviceLocator, ResolvedDevice, Scanner, is_bb8_name};
pub use sim::{LinkCall, SimBleLink, SimScanner};
