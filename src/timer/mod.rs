//! Timing wheels and timeout notifiers
//!
//! - [`TimingWheel`]: single-owner wheel, no locking; each selector thread
//!   keeps one for its connect timeouts.
//! - [`SharedTimingWheel`]: one lock per slot, safe to schedule into from any
//!   thread.
//! - [`TimeoutTimer`] / [`TimeoutNotifier`]: the per-channel idle and read
//!   timeouts, built on the shared wheel.

mod notifier;
mod shared;
mod wheel;

pub use notifier::{NotifierState, TimeoutNotifier, TimeoutTimer};
pub use shared::SharedTimingWheel;
pub use wheel::{TimerHandle, TimingWheel};
