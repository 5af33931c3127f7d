//! `roamer-kernel` – Control & Safety
//!
//! Decides who may move the robot and when a human wants it back.
//!
//! # Modules
//!
//! - [`arbiter`] – [`ControlLease`][arbiter::ControlLease]: negotiates
//!   exclusive actuator control over the robot's control stream, releases a
//!   grant that arrives after the caller gave up, and reports loss.
//! - [`interrupt`] – [`InterruptMonitor`][interrupt::InterruptMonitor]:
//!   watches touch and wake-word events and raises a single, non-blocking
//!   interrupt signal.

pub mod arbiter;
pub mod interrupt;

pub use arbiter::{ACQUIRE_TIMEOUT, ControlLease, RELEASE_WAIT};
pub use interrupt::{
    InterruptMonitor, InterruptReceiver, InterruptSource, InterruptTrigger, MonitorExit,
    TOUCH_DELTA_THRESHOLD, TouchBaseline, interrupt_channel,
};
