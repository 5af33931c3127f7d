//! `roamer-hal` – Hardware Abstraction Layer
//!
//! Defines the transport seam between the Roamer runtime and a robot.
//!
//! # Modules
//!
//! - [`link`] – [`RobotLink`][link::RobotLink], [`ControlStream`][link::ControlStream]
//!   and [`EventStream`][link::EventStream]: the async traits every robot
//!   transport implements.
//! - [`camera`] – [`CameraFrame`][camera::CameraFrame], an encoded image
//!   returned by a capture.
//! - [`sim`] – [`SimRobot`][sim::SimRobot], an in-process robot used by tests
//!   and by `roamer simulate`.

pub mod camera;
pub mod link;
pub mod sim;

pub use camera::{CameraFrame, ImageEncoding};
pub use link::{ControlStream, EventStream, RobotLink};
pub use sim::{ActuatorCall, GrantPolicy, SimRobot};
