//! Driver components, one per concern. [`crate::camera::SvbonyCamera`] wires
//! them to a single device.

pub mod acquisition;
pub mod capture;
pub mod connection;
pub mod controls;
pub mod dispatch;
pub mod guide;
pub mod settings;
pub mod thermal;
