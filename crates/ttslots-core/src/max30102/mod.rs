//! MAX30102 pulse oximetry / heart-rate sensor.
//!
//! - [`registers`]: register map, field encodings, FIFO sample decoding
//! - [`config`]: the configuration written at bring-up
//! - [`controller`]: bring-up, interrupt handling and FIFO draining

pub mod config;
pub mod controller;
pub mod registers;

pub use config::SensorConfig;
pub use controller::{Batch, ControllerState, Max30102, SensorError};
pub use registers::{DieTemperature, FifoSample, InterruptStatus};
