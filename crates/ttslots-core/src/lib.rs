//! Hardware-independent core library for ttslots
//!
//! This crate contains the platform-agnostic logic of the heart-rate slot
//! machine: a two-wire bus master, the MAX30102 register model and
//! acquisition controller, the heart-rate / SpO2 estimator, the odds engine,
//! and the measurement session the game layer drives.
//!
//! It is `#![no_std]` without `alloc` so it compiles on small microcontrollers
//! as well as desktop hosts (for the simulator and tests).

#![no_std]

pub mod bus;
pub mod estimator;
pub mod max30102;
pub mod odds;
pub mod session;

#[cfg(any(test, feature = "sim"))]
pub mod sim;
