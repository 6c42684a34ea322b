//! Two-wire (I2C) bus access.
//!
//! The sensor layers above only ever talk to a [`RegisterBus`]: a device
//! address plus register-level reads and writes. Two implementations exist:
//!
//! - [`BusTransport`] drives a bare TWI peripheral through the
//!   [`TwiHardware`] seam (start / address / byte / stop primitives with a
//!   polled timeout), which is how the bring-up board talks to the sensor.
//! - [`HalBus`] adapts any `embedded_hal::i2c::I2c` master so the same
//!   controller runs on vendor HAL peripherals.

mod hal;
mod twi;

pub use hal::HalBus;
pub use twi::{BusTransport, TwiAction, TwiHardware, TwiStatus};

use embedded_hal::i2c::ErrorKind;
use thiserror_no_std::Error;

/// Default budget a single bus primitive may take before it is abandoned.
pub const DEFAULT_TIMEOUT_US: u32 = 10_000;

/// Granularity used while polling the peripheral for completion.
pub const POLL_STEP_US: u32 = 100;

/// Transfer direction encoded in bit 0 of the address byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Write,
    Read,
}

impl Direction {
    /// Address byte for a 7-bit device address in this direction.
    pub fn address_byte(self, address: u8) -> u8 {
        match self {
            Direction::Write => (address << 1) & 0xFE,
            Direction::Read => (address << 1) | 0x01,
        }
    }
}

/// Which primitive was waiting when the bus gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusStage {
    Start,
    RepeatedStart,
    Address,
    Transmit,
    Receive,
}

/// Error types for bus operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// The peripheral did not complete within the timeout budget
    #[error("Bus timeout during {stage:?}")]
    Timeout { stage: BusStage },

    /// No device acknowledged the address byte
    #[error("Device {address:#04x} did not acknowledge its address")]
    AddressNack { address: u8 },

    /// The device refused a data byte
    #[error("Data byte not acknowledged")]
    DataNack,

    /// The peripheral reported a status that does not fit the current step
    #[error("Unexpected bus status (expected {expected:?}, found {found:?})")]
    UnexpectedStatus {
        expected: TwiStatus,
        found: TwiStatus,
    },

    /// Error reported by an `embedded-hal` I2C implementation
    #[error("I2C peripheral error: {0:?}")]
    Hal(ErrorKind),
}

/// Register-level access to devices on a two-wire bus.
///
/// Every method is one complete bus transaction: it either succeeds or
/// leaves the bus released (stop issued) before returning the error.
pub trait RegisterBus {
    /// Write a single register.
    fn write_register(&mut self, device: u8, register: u8, value: u8) -> Result<(), BusError>;

    /// Read `buf.len()` consecutive bytes starting at `register`.
    fn read_registers(&mut self, device: u8, register: u8, buf: &mut [u8])
    -> Result<(), BusError>;

    /// Burst-write `values` to consecutive registers starting at `register`.
    fn write_registers(&mut self, device: u8, register: u8, values: &[u8])
    -> Result<(), BusError>;

    /// Returns true when a device acknowledges `device`.
    fn probe(&mut self, device: u8) -> bool;

    /// Read a single register.
    fn read_register(&mut self, device: u8, register: u8) -> Result<u8, BusError> {
        let mut value = [0u8; 1];
        self.read_registers(device, register, &mut value)?;
        Ok(value[0])
    }

    /// Read-modify-write of the bits selected by `mask`.
    fn update_register(
        &mut self,
        device: u8,
        register: u8,
        mask: u8,
        bits: u8,
    ) -> Result<(), BusError> {
        let current = self.read_register(device, register)?;
        self.write_register(device, register, (current & !mask) | (bits & mask))
    }
}

impl<T: RegisterBus + ?Sized> RegisterBus for &mut T {
    fn write_register(&mut self, device: u8, register: u8, value: u8) -> Result<(), BusError> {
        (**self).write_register(device, register, value)
    }

    fn read_registers(
        &mut self,
        device: u8,
        register: u8,
        buf: &mut [u8],
    ) -> Result<(), BusError> {
        (**self).read_registers(device, register, buf)
    }

    fn write_registers(
        &mut self,
        device: u8,
        register: u8,
        values: &[u8],
    ) -> Result<(), BusError> {
        (**self).write_registers(device, register, values)
    }

    fn probe(&mut self, device: u8) -> bool {
        (**self).probe(device)
    }
}
