//! [`RegisterBus`] over any `embedded-hal` I2C master.

use embedded_hal::i2c::I2c;
use log::warn;

use super::{BusError, RegisterBus};

/// Largest burst sent in a single `write` call (register byte excluded).
const MAX_BURST: usize = 16;

pub struct HalBus<I> {
    i2c: I,
}

impl<I: I2c> HalBus<I> {
    pub fn new(i2c: I) -> Self {
        Self { i2c }
    }

    pub fn release(self) -> I {
        self.i2c
    }
}

fn map_hal_error<E: embedded_hal::i2c::Error>(e: E, device: u8, register: u8) -> BusError {
    let kind = e.kind();
    warn!(
        "I2C access to {:#04x} register {:#04x} failed: {:?}",
        device, register, kind
    );
    BusError::Hal(kind)
}

impl<I: I2c> RegisterBus for HalBus<I> {
    fn write_register(&mut self, device: u8, register: u8, value: u8) -> Result<(), BusError> {
        self.i2c
            .write(device, &[register, value])
            .map_err(|e| map_hal_error(e, device, register))
    }

    fn read_registers(
        &mut self,
        device: u8,
        register: u8,
        buf: &mut [u8],
    ) -> Result<(), BusError> {
        self.i2c
            .write_read(device, &[register], buf)
            .map_err(|e| map_hal_error(e, device, register))
    }

    fn write_registers(
        &mut self,
        device: u8,
        register: u8,
        values: &[u8],
    ) -> Result<(), BusError> {
        // Auto-increment lets long bursts be split at any register boundary
        let mut frame = [0u8; MAX_BURST + 1];
        for (i, chunk) in values.chunks(MAX_BURST).enumerate() {
            let start = register.wrapping_add((i * MAX_BURST) as u8);
            frame[0] = start;
            frame[1..=chunk.len()].copy_from_slice(chunk);
            self.i2c
                .write(device, &frame[..=chunk.len()])
                .map_err(|e| map_hal_error(e, device, start))?;
        }
        Ok(())
    }

    fn probe(&mut self, device: u8) -> bool {
        self.i2c.write(device, &[]).is_ok()
    }
}
