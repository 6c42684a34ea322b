//! Acquisition controller: owns the device from reset to FIFO draining.
//!
//! ```text
//! Uninitialized -> Resetting -> Configuring -> Ready <-> Draining
//!                                              Ready <-> Shutdown
//! any init failure -> Faulted (only a new `init` leaves it)
//! ```

use embedded_hal::delay::DelayNs;
use log::{debug, error, info, warn};
use thiserror_no_std::Error;

use super::config::SensorConfig;
use super::registers::*;
use crate::bus::{BusError, RegisterBus};

/// Soft-reset completion is polled this many times before giving up.
pub const RESET_POLL_ATTEMPTS: u8 = 10;
const RESET_POLL_INTERVAL_MS: u32 = 10;

/// A die temperature conversion takes about 29 ms.
pub const TEMP_POLL_ATTEMPTS: u8 = 10;
const TEMP_POLL_INTERVAL_MS: u32 = 10;

/// Fewer unread samples than this are left for the next trigger.
pub const MIN_DRAIN_SAMPLES: usize = 5;

/// Samples from one drain, oldest first.
pub type Batch = heapless::Vec<FifoSample, FIFO_DEPTH>;

/// Registers included in [`Max30102::register_dump`].
const DUMP_REGISTERS: [u8; 15] = [
    ADDR_INT_ENABLE_1,
    ADDR_INT_ENABLE_2,
    ADDR_FIFO_WR_PTR,
    ADDR_OVF_COUNTER,
    ADDR_FIFO_RD_PTR,
    ADDR_FIFO_CONFIG,
    ADDR_MODE_CONFIG,
    ADDR_SPO2_CONFIG,
    ADDR_LED1_PA,
    ADDR_LED2_PA,
    ADDR_PILOT_PA,
    ADDR_MULTI_LED_CTRL1,
    ADDR_MULTI_LED_CTRL2,
    ADDR_PROX_INT_THRESH,
    ADDR_REV_ID,
];

pub type RegisterDump = [(u8, u8); DUMP_REGISTERS.len()];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Uninitialized,
    Resetting,
    Configuring,
    Ready,
    Draining,
    Shutdown,
    Faulted,
}

/// Error types for sensor operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    /// Underlying bus transaction failed
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// PART_ID did not read back as a MAX30102
    #[error("Unexpected part id {found:#04x}")]
    IdentityMismatch { found: u8 },

    /// The reset bit never self-cleared
    #[error("Soft reset still pending after {attempts} polls")]
    ResetTimeout { attempts: u8 },

    /// A die temperature conversion never completed
    #[error("Temperature conversion still pending after {attempts} polls")]
    ConversionTimeout { attempts: u8 },

    /// Samples were lost; the FIFO has been resynchronized
    #[error("FIFO overflow, {dropped} samples lost")]
    FifoOverflow { dropped: u8 },

    /// The operation is not allowed in the current state
    #[error("Sensor not ready (state {state:?})")]
    NotReady { state: ControllerState },
}

pub struct Max30102<B, D> {
    bus: B,
    delay: D,
    config: SensorConfig,
    state: ControllerState,
    revision: Option<u8>,
}

impl<B: RegisterBus, D: DelayNs> Max30102<B, D> {
    pub fn new(bus: B, delay: D, config: SensorConfig) -> Self {
        Self {
            bus,
            delay,
            config,
            state: ControllerState::Uninitialized,
            revision: None,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Configuration currently programmed into the device.
    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    /// Revision id read during the last successful identity check.
    pub fn revision(&self) -> Option<u8> {
        self.revision
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn release(self) -> (B, D) {
        (self.bus, self.delay)
    }

    fn require(&self, allowed: &[ControllerState]) -> Result<(), SensorError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SensorError::NotReady { state: self.state })
        }
    }

    // =========================================================================
    // Bring-up
    // =========================================================================

    /// Reset, identify, configure and clear the FIFO.
    ///
    /// Any failure leaves the controller `Faulted`.
    pub fn init(&mut self) -> Result<(), SensorError> {
        match self.bring_up() {
            Ok(()) => {
                self.state = ControllerState::Ready;
                info!("MAX30102 ready: {:?}", self.config);
                Ok(())
            }
            Err(e) => {
                error!("MAX30102 initialization failed: {:?}", e);
                self.state = ControllerState::Faulted;
                Err(e)
            }
        }
    }

    fn bring_up(&mut self) -> Result<(), SensorError> {
        self.state = ControllerState::Resetting;
        self.soft_reset()?;
        self.verify_identity()?;

        self.state = ControllerState::Configuring;
        let config = self.config;
        self.configure(&config)?;
        self.write_fifo_pointers()
    }

    fn soft_reset(&mut self) -> Result<(), SensorError> {
        self.bus
            .write_register(I2C_ADDR, ADDR_MODE_CONFIG, MODE_RESET)?;

        for attempt in 1..=RESET_POLL_ATTEMPTS {
            self.delay.delay_ms(RESET_POLL_INTERVAL_MS);
            let mode = self.bus.read_register(I2C_ADDR, ADDR_MODE_CONFIG)?;
            if mode & MODE_RESET == 0 {
                debug!("MAX30102 reset complete after {} polls", attempt);
                return Ok(());
            }
        }

        Err(SensorError::ResetTimeout {
            attempts: RESET_POLL_ATTEMPTS,
        })
    }

    fn verify_identity(&mut self) -> Result<(), SensorError> {
        let found = self.bus.read_register(I2C_ADDR, ADDR_PART_ID)?;
        if found != PART_ID {
            return Err(SensorError::IdentityMismatch { found });
        }

        let revision = self.bus.read_register(I2C_ADDR, ADDR_REV_ID)?;
        info!("MAX30102 detected (revision {:#04x})", revision);
        self.revision = Some(revision);
        Ok(())
    }

    /// Program `config`. The stored config follows the device register by
    /// register, so decoding always uses the pulse width actually written.
    fn configure(&mut self, config: &SensorConfig) -> Result<(), SensorError> {
        self.bus
            .write_register(I2C_ADDR, ADDR_SPO2_CONFIG, config.spo2_register())?;
        self.config.sample_rate = config.sample_rate;
        self.config.pulse_width = config.pulse_width;
        self.config.adc_range = config.adc_range;

        self.bus
            .write_register(I2C_ADDR, ADDR_LED1_PA, config.red_amplitude)?;
        self.config.red_amplitude = config.red_amplitude;
        self.bus
            .write_register(I2C_ADDR, ADDR_LED2_PA, config.ir_amplitude)?;
        self.config.ir_amplitude = config.ir_amplitude;

        self.bus
            .write_register(I2C_ADDR, ADDR_FIFO_CONFIG, config.fifo_register())?;
        self.config.averaging = config.averaging;
        self.config.rollover = config.rollover;
        self.config.almost_full = config.almost_full;

        self.bus
            .write_register(I2C_ADDR, ADDR_MODE_CONFIG, config.mode_register())?;
        self.config.mode = config.mode;

        self.bus
            .write_register(I2C_ADDR, ADDR_INT_ENABLE_1, INT_A_FULL)?;
        self.bus.write_register(I2C_ADDR, ADDR_INT_ENABLE_2, 0x00)?;

        // Reading the status registers clears anything latched so far
        self.read_status()?;
        Ok(())
    }

    fn write_fifo_pointers(&mut self) -> Result<(), SensorError> {
        // FIFO_WR_PTR, OVF_COUNTER and FIFO_RD_PTR are consecutive
        self.bus
            .write_registers(I2C_ADDR, ADDR_FIFO_WR_PTR, &[0, 0, 0])?;
        Ok(())
    }

    fn read_status(&mut self) -> Result<InterruptStatus, BusError> {
        let bank1 = self.bus.read_register(I2C_ADDR, ADDR_INT_STATUS_1)?;
        let bank2 = self.bus.read_register(I2C_ADDR, ADDR_INT_STATUS_2)?;
        Ok(InterruptStatus::from_registers(bank1, bank2))
    }

    // =========================================================================
    // Acquisition
    // =========================================================================

    /// Discard everything in the FIFO.
    pub fn clear_fifo(&mut self) -> Result<(), SensorError> {
        self.require(&[ControllerState::Ready])?;
        self.write_fifo_pointers()
    }

    /// Read (and thereby clear) both interrupt status registers with
    /// interrupts masked, so the handler cannot re-enter mid-transaction.
    pub fn acknowledge_interrupt(&mut self) -> Result<InterruptStatus, SensorError> {
        self.require(&[ControllerState::Ready, ControllerState::Shutdown])?;
        let status = critical_section::with(|_| self.read_status())?;
        debug!("MAX30102 interrupt status {:?}", status);
        Ok(status)
    }

    /// Drain the FIFO into `batch` and return the number of samples read.
    ///
    /// `batch` is cleared first and stays empty unless the whole cycle
    /// succeeds. The controller is back in `Ready` afterwards either way.
    pub fn drain(&mut self, batch: &mut Batch) -> Result<usize, SensorError> {
        batch.clear();
        self.require(&[ControllerState::Ready])?;

        self.state = ControllerState::Draining;
        let result = self.drain_cycle(batch);
        self.state = ControllerState::Ready;

        if let Err(e) = &result {
            batch.clear();
            warn!("MAX30102 drain aborted: {:?}", e);
        }
        result
    }

    fn drain_cycle(&mut self, batch: &mut Batch) -> Result<usize, SensorError> {
        // FIFO_WR_PTR, OVF_COUNTER, FIFO_RD_PTR
        let mut pointers = [0u8; 3];
        self.bus
            .read_registers(I2C_ADDR, ADDR_FIFO_WR_PTR, &mut pointers)?;
        let [write_ptr, overflow, read_ptr] = pointers.map(|p| p & 0x1F);

        if overflow != 0 {
            self.write_fifo_pointers()?;
            return Err(SensorError::FifoOverflow { dropped: overflow });
        }

        let count = fifo_available(write_ptr, read_ptr).min(batch.capacity());
        if count < MIN_DRAIN_SAMPLES {
            debug!("MAX30102 drain skipped, {} samples available", count);
            return Ok(0);
        }

        let mut raw = [0u8; FIFO_DEPTH * BYTES_PER_SAMPLE];
        let raw = &mut raw[..count * BYTES_PER_SAMPLE];
        self.bus.read_registers(I2C_ADDR, ADDR_FIFO_DATA, raw)?;

        let (samples, _) = raw.as_chunks::<BYTES_PER_SAMPLE>();
        for bytes in samples {
            if batch
                .push(FifoSample::decode(bytes, self.config.pulse_width))
                .is_err()
            {
                break;
            }
        }

        debug!("MAX30102 drained {} samples", batch.len());
        Ok(batch.len())
    }

    // =========================================================================
    // Runtime configuration
    // =========================================================================

    /// Write a new configuration and discard samples taken under the old one.
    pub fn reconfigure(&mut self, config: SensorConfig) -> Result<(), SensorError> {
        self.require(&[ControllerState::Ready])?;

        self.state = ControllerState::Configuring;
        let result = self
            .configure(&config)
            .and_then(|()| self.write_fifo_pointers());
        self.state = ControllerState::Ready;

        match &result {
            Ok(()) => info!("MAX30102 reconfigured: {:?}", self.config),
            Err(e) => warn!("MAX30102 reconfigure failed: {:?}", e),
        }
        result
    }

    /// Enter low-power shutdown. Register contents are kept.
    pub fn shutdown(&mut self) -> Result<(), SensorError> {
        self.require(&[ControllerState::Ready])?;
        self.bus
            .update_register(I2C_ADDR, ADDR_MODE_CONFIG, MODE_SHDN, MODE_SHDN)?;
        self.state = ControllerState::Shutdown;
        info!("MAX30102 shut down");
        Ok(())
    }

    pub fn wake(&mut self) -> Result<(), SensorError> {
        self.require(&[ControllerState::Shutdown])?;
        self.bus
            .update_register(I2C_ADDR, ADDR_MODE_CONFIG, MODE_SHDN, 0)?;
        self.state = ControllerState::Ready;
        info!("MAX30102 awake");
        Ok(())
    }

    pub fn set_fifo_averaging(&mut self, averaging: SampleAveraging) -> Result<(), SensorError> {
        self.require(&[ControllerState::Ready])?;
        self.bus.update_register(
            I2C_ADDR,
            ADDR_FIFO_CONFIG,
            FIFO_SMP_AVE_MASK,
            averaging.to_register(),
        )?;
        self.config.averaging = averaging;
        Ok(())
    }

    /// Set the almost-full threshold (free slots, clamped to 15).
    pub fn set_fifo_almost_full(&mut self, almost_full: u8) -> Result<(), SensorError> {
        self.require(&[ControllerState::Ready])?;
        let almost_full = almost_full.min(FIFO_A_FULL_MASK);
        self.bus
            .update_register(I2C_ADDR, ADDR_FIFO_CONFIG, FIFO_A_FULL_MASK, almost_full)?;
        self.config.almost_full = almost_full;
        Ok(())
    }

    pub fn set_led_amplitudes(&mut self, red: u8, ir: u8) -> Result<(), SensorError> {
        self.require(&[ControllerState::Ready])?;
        self.bus.write_registers(I2C_ADDR, ADDR_LED1_PA, &[red, ir])?;
        self.config.red_amplitude = red;
        self.config.ir_amplitude = ir;
        Ok(())
    }

    fn set_interrupt(&mut self, mask: u8, enabled: bool) -> Result<(), SensorError> {
        self.require(&[ControllerState::Ready])?;
        let bits = if enabled { mask } else { 0 };
        self.bus
            .update_register(I2C_ADDR, ADDR_INT_ENABLE_1, mask, bits)?;
        Ok(())
    }

    pub fn enable_almost_full_interrupt(&mut self) -> Result<(), SensorError> {
        self.set_interrupt(INT_A_FULL, true)
    }

    pub fn disable_almost_full_interrupt(&mut self) -> Result<(), SensorError> {
        self.set_interrupt(INT_A_FULL, false)
    }

    pub fn enable_ppg_ready_interrupt(&mut self) -> Result<(), SensorError> {
        self.set_interrupt(INT_PPG_RDY, true)
    }

    pub fn disable_ppg_ready_interrupt(&mut self) -> Result<(), SensorError> {
        self.set_interrupt(INT_PPG_RDY, false)
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Run a one-shot die temperature conversion.
    pub fn read_temperature(&mut self) -> Result<DieTemperature, SensorError> {
        self.require(&[ControllerState::Ready])?;
        self.bus.write_register(I2C_ADDR, ADDR_TEMP_CONFIG, TEMP_EN)?;

        for _ in 0..TEMP_POLL_ATTEMPTS {
            self.delay.delay_ms(TEMP_POLL_INTERVAL_MS);
            if self.bus.read_register(I2C_ADDR, ADDR_TEMP_CONFIG)? & TEMP_EN == 0 {
                let mut raw = [0u8; 2];
                self.bus.read_registers(I2C_ADDR, ADDR_TEMP_INT, &mut raw)?;
                let temperature = DieTemperature::from_registers(raw[0], raw[1]);
                debug!(
                    "MAX30102 die temperature {} mC",
                    temperature.milli_celsius()
                );
                return Ok(temperature);
            }
        }

        Err(SensorError::ConversionTimeout {
            attempts: TEMP_POLL_ATTEMPTS,
        })
    }

    pub fn read_revision_id(&mut self) -> Result<u8, SensorError> {
        self.require(&[ControllerState::Ready, ControllerState::Shutdown])?;
        let revision = self.bus.read_register(I2C_ADDR, ADDR_REV_ID)?;
        self.revision = Some(revision);
        Ok(revision)
    }

    /// Read and log every configuration register.
    pub fn register_dump(&mut self) -> Result<RegisterDump, SensorError> {
        self.require(&[ControllerState::Ready, ControllerState::Shutdown])?;
        let mut dump = [(0u8, 0u8); DUMP_REGISTERS.len()];
        for (slot, &register) in dump.iter_mut().zip(DUMP_REGISTERS.iter()) {
            let value = self.bus.read_register(I2C_ADDR, register)?;
            info!("MAX30102 [{:#04x}] = {:#04x}", register, value);
            *slot = (register, value);
        }
        Ok(dump)
    }
}
