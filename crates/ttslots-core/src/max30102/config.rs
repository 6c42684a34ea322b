//! Sensor configuration.
//!
//! A [`SensorConfig`] is everything the controller writes during bring-up.
//! It serializes with `postcard` so firmware can keep a tuned configuration
//! in a small flash slot.

use serde::{Deserialize, Serialize};

use super::registers::{
    AdcRange, FIFO_A_FULL_MASK, FIFO_ROLLOVER_EN, Mode, PulseWidth, SampleAveraging, SampleRate,
};

/// Largest encoded size of a [`SensorConfig`] in postcard format.
pub const CONFIG_BLOB_SIZE: usize = 16;

/// Default LED drive amplitude (about 7.2 mA).
pub const DEFAULT_LED_AMPLITUDE: u8 = 0x24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorConfig {
    pub sample_rate: SampleRate,
    pub pulse_width: PulseWidth,
    pub adc_range: AdcRange,
    /// LED1 (red) pulse amplitude, 0.2 mA per step
    pub red_amplitude: u8,
    /// LED2 (IR) pulse amplitude, 0.2 mA per step
    pub ir_amplitude: u8,
    pub averaging: SampleAveraging,
    pub rollover: bool,
    /// Free FIFO slots left when the almost-full interrupt fires (0..=15)
    pub almost_full: u8,
    pub mode: Mode,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            sample_rate: SampleRate::Hz100,
            pulse_width: PulseWidth::Us411,
            adc_range: AdcRange::Na4096,
            red_amplitude: DEFAULT_LED_AMPLITUDE,
            ir_amplitude: DEFAULT_LED_AMPLITUDE,
            averaging: SampleAveraging::One,
            rollover: true,
            almost_full: 15,
            mode: Mode::SpO2,
        }
    }
}

impl SensorConfig {
    pub fn with_sample_rate(mut self, sample_rate: SampleRate) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_pulse_width(mut self, pulse_width: PulseWidth) -> Self {
        self.pulse_width = pulse_width;
        self
    }

    pub fn with_adc_range(mut self, adc_range: AdcRange) -> Self {
        self.adc_range = adc_range;
        self
    }

    pub fn with_led_amplitudes(mut self, red: u8, ir: u8) -> Self {
        self.red_amplitude = red;
        self.ir_amplitude = ir;
        self
    }

    pub fn with_averaging(mut self, averaging: SampleAveraging) -> Self {
        self.averaging = averaging;
        self
    }

    pub fn with_rollover(mut self, rollover: bool) -> Self {
        self.rollover = rollover;
        self
    }

    /// Values above 15 are clamped.
    pub fn with_almost_full(mut self, almost_full: u8) -> Self {
        self.almost_full = almost_full.min(FIFO_A_FULL_MASK);
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// SPO2_CONFIG register value
    pub fn spo2_register(&self) -> u8 {
        self.adc_range.to_register() | self.sample_rate.to_register() | self.pulse_width.to_register()
    }

    /// FIFO_CONFIG register value
    pub fn fifo_register(&self) -> u8 {
        let rollover = if self.rollover { FIFO_ROLLOVER_EN } else { 0 };
        self.averaging.to_register() | rollover | (self.almost_full.min(FIFO_A_FULL_MASK))
    }

    /// MODE_CONFIG register value (shutdown and reset bits clear)
    pub fn mode_register(&self) -> u8 {
        self.mode.to_register()
    }

    /// Number of unread samples at which the almost-full interrupt fires
    pub fn almost_full_samples(&self) -> usize {
        super::registers::FIFO_DEPTH - self.almost_full.min(FIFO_A_FULL_MASK) as usize
    }

    /// Serialize into `buf`, returning the used prefix.
    pub fn store<'a>(&self, buf: &'a mut [u8]) -> Result<&'a mut [u8], postcard::Error> {
        postcard::to_slice(self, buf)
    }

    /// Deserialize a blob produced by [`SensorConfig::store`].
    pub fn load(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}
