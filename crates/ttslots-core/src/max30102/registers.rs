//! MAX30102 register map, field encodings and FIFO sample decoding.

use serde::{Deserialize, Serialize};

// =============================================================================
// I2C Address
// =============================================================================

/// MAX30102 7-bit I2C address
pub const I2C_ADDR: u8 = 0x57;

/// Value of the part identification register
pub const PART_ID: u8 = 0x15;

// =============================================================================
// Register Addresses
// =============================================================================

// Status Registers
pub const ADDR_INT_STATUS_1: u8 = 0x00;
pub const ADDR_INT_STATUS_2: u8 = 0x01;
pub const ADDR_INT_ENABLE_1: u8 = 0x02;
pub const ADDR_INT_ENABLE_2: u8 = 0x03;

// FIFO Registers
pub const ADDR_FIFO_WR_PTR: u8 = 0x04;
pub const ADDR_OVF_COUNTER: u8 = 0x05;
pub const ADDR_FIFO_RD_PTR: u8 = 0x06;
pub const ADDR_FIFO_DATA: u8 = 0x07;

// Configuration Registers
pub const ADDR_FIFO_CONFIG: u8 = 0x08;
pub const ADDR_MODE_CONFIG: u8 = 0x09;
pub const ADDR_SPO2_CONFIG: u8 = 0x0A;
pub const ADDR_LED1_PA: u8 = 0x0C;
pub const ADDR_LED2_PA: u8 = 0x0D;
pub const ADDR_PILOT_PA: u8 = 0x10;
pub const ADDR_MULTI_LED_CTRL1: u8 = 0x11;
pub const ADDR_MULTI_LED_CTRL2: u8 = 0x12;

// Die Temperature Registers
pub const ADDR_TEMP_INT: u8 = 0x1F;
pub const ADDR_TEMP_FRAC: u8 = 0x20;
pub const ADDR_TEMP_CONFIG: u8 = 0x21;

// Proximity Function Registers
pub const ADDR_PROX_INT_THRESH: u8 = 0x30;

// Part ID Registers
pub const ADDR_REV_ID: u8 = 0xFE;
pub const ADDR_PART_ID: u8 = 0xFF;

// =============================================================================
// Bit Fields
// =============================================================================

// Interrupt status / enable, bank 1
pub const INT_A_FULL: u8 = 1 << 7;
pub const INT_PPG_RDY: u8 = 1 << 6;
pub const INT_ALC_OVF: u8 = 1 << 5;
pub const INT_PROX: u8 = 1 << 4;
/// Status only, cannot be masked
pub const INT_PWR_RDY: u8 = 1 << 0;

// Interrupt status / enable, bank 2
pub const INT_DIE_TEMP_RDY: u8 = 1 << 1;

// Mode configuration
pub const MODE_SHDN: u8 = 1 << 7;
pub const MODE_RESET: u8 = 1 << 6;
pub const MODE_MASK: u8 = 0b0000_0111;

// FIFO configuration
pub const FIFO_SMP_AVE_MASK: u8 = 0b1110_0000;
pub const FIFO_ROLLOVER_EN: u8 = 1 << 4;
pub const FIFO_A_FULL_MASK: u8 = 0b0000_1111;

// SpO2 configuration
pub const SPO2_ADC_RGE_MASK: u8 = 0b0110_0000;
pub const SPO2_SR_MASK: u8 = 0b0001_1100;
pub const SPO2_LED_PW_MASK: u8 = 0b0000_0011;

// Die temperature
pub const TEMP_EN: u8 = 1 << 0;

// =============================================================================
// FIFO Geometry
// =============================================================================

/// Number of sample slots in the on-chip FIFO
pub const FIFO_DEPTH: usize = 32;

/// Bytes per FIFO sample with both LEDs active (3 per channel)
pub const BYTES_PER_SAMPLE: usize = 6;

/// Samples currently waiting in the FIFO for the given pointer values.
///
/// Both pointers are 5-bit counters, so the difference wraps modulo 32.
pub fn fifo_available(write_ptr: u8, read_ptr: u8) -> usize {
    (write_ptr.wrapping_sub(read_ptr) & 0x1F) as usize
}

// =============================================================================
// Enums
// =============================================================================

/// Number of samples averaged on-chip per FIFO entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SampleAveraging {
    One = 0b000,
    Two = 0b001,
    Four = 0b010,
    Eight = 0b011,
    Sixteen = 0b100,
    ThirtyTwo = 0b101,
}

impl SampleAveraging {
    /// Convert from a raw FIFO_CONFIG value
    pub fn from_register(val: u8) -> Self {
        match (val & FIFO_SMP_AVE_MASK) >> 5 {
            0b000 => Self::One,
            0b001 => Self::Two,
            0b010 => Self::Four,
            0b011 => Self::Eight,
            0b100 => Self::Sixteen,
            // 0b101..=0b111 all average 32 samples
            _ => Self::ThirtyTwo,
        }
    }

    /// Convert to FIFO_CONFIG bits
    pub fn to_register(self) -> u8 {
        (self as u8) << 5
    }

    /// Map a sample count to the nearest setting; unsupported counts fall
    /// back to four samples.
    pub fn from_count(count: u8) -> Self {
        match count {
            1 => Self::One,
            2 => Self::Two,
            4 => Self::Four,
            8 => Self::Eight,
            16 => Self::Sixteen,
            32 => Self::ThirtyTwo,
            _ => Self::Four,
        }
    }

    pub fn count(self) -> u8 {
        1 << (self as u8)
    }
}

/// Operating mode (LED channels active)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Mode {
    /// Red LED only
    HeartRate = 0b010,
    /// Red and IR LEDs
    SpO2 = 0b011,
    /// Time slots programmed in MULTI_LED_CTRL
    MultiLed = 0b111,
}

impl Mode {
    /// Convert from a raw MODE_CONFIG value
    pub fn from_register(val: u8) -> Option<Self> {
        match val & MODE_MASK {
            0b010 => Some(Self::HeartRate),
            0b011 => Some(Self::SpO2),
            0b111 => Some(Self::MultiLed),
            _ => None,
        }
    }

    /// Convert to MODE_CONFIG bits
    pub fn to_register(self) -> u8 {
        self as u8
    }
}

/// SpO2 ADC full-scale range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AdcRange {
    Na2048 = 0b00,
    Na4096 = 0b01,
    Na8192 = 0b10,
    Na16384 = 0b11,
}

impl AdcRange {
    pub fn from_register(val: u8) -> Self {
        match (val & SPO2_ADC_RGE_MASK) >> 5 {
            0b00 => Self::Na2048,
            0b01 => Self::Na4096,
            0b10 => Self::Na8192,
            _ => Self::Na16384,
        }
    }

    pub fn to_register(self) -> u8 {
        (self as u8) << 5
    }

    /// Full-scale current in nA
    pub fn full_scale_na(self) -> u16 {
        2048 << (self as u8)
    }
}

/// Samples per second
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SampleRate {
    Hz50 = 0b000,
    Hz100 = 0b001,
    Hz200 = 0b010,
    Hz400 = 0b011,
    Hz800 = 0b100,
    Hz1000 = 0b101,
    Hz1600 = 0b110,
    Hz3200 = 0b111,
}

impl SampleRate {
    pub fn from_register(val: u8) -> Self {
        match (val & SPO2_SR_MASK) >> 2 {
            0b000 => Self::Hz50,
            0b001 => Self::Hz100,
            0b010 => Self::Hz200,
            0b011 => Self::Hz400,
            0b100 => Self::Hz800,
            0b101 => Self::Hz1000,
            0b110 => Self::Hz1600,
            _ => Self::Hz3200,
        }
    }

    pub fn to_register(self) -> u8 {
        (self as u8) << 2
    }

    pub fn hz(self) -> u16 {
        match self {
            Self::Hz50 => 50,
            Self::Hz100 => 100,
            Self::Hz200 => 200,
            Self::Hz400 => 400,
            Self::Hz800 => 800,
            Self::Hz1000 => 1000,
            Self::Hz1600 => 1600,
            Self::Hz3200 => 3200,
        }
    }
}

/// LED pulse width, which also fixes the ADC resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PulseWidth {
    /// 69 µs, 15-bit samples
    Us69 = 0b00,
    /// 118 µs, 16-bit samples
    Us118 = 0b01,
    /// 215 µs, 17-bit samples
    Us215 = 0b10,
    /// 411 µs, 18-bit samples
    Us411 = 0b11,
}

impl PulseWidth {
    pub fn from_register(val: u8) -> Self {
        match val & SPO2_LED_PW_MASK {
            0b00 => Self::Us69,
            0b01 => Self::Us118,
            0b10 => Self::Us215,
            _ => Self::Us411,
        }
    }

    pub fn to_register(self) -> u8 {
        self as u8
    }

    /// ADC resolution in bits
    pub fn resolution_bits(self) -> u8 {
        15 + self as u8
    }

    /// Mask applied to each 3-byte FIFO channel value
    pub fn sample_mask(self) -> u32 {
        match self {
            Self::Us69 => 0x7FFF,
            Self::Us118 => 0xFFFF,
            Self::Us215 => 0x1FFFF,
            Self::Us411 => 0x3FFFF,
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Both interrupt status banks as read (and thereby cleared) from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterruptStatus {
    pub bank1: u8,
    pub bank2: u8,
}

impl InterruptStatus {
    pub fn from_registers(bank1: u8, bank2: u8) -> Self {
        Self { bank1, bank2 }
    }

    /// FIFO reached the almost-full threshold
    pub fn almost_full(&self) -> bool {
        self.bank1 & INT_A_FULL != 0
    }

    /// A new sample is in the FIFO
    pub fn ppg_ready(&self) -> bool {
        self.bank1 & INT_PPG_RDY != 0
    }

    /// Ambient light cancellation hit its limit
    pub fn ambient_light_overflow(&self) -> bool {
        self.bank1 & INT_ALC_OVF != 0
    }

    pub fn proximity(&self) -> bool {
        self.bank1 & INT_PROX != 0
    }

    pub fn die_temp_ready(&self) -> bool {
        self.bank2 & INT_DIE_TEMP_RDY != 0
    }

    /// Set once after power-up or brown-out
    pub fn power_ready(&self) -> bool {
        self.bank1 & INT_PWR_RDY != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bank1 == 0 && self.bank2 == 0
    }
}

/// On-chip die temperature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DieTemperature {
    /// Whole degrees Celsius (two's complement register)
    pub integer: i8,
    /// Additional sixteenths of a degree (0..=15)
    pub sixteenths: u8,
}

impl DieTemperature {
    pub fn from_registers(integer: u8, fraction: u8) -> Self {
        Self {
            integer: integer as i8,
            sixteenths: fraction & 0x0F,
        }
    }

    /// Temperature in thousandths of a degree Celsius
    pub fn milli_celsius(&self) -> i32 {
        self.integer as i32 * 1000 + self.sixteenths as i32 * 1000 / 16
    }
}

// =============================================================================
// FIFO Samples
// =============================================================================

/// One decoded FIFO entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FifoSample {
    pub red: u32,
    pub ir: u32,
}

impl FifoSample {
    /// Decode 6 raw FIFO bytes (red then IR, 3 bytes each, MSB first),
    /// keeping only the bits the configured pulse width produces.
    pub fn decode(raw: &[u8; BYTES_PER_SAMPLE], pulse_width: PulseWidth) -> Self {
        let mask = pulse_width.sample_mask();
        let red = u32::from_be_bytes([0, raw[0], raw[1], raw[2]]) & mask;
        let ir = u32::from_be_bytes([0, raw[3], raw[4], raw[5]]) & mask;
        Self { red, ir }
    }

    /// Inverse of [`FifoSample::decode`] for values within the resolution.
    pub fn encode(&self) -> [u8; BYTES_PER_SAMPLE] {
        let red = self.red.to_be_bytes();
        let ir = self.ir.to_be_bytes();
        [red[1], red[2], red[3], ir[1], ir[2], ir[3]]
    }
}
