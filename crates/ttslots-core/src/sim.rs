//! Simulated MAX30102 behind the [`TwiHardware`] seam.
//!
//! The model is register-accurate enough to drive the real transport,
//! controller and session code: address/pointer/data framing with
//! auto-increment, a 32-slot FIFO with read/write pointers and overflow
//! counter, clear-on-read interrupt status, a self-clearing reset bit and
//! one-shot die temperature conversions. A synthetic PPG waveform feeds
//! the FIFO, and a few faults can be injected to exercise error paths.

use embedded_hal::delay::DelayNs;

use crate::bus::{TwiAction, TwiHardware, TwiStatus};
use crate::max30102::FifoSample;
use crate::max30102::registers::*;

/// Revision id reported by the model.
pub const SIM_REVISION_ID: u8 = 0x03;

const DEFAULT_RESET_POLLS: usize = 2;
const DEFAULT_TEMP_POLLS: usize = 2;

/// Bits above the 18-bit sample field are not guaranteed to read as zero.
const DIRTY_BITS: u8 = 0xFC;

/// Delay source for host tests; returns immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDelay;

impl DelayNs for NoopDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    /// Stop completing bus operations after this many more actions
    StallAfter(usize),
    /// Never acknowledge the device address
    AddressNack,
    /// Report a different part id
    WrongPartId(u8),
}

/// Synthetic pulse waveform on both LED channels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PpgWaveform {
    /// Samples per heartbeat
    pub period_samples: f32,
    /// Offset of sample 0 into the cycle, in samples
    pub phase_samples: f32,
    pub ir_dc: f32,
    pub ir_amplitude: f32,
    pub red_dc: f32,
    pub red_amplitude: f32,
}

impl PpgWaveform {
    /// A finger on the sensor with the given pulse, sampled at 100 Hz.
    pub fn for_bpm(bpm: u16) -> Self {
        Self {
            period_samples: 6000.0 / bpm.max(1) as f32,
            phase_samples: 0.0,
            ir_dc: 100_000.0,
            ir_amplitude: 2_000.0,
            red_dc: 50_000.0,
            red_amplitude: 800.0,
        }
    }

    /// Ambient light only: low, nearly flat readings.
    pub fn no_contact() -> Self {
        Self {
            period_samples: 100.0,
            phase_samples: 0.0,
            ir_dc: 1_200.0,
            ir_amplitude: 5.0,
            red_dc: 900.0,
            red_amplitude: 5.0,
        }
    }

    /// Shift the waveform so sample instants fall off the crest symmetry.
    pub fn with_phase(mut self, phase_samples: f32) -> Self {
        self.phase_samples = phase_samples;
        self
    }

    pub fn sample(&self, index: u32) -> FifoSample {
        let t = (index as f32 + self.phase_samples) / self.period_samples;
        let angle = 2.0 * core::f32::consts::PI * t;
        let s = libm::sinf(angle);
        FifoSample {
            red: (self.red_dc + self.red_amplitude * s).max(0.0) as u32,
            ir: (self.ir_dc + self.ir_amplitude * s).max(0.0) as u32,
        }
    }
}

impl Default for PpgWaveform {
    fn default() -> Self {
        Self::for_bpm(75)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// No transaction, or one the device has stopped listening to
    Idle,
    Address,
    Pointer,
    Write,
    Read,
}

pub struct SimulatedMax30102 {
    registers: [u8; 256],
    fifo: [[u8; BYTES_PER_SAMPLE]; FIFO_DEPTH],
    fifo_len: usize,
    byte_in_sample: usize,

    phase: Phase,
    owned: bool,
    pointer: u8,
    pending: Option<TwiStatus>,
    last_byte: u8,

    reset_polls: usize,
    reset_remaining: usize,
    temp_polls: usize,
    temp_remaining: usize,
    die_temperature: (u8, u8),

    stall_after: Option<usize>,
    stalled: bool,
    address_nack: bool,
    part_id: u8,

    waveform: PpgWaveform,
    sample_index: u32,
}

impl Default for SimulatedMax30102 {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedMax30102 {
    pub fn new() -> Self {
        let mut sim = Self {
            registers: [0; 256],
            fifo: [[0; BYTES_PER_SAMPLE]; FIFO_DEPTH],
            fifo_len: 0,
            byte_in_sample: 0,
            phase: Phase::Idle,
            owned: false,
            pointer: 0,
            pending: None,
            last_byte: 0,
            reset_polls: DEFAULT_RESET_POLLS,
            reset_remaining: 0,
            temp_polls: DEFAULT_TEMP_POLLS,
            temp_remaining: 0,
            die_temperature: (25, 0),
            stall_after: None,
            stalled: false,
            address_nack: false,
            part_id: PART_ID,
            waveform: PpgWaveform::default(),
            sample_index: 0,
        };
        sim.power_on_reset();
        sim
    }

    pub fn with_waveform(mut self, waveform: PpgWaveform) -> Self {
        self.waveform = waveform;
        self
    }

    pub fn set_waveform(&mut self, waveform: PpgWaveform) {
        self.waveform = waveform;
    }

    /// Number of MODE_CONFIG reads until the reset bit reads as clear.
    pub fn set_reset_polls(&mut self, polls: usize) {
        self.reset_polls = polls;
    }

    /// Number of TEMP_CONFIG reads until a conversion completes.
    pub fn set_temp_polls(&mut self, polls: usize) {
        self.temp_polls = polls;
    }

    pub fn set_die_temperature(&mut self, integer: i8, sixteenths: u8) {
        self.die_temperature = (integer as u8, sixteenths & 0x0F);
    }

    pub fn inject(&mut self, fault: SimFault) {
        match fault {
            SimFault::StallAfter(actions) => self.stall_after = Some(actions),
            SimFault::AddressNack => self.address_nack = true,
            SimFault::WrongPartId(id) => self.part_id = id,
        }
    }

    pub fn clear_faults(&mut self) {
        self.stall_after = None;
        self.stalled = false;
        self.address_nack = false;
        self.part_id = PART_ID;
    }

    /// Raw register contents, without read side effects.
    pub fn register(&self, address: u8) -> u8 {
        match address {
            ADDR_PART_ID => self.part_id,
            _ => self.registers[address as usize],
        }
    }

    /// Unread samples in the FIFO.
    pub fn fifo_len(&self) -> usize {
        self.fifo_len
    }

    /// State of the (active-low) INT pin, as a logical level.
    pub fn interrupt_asserted(&self) -> bool {
        (self.registers[ADDR_INT_STATUS_1 as usize] & self.registers[ADDR_INT_ENABLE_1 as usize])
            != 0
            || (self.registers[ADDR_INT_STATUS_2 as usize]
                & self.registers[ADDR_INT_ENABLE_2 as usize])
                != 0
    }

    /// Let `samples` sample periods elapse. Nothing is acquired while the
    /// device is shut down.
    pub fn advance(&mut self, samples: usize) {
        if self.registers[ADDR_MODE_CONFIG as usize] & MODE_SHDN != 0 {
            return;
        }
        for _ in 0..samples {
            let sample = self.waveform.sample(self.sample_index);
            self.sample_index = self.sample_index.wrapping_add(1);
            self.push_sample(sample);
        }
    }

    /// Append one sample the way the acquisition engine would.
    pub fn push_sample(&mut self, sample: FifoSample) {
        let mut bytes = sample.encode();
        bytes[0] |= DIRTY_BITS;
        bytes[3] |= DIRTY_BITS;

        let fifo_config = self.registers[ADDR_FIFO_CONFIG as usize];
        if self.fifo_len == FIFO_DEPTH {
            let overflow = &mut self.registers[ADDR_OVF_COUNTER as usize];
            *overflow = (*overflow + 1).min(0x1F);
            if fifo_config & FIFO_ROLLOVER_EN == 0 {
                return;
            }
            // Oldest sample is overwritten
            let read_ptr = &mut self.registers[ADDR_FIFO_RD_PTR as usize];
            *read_ptr = (*read_ptr + 1) % FIFO_DEPTH as u8;
        } else {
            self.fifo_len += 1;
        }

        let write_ptr = self.registers[ADDR_FIFO_WR_PTR as usize];
        self.fifo[write_ptr as usize] = bytes;
        self.registers[ADDR_FIFO_WR_PTR as usize] = (write_ptr + 1) % FIFO_DEPTH as u8;

        let threshold = FIFO_DEPTH - (fifo_config & FIFO_A_FULL_MASK) as usize;
        let status = &mut self.registers[ADDR_INT_STATUS_1 as usize];
        *status |= INT_PPG_RDY;
        if self.fifo_len >= threshold {
            *status |= INT_A_FULL;
        }
    }

    fn power_on_reset(&mut self) {
        self.registers = [0; 256];
        self.registers[ADDR_INT_STATUS_1 as usize] = INT_PWR_RDY;
        self.registers[ADDR_REV_ID as usize] = SIM_REVISION_ID;
        self.fifo_len = 0;
        self.byte_in_sample = 0;
        self.temp_remaining = 0;
    }

    // =========================================================================
    // Register file
    // =========================================================================

    fn read_register(&mut self, address: u8) -> u8 {
        match address {
            ADDR_INT_STATUS_1 | ADDR_INT_STATUS_2 => {
                let value = self.registers[address as usize];
                self.registers[address as usize] = 0;
                value
            }
            ADDR_MODE_CONFIG if self.reset_remaining > 0 => {
                self.reset_remaining -= 1;
                if self.reset_remaining == 0 {
                    self.registers[address as usize] &= !MODE_RESET;
                }
                self.registers[address as usize]
            }
            ADDR_TEMP_CONFIG if self.temp_remaining > 0 => {
                self.temp_remaining -= 1;
                if self.temp_remaining == 0 {
                    self.finish_temperature();
                }
                self.registers[address as usize]
            }
            ADDR_FIFO_DATA => self.read_fifo_byte(),
            ADDR_PART_ID => self.part_id,
            _ => self.registers[address as usize],
        }
    }

    fn write_register(&mut self, address: u8, value: u8) {
        match address {
            ADDR_MODE_CONFIG if value & MODE_RESET != 0 => {
                self.power_on_reset();
                if self.reset_polls > 0 {
                    self.registers[address as usize] = MODE_RESET;
                    self.reset_remaining = self.reset_polls;
                }
            }
            ADDR_FIFO_WR_PTR | ADDR_FIFO_RD_PTR => {
                self.registers[address as usize] = value & 0x1F;
                self.fifo_len = fifo_available(
                    self.registers[ADDR_FIFO_WR_PTR as usize],
                    self.registers[ADDR_FIFO_RD_PTR as usize],
                );
                self.byte_in_sample = 0;
            }
            ADDR_OVF_COUNTER => self.registers[address as usize] = value & 0x1F,
            ADDR_TEMP_CONFIG if value & TEMP_EN != 0 => {
                self.registers[address as usize] = TEMP_EN;
                self.temp_remaining = self.temp_polls.max(1);
            }
            // Read-only
            ADDR_INT_STATUS_1 | ADDR_INT_STATUS_2 | ADDR_FIFO_DATA | ADDR_TEMP_INT
            | ADDR_TEMP_FRAC | ADDR_REV_ID | ADDR_PART_ID => {}
            _ => self.registers[address as usize] = value,
        }
    }

    fn finish_temperature(&mut self) {
        self.registers[ADDR_TEMP_CONFIG as usize] &= !TEMP_EN;
        self.registers[ADDR_TEMP_INT as usize] = self.die_temperature.0;
        self.registers[ADDR_TEMP_FRAC as usize] = self.die_temperature.1;
        self.registers[ADDR_INT_STATUS_2 as usize] |= INT_DIE_TEMP_RDY;
    }

    fn read_fifo_byte(&mut self) -> u8 {
        if self.fifo_len == 0 {
            return 0;
        }
        let read_ptr = self.registers[ADDR_FIFO_RD_PTR as usize];
        let byte = self.fifo[read_ptr as usize][self.byte_in_sample];

        self.byte_in_sample += 1;
        if self.byte_in_sample == BYTES_PER_SAMPLE {
            self.byte_in_sample = 0;
            self.fifo_len -= 1;
            self.registers[ADDR_FIFO_RD_PTR as usize] = (read_ptr + 1) % FIFO_DEPTH as u8;
        }
        byte
    }

    fn advance_pointer(&mut self) {
        // FIFO_DATA does not auto-increment so bursts keep popping samples
        if self.pointer != ADDR_FIFO_DATA {
            self.pointer = self.pointer.wrapping_add(1);
        }
    }
}

impl TwiHardware for SimulatedMax30102 {
    fn begin(&mut self, action: TwiAction) {
        if action == TwiAction::Stop {
            self.owned = false;
            self.phase = Phase::Idle;
            self.pending = None;
            return;
        }

        if let Some(remaining) = self.stall_after {
            if remaining == 0 {
                self.stalled = true;
            } else {
                self.stall_after = Some(remaining - 1);
            }
        }
        if self.stalled {
            self.pending = None;
            return;
        }

        self.pending = Some(match action {
            TwiAction::Start => {
                let status = if self.owned {
                    TwiStatus::RepeatedStartSent
                } else {
                    TwiStatus::StartSent
                };
                self.owned = true;
                self.phase = Phase::Address;
                self.byte_in_sample = 0;
                status
            }
            TwiAction::Transmit(byte) => match self.phase {
                Phase::Address => {
                    let read = byte & 0x01 != 0;
                    let ours = byte >> 1 == I2C_ADDR && !self.address_nack;
                    self.phase = match (ours, read) {
                        (false, _) => Phase::Idle,
                        (true, false) => Phase::Pointer,
                        (true, true) => Phase::Read,
                    };
                    match (ours, read) {
                        (true, false) => TwiStatus::AddressWriteAck,
                        (false, false) => TwiStatus::AddressWriteNack,
                        (true, true) => TwiStatus::AddressReadAck,
                        (false, true) => TwiStatus::AddressReadNack,
                    }
                }
                Phase::Pointer => {
                    self.pointer = byte;
                    self.phase = Phase::Write;
                    TwiStatus::DataSentAck
                }
                Phase::Write => {
                    self.write_register(self.pointer, byte);
                    self.advance_pointer();
                    TwiStatus::DataSentAck
                }
                Phase::Idle => TwiStatus::DataSentNack,
                Phase::Read => TwiStatus::BusFault,
            },
            TwiAction::Receive { ack } => {
                if self.phase == Phase::Read {
                    self.last_byte = self.read_register(self.pointer);
                    self.advance_pointer();
                    if ack {
                        TwiStatus::DataReceivedAck
                    } else {
                        TwiStatus::DataReceivedNack
                    }
                } else {
                    TwiStatus::BusFault
                }
            }
            TwiAction::Stop => TwiStatus::Idle,
        });
    }

    fn poll(&mut self) -> Option<TwiStatus> {
        if self.stalled {
            return None;
        }
        self.pending.take()
    }

    fn data(&mut self) -> u8 {
        self.last_byte
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusTransport, RegisterBus};

    fn transport() -> BusTransport<SimulatedMax30102, NoopDelay> {
        BusTransport::new(SimulatedMax30102::new(), NoopDelay)
    }

    #[test]
    fn test_identity_registers() {
        let mut bus = transport();
        assert_eq!(bus.read_register(I2C_ADDR, ADDR_PART_ID).unwrap(), PART_ID);
        assert_eq!(
            bus.read_register(I2C_ADDR, ADDR_REV_ID).unwrap(),
            SIM_REVISION_ID
        );
        assert!(bus.probe(I2C_ADDR));
        assert!(!bus.probe(0x3C));
    }

    #[test]
    fn test_status_clears_on_read() {
        let mut bus = transport();
        assert_eq!(
            bus.read_register(I2C_ADDR, ADDR_INT_STATUS_1).unwrap(),
            INT_PWR_RDY
        );
        assert_eq!(bus.read_register(I2C_ADDR, ADDR_INT_STATUS_1).unwrap(), 0);
    }

    #[test]
    fn test_reset_bit_self_clears() {
        let mut bus = transport();
        bus.hardware_mut().set_reset_polls(3);
        bus.write_register(I2C_ADDR, ADDR_LED1_PA, 0x24).unwrap();
        bus.write_register(I2C_ADDR, ADDR_MODE_CONFIG, MODE_RESET)
            .unwrap();

        assert_eq!(bus.read_register(I2C_ADDR, ADDR_MODE_CONFIG).unwrap(), MODE_RESET);
        assert_eq!(bus.read_register(I2C_ADDR, ADDR_MODE_CONFIG).unwrap(), MODE_RESET);
        assert_eq!(bus.read_register(I2C_ADDR, ADDR_MODE_CONFIG).unwrap(), 0);
        // Configuration returned to power-on values
        assert_eq!(bus.read_register(I2C_ADDR, ADDR_LED1_PA).unwrap(), 0);
    }

    #[test]
    fn test_fifo_burst_pops_samples() {
        let mut bus = transport();
        let sample = FifoSample {
            red: 0x01234,
            ir: 0x2ABCD,
        };
        bus.hardware_mut().push_sample(sample);
        bus.hardware_mut().push_sample(sample);

        let mut raw = [0u8; 12];
        bus.read_registers(I2C_ADDR, ADDR_FIFO_DATA, &mut raw).unwrap();
        assert_eq!(bus.hardware().fifo_len(), 0);
        assert_eq!(bus.hardware().register(ADDR_FIFO_RD_PTR), 2);

        // Upper bits are dirty, the 18-bit field is intact
        assert_eq!(raw[0] & 0xFC, 0xFC);
        let (samples, _) = raw.as_chunks::<BYTES_PER_SAMPLE>();
        for bytes in samples {
            assert_eq!(FifoSample::decode(bytes, PulseWidth::Us411), sample);
        }
    }

    #[test]
    fn test_pointer_registers_auto_increment() {
        let mut bus = transport();
        for _ in 0..3 {
            bus.hardware_mut().push_sample(FifoSample::default());
        }
        let mut pointers = [0u8; 3];
        bus.read_registers(I2C_ADDR, ADDR_FIFO_WR_PTR, &mut pointers)
            .unwrap();
        assert_eq!(pointers, [3, 0, 0]);

        bus.write_registers(I2C_ADDR, ADDR_FIFO_WR_PTR, &[0, 0, 0])
            .unwrap();
        assert_eq!(bus.hardware().fifo_len(), 0);
    }

    #[test]
    fn test_overflow_without_rollover_drops_new_samples() {
        let mut sim = SimulatedMax30102::new();
        for i in 0..34u32 {
            sim.push_sample(FifoSample { red: i, ir: i });
        }
        assert_eq!(sim.fifo_len(), FIFO_DEPTH);
        assert_eq!(sim.register(ADDR_OVF_COUNTER), 2);
        assert_eq!(sim.register(ADDR_FIFO_RD_PTR), 0);
    }

    #[test]
    fn test_almost_full_raises_interrupt() {
        let mut bus = transport();
        bus.write_register(I2C_ADDR, ADDR_INT_ENABLE_1, INT_A_FULL)
            .unwrap();
        bus.write_register(I2C_ADDR, ADDR_FIFO_CONFIG, 0x1F).unwrap();
        bus.read_register(I2C_ADDR, ADDR_INT_STATUS_1).unwrap();

        bus.hardware_mut().advance(16);
        assert!(!bus.hardware().interrupt_asserted());
        bus.hardware_mut().advance(1);
        assert!(bus.hardware().interrupt_asserted());
    }

    #[test]
    fn test_shutdown_stops_sampling() {
        let mut sim = SimulatedMax30102::new();
        sim.write_register(ADDR_MODE_CONFIG, MODE_SHDN | 0x03);
        sim.advance(10);
        assert_eq!(sim.fifo_len(), 0);
    }

    #[test]
    fn test_waveform_levels() {
        let wave = PpgWaveform::for_bpm(75);
        assert_eq!(wave.period_samples, 80.0);
        let crest = wave.sample(20);
        assert!(crest.ir > 101_990 && crest.ir <= 102_000);
        assert!(PpgWaveform::no_contact().sample(0).ir < 5_000);
    }
}
