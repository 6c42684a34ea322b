//! Polled TWI master built on a minimal hardware seam.

use embedded_hal::delay::DelayNs;
use log::{debug, warn};

use super::{BusError, BusStage, DEFAULT_TIMEOUT_US, Direction, POLL_STEP_US, RegisterBus};

/// Settle time after issuing a stop condition. The peripheral reports no
/// status for a stop, so the bus is simply given time to release.
const STOP_SETTLE_US: u32 = 10;

// =============================================================================
// Hardware seam
// =============================================================================

/// One operation handed to the TWI peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwiAction {
    /// Generate a start (or repeated start, when the bus is already owned)
    Start,
    /// Generate a stop and release the bus
    Stop,
    /// Shift out one byte (address or data)
    Transmit(u8),
    /// Shift in one byte, answering with ACK when `ack` is true
    Receive { ack: bool },
}

/// Master-mode status codes as reported in the TWI status register
/// (prescaler bits masked off).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TwiStatus {
    /// Illegal start/stop detected on the bus
    BusFault = 0x00,
    StartSent = 0x08,
    RepeatedStartSent = 0x10,
    AddressWriteAck = 0x18,
    AddressWriteNack = 0x20,
    DataSentAck = 0x28,
    DataSentNack = 0x30,
    ArbitrationLost = 0x38,
    AddressReadAck = 0x40,
    AddressReadNack = 0x48,
    DataReceivedAck = 0x50,
    DataReceivedNack = 0x58,
    /// No relevant state information available
    Idle = 0xF8,
}

impl TwiStatus {
    /// Convert from a raw status register value
    pub fn from_code(code: u8) -> Option<Self> {
        match code & 0xF8 {
            0x00 => Some(Self::BusFault),
            0x08 => Some(Self::StartSent),
            0x10 => Some(Self::RepeatedStartSent),
            0x18 => Some(Self::AddressWriteAck),
            0x20 => Some(Self::AddressWriteNack),
            0x28 => Some(Self::DataSentAck),
            0x30 => Some(Self::DataSentNack),
            0x38 => Some(Self::ArbitrationLost),
            0x40 => Some(Self::AddressReadAck),
            0x48 => Some(Self::AddressReadNack),
            0x50 => Some(Self::DataReceivedAck),
            0x58 => Some(Self::DataReceivedNack),
            0xF8 => Some(Self::Idle),
            _ => None,
        }
    }

    /// Convert to the raw status register value
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// The register-level TWI peripheral.
///
/// `begin` kicks off an operation and returns immediately; `poll` returns
/// `None` while the peripheral is still busy and the resulting status once
/// it has finished. A stop produces no status.
pub trait TwiHardware {
    fn begin(&mut self, action: TwiAction);

    fn poll(&mut self) -> Option<TwiStatus>;

    /// Last byte shifted in by a `Receive`.
    fn data(&mut self) -> u8;
}

// =============================================================================
// Transport
// =============================================================================

/// Blocking TWI master with a per-primitive timeout.
pub struct BusTransport<H, D> {
    hardware: H,
    delay: D,
    timeout_us: u32,
}

impl<H: TwiHardware, D: DelayNs> BusTransport<H, D> {
    pub fn new(hardware: H, delay: D) -> Self {
        Self {
            hardware,
            delay,
            timeout_us: DEFAULT_TIMEOUT_US,
        }
    }

    /// Override the per-primitive timeout budget.
    pub fn with_timeout_us(mut self, timeout_us: u32) -> Self {
        self.timeout_us = timeout_us;
        self
    }

    pub fn timeout_us(&self) -> u32 {
        self.timeout_us
    }

    pub fn hardware(&self) -> &H {
        &self.hardware
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hardware
    }

    /// Give back the peripheral and delay source.
    pub fn release(self) -> (H, D) {
        (self.hardware, self.delay)
    }

    /// Poll until the peripheral finishes or the budget runs out.
    fn wait(&mut self, stage: BusStage) -> Result<TwiStatus, BusError> {
        let mut waited_us = 0;
        loop {
            if let Some(status) = self.hardware.poll() {
                return Ok(status);
            }
            if waited_us >= self.timeout_us {
                warn!("TWI timeout after {}us during {:?}", waited_us, stage);
                return Err(BusError::Timeout { stage });
            }
            self.delay.delay_us(POLL_STEP_US);
            waited_us += POLL_STEP_US;
        }
    }

    fn expect(&mut self, stage: BusStage, expected: TwiStatus) -> Result<(), BusError> {
        let found = self.wait(stage)?;
        if found == expected {
            Ok(())
        } else {
            Err(BusError::UnexpectedStatus { expected, found })
        }
    }

    /// Send a start condition.
    pub fn start(&mut self) -> Result<(), BusError> {
        self.hardware.begin(TwiAction::Start);
        self.expect(BusStage::Start, TwiStatus::StartSent)
    }

    /// Send a repeated start condition while the bus is owned.
    pub fn restart(&mut self) -> Result<(), BusError> {
        self.hardware.begin(TwiAction::Start);
        self.expect(BusStage::RepeatedStart, TwiStatus::RepeatedStartSent)
    }

    /// Send a stop condition. Never fails; a wedged peripheral is caught
    /// by the next start timing out.
    pub fn stop(&mut self) {
        self.hardware.begin(TwiAction::Stop);
        self.delay.delay_us(STOP_SETTLE_US);
    }

    /// Send the address byte for `address` in `direction`.
    pub fn address(&mut self, address: u8, direction: Direction) -> Result<(), BusError> {
        self.hardware
            .begin(TwiAction::Transmit(direction.address_byte(address)));
        let found = self.wait(BusStage::Address)?;

        let (ack, nack) = match direction {
            Direction::Write => (TwiStatus::AddressWriteAck, TwiStatus::AddressWriteNack),
            Direction::Read => (TwiStatus::AddressReadAck, TwiStatus::AddressReadNack),
        };

        if found == ack {
            Ok(())
        } else if found == nack {
            Err(BusError::AddressNack { address })
        } else {
            Err(BusError::UnexpectedStatus {
                expected: ack,
                found,
            })
        }
    }

    /// Transmit one data byte and require an ACK.
    pub fn write_byte(&mut self, byte: u8) -> Result<(), BusError> {
        self.hardware.begin(TwiAction::Transmit(byte));
        match self.wait(BusStage::Transmit)? {
            TwiStatus::DataSentAck => Ok(()),
            TwiStatus::DataSentNack => Err(BusError::DataNack),
            found => Err(BusError::UnexpectedStatus {
                expected: TwiStatus::DataSentAck,
                found,
            }),
        }
    }

    /// Receive one byte, answering ACK (more to come) or NACK (last byte).
    pub fn read_byte(&mut self, ack: bool) -> Result<u8, BusError> {
        self.hardware.begin(TwiAction::Receive { ack });
        let expected = if ack {
            TwiStatus::DataReceivedAck
        } else {
            TwiStatus::DataReceivedNack
        };
        self.expect(BusStage::Receive, expected)?;
        Ok(self.hardware.data())
    }

    /// Run `body` as one transaction; the stop is issued whatever the outcome.
    fn transaction<T>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<T, BusError>,
    ) -> Result<T, BusError> {
        let result = body(self);
        self.stop();
        if let Err(e) = &result {
            debug!("TWI transaction aborted: {:?}", e);
        }
        result
    }

    /// Start, address for write, register pointer. Shared by every composite.
    fn select_register(&mut self, device: u8, register: u8) -> Result<(), BusError> {
        self.start()?;
        self.address(device, Direction::Write)?;
        self.write_byte(register)
    }
}

impl<H: TwiHardware, D: DelayNs> RegisterBus for BusTransport<H, D> {
    fn write_register(&mut self, device: u8, register: u8, value: u8) -> Result<(), BusError> {
        self.transaction(|bus| {
            bus.select_register(device, register)?;
            bus.write_byte(value)
        })
    }

    fn read_registers(
        &mut self,
        device: u8,
        register: u8,
        buf: &mut [u8],
    ) -> Result<(), BusError> {
        self.transaction(|bus| {
            bus.select_register(device, register)?;
            bus.restart()?;
            bus.address(device, Direction::Read)?;

            let last = buf.len().saturating_sub(1);
            for (i, byte) in buf.iter_mut().enumerate() {
                *byte = bus.read_byte(i < last)?;
            }
            Ok(())
        })
    }

    fn write_registers(
        &mut self,
        device: u8,
        register: u8,
        values: &[u8],
    ) -> Result<(), BusError> {
        self.transaction(|bus| {
            bus.select_register(device, register)?;
            for &value in values {
                bus.write_byte(value)?;
            }
            Ok(())
        })
    }

    fn probe(&mut self, device: u8) -> bool {
        self.transaction(|bus| {
            bus.start()?;
            bus.address(device, Direction::Write)
        })
        .is_ok()
    }
}
