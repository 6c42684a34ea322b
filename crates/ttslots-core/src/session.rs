//! Measurement session: the interface the game layer drives.
//!
//! A session owns the acquisition controller and the estimator state. The
//! game starts it when the player grabs the sensor and stops it when the
//! round ends; in between the main loop keeps calling
//! [`MeasurementSession::service`].
//!
//! Draining is requested through a [`DrainLatch`]. The sensor interrupt
//! ([`MeasurementSession::on_interrupt`]) and the polling fallback
//! ([`MeasurementSession::poll_interrupt_status`]) both set it, and
//! `service` consumes it once, so two triggers for the same FIFO level
//! result in a single drain.
//!
//! The session is owned by the main loop, so a board's interrupt handler
//! cannot borrow it. The handler only calls [`DrainLatch::record_edge`] on
//! the shared latch; the main loop then calls
//! [`MeasurementSession::handle_pending_edge`], which acknowledges the
//! sensor the same way `on_interrupt` does.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embedded_hal::delay::DelayNs;
use log::{debug, info, warn};

use crate::bus::RegisterBus;
use crate::estimator::{EstimatorState, HrEstimate, estimate};
use crate::max30102::{Batch, ControllerState, FifoSample, InterruptStatus, Max30102, SensorError};

/// Samples per estimator pass (one second at 100 Hz).
pub const WINDOW_LEN: usize = 100;

/// What asked for the pending drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTrigger {
    Interrupt,
    Poll,
}

/// Single "drain requested" flag shared by the interrupt handler and the
/// main loop.
pub struct DrainLatch {
    signal: Signal<CriticalSectionRawMutex, DrainTrigger>,
    edge: Signal<CriticalSectionRawMutex, ()>,
}

impl Default for DrainLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl DrainLatch {
    pub const fn new() -> Self {
        Self {
            signal: Signal::new(),
            edge: Signal::new(),
        }
    }

    /// Note a falling edge on the sensor INT line. Safe to call from an
    /// interrupt handler; no bus access happens here.
    pub fn record_edge(&self) {
        self.edge.signal(());
    }

    fn take_edge(&self) -> bool {
        self.edge.try_take().is_some()
    }

    /// Request a drain. Repeated requests before the next take collapse.
    pub fn request(&self, trigger: DrainTrigger) {
        self.signal.signal(trigger);
    }

    /// Consume the pending request, if any.
    pub fn take(&self) -> Option<DrainTrigger> {
        self.signal.try_take()
    }

    pub fn is_pending(&self) -> bool {
        self.signal.signaled()
    }

    pub fn reset(&self) {
        self.signal.reset();
        self.edge.reset();
    }
}

pub struct MeasurementSession<'a, B, D> {
    sensor: Max30102<B, D>,
    latch: &'a DrainLatch,
    state: EstimatorState,
    window: heapless::Vec<FifoSample, WINDOW_LEN>,
    batch: Batch,
    armed: bool,
    latest: Option<HrEstimate>,
    last_valid: Option<HrEstimate>,
}

impl<'a, B: RegisterBus, D: DelayNs> MeasurementSession<'a, B, D> {
    pub fn new(sensor: Max30102<B, D>, latch: &'a DrainLatch) -> Self {
        Self {
            sensor,
            latch,
            state: EstimatorState::new(),
            window: heapless::Vec::new(),
            batch: Batch::new(),
            armed: false,
            latest: None,
            last_valid: None,
        }
    }

    /// Bring the sensor up. Failure is fatal; the sensor stays `Faulted`.
    pub fn init(&mut self) -> Result<(), SensorError> {
        self.sensor.init()
    }

    pub fn sensor(&self) -> &Max30102<B, D> {
        &self.sensor
    }

    pub fn sensor_mut(&mut self) -> &mut Max30102<B, D> {
        &mut self.sensor
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Open a measurement window: fresh FIFO, fresh estimator state, no
    /// pending trigger.
    pub fn start_measurement(&mut self) -> Result<(), SensorError> {
        if self.sensor.state() == ControllerState::Shutdown {
            self.sensor.wake()?;
        }
        self.sensor.clear_fifo()?;

        self.forget();
        self.latch.reset();
        self.armed = true;
        info!("Measurement started");
        Ok(())
    }

    /// Interrupt path: acknowledge the sensor and request a drain when the
    /// FIFO is almost full.
    pub fn on_interrupt(&mut self) -> Result<InterruptStatus, SensorError> {
        self.check_status(DrainTrigger::Interrupt)
    }

    /// Acknowledge the sensor if an edge was recorded since the last call.
    pub fn handle_pending_edge(&mut self) -> Result<Option<InterruptStatus>, SensorError> {
        if !self.latch.take_edge() {
            return Ok(None);
        }
        self.on_interrupt().map(Some)
    }

    /// Polling fallback for boards without the interrupt line wired.
    pub fn poll_interrupt_status(&mut self) -> Result<InterruptStatus, SensorError> {
        self.check_status(DrainTrigger::Poll)
    }

    fn check_status(&mut self, trigger: DrainTrigger) -> Result<InterruptStatus, SensorError> {
        let status = self.sensor.acknowledge_interrupt()?;
        if self.armed && status.almost_full() {
            self.latch.request(trigger);
        }
        Ok(status)
    }

    /// Main-loop step. Consumes a pending drain request, moves the drained
    /// samples into the analysis window and runs the estimator each time
    /// the window fills. Returns the estimate produced by this call, if any.
    ///
    /// A failed drain is returned as an error; the controller stays `Ready`
    /// and the next trigger retries.
    pub fn service(&mut self) -> Result<Option<HrEstimate>, SensorError> {
        if !self.armed {
            return Ok(None);
        }
        let Some(trigger) = self.latch.take() else {
            return Ok(None);
        };

        match self.sensor.drain(&mut self.batch) {
            Ok(count) => debug!("Drain ({:?}): {} samples", trigger, count),
            Err(SensorError::FifoOverflow { dropped }) => {
                // The waveform has a gap, peak intervals across it are meaningless
                warn!("{} samples lost, restarting analysis", dropped);
                self.window.clear();
                self.state.reset();
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        let mut produced = None;
        for &sample in self.batch.iter() {
            if self.window.push(sample).is_err() {
                break;
            }
            if self.window.is_full() {
                let result = estimate(&self.window, &mut self.state);
                self.window.clear();

                self.latest = Some(result);
                if result.hr_valid {
                    self.last_valid = Some(result);
                }
                produced = Some(result);
            }
        }

        if let Some(result) = produced {
            info!(
                "HR {} BPM (valid: {}), SpO2 {}% (valid: {})",
                result.heart_rate, result.hr_valid, result.spo2, result.spo2_valid
            );
        }
        Ok(produced)
    }

    /// Most recent estimate of this window, without blocking.
    pub fn poll_latest_estimate(&self) -> Option<HrEstimate> {
        self.latest
    }

    /// Close the window and return its last valid heart-rate estimate, or
    /// an all-invalid estimate when there was none.
    pub fn stop_measurement(&mut self) -> HrEstimate {
        self.armed = false;
        self.latch.reset();

        let result = self.last_valid.unwrap_or(HrEstimate::invalid());
        self.forget();
        info!("Measurement stopped: {:?}", result);
        result
    }

    fn forget(&mut self) {
        self.state.reset();
        self.window.clear();
        self.batch.clear();
        self.latest = None;
        self.last_valid = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusError, BusTransport};
    use crate::max30102::SensorConfig;
    use crate::sim::{NoopDelay, PpgWaveform, SimFault, SimulatedMax30102};

    type SimSession<'a> =
        MeasurementSession<'a, BusTransport<SimulatedMax30102, NoopDelay>, NoopDelay>;

    fn session(latch: &DrainLatch, waveform: PpgWaveform) -> SimSession<'_> {
        let sim = SimulatedMax30102::new().with_waveform(waveform);
        let sensor = Max30102::new(
            BusTransport::new(sim, NoopDelay),
            NoopDelay,
            SensorConfig::default(),
        );
        let mut session = MeasurementSession::new(sensor, latch);
        session.init().unwrap();
        session
    }

    fn sim<'s>(session: &'s mut SimSession<'_>) -> &'s mut SimulatedMax30102 {
        session.sensor_mut().bus_mut().hardware_mut()
    }

    /// Advance the sensor sample by sample, servicing like the main loop.
    fn run_interrupt_driven(session: &mut SimSession<'_>, samples: usize) {
        for _ in 0..samples {
            sim(session).advance(1);
            if sim(session).interrupt_asserted() {
                session.on_interrupt().unwrap();
            }
            session.service().unwrap();
        }
    }

    #[test]
    fn test_interrupt_driven_measurement() {
        let latch = DrainLatch::new();
        let mut session = session(&latch, PpgWaveform::for_bpm(75));
        session.start_measurement().unwrap();
        assert_eq!(session.poll_latest_estimate(), None);

        run_interrupt_driven(&mut session, 700);

        let latest = session.poll_latest_estimate().unwrap();
        assert!(latest.hr_valid);
        assert!((36..=39).contains(&latest.heart_rate));
        assert!(latest.spo2_valid);

        let result = session.stop_measurement();
        assert!(result.hr_valid);
        assert!(!latch.is_pending());
        assert_eq!(session.sensor().state(), ControllerState::Ready);
    }

    #[test]
    fn test_polling_fallback_produces_estimates() {
        let latch = DrainLatch::new();
        let mut session = session(&latch, PpgWaveform::for_bpm(75));
        session.start_measurement().unwrap();

        let mut estimates = 0;
        for _ in 0..300 {
            sim(&mut session).advance(1);
            session.poll_interrupt_status().unwrap();
            if session.service().unwrap().is_some() {
                estimates += 1;
            }
        }
        // Windows complete at 102, 204 (drains are 17 samples each)
        assert_eq!(estimates, 2);
    }

    #[test]
    fn test_triggers_collapse_into_one_drain() {
        let latch = DrainLatch::new();
        let mut session = session(&latch, PpgWaveform::for_bpm(75));
        session.start_measurement().unwrap();

        sim(&mut session).advance(17);
        session.on_interrupt().unwrap();
        latch.request(DrainTrigger::Poll);

        session.service().unwrap();
        assert!(!latch.is_pending());
        assert_eq!(sim(&mut session).fifo_len(), 0);

        // Nothing left to consume
        sim(&mut session).advance(5);
        assert_eq!(session.service().unwrap(), None);
        assert_eq!(sim(&mut session).fifo_len(), 5);
    }

    #[test]
    fn test_recorded_edge_is_acknowledged_by_main_loop() {
        let latch = DrainLatch::new();
        let mut session = session(&latch, PpgWaveform::for_bpm(75));
        session.start_measurement().unwrap();
        assert_eq!(session.handle_pending_edge().unwrap(), None);

        sim(&mut session).advance(17);
        // Interrupt context: shared reference only
        latch.record_edge();
        assert!(!latch.is_pending());

        let status = session.handle_pending_edge().unwrap().unwrap();
        assert!(status.almost_full());
        assert!(latch.is_pending());
        assert_eq!(session.handle_pending_edge().unwrap(), None);

        session.service().unwrap();
        assert_eq!(sim(&mut session).fifo_len(), 0);
    }

    #[test]
    fn test_stop_discards_recorded_edge() {
        let latch = DrainLatch::new();
        let mut session = session(&latch, PpgWaveform::for_bpm(75));
        session.start_measurement().unwrap();

        latch.record_edge();
        session.stop_measurement();
        assert_eq!(session.handle_pending_edge().unwrap(), None);
    }

    #[test]
    fn test_disarmed_session_ignores_interrupts() {
        let latch = DrainLatch::new();
        let mut session = session(&latch, PpgWaveform::for_bpm(75));

        sim(&mut session).advance(17);
        let status = session.on_interrupt().unwrap();
        assert!(status.almost_full());
        assert!(!latch.is_pending());
        assert_eq!(session.service().unwrap(), None);
        assert_eq!(sim(&mut session).fifo_len(), 17);
    }

    #[test]
    fn test_windows_do_not_leak_state() {
        let latch = DrainLatch::new();
        let mut session = session(&latch, PpgWaveform::for_bpm(75));
        session.start_measurement().unwrap();
        run_interrupt_driven(&mut session, 700);
        assert!(session.stop_measurement().hr_valid);

        // Second round: finger lifted the whole time
        sim(&mut session).set_waveform(PpgWaveform::no_contact());
        session.start_measurement().unwrap();
        assert_eq!(session.poll_latest_estimate(), None);

        run_interrupt_driven(&mut session, 300);
        let latest = session.poll_latest_estimate().unwrap();
        assert!(!latest.hr_valid);
        assert_eq!(session.stop_measurement(), HrEstimate::invalid());
    }

    #[test]
    fn test_start_discards_stale_fifo_contents() {
        let latch = DrainLatch::new();
        let mut session = session(&latch, PpgWaveform::for_bpm(75));

        sim(&mut session).advance(20);
        latch.request(DrainTrigger::Interrupt);
        session.start_measurement().unwrap();

        assert_eq!(sim(&mut session).fifo_len(), 0);
        assert!(!latch.is_pending());
    }

    #[test]
    fn test_drain_failure_is_retried_on_next_trigger() {
        let latch = DrainLatch::new();
        let mut session = session(&latch, PpgWaveform::for_bpm(75));
        session.start_measurement().unwrap();

        sim(&mut session).advance(17);
        session.on_interrupt().unwrap();
        sim(&mut session).inject(SimFault::StallAfter(0));
        assert!(matches!(
            session.service(),
            Err(SensorError::Bus(BusError::Timeout { .. }))
        ));
        assert_eq!(session.sensor().state(), ControllerState::Ready);

        sim(&mut session).clear_faults();
        latch.request(DrainTrigger::Poll);
        session.service().unwrap();
        assert_eq!(sim(&mut session).fifo_len(), 0);
    }

    #[test]
    fn test_overflow_restarts_analysis() {
        let latch = DrainLatch::new();
        let mut session = session(&latch, PpgWaveform::for_bpm(75));
        session.start_measurement().unwrap();

        // Main loop stalled long enough for the FIFO to wrap
        sim(&mut session).advance(40);
        session.on_interrupt().unwrap();
        assert_eq!(session.service().unwrap(), None);
        assert_eq!(sim(&mut session).fifo_len(), 0);
        assert_eq!(session.sensor().state(), ControllerState::Ready);
    }

    #[test]
    fn test_start_wakes_shutdown_sensor() {
        let latch = DrainLatch::new();
        let mut session = session(&latch, PpgWaveform::for_bpm(75));
        session.sensor_mut().shutdown().unwrap();

        session.start_measurement().unwrap();
        assert_eq!(session.sensor().state(), ControllerState::Ready);
        assert!(session.is_armed());
    }
}
