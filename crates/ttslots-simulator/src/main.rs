//! Desktop simulator for the ttslots heart-rate slot machine.
//!
//! Plays one round against a simulated MAX30102 so the acquisition path,
//! the estimator and the odds engine can be exercised without hardware.
//!
//! ```text
//! ttslots-simulator [BPM] [--fast]
//! ```
//!
//! `BPM` is the pulse the simulated finger produces (default 75). The
//! estimator reports half the detected rate, so the odds are computed from
//! that halved value. `--fast` skips the 10 ms pacing between samples.
//! Set `RUST_LOG=debug` to see every drain.

use std::process::ExitCode;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use embedded_hal::delay::DelayNs;
use log::{error, info, warn};

use ttslots_core::bus::BusTransport;
use ttslots_core::estimator::HrEstimate;
use ttslots_core::max30102::{Max30102, SensorConfig, SensorError};
use ttslots_core::odds::{Lcg, play_round};
use ttslots_core::session::{DrainLatch, MeasurementSession};
use ttslots_core::sim::{PpgWaveform, SimulatedMax30102};

// ---------------------------------------------------------------------------
// Timing constants
// ---------------------------------------------------------------------------

const DEFAULT_BPM: u16 = 75;

/// One sample period at 100 Hz.
const SAMPLE_PERIOD: Duration = Duration::from_millis(10);

/// Length of the measurement window, in samples (ten seconds).
const MEASUREMENT_SAMPLES: usize = 1000;

/// Half-sample phases put two equal samples on every crest.
const WAVEFORM_PHASE: f32 = 0.3;

/// The drain latch is shared with the (simulated) interrupt handler.
static DRAIN_LATCH: DrainLatch = DrainLatch::new();

/// Blocking delay backed by the host scheduler.
struct StdDelay;

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        thread::sleep(Duration::from_nanos(ns as u64));
    }
}

type SimSession = MeasurementSession<'static, BusTransport<SimulatedMax30102, StdDelay>, StdDelay>;

struct Options {
    bpm: u16,
    fast: bool,
}

fn parse_args() -> Options {
    let mut options = Options {
        bpm: DEFAULT_BPM,
        fast: false,
    };
    for arg in std::env::args().skip(1) {
        if arg == "--fast" {
            options.fast = true;
            continue;
        }
        match arg.parse::<u16>() {
            Ok(bpm) if bpm > 0 => options.bpm = bpm,
            _ => warn!("Ignoring argument {:?}, using {} BPM", arg, options.bpm),
        }
    }
    options
}

/// Seed material from the host clock, standing in for floating ADC pins.
fn noise_samples() -> [u16; 8] {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    core::array::from_fn(|i| (nanos >> (i * 4)) as u16)
}

fn measure(session: &mut SimSession, fast: bool) -> Result<HrEstimate, SensorError> {
    session.start_measurement()?;

    for tick in 0..MEASUREMENT_SAMPLES {
        let sim = session.sensor_mut().bus_mut().hardware_mut();
        sim.advance(1);

        // Stand-in for the INT pin handler, which only records the edge
        if sim.interrupt_asserted() {
            DRAIN_LATCH.record_edge();
        }
        session.handle_pending_edge()?;
        if let Some(estimate) = session.service()? {
            info!(
                "t={:>5} ms  HR {:>3} ({})  SpO2 {:>3}% ({})",
                tick * 10,
                estimate.heart_rate,
                if estimate.hr_valid { "valid" } else { "invalid" },
                estimate.spo2,
                if estimate.spo2_valid { "valid" } else { "invalid" },
            );
        }

        if !fast {
            thread::sleep(SAMPLE_PERIOD);
        }
    }

    Ok(session.stop_measurement())
}

fn main() -> ExitCode {
    env_logger::init();
    let options = parse_args();
    info!("Starting ttslots simulator");
    info!("Simulated pulse: {} BPM", options.bpm);

    let waveform = PpgWaveform::for_bpm(options.bpm).with_phase(WAVEFORM_PHASE);
    let hardware = SimulatedMax30102::new().with_waveform(waveform);
    let sensor = Max30102::new(
        BusTransport::new(hardware, StdDelay),
        StdDelay,
        SensorConfig::default(),
    );
    let mut session = MeasurementSession::new(sensor, &DRAIN_LATCH);

    if let Err(e) = session.init() {
        error!("Sensor bring-up failed: {:?}", e);
        return ExitCode::FAILURE;
    }

    let mut rng = Lcg::seed_from_noise(&noise_samples());

    info!("Place your finger on the sensor...");
    let estimate = match measure(&mut session, options.fast) {
        Ok(estimate) => estimate,
        Err(e) => {
            error!("Measurement failed: {:?}", e);
            return ExitCode::FAILURE;
        }
    };

    if !estimate.hr_valid {
        warn!("No valid heart rate, no round played");
        return ExitCode::FAILURE;
    }

    let round = play_round(estimate.heart_rate, &mut rng);
    info!(
        "Heart rate {} -> {}% chance, drew {}: {}",
        estimate.heart_rate,
        round.win_percent,
        round.draw,
        if round.win { "WIN" } else { "lose" }
    );

    if let Err(e) = session.sensor_mut().shutdown() {
        warn!("Sensor shutdown failed: {:?}", e);
    }
    info!("Simulator exiting");
    ExitCode::SUCCESS
}
