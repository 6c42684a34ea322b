//! Heart-rate and SpO2 estimation from raw PPG samples.
//!
//! Each call to [`estimate`] takes one analysis batch plus the caller-owned
//! [`EstimatorState`] that carries the rolling IR waveform and peak history
//! between batches. The heuristic is deliberately simple:
//!
//! 1. batch statistics for both channels
//! 2. presence gate on the IR channel (skin contact)
//! 3. DC removal into a 128-sample rolling buffer
//! 4. local-maximum peak detection above a dynamic threshold
//! 5. mean inter-peak interval to BPM
//! 6. red/IR ratio of ratios to SpO2
//!
//! The reported heart rate is half of the rate implied by the detected
//! peaks. Downstream odds are tuned against that value, so it is kept.

use log::debug;

use crate::max30102::FifoSample;

/// Rate the sensor is configured for; intervals are counted in samples.
pub const SAMPLE_RATE_HZ: u32 = 100;

/// Length of the rolling DC-removed IR buffer.
pub const HISTORY_LEN: usize = 128;

/// Number of inter-peak intervals kept for averaging.
pub const INTERVAL_SLOTS: usize = 8;

/// Shortest accepted inter-peak interval (220 BPM at 100 Hz).
pub const MIN_INTERVAL: u32 = 27;
/// Longest accepted inter-peak interval (40 BPM at 100 Hz).
pub const MAX_INTERVAL: u32 = 150;

/// Stored intervals needed before a rate is reported.
pub const MIN_INTERVALS: usize = 3;

pub const MIN_BPM: f32 = 40.0;
pub const MAX_BPM: f32 = 220.0;

/// IR mean at or below this means nothing is on the sensor.
pub const PRESENCE_FLOOR: u32 = 5000;
/// Looser floor on both channel means for SpO2.
pub const SPO2_FLOOR: u32 = 1000;

/// Lower bound of the dynamic peak threshold.
const MIN_PEAK_THRESHOLD: i32 = 10;

pub const MIN_VALID_SPO2: u8 = 70;

/// One estimation result. Invalid fields are zeroed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HrEstimate {
    pub heart_rate: u16,
    pub hr_valid: bool,
    pub spo2: u8,
    pub spo2_valid: bool,
}

impl HrEstimate {
    pub const fn invalid() -> Self {
        Self {
            heart_rate: 0,
            hr_valid: false,
            spo2: 0,
            spo2_valid: false,
        }
    }

    /// True when at least one field carries a valid reading.
    pub fn any_valid(&self) -> bool {
        self.hr_valid || self.spo2_valid
    }
}

/// Whether an inter-peak interval (in samples) is physiologically plausible.
pub fn accept_interval(interval: u32) -> bool {
    (MIN_INTERVAL..=MAX_INTERVAL).contains(&interval)
}

/// Peak bookkeeping: last peak position, running count and the interval
/// history ring.
#[derive(Debug, Clone, Default)]
pub struct PeakTracker {
    last_peak: Option<u32>,
    peak_count: u32,
    intervals: [u32; INTERVAL_SLOTS],
    next_slot: usize,
}

impl PeakTracker {
    /// Register a peak at absolute sample `index`. Returns the interval
    /// to the previous peak when it was stored.
    ///
    /// Every peak moves the reference point, so a spurious peak between two
    /// real ones produces two rejected short intervals rather than one
    /// accepted long one.
    pub fn record_peak(&mut self, index: u32) -> Option<u32> {
        let stored = self.last_peak.and_then(|last| {
            let interval = index.wrapping_sub(last);
            if accept_interval(interval) {
                self.intervals[self.next_slot] = interval;
                self.next_slot = (self.next_slot + 1) % INTERVAL_SLOTS;
                Some(interval)
            } else {
                None
            }
        });

        self.last_peak = Some(index);
        self.peak_count = self.peak_count.wrapping_add(1);
        stored
    }

    /// Number of stored (non-zero) intervals.
    pub fn interval_count(&self) -> usize {
        self.intervals.iter().filter(|&&i| i != 0).count()
    }

    pub fn peak_count(&self) -> u32 {
        self.peak_count
    }

    pub fn last_peak(&self) -> Option<u32> {
        self.last_peak
    }

    /// Mean of the stored intervals, once enough have been collected.
    pub fn mean_interval(&self) -> Option<f32> {
        let count = self.interval_count();
        if count < MIN_INTERVALS {
            return None;
        }
        let sum: u32 = self.intervals.iter().sum();
        Some(sum as f32 / count as f32)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Rolling state carried from one batch to the next.
#[derive(Debug, Clone)]
pub struct EstimatorState {
    /// DC-removed IR samples, indexed by absolute sample number mod length
    buffer: [i32; HISTORY_LEN],
    /// Samples appended since the last reset
    total: u32,
    tracker: PeakTracker,
}

impl Default for EstimatorState {
    fn default() -> Self {
        Self::new()
    }
}

impl EstimatorState {
    pub const fn new() -> Self {
        Self {
            buffer: [0; HISTORY_LEN],
            total: 0,
            tracker: PeakTracker {
                last_peak: None,
                peak_count: 0,
                intervals: [0; INTERVAL_SLOTS],
                next_slot: 0,
            },
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Break waveform continuity without discarding the interval history.
    /// No peak is judged against samples from before the gap, and the
    /// interval across the gap is never measured.
    pub fn lose_contact(&mut self) {
        self.buffer = [0; HISTORY_LEN];
        self.tracker.last_peak = None;
    }

    pub fn tracker(&self) -> &PeakTracker {
        &self.tracker
    }

    /// Samples appended since the last reset.
    pub fn samples_seen(&self) -> u32 {
        self.total
    }

    fn at(&self, index: u32) -> i32 {
        self.buffer[index as usize % HISTORY_LEN]
    }

    fn push(&mut self, value: i32) {
        self.buffer[self.total as usize % HISTORY_LEN] = value;
        self.total = self.total.wrapping_add(1);
    }
}

/// Min / max / mean of one channel over a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStats {
    pub min: u32,
    pub max: u32,
    pub mean: u32,
}

impl ChannelStats {
    fn over(samples: &[FifoSample], channel: impl Fn(&FifoSample) -> u32) -> Self {
        let mut min = u32::MAX;
        let mut max = 0;
        let mut sum: u64 = 0;
        for sample in samples {
            let value = channel(sample);
            min = min.min(value);
            max = max.max(value);
            sum += value as u64;
        }
        let mean = (sum / samples.len().max(1) as u64) as u32;
        Self { min, max, mean }
    }

    pub fn peak_to_peak(&self) -> u32 {
        self.max.saturating_sub(self.min)
    }
}

/// Run one estimation pass over `samples`.
pub fn estimate(samples: &[FifoSample], state: &mut EstimatorState) -> HrEstimate {
    if samples.is_empty() {
        return HrEstimate::invalid();
    }

    let red = ChannelStats::over(samples, |s| s.red);
    let ir = ChannelStats::over(samples, |s| s.ir);

    let mut result = HrEstimate::invalid();

    if finger_present(&ir) {
        if let Some(bpm) = track_peaks(samples, &ir, state) {
            result.heart_rate = bpm;
            result.hr_valid = true;
        }
    } else {
        debug!(
            "No contact (IR mean {}, p2p {}), peak reference dropped",
            ir.mean,
            ir.peak_to_peak()
        );
        state.lose_contact();
    }

    if let Some(spo2) = spo2(&red, &ir) {
        result.spo2 = spo2;
        result.spo2_valid = true;
    }

    debug!(
        "Estimate over {} samples: {:?} ({} intervals stored)",
        samples.len(),
        result,
        state.tracker.interval_count()
    );
    result
}

fn finger_present(ir: &ChannelStats) -> bool {
    ir.mean > PRESENCE_FLOOR && (ir.peak_to_peak() as u64) * 100 > ir.mean as u64
}

/// DC removal, peak detection and interval-to-BPM conversion.
///
/// Returns the reported (halved) heart rate when it is valid.
fn track_peaks(samples: &[FifoSample], ir: &ChannelStats, state: &mut EstimatorState) -> Option<u16> {
    let first_new = state.total;
    for sample in samples {
        state.push(sample.ir as i32 - ir.mean as i32);
    }

    let threshold = MIN_PEAK_THRESHOLD.max((ir.peak_to_peak() / 10) as i32);

    // The newest sample has no successor yet; the previous batch's newest
    // sample is judged now. Neighbours may sit in the previous batch.
    let oldest = state.total.saturating_sub(HISTORY_LEN as u32) + 1;
    let first_candidate = first_new.saturating_sub(1).max(oldest);
    let last_candidate = state.total - 1;
    for index in first_candidate..last_candidate {
        let value = state.at(index);
        if value > threshold && value > state.at(index - 1) && value > state.at(index + 1) {
            if let Some(interval) = state.tracker.record_peak(index) {
                debug!("Peak at {}, interval {} samples", index, interval);
            }
        }
    }

    let mean = state.tracker.mean_interval()?;
    let bpm = (60 * SAMPLE_RATE_HZ) as f32 / mean;
    if !(MIN_BPM..=MAX_BPM).contains(&bpm) {
        debug!("Detected rate {} BPM out of range", bpm);
        return None;
    }

    Some((bpm / 2.0) as u16)
}

/// Ratio-of-ratios SpO2. `None` when the channels are too weak or the
/// result is implausible.
fn spo2(red: &ChannelStats, ir: &ChannelStats) -> Option<u8> {
    if red.mean <= SPO2_FLOOR || ir.mean <= SPO2_FLOOR || ir.peak_to_peak() == 0 {
        return None;
    }

    let ratio = (red.peak_to_peak() as f32 * ir.mean as f32)
        / (ir.peak_to_peak() as f32 * red.mean as f32);
    let spo2 = (110.0 - 25.0 * ratio).clamp(0.0, 100.0) as u8;

    (spo2 >= MIN_VALID_SPO2).then_some(spo2)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DC: f32 = 100_000.0;
    const AMPLITUDE: f32 = 2_000.0;

    /// Sine batch of `len` samples continuing from absolute sample `start`.
    fn sine_batch(start: u32, len: usize, period: f32, phase: f32, dc: f32) -> [FifoSample; 100] {
        let mut batch = [FifoSample::default(); 100];
        for (i, sample) in batch.iter_mut().take(len).enumerate() {
            let t = (start as f32 + i as f32 + phase) / period;
            let value = dc + AMPLITUDE * libm::sinf(2.0 * core::f32::consts::PI * t);
            *sample = FifoSample {
                red: (value / 2.0) as u32,
                ir: value as u32,
            };
        }
        batch
    }

    /// Feed `batches` consecutive 100-sample batches, returning the last estimate.
    fn run_sine(state: &mut EstimatorState, batches: u32, period: f32, phase: f32) -> HrEstimate {
        let mut last = HrEstimate::invalid();
        for b in 0..batches {
            let batch = sine_batch(b * 100, 100, period, phase, DC);
            last = estimate(&batch, state);
        }
        last
    }

    fn alternating(low: u32, high: u32, len: usize) -> heapless::Vec<u32, 100> {
        (0..len).map(|i| if i % 2 == 0 { low } else { high }).collect()
    }

    #[test]
    fn test_reported_bpm_is_half_of_detected_peak_rate() {
        // 80-sample period at 100 Hz is 75 BPM; the reported value is ~37
        let mut state = EstimatorState::new();
        let estimate = run_sine(&mut state, 6, 80.0, 0.0);

        assert!(estimate.hr_valid);
        assert!(
            (36..=39).contains(&estimate.heart_rate),
            "reported {}",
            estimate.heart_rate
        );
        assert!(state.tracker().interval_count() >= MIN_INTERVALS);
    }

    #[test]
    fn test_single_batch_is_not_enough() {
        let mut state = EstimatorState::new();
        let estimate = run_sine(&mut state, 1, 80.0, 0.0);
        assert!(!estimate.hr_valid);
        assert_eq!(estimate.heart_rate, 0);
    }

    #[test]
    fn test_no_contact_below_presence_floor() {
        let mut state = EstimatorState::new();
        for b in 0..6 {
            let batch = sine_batch(b * 100, 100, 80.0, 0.0, 4_000.0);
            let estimate = estimate(&batch, &mut state);
            assert!(!estimate.hr_valid);
            assert_eq!(estimate.heart_rate, 0);
        }
    }

    #[test]
    fn test_flat_signal_is_not_contact() {
        let mut state = EstimatorState::new();
        let batch = [FifoSample {
            red: 50_000,
            ir: 100_000,
        }; 100];
        let estimate = estimate(&batch, &mut state);
        assert!(!estimate.hr_valid);
        // No IR variation, so no ratio either
        assert!(!estimate.spo2_valid);
    }

    #[test]
    fn test_contact_loss_keeps_interval_history() {
        let mut state = EstimatorState::new();
        assert!(run_sine(&mut state, 6, 80.0, 0.0).hr_valid);
        let intervals = state.tracker().interval_count();
        let seen = state.samples_seen();

        let lifted = sine_batch(600, 100, 80.0, 0.0, 3_000.0);
        let estimate = estimate(&lifted, &mut state);
        assert!(!estimate.hr_valid);
        assert_eq!(state.tracker().last_peak(), None);
        assert_eq!(state.tracker().interval_count(), intervals);
        assert_eq!(state.samples_seen(), seen);

        // Contact back: the stored history is usable straight away and no
        // interval spans the gap
        let resumed = sine_batch(700, 100, 80.0, 0.0, DC);
        let estimate = super::estimate(&resumed, &mut state);
        assert!(estimate.hr_valid);
        assert!((36..=39).contains(&estimate.heart_rate));
        assert_eq!(state.tracker().interval_count(), intervals);
        assert_eq!(state.tracker().last_peak(), Some(seen + 40));
    }

    #[test]
    fn test_interval_acceptance_boundaries() {
        assert!(!accept_interval(26));
        assert!(accept_interval(27));
        assert!(accept_interval(150));
        assert!(!accept_interval(151));

        for (interval, stored) in [(26, false), (27, true), (150, true), (151, false)] {
            let mut tracker = PeakTracker::default();
            tracker.record_peak(1_000);
            assert_eq!(
                tracker.record_peak(1_000 + interval).is_some(),
                stored,
                "interval {}",
                interval
            );
            assert_eq!(tracker.peak_count(), 2);
            assert_eq!(tracker.last_peak(), Some(1_000 + interval));
        }
    }

    #[test]
    fn test_every_peak_moves_reference() {
        let mut tracker = PeakTracker::default();
        tracker.record_peak(0);
        // Spurious peak 26 samples later is rejected but becomes the reference
        assert_eq!(tracker.record_peak(26), None);
        assert_eq!(tracker.record_peak(52), None);
        assert_eq!(tracker.interval_count(), 0);
    }

    #[test]
    fn test_interval_history_overwrites_oldest() {
        let mut tracker = PeakTracker::default();
        let mut index = 0;
        tracker.record_peak(index);
        for _ in 0..INTERVAL_SLOTS {
            index += 100;
            tracker.record_peak(index);
        }
        assert_eq!(tracker.mean_interval(), Some(100.0));

        for _ in 0..INTERVAL_SLOTS {
            index += 50;
            tracker.record_peak(index);
        }
        assert_eq!(tracker.interval_count(), INTERVAL_SLOTS);
        assert_eq!(tracker.mean_interval(), Some(50.0));
    }

    #[test]
    fn test_mean_needs_three_intervals() {
        let mut tracker = PeakTracker::default();
        tracker.record_peak(0);
        tracker.record_peak(80);
        tracker.record_peak(160);
        assert_eq!(tracker.mean_interval(), None);
        tracker.record_peak(240);
        assert_eq!(tracker.mean_interval(), Some(80.0));
    }

    #[test]
    fn test_too_fast_waveform_never_valid() {
        // 26-sample period (~231 BPM) is below the shortest accepted interval
        let mut state = EstimatorState::new();
        let estimate = run_sine(&mut state, 6, 26.0, 0.25);
        assert!(!estimate.hr_valid);
        assert_eq!(state.tracker().interval_count(), 0);
        assert!(state.tracker().peak_count() > 0);
    }

    #[test]
    fn test_spo2_from_ratio_of_ratios() {
        // red p2p/mean = 1000/50000, IR p2p/mean = 4000/100000, ratio 0.5
        let red = alternating(49_500, 50_500, 100);
        let ir = alternating(98_000, 102_000, 100);
        let batch: heapless::Vec<FifoSample, 100> = red
            .iter()
            .zip(ir.iter())
            .map(|(&red, &ir)| FifoSample { red, ir })
            .collect();

        let estimate = estimate(&batch, &mut EstimatorState::new());
        assert!(estimate.spo2_valid);
        assert_eq!(estimate.spo2, 97);
    }

    #[test]
    fn test_implausible_spo2_is_zeroed() {
        // ratio 2.0 maps to 60 %, below the valid band
        let red = alternating(48_000, 52_000, 100);
        let ir = alternating(98_000, 102_000, 100);
        let batch: heapless::Vec<FifoSample, 100> = red
            .iter()
            .zip(ir.iter())
            .map(|(&red, &ir)| FifoSample { red, ir })
            .collect();

        let estimate = estimate(&batch, &mut EstimatorState::new());
        assert!(!estimate.spo2_valid);
        assert_eq!(estimate.spo2, 0);
    }

    #[test]
    fn test_empty_batch_leaves_state_untouched() {
        let mut state = EstimatorState::new();
        run_sine(&mut state, 2, 80.0, 0.0);
        let seen = state.samples_seen();

        assert_eq!(estimate(&[], &mut state), HrEstimate::invalid());
        assert_eq!(state.samples_seen(), seen);
    }

    #[test]
    fn test_channel_stats() {
        let batch = [
            FifoSample { red: 10, ir: 300 },
            FifoSample { red: 30, ir: 100 },
            FifoSample { red: 20, ir: 200 },
        ];
        let ir = ChannelStats::over(&batch, |s| s.ir);
        assert_eq!(ir, ChannelStats { min: 100, max: 300, mean: 200 });
        assert_eq!(ir.peak_to_peak(), 200);
    }
}
