//! Odds engine: heart rate in, win probability and outcome out.
//!
//! A calm player (low reported BPM) is guaranteed a win; the odds fall
//! linearly through the middle band and bottom out at 5 % for very
//! excited players.

use log::debug;

/// Below this rate the round is always won.
pub const LOW_THRESHOLD: u16 = 80;
/// Above this rate the odds enter the floor band.
pub const HIGH_THRESHOLD: u16 = 120;
/// Lowest win percentage ever offered.
pub const MIN_WIN_PERCENT: u8 = 5;

const LCG_MULTIPLIER: u32 = 1_103_515_245;
const LCG_INCREMENT: u32 = 12_345;

/// Win probability (0..=100) for a reported heart rate.
pub fn determine_win_odds(bpm: u16) -> u8 {
    let percent = if bpm < LOW_THRESHOLD {
        100
    } else if bpm > HIGH_THRESHOLD {
        let decay = (bpm - HIGH_THRESHOLD) / 10;
        20u16.saturating_sub(decay).max(MIN_WIN_PERCENT as u16) as u8
    } else {
        (50 - (bpm - LOW_THRESHOLD) / 2) as u8
    };

    debug!("Win odds for {} BPM: {}%", bpm, percent);
    percent
}

/// A draw in 0..=99 wins when it falls below the win percentage.
pub fn draw_outcome(win_percent: u8, draw: u8) -> bool {
    draw < win_percent
}

/// 32-bit linear congruential generator.
///
/// Seeded once per power cycle; there is deliberately no way to reseed an
/// existing generator.
#[derive(Debug, Clone)]
pub struct Lcg {
    state: u32,
}

impl Lcg {
    pub const fn new(seed: u32) -> Self {
        Self { state: seed }
    }

    /// Fold the low-order bits of noisy analog readings into a seed.
    pub fn seed_from_noise(samples: &[u16]) -> Self {
        let seed = samples
            .iter()
            .fold(0u32, |acc, &s| acc.rotate_left(3) ^ (s as u32 & 0x0F));
        debug!("LCG seeded from {} noise samples", samples.len());
        Self::new(seed)
    }

    pub fn next_u32(&mut self) -> u32 {
        self.state = self
            .state
            .wrapping_mul(LCG_MULTIPLIER)
            .wrapping_add(LCG_INCREMENT);
        self.state
    }

    /// Uniform-ish draw in 0..=99 from the high half of the state.
    pub fn draw_percent(&mut self) -> u8 {
        ((self.next_u32() >> 16) % 100) as u8
    }
}

/// Result of one game round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundOutcome {
    pub win_percent: u8,
    pub draw: u8,
    pub win: bool,
}

/// Compute the odds for `bpm`, draw once and decide the round.
pub fn play_round(bpm: u16, rng: &mut Lcg) -> RoundOutcome {
    let win_percent = determine_win_odds(bpm);
    let draw = rng.draw_percent();
    let win = draw_outcome(win_percent, draw);
    debug!(
        "Round at {} BPM: draw {} against {}% -> {}",
        bpm,
        draw,
        win_percent,
        if win { "win" } else { "lose" }
    );
    RoundOutcome {
        win_percent,
        draw,
        win,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_odds_bands() {
        assert_eq!(determine_win_odds(0), 100);
        assert_eq!(determine_win_odds(79), 100);
        assert_eq!(determine_win_odds(80), 50);
        assert_eq!(determine_win_odds(81), 50);
        assert_eq!(determine_win_odds(100), 40);
        assert_eq!(determine_win_odds(120), 30);
        assert_eq!(determine_win_odds(121), 20);
        assert_eq!(determine_win_odds(200), 12);
        assert_eq!(determine_win_odds(270), 5);
        assert_eq!(determine_win_odds(u16::MAX), 5);
    }

    #[test]
    fn test_odds_never_increase_with_rate() {
        let mut previous = determine_win_odds(0);
        for bpm in 1..=400 {
            let odds = determine_win_odds(bpm);
            assert!(odds <= previous, "odds rose at {} BPM", bpm);
            assert!((MIN_WIN_PERCENT..=100).contains(&odds));
            previous = odds;
        }
    }

    #[test]
    fn test_guaranteed_win_band() {
        for draw in 0..100 {
            assert!(draw_outcome(100, draw));
        }
    }

    #[test]
    fn test_floor_band_outcome() {
        for draw in 0..100 {
            assert_eq!(draw_outcome(5, draw), draw < 5);
        }
    }

    #[test]
    fn test_lcg_is_deterministic() {
        let mut a = Lcg::new(0xDEAD_BEEF);
        let mut b = Lcg::new(0xDEAD_BEEF);
        for _ in 0..1000 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn test_lcg_known_sequence() {
        let mut rng = Lcg::new(1);
        assert_eq!(rng.next_u32(), 1_103_527_590);
        assert_eq!(
            rng.next_u32(),
            1_103_527_590u32
                .wrapping_mul(LCG_MULTIPLIER)
                .wrapping_add(LCG_INCREMENT)
        );
    }

    #[test]
    fn test_draws_stay_in_range_and_vary() {
        let mut rng = Lcg::new(42);
        let mut seen = [false; 100];
        for _ in 0..2000 {
            let draw = rng.draw_percent();
            assert!(draw < 100);
            seen[draw as usize] = true;
        }
        assert!(seen.iter().filter(|&&s| s).count() > 90);
    }

    #[test]
    fn test_seed_from_noise() {
        let a = Lcg::seed_from_noise(&[512, 513, 511, 514]);
        let b = Lcg::seed_from_noise(&[512, 513, 511, 514]);
        let c = Lcg::seed_from_noise(&[512, 513, 511, 515]);
        assert_eq!(a.state, b.state);
        assert_ne!(a.state, c.state);
        // High bits of the readings do not contribute
        assert_eq!(
            Lcg::seed_from_noise(&[0x0103]).state,
            Lcg::seed_from_noise(&[0x0F03]).state
        );
    }

    #[test]
    fn test_play_round() {
        let mut rng = Lcg::new(7);
        let calm = play_round(60, &mut rng);
        assert_eq!(calm.win_percent, 100);
        assert!(calm.win);

        let mut a = Lcg::new(99);
        let mut b = Lcg::new(99);
        let first = play_round(150, &mut a);
        assert_eq!(first, play_round(150, &mut b));
        assert_eq!(first.win_percent, 17);
        assert_eq!(first.win, first.draw < 17);
    }
}
