//! AIMD adaptive bitrate controller with EWMA-smoothed loss/RTT and a
//! stable-sample gate on upgrades (spec §4.5).

use std::time::{Duration, Instant};

use rda_common::AdaptiveError;

use crate::encode::{Encoder, QualityPreset};

const EWMA_ALPHA: f64 = 0.3;
const DEGRADE_LOSS_THRESHOLD: f64 = 0.05;
const DEGRADE_RTT_LOSS_THRESHOLD: f64 = 0.02;
const DEGRADE_RTT_MS_THRESHOLD: f64 = 300.0;
const UPGRADE_LOSS_THRESHOLD: f64 = 0.01;
const UPGRADE_STABLE_SAMPLES: u32 = 3;
const WARMUP_SAMPLES: u32 = 3;
const DEGRADE_FACTOR: f64 = 0.70;
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(2);
const DEFAULT_MIN_QUALITY: QualityPreset = 0;
const DEFAULT_MAX_QUALITY: QualityPreset = 4;

/// Tracks target bitrate/quality against RTCP-derived RTT and loss
/// samples. Owns no encoder reference; callers pass the encoder into
/// [`AdaptiveController::update`] so changes apply atomically with the
/// decision that produced them.
pub struct AdaptiveController {
    min_bitrate: u32,
    max_bitrate: u32,
    target_bitrate: u32,
    min_quality: QualityPreset,
    max_quality: QualityPreset,
    target_quality: QualityPreset,
    smoothed_loss: f64,
    smoothed_rtt_ms: f64,
    sample_count: u32,
    stable_count: u32,
    last_adjust: Instant,
    cooldown: Duration,
}

impl AdaptiveController {
    pub fn new(min_bitrate: u32, max_bitrate: u32, initial_bitrate: u32) -> Result<Self, AdaptiveError> {
        Self::with_cooldown(min_bitrate, max_bitrate, initial_bitrate, DEFAULT_COOLDOWN)
    }

    pub fn with_cooldown(
        min_bitrate: u32,
        max_bitrate: u32,
        initial_bitrate: u32,
        cooldown: Duration,
    ) -> Result<Self, AdaptiveError> {
        if min_bitrate == 0 || min_bitrate > max_bitrate || initial_bitrate < min_bitrate || initial_bitrate > max_bitrate {
            return Err(AdaptiveError::InvalidBounds {
                min: min_bitrate,
                max: max_bitrate,
            });
        }

        Ok(Self {
            min_bitrate,
            max_bitrate,
            target_bitrate: initial_bitrate,
            min_quality: DEFAULT_MIN_QUALITY,
            max_quality: DEFAULT_MAX_QUALITY,
            target_quality: DEFAULT_MAX_QUALITY,
            smoothed_loss: 0.0,
            smoothed_rtt_ms: 0.0,
            sample_count: 0,
            stable_count: 0,
            last_adjust: Instant::now(),
            cooldown,
        })
    }

    pub fn target_bitrate(&self) -> u32 {
        self.target_bitrate
    }

    pub fn target_quality(&self) -> QualityPreset {
        self.target_quality
    }

    /// Updates the ceiling (viewer UI `set_bitrate`); clamps the current
    /// target immediately if it now exceeds the new max and propagates to
    /// `encoder`.
    pub fn set_max_bitrate(&mut self, new_max: u32, encoder: &mut dyn Encoder) -> Result<(), AdaptiveError> {
        if new_max == 0 || new_max < self.min_bitrate {
            return Err(AdaptiveError::InvalidBounds {
                min: self.min_bitrate,
                max: new_max,
            });
        }
        self.max_bitrate = new_max;
        if self.target_bitrate > self.max_bitrate {
            self.target_bitrate = self.max_bitrate;
            if let Err(e) = encoder.set_bitrate(self.target_bitrate) {
                tracing::warn!(error = %e, "encoder rejected clamped bitrate");
            }
        }
        Ok(())
    }

    /// Feeds one RTCP-derived sample and applies the spec's AIMD rules, in
    /// order: clamp+EWMA, cooldown, warmup, degrade, upgrade, mid-zone
    /// decay.
    pub fn update(&mut self, rtt_ms: f64, loss: f64, encoder: &mut dyn Encoder) {
        let loss = loss.clamp(0.0, 1.0);
        let rtt_ms = rtt_ms.max(0.0);

        if self.sample_count == 0 {
            self.smoothed_loss = loss;
            self.smoothed_rtt_ms = rtt_ms;
        } else {
            self.smoothed_loss = (1.0 - EWMA_ALPHA) * self.smoothed_loss + EWMA_ALPHA * loss;
            self.smoothed_rtt_ms = (1.0 - EWMA_ALPHA) * self.smoothed_rtt_ms + EWMA_ALPHA * rtt_ms;
        }
        self.sample_count += 1;

        if self.last_adjust.elapsed() < self.cooldown {
            return;
        }
        if self.sample_count < WARMUP_SAMPLES {
            return;
        }

        let should_degrade = self.smoothed_loss >= DEGRADE_LOSS_THRESHOLD
            || (self.smoothed_rtt_ms >= DEGRADE_RTT_MS_THRESHOLD && self.smoothed_loss >= DEGRADE_RTT_LOSS_THRESHOLD);
        let upgrade_eligible = self.smoothed_loss <= UPGRADE_LOSS_THRESHOLD;

        if should_degrade {
            self.degrade(encoder);
        } else if upgrade_eligible {
            self.stable_count += 1;
            if self.stable_count >= UPGRADE_STABLE_SAMPLES {
                self.upgrade(encoder);
            }
        } else {
            self.stable_count = self.stable_count.saturating_sub(1);
        }
    }

    fn degrade(&mut self, encoder: &mut dyn Encoder) {
        let next = (self.target_bitrate as f64 * DEGRADE_FACTOR) as u32;
        self.target_bitrate = next.clamp(self.min_bitrate, self.max_bitrate);
        self.target_quality = self.target_quality.saturating_sub(1).max(self.min_quality);
        self.stable_count = 0;
        self.last_adjust = Instant::now();
        self.apply(encoder);
    }

    fn upgrade(&mut self, encoder: &mut dyn Encoder) {
        let step = (self.max_bitrate / 20).max(100_000);
        self.target_bitrate = self.target_bitrate.saturating_add(step).min(self.max_bitrate);
        self.target_quality = (self.target_quality + 1).min(self.max_quality);
        self.stable_count = 0;
        self.last_adjust = Instant::now();
        self.apply(encoder);
    }

    fn apply(&self, encoder: &mut dyn Encoder) {
        if let Err(e) = encoder.set_bitrate(self.target_bitrate) {
            tracing::warn!(error = %e, "adaptive controller: encoder rejected bitrate");
        }
        if let Err(e) = encoder.set_quality(self.target_quality) {
            tracing::warn!(error = %e, "adaptive controller: encoder rejected quality");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use crate::encode::{EncodedSample, EncoderCapabilities};
    use rda_common::EncodeError;

    struct NullEncoder {
        bitrate: u32,
        quality: QualityPreset,
    }

    impl Encoder for NullEncoder {
        fn encode(&mut self, _pixels: &[u8], _format: PixelFormat) -> Result<Option<EncodedSample>, EncodeError> {
            Ok(None)
        }
        fn set_bitrate(&mut self, bps: u32) -> Result<(), EncodeError> {
            self.bitrate = bps;
            Ok(())
        }
        fn bitrate(&self) -> u32 {
            self.bitrate
        }
        fn set_quality(&mut self, preset: QualityPreset) -> Result<(), EncodeError> {
            self.quality = preset;
            Ok(())
        }
        fn set_fps(&mut self, _fps: u32) -> Result<(), EncodeError> {
            Ok(())
        }
        fn set_dimensions(&mut self, _width: u32, _height: u32) -> Result<(), EncodeError> {
            Ok(())
        }
        fn set_pixel_format(&mut self, _format: PixelFormat) {}
        fn force_keyframe(&mut self) {}
        fn flush(&mut self) {}
        fn close(&mut self) {}
        fn capabilities(&self) -> EncoderCapabilities {
            EncoderCapabilities {
                gpu_input: false,
                dynamic_bitrate: true,
            }
        }
    }

    fn encoder() -> NullEncoder {
        NullEncoder { bitrate: 0, quality: 0 }
    }

    #[test]
    fn warmup_holds_target_for_first_two_samples() {
        let mut ctrl = AdaptiveController::with_cooldown(500_000, 8_000_000, 2_500_000, Duration::ZERO).unwrap();
        let mut enc = encoder();
        ctrl.update(10.0, 0.0, &mut enc);
        ctrl.update(10.0, 0.0, &mut enc);
        assert_eq!(ctrl.target_bitrate(), 2_500_000);
    }

    #[test]
    fn sustained_loss_degrades_by_factor_after_warmup() {
        let mut ctrl = AdaptiveController::with_cooldown(500_000, 8_000_000, 2_500_000, Duration::ZERO).unwrap();
        let mut enc = encoder();
        for _ in 0..5 {
            ctrl.update(50.0, 0.10, &mut enc);
        }
        assert!(ctrl.target_bitrate() < 2_500_000);
        let expected = (2_500_000f64 * 0.70) as u32;
        assert_eq!(ctrl.target_bitrate(), expected);
    }

    #[test]
    fn stable_clean_samples_upgrade_by_fixed_step() {
        let mut ctrl = AdaptiveController::with_cooldown(500_000, 8_000_000, 2_000_000, Duration::ZERO).unwrap();
        let mut enc = encoder();
        for _ in 0..5 {
            ctrl.update(50.0, 0.0, &mut enc);
        }
        assert_eq!(ctrl.target_bitrate(), 2_400_000);
    }

    #[test]
    fn high_rtt_alone_never_degrades() {
        let mut ctrl = AdaptiveController::with_cooldown(500_000, 8_000_000, 2_500_000, Duration::ZERO).unwrap();
        let mut enc = encoder();
        let before = ctrl.target_bitrate();
        for _ in 0..6 {
            ctrl.update(200.0, 0.0, &mut enc);
        }
        assert!(ctrl.target_bitrate() >= before);
    }

    #[test]
    fn recovers_to_ceiling_after_loss_clears() {
        let mut ctrl = AdaptiveController::with_cooldown(500_000, 8_000_000, 2_500_000, Duration::ZERO).unwrap();
        let mut enc = encoder();
        for _ in 0..30 {
            ctrl.update(50.0, 0.15, &mut enc);
        }
        assert_eq!(ctrl.target_bitrate(), 500_000);

        for _ in 0..120 {
            ctrl.update(10.0, 0.0, &mut enc);
        }
        assert_eq!(ctrl.target_bitrate(), 8_000_000);
    }

    #[test]
    fn mid_zone_oscillation_changes_target_at_most_twice() {
        let mut ctrl = AdaptiveController::with_cooldown(500_000, 8_000_000, 2_500_000, Duration::ZERO).unwrap();
        let mut enc = encoder();
        // Burn through warmup with a neutral sample first.
        ctrl.update(50.0, 0.0, &mut enc);
        ctrl.update(50.0, 0.0, &mut enc);
        ctrl.update(50.0, 0.0, &mut enc);

        let mut changes = 0;
        let mut last = ctrl.target_bitrate();
        for i in 0..20 {
            let loss = if i % 2 == 0 { 0.0 } else { 0.03 };
            ctrl.update(50.0, loss, &mut enc);
            if ctrl.target_bitrate() != last {
                changes += 1;
                last = ctrl.target_bitrate();
            }
        }
        assert!(changes <= 2, "expected at most 2 changes, saw {changes}");
    }

    #[test]
    fn bitrate_and_quality_always_in_bounds() {
        let mut ctrl = AdaptiveController::with_cooldown(500_000, 8_000_000, 2_500_000, Duration::ZERO).unwrap();
        let mut enc = encoder();
        for i in 0..200 {
            let loss = if i % 3 == 0 { 0.2 } else { 0.0 };
            ctrl.update(100.0, loss, &mut enc);
            assert!(ctrl.target_bitrate() >= 500_000 && ctrl.target_bitrate() <= 8_000_000);
            assert!(ctrl.target_quality() >= DEFAULT_MIN_QUALITY && ctrl.target_quality() <= DEFAULT_MAX_QUALITY);
        }
    }

    #[test]
    fn invalid_bounds_rejected() {
        assert!(AdaptiveController::new(0, 8_000_000, 2_500_000).is_err());
        assert!(AdaptiveController::new(9_000_000, 8_000_000, 2_500_000).is_err());
        assert!(AdaptiveController::new(500_000, 8_000_000, 9_000_000).is_err());
    }

    #[test]
    fn set_max_bitrate_clamps_current_target_immediately() {
        let mut ctrl = AdaptiveController::with_cooldown(500_000, 8_000_000, 8_000_000, Duration::ZERO).unwrap();
        let mut enc = encoder();
        ctrl.set_max_bitrate(2_000_000, &mut enc).unwrap();
        assert_eq!(ctrl.target_bitrate(), 2_000_000);
        assert_eq!(enc.bitrate, 2_000_000);
    }
}
