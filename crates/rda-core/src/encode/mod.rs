//! Encoder abstraction (spec §4.2) — polymorphic over platform back-ends,
//! selected by an ordered list of factories (spec §9 "hardware preferred,
//! falls back to software").

pub mod nv12;
pub mod placeholder;
pub mod software;
#[cfg(target_os = "windows")]
pub mod mft;
#[cfg(target_os = "macos")]
pub mod videotoolbox;

use rda_common::EncodeError;

use crate::capture::{GpuTexture, PixelFormat};

/// Opaque D3D11 device/context pair handed to the Windows hardware
/// encoder by a capturer that exposes [`crate::capture::GpuCapture`].
/// Wrapped in its own type (rather than passed as raw pointers) so
/// non-Windows builds can still reference the type name from
/// `capture::GpuCapture::d3d11_device`.
#[derive(Clone)]
pub struct D3D11DeviceHandle {
    #[cfg(target_os = "windows")]
    pub device: windows::Win32::Graphics::Direct3D11::ID3D11Device,
    #[cfg(target_os = "windows")]
    pub context: windows::Win32::Graphics::Direct3D11::ID3D11DeviceContext,
    #[cfg(not(target_os = "windows"))]
    _private: (),
}

/// A produced H.264 Annex-B sample.
pub struct EncodedSample {
    pub data: Vec<u8>,
    pub is_keyframe: bool,
}

/// Quality preset index, clamped to `[min_q, max_q]` by the adaptive
/// controller (spec §4.5).
pub type QualityPreset = u8;

/// Core encoder operations every back-end implements (spec §4.2).
pub trait Encoder: Send {
    fn encode(&mut self, pixels: &[u8], format: PixelFormat) -> Result<Option<EncodedSample>, EncodeError>;

    /// GPU texture fast path. Default implementation rejects it; only
    /// back-ends that advertise [`EncoderCapabilities::gpu_input`] should
    /// override this.
    fn encode_texture(&mut self, _texture: &GpuTexture) -> Result<Option<EncodedSample>, EncodeError> {
        Err(EncodeError::NotInitialised)
    }

    fn set_bitrate(&mut self, bps: u32) -> Result<(), EncodeError>;
    fn bitrate(&self) -> u32;
    fn set_quality(&mut self, preset: QualityPreset) -> Result<(), EncodeError>;
    fn set_fps(&mut self, fps: u32) -> Result<(), EncodeError>;
    /// Rounds down to even dimensions per spec §8 and reinitialises the
    /// backend if the (rounded) dimensions actually changed.
    fn set_dimensions(&mut self, width: u32, height: u32) -> Result<(), EncodeError>;
    fn set_pixel_format(&mut self, format: PixelFormat);

    /// Latches a keyframe request; applied immediately if already
    /// initialised, or on the next initialisation otherwise (spec §4.2).
    fn force_keyframe(&mut self);

    /// Drops buffered input/output and forces the next sample to be an
    /// IDR.
    fn flush(&mut self);

    fn set_d3d11_device(&mut self, _device: D3D11DeviceHandle) {}

    fn close(&mut self);

    fn capabilities(&self) -> EncoderCapabilities {
        EncoderCapabilities::default()
    }

    /// Placeholder backends must identify themselves so session start can
    /// refuse them (spec §4.2, §7 `SessionError::PlaceholderEncoder`).
    fn is_placeholder(&self) -> bool {
        false
    }
}

#[derive(Default, Clone, Copy)]
pub struct EncoderCapabilities {
    pub gpu_input: bool,
    pub dynamic_bitrate: bool,
}

/// Resolution-dependent initial bitrate and adaptive ceiling (spec §4.6
/// step 6).
pub fn initial_bitrate_for(width: u32, height: u32) -> (u32, u32) {
    if width * height <= 1920 * 1080 {
        (2_500_000, 8_000_000)
    } else {
        (8_000_000, 15_000_000)
    }
}

/// Rounds dimensions down to even, per spec §8 (`1921x1081 -> 1920x1080`).
pub fn round_down_even(width: u32, height: u32) -> (u32, u32) {
    (width & !1, height & !1)
}

/// Builds the first working encoder from an ordered list of platform
/// factories (spec §9: "ordered list of factories producing
/// `Option<Backend>`; construct the first that succeeds and is
/// non-placeholder").
pub fn create_encoder(width: u32, height: u32, bitrate_bps: u32, fps: u32) -> Result<Box<dyn Encoder>, EncodeError> {
    #[cfg(target_os = "windows")]
    {
        if let Some(enc) = mft::HardwareMftEncoder::try_new(width, height, bitrate_bps, fps) {
            return Ok(Box::new(enc?));
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(enc) = videotoolbox::VideoToolboxEncoder::try_new(width, height, bitrate_bps, fps) {
            return Ok(Box::new(enc?));
        }
    }

    let sw = software::SoftwareEncoder::new(width, height, bitrate_bps, fps)?;
    Ok(Box::new(sw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_bitrate_picks_low_tier_at_1080p() {
        let (init, max) = initial_bitrate_for(1920, 1080);
        assert_eq!(init, 2_500_000);
        assert_eq!(max, 8_000_000);
    }

    #[test]
    fn initial_bitrate_picks_high_tier_above_1080p() {
        let (init, max) = initial_bitrate_for(3840, 2160);
        assert_eq!(init, 8_000_000);
        assert_eq!(max, 15_000_000);
    }

    #[test]
    fn round_down_even_matches_spec_example() {
        assert_eq!(round_down_even(1921, 1081), (1920, 1080));
    }
}
