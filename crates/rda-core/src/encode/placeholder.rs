//! Placeholder encoder (spec §4.2): exists so `create_encoder` always has
//! a terminal fallback to reason about in tests, and so session start has
//! something concrete to reject via `is_placeholder()`.

use rda_common::EncodeError;

use super::{D3D11DeviceHandle, Encoder, EncoderCapabilities, EncodedSample, QualityPreset};
use crate::capture::{GpuTexture, PixelFormat};

pub struct PlaceholderEncoder {
    width: u32,
    height: u32,
    bitrate: u32,
}

impl PlaceholderEncoder {
    pub fn new(width: u32, height: u32, bitrate: u32) -> Self {
        Self {
            width,
            height,
            bitrate,
        }
    }
}

impl Encoder for PlaceholderEncoder {
    fn encode(&mut self, _pixels: &[u8], _format: PixelFormat) -> Result<Option<EncodedSample>, EncodeError> {
        Err(EncodeError::NotInitialised)
    }

    fn encode_texture(&mut self, _texture: &GpuTexture) -> Result<Option<EncodedSample>, EncodeError> {
        Err(EncodeError::NotInitialised)
    }

    fn set_bitrate(&mut self, bps: u32) -> Result<(), EncodeError> {
        if bps == 0 || bps > rda_protocol::MAX_BITRATE_BPS {
            return Err(EncodeError::InvalidBitrate(bps));
        }
        self.bitrate = bps;
        Ok(())
    }

    fn bitrate(&self) -> u32 {
        self.bitrate
    }

    fn set_quality(&mut self, _preset: QualityPreset) -> Result<(), EncodeError> {
        Ok(())
    }

    fn set_fps(&mut self, _fps: u32) -> Result<(), EncodeError> {
        Ok(())
    }

    fn set_dimensions(&mut self, width: u32, height: u32) -> Result<(), EncodeError> {
        let (w, h) = super::round_down_even(width, height);
        if w == 0 || h == 0 {
            return Err(EncodeError::InvalidMediaType);
        }
        self.width = w;
        self.height = h;
        Ok(())
    }

    fn set_pixel_format(&mut self, _format: PixelFormat) {}

    fn force_keyframe(&mut self) {}

    fn flush(&mut self) {}

    fn set_d3d11_device(&mut self, _device: D3D11DeviceHandle) {}

    fn close(&mut self) {}

    fn capabilities(&self) -> EncoderCapabilities {
        EncoderCapabilities::default()
    }

    fn is_placeholder(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_reports_itself() {
        let enc = PlaceholderEncoder::new(1920, 1080, 1_000_000);
        assert!(enc.is_placeholder());
    }

    #[test]
    fn placeholder_encode_always_errors() {
        let mut enc = PlaceholderEncoder::new(2, 2, 1_000_000);
        let pixels = vec![0u8; 16];
        assert!(enc.encode(&pixels, PixelFormat::Rgba).is_err());
    }
}
