//! Software H.264 encoder backend wrapping `openh264` (spec §4.2 backend
//! 3: "reference fallback; same interface; no GPU affinity").

use openh264::encoder::{
    BitRate, Complexity, EncoderConfig, FrameRate, FrameType, RateControlMode, SpsPpsStrategy, UsageType,
};
use openh264::formats::YUVSource;
use openh264::OpenH264API;
use rda_common::EncodeError;

use super::nv12;
use super::{D3D11DeviceHandle, Encoder, EncoderCapabilities, EncodedSample, QualityPreset};
use crate::capture::{GpuTexture, PixelFormat};

struct PlanarBuffer {
    y: Vec<u8>,
    u: Vec<u8>,
    v: Vec<u8>,
    width: usize,
    height: usize,
}

impl YUVSource for PlanarBuffer {
    fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    fn strides(&self) -> (usize, usize, usize) {
        (self.width, self.width / 2, self.width / 2)
    }

    fn y(&self) -> &[u8] {
        &self.y
    }

    fn u(&self) -> &[u8] {
        &self.u
    }

    fn v(&self) -> &[u8] {
        &self.v
    }
}

impl PlanarBuffer {
    fn new(width: usize, height: usize) -> Self {
        Self {
            y: vec![0u8; width * height],
            u: vec![0u8; (width / 2) * (height / 2)],
            v: vec![0u8; (width / 2) * (height / 2)],
            width,
            height,
        }
    }

    fn fill(&mut self, pixels: &[u8], stride: u32, format: PixelFormat) {
        nv12::convert_to_i420(
            pixels,
            self.width as u32,
            self.height as u32,
            stride,
            format,
            &mut self.y,
            &mut self.u,
            &mut self.v,
        );
    }
}

pub struct SoftwareEncoder {
    encoder: openh264::encoder::Encoder,
    width: u32,
    height: u32,
    bitrate: u32,
    fps: u32,
    format: PixelFormat,
    planar: PlanarBuffer,
    pending_keyframe: bool,
    frame_count: u64,
}

impl SoftwareEncoder {
    pub fn new(width: u32, height: u32, bitrate_bps: u32, fps: u32) -> Result<Self, EncodeError> {
        let (width, height) = super::round_down_even(width, height);
        if width == 0 || height == 0 {
            return Err(EncodeError::InvalidMediaType);
        }

        let config = EncoderConfig::new()
            .bitrate(BitRate::from_bps(bitrate_bps))
            .max_frame_rate(FrameRate::from_hz(fps as f32))
            .usage_type(UsageType::ScreenContentRealTime)
            .rate_control_mode(RateControlMode::Bitrate)
            .complexity(Complexity::Low)
            .skip_frames(false)
            .sps_pps_strategy(SpsPpsStrategy::ConstantId);

        let api = OpenH264API::from_source();
        let encoder = openh264::encoder::Encoder::with_api_config(api, config)
            .map_err(|e| EncodeError::Fatal(e.to_string()))?;

        tracing::info!(width, height, bitrate_bps, fps, "software H.264 encoder initialized");

        Ok(Self {
            encoder,
            width,
            height,
            bitrate: bitrate_bps,
            fps,
            format: PixelFormat::Rgba,
            planar: PlanarBuffer::new(width as usize, height as usize),
            pending_keyframe: false,
            frame_count: 0,
        })
    }
}

impl Encoder for SoftwareEncoder {
    fn encode(&mut self, pixels: &[u8], format: PixelFormat) -> Result<Option<EncodedSample>, EncodeError> {
        let expected_len = (self.width * self.height * 4) as usize;
        if pixels.len() < expected_len {
            return Err(EncodeError::BufferTooSmall {
                need: expected_len,
                have: pixels.len(),
            });
        }

        self.planar.fill(pixels, self.width * 4, format);

        if self.pending_keyframe {
            self.encoder.force_intra_frame();
            self.pending_keyframe = false;
        }

        let bitstream = self
            .encoder
            .encode(&self.planar)
            .map_err(|e| EncodeError::Fatal(e.to_string()))?;

        let frame_type = bitstream.frame_type();
        if matches!(frame_type, FrameType::Skip) {
            return Ok(None);
        }

        let mut data = Vec::with_capacity(expected_len / 10);
        bitstream.write_vec(&mut data);
        if data.is_empty() {
            return Ok(None);
        }

        self.frame_count += 1;
        let is_keyframe = matches!(frame_type, FrameType::IDR | FrameType::I);

        if self.frame_count <= 3 || self.frame_count % 300 == 0 {
            tracing::debug!(frame = self.frame_count, bytes = data.len(), is_keyframe, "encoded frame");
        }

        Ok(Some(EncodedSample { data, is_keyframe }))
    }

    fn encode_texture(&mut self, _texture: &GpuTexture) -> Result<Option<EncodedSample>, EncodeError> {
        Err(EncodeError::NotInitialised)
    }

    fn set_bitrate(&mut self, bps: u32) -> Result<(), EncodeError> {
        if bps == 0 || bps > rda_protocol::MAX_BITRATE_BPS {
            return Err(EncodeError::InvalidBitrate(bps));
        }
        // openh264 does not expose a live bitrate update; the reference
        // fallback tracks the target and applies it at the next
        // construction boundary (dimension/format change).
        self.bitrate = bps;
        Ok(())
    }

    fn bitrate(&self) -> u32 {
        self.bitrate
    }

    fn set_quality(&mut self, _preset: QualityPreset) -> Result<(), EncodeError> {
        Ok(())
    }

    fn set_fps(&mut self, fps: u32) -> Result<(), EncodeError> {
        if fps == 0 {
            return Err(EncodeError::InvalidFps(fps));
        }
        self.fps = fps;
        Ok(())
    }

    fn set_dimensions(&mut self, width: u32, height: u32) -> Result<(), EncodeError> {
        let (w, h) = super::round_down_even(width, height);
        if w == 0 || h == 0 {
            return Err(EncodeError::InvalidMediaType);
        }
        if w != self.width || h != self.height {
            *self = Self::new(w, h, self.bitrate, self.fps)?;
        }
        Ok(())
    }

    fn set_pixel_format(&mut self, format: PixelFormat) {
        self.format = format;
    }

    fn force_keyframe(&mut self) {
        self.pending_keyframe = true;
    }

    fn flush(&mut self) {
        self.pending_keyframe = true;
    }

    fn set_d3d11_device(&mut self, _device: D3D11DeviceHandle) {}

    fn close(&mut self) {}

    fn capabilities(&self) -> EncoderCapabilities {
        EncoderCapabilities {
            gpu_input: false,
            dynamic_bitrate: false,
        }
    }

    fn is_placeholder(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_odd_dimensions_by_rounding_down() {
        let enc = SoftwareEncoder::new(1921, 1081, 2_500_000, 30).unwrap();
        assert_eq!((enc.width, enc.height), (1920, 1080));
    }

    #[test]
    fn rejects_zero_dimensions() {
        assert!(SoftwareEncoder::new(1, 0, 1_000_000, 30).is_err());
    }

    #[test]
    fn set_bitrate_rejects_above_hard_cap() {
        let mut enc = SoftwareEncoder::new(640, 480, 1_000_000, 30).unwrap();
        assert!(enc.set_bitrate(rda_protocol::MAX_BITRATE_BPS + 1).is_err());
        assert!(enc.set_bitrate(5_000_000).is_ok());
        assert_eq!(enc.bitrate(), 5_000_000);
    }

    #[test]
    fn encode_rejects_undersized_buffer() {
        let mut enc = SoftwareEncoder::new(640, 480, 1_000_000, 30).unwrap();
        let pixels = vec![0u8; 16];
        assert!(matches!(enc.encode(&pixels, PixelFormat::Rgba), Err(EncodeError::BufferTooSmall { .. })));
    }
}
