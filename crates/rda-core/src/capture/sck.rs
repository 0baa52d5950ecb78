//! macOS ScreenCaptureKit capturer (spec §4.1 backend 3): initialised once
//! so the OS permission dialog is triggered exactly once, then polled for
//! per-frame pixel buffers via a bounded channel fed by the stream output
//! callback.

#![cfg(target_os = "macos")]

use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rda_common::CaptureError;
use screencapturekit::output::sc_stream_frame_info::SCFrameStatus;
use screencapturekit::output::{CMSampleBuffer, StreamOutput, StreamOutputType};
use screencapturekit::shareable_content::SCShareableContent;
use screencapturekit::stream::configuration::SCStreamConfiguration;
use screencapturekit::stream::content_filter::SCContentFilter;
use screencapturekit::stream::SCStream;

use super::{Capturer, CapturerCapabilities, Frame, PixelFormat};
use crate::pools::FramePool;

struct RawFrame {
    width: u32,
    height: u32,
    stride: u32,
    data: Vec<u8>,
}

struct FrameSink {
    tx: SyncSender<RawFrame>,
}

impl StreamOutput for FrameSink {
    fn did_output_sample_buffer(&self, sample: CMSampleBuffer, of_type: StreamOutputType) {
        if of_type != StreamOutputType::Screen {
            return;
        }
        let Some(pixel_buffer) = sample.get_pixel_buffer() else {
            return;
        };
        if sample.frame_status() != SCFrameStatus::Complete {
            return;
        }

        let width = pixel_buffer.get_width() as u32;
        let height = pixel_buffer.get_height() as u32;
        let stride = pixel_buffer.get_bytes_per_row() as u32;
        let data = pixel_buffer.get_bytes().to_vec();

        let frame = RawFrame { width, height, stride, data };
        if let Err(TrySendError::Full(_)) = self.tx.try_send(frame) {
            tracing::trace!("ScreenCaptureKit frame dropped, session behind");
        }
    }
}

pub struct ScreenCaptureKitCapturer {
    // Held for its lifetime: dropping the stream stops capture.
    _stream: SCStream,
    rx: Receiver<RawFrame>,
    pool: FramePool,
    width: u32,
    height: u32,
    /// Backing-scale factor for the display (native pixels per logical
    /// point); surfaced so callers can reason about HiDPI capture sizes.
    #[allow(dead_code)]
    scale_factor: f64,
}

impl ScreenCaptureKitCapturer {
    pub fn new(display_index: u32) -> Result<Self, CaptureError> {
        let content = SCShareableContent::get().map_err(|_| CaptureError::PermissionDenied)?;
        let displays = content.displays();
        let display = displays
            .get(display_index as usize)
            .ok_or(CaptureError::DisplayNotFound(display_index))?
            .clone();

        let width = display.width() as u32;
        let height = display.height() as u32;

        let filter = SCContentFilter::new().with_display_excluding_windows(&display, &[]);

        let config = SCStreamConfiguration::new()
            .set_width(width)
            .set_height(height)
            .set_pixel_format_bgra()
            .set_shows_cursor(false)
            .set_queue_depth(4);

        let (tx, rx) = std::sync::mpsc::sync_channel(4);
        let stream = Arc::new(Mutex::new(SCStream::new(&filter, &config)));
        stream
            .lock()
            .unwrap()
            .add_output_handler(FrameSink { tx }, StreamOutputType::Screen);
        stream
            .lock()
            .unwrap()
            .start_capture()
            .map_err(|e| CaptureError::TransientUnavailable(e.to_string()))?;

        let stream = Arc::try_unwrap(stream)
            .map_err(|_| CaptureError::TransientUnavailable("stream still shared".into()))?
            .into_inner()
            .unwrap();

        Ok(Self {
            _stream: stream,
            rx,
            pool: FramePool::new(),
            width,
            height,
            scale_factor: display.scale_factor(),
        })
    }
}

impl Capturer for ScreenCaptureKitCapturer {
    fn capture(&mut self) -> Result<Option<Frame>, CaptureError> {
        match self.rx.recv_timeout(Duration::from_millis(50)) {
            Ok(raw) => {
                self.width = raw.width;
                self.height = raw.height;
                let mut buf = self.pool.checkout(raw.data.len());
                buf.copy_from_slice(&raw.data);
                Ok(Some(Frame::new(raw.width, raw.height, raw.stride, PixelFormat::Bgra, buf, self.pool.clone())))
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => Err(CaptureError::DeviceLost),
        }
    }

    fn screen_bounds(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn close(&mut self) {}

    fn capabilities(&self) -> CapturerCapabilities {
        CapturerCapabilities {
            is_bgra: true,
            tight_loop: false,
            gpu_texture: false,
            desktop_switch_notifier: false,
        }
    }
}
