//! Windows GDI capturer (spec §4.1 backend 2, fallback): BitBlt against a
//! "DISPLAY" device context, which (unlike Desktop Duplication) remains
//! reachable on the Winlogon/Screen-saver secure desktop.

use rda_common::CaptureError;
use windows::core::PCWSTR;
use windows::Win32::Foundation::HWND;
use windows::Win32::Graphics::Gdi::{
    BitBlt, CreateCompatibleBitmap, CreateCompatibleDC, CreateDCW, DeleteDC, DeleteObject, GetDIBits, SelectObject,
    BITMAPINFO, BITMAPINFOHEADER, BI_RGB, DIB_RGB_COLORS, HDC, SRCCOPY,
};
use windows::Win32::UI::WindowsAndMessaging::{GetSystemMetrics, SM_CXSCREEN, SM_CYSCREEN};

use super::{Capturer, CapturerCapabilities, Frame, PixelFormat};
use crate::pools::FramePool;

pub struct GdiCapturer {
    #[allow(dead_code)]
    display_index: u32,
    width: u32,
    height: u32,
    pool: FramePool,
}

impl GdiCapturer {
    pub fn new(display_index: u32) -> Result<Self, CaptureError> {
        let width = unsafe { GetSystemMetrics(SM_CXSCREEN) };
        let height = unsafe { GetSystemMetrics(SM_CYSCREEN) };
        if width <= 0 || height <= 0 {
            return Err(CaptureError::DisplayNotFound(display_index));
        }

        Ok(Self {
            display_index,
            width: width as u32,
            height: height as u32,
            pool: FramePool::new(),
        })
    }
}

impl Capturer for GdiCapturer {
    fn capture(&mut self) -> Result<Option<Frame>, CaptureError> {
        // "DISPLAY" reaches the active input desktop even when it is the
        // secure desktop, unlike a window DC bound to this process's
        // desktop.
        let display_name: Vec<u16> = "DISPLAY\0".encode_utf16().collect();
        let screen_dc = unsafe { CreateDCW(PCWSTR(display_name.as_ptr()), PCWSTR(display_name.as_ptr()), None, None) };
        if screen_dc.is_invalid() {
            return Err(CaptureError::TransientUnavailable("CreateDCW(DISPLAY) failed".into()));
        }

        let result = self.capture_via_dc(screen_dc);
        unsafe {
            let _ = DeleteDC(screen_dc);
        }
        result
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

impl GdiCapturer {
    fn capture_via_dc(&mut self, screen_dc: HDC) -> Result<Option<Frame>, CaptureError> {
        let mem_dc = unsafe { CreateCompatibleDC(screen_dc) };
        if mem_dc.is_invalid() {
            return Err(CaptureError::TransientUnavailable("CreateCompatibleDC failed".into()));
        }

        let bitmap = unsafe { CreateCompatibleBitmap(screen_dc, self.width as i32, self.height as i32) };
        if bitmap.is_invalid() {
            unsafe {
                let _ = DeleteDC(mem_dc);
            }
            return Err(CaptureError::TransientUnavailable("CreateCompatibleBitmap failed".into()));
        }

        let old = unsafe { SelectObject(mem_dc, bitmap) };

        // CAPTUREBLT would also grab layered/WS_EX_LAYERED windows, but may
        // be rejected on a secure desktop (spec §4.1); plain SRCCOPY always
        // works there.
        let ok = unsafe {
            BitBlt(
                mem_dc,
                0,
                0,
                self.width as i32,
                self.height as i32,
                Some(screen_dc),
                0,
                0,
                SRCCOPY,
            )
        };

        let frame = if ok.is_ok() {
            self.readback_bitmap(mem_dc, bitmap)
        } else {
            Err(CaptureError::TransientUnavailable("BitBlt failed".into()))
        };

        unsafe {
            SelectObject(mem_dc, old);
            let _ = DeleteObject(bitmap);
            let _ = DeleteDC(mem_dc);
        }

        frame.map(Some)
    }

    fn readback_bitmap(&mut self, mem_dc: HDC, bitmap: windows::Win32::Graphics::Gdi::HBITMAP) -> Result<Frame, CaptureError> {
        let stride = self.width * 4;
        let buf_len = (stride * self.height) as usize;
        let mut buf = self.pool.checkout(buf_len);

        let mut bmi = BITMAPINFO {
            bmiHeader: BITMAPINFOHEADER {
                biSize: std::mem::size_of::<BITMAPINFOHEADER>() as u32,
                biWidth: self.width as i32,
                // Negative height requests a top-down DIB so rows don't
                // need flipping after readback.
                biHeight: -(self.height as i32),
                biPlanes: 1,
                biBitCount: 32,
                biCompression: BI_RGB.0,
                ..Default::default()
            },
            ..Default::default()
        };

        let lines = unsafe {
            GetDIBits(
                mem_dc,
                bitmap,
                0,
                self.height,
                Some(buf.as_mut_ptr() as *mut _),
                &mut bmi,
                DIB_RGB_COLORS,
            )
        };

        if lines == 0 {
            self.pool.put_back(buf);
            return Err(CaptureError::TransientUnavailable("GetDIBits failed".into()));
        }

        Ok(Frame::new(self.width, self.height, stride, PixelFormat::Bgra, buf, self.pool.clone()))
    }
}

