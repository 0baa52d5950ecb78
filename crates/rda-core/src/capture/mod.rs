//! Capturer abstraction (spec §4.1) — polymorphic over platform back-ends,
//! with optional capabilities surfaced through a registry instead of
//! runtime type probing (spec §9 REDESIGN FLAGS).

#[cfg(target_os = "windows")]
pub mod dxgi;
#[cfg(target_os = "windows")]
pub mod gdi;
#[cfg(target_os = "linux")]
pub mod x11;
#[cfg(target_os = "macos")]
pub mod sck;

use rda_common::CaptureError;

/// Pixel layout of a captured [`Frame`]'s buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba,
    Bgra,
}

/// A rectangle in virtual-screen coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// A monitor as enumerated by a capturer back-end (spec §3 Monitor).
#[derive(Debug, Clone)]
pub struct Monitor {
    pub index: u32,
    pub name: String,
    pub rect: Rect,
    pub is_primary: bool,
}

/// A captured frame. Owns a buffer checked out of a [`crate::pools::FramePool`];
/// callers must return it via [`Frame::release`] — the pool invariant in
/// spec §3 ("no pixel buffer outlives the pool put-back call") is enforced
/// by consuming `self` there rather than relying on `Drop` to do it
/// silently (a panic during unwind inside `Drop` would abort the process,
/// so `Drop` here only logs a leak, it does not panic).
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    data: Option<Vec<u8>>,
    pool: crate::pools::FramePool,
}

impl Frame {
    pub fn new(
        width: u32,
        height: u32,
        stride: u32,
        format: PixelFormat,
        data: Vec<u8>,
        pool: crate::pools::FramePool,
    ) -> Self {
        Self {
            width,
            height,
            stride,
            format,
            data: Some(data),
            pool,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    /// Return the backing buffer to its pool. After this call the frame
    /// must not be used again.
    pub fn release(mut self) {
        if let Some(buf) = self.data.take() {
            self.pool.put_back(buf);
        }
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(buf) = self.data.take() {
            tracing::warn!("Frame dropped without release(); returning buffer to pool anyway");
            self.pool.put_back(buf);
        }
    }
}

/// Opaque GPU texture handle returned by [`GpuCapture::capture_texture`].
/// Concretely a COM `ID3D11Texture2D` pointer on the DXGI back-end; no
/// other back-end currently implements [`GpuCapture`]. Holding one
/// implies exclusive ownership until [`GpuCapture::release_texture`] is
/// called (spec §3 invariant).
pub struct GpuTexture {
    pub width: u32,
    pub height: u32,
    inner: Box<dyn std::any::Any + Send>,
}

impl GpuTexture {
    pub fn new(width: u32, height: u32, inner: Box<dyn std::any::Any + Send>) -> Self {
        Self {
            width,
            height,
            inner,
        }
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

/// Core capture operations every back-end implements (spec §4.1).
pub trait Capturer: Send {
    fn capture(&mut self) -> Result<Option<Frame>, CaptureError>;

    fn capture_region(&mut self, rect: Rect) -> Result<Option<Frame>, CaptureError> {
        let frame = match self.capture()? {
            Some(f) => f,
            None => return Ok(None),
        };
        Ok(Some(crop_frame(frame, rect)))
    }

    fn screen_bounds(&self) -> (u32, u32);

    fn close(&mut self);

    /// Optional capabilities this back-end exposes. Callers check this
    /// registry instead of probing concrete types at runtime (spec §9).
    fn capabilities(&self) -> CapturerCapabilities {
        CapturerCapabilities::default()
    }

    /// Present only when `capabilities().gpu_texture` is true.
    fn as_gpu_capture(&mut self) -> Option<&mut dyn GpuCapture> {
        None
    }

    /// Present only when `capabilities().desktop_switch_notifier` is true.
    fn as_desktop_switch_notifier(&mut self) -> Option<&mut dyn DesktopSwitchNotifier> {
        None
    }
}

/// Registry of optional capturer capabilities (spec §4.1's "Optional:"
/// list), surfaced explicitly rather than via `dyn Any` downcasting.
#[derive(Default, Clone, Copy)]
pub struct CapturerCapabilities {
    pub is_bgra: bool,
    /// `capture()` itself paces the loop; the session should not also run
    /// a ticker (spec §4.3 "Tight-loop mode").
    pub tight_loop: bool,
    /// Whether this back-end exposes a GPU texture fast path. When true,
    /// callers may invoke [`GpuCapture::capture_texture`] via a downcast
    /// registered separately (see [`crate::session::Session`]), since Rust
    /// trait objects cannot carry an optional super-trait without the
    /// concrete type being known ahead of time.
    pub gpu_texture: bool,
    pub desktop_switch_notifier: bool,
}

/// Optional GPU-texture fast path (spec §4.1). Implemented only by the
/// Windows Desktop Duplication back-end.
pub trait GpuCapture {
    fn capture_texture(&mut self) -> Result<Option<GpuTexture>, CaptureError>;
    fn release_texture(&mut self);
    fn d3d11_device(&self) -> Option<crate::encode::D3D11DeviceHandle>;
}

/// Optional cursor/desktop-switch signalling a back-end may expose
/// alongside its pixel data (spec §4.1).
pub trait DesktopSwitchNotifier {
    /// Latched flag, compare-and-clear: true at most once per transition.
    fn consume_desktop_switch(&mut self) -> bool;
    fn on_secure_desktop(&self) -> bool;
}

fn crop_frame(frame: Frame, rect: Rect) -> Frame {
    let x0 = rect.x.max(0) as u32;
    let y0 = rect.y.max(0) as u32;
    let w = rect.width.min(frame.width.saturating_sub(x0));
    let h = rect.height.min(frame.height.saturating_sub(y0));
    let bpp = 4u32;

    let mut out = vec![0u8; (w * h * bpp) as usize];
    let src = frame.bytes();
    for row in 0..h {
        let src_off = ((y0 + row) * frame.stride + x0 * bpp) as usize;
        let dst_off = (row * w * bpp) as usize;
        let len = (w * bpp) as usize;
        if src_off + len <= src.len() {
            out[dst_off..dst_off + len].copy_from_slice(&src[src_off..src_off + len]);
        }
    }

    let pool = frame.pool.clone();
    let format = frame.format;
    frame.release();
    Frame::new(w, h, w * bpp, format, out, pool)
}

/// Enumerates displays for the `list_monitors` control message (spec
/// §4.6). Platform-specific; falls back to a single synthetic primary
/// entry when the platform query is unavailable so the control message
/// always gets a reply.
pub fn enumerate_monitors() -> Vec<Monitor> {
    #[cfg(target_os = "linux")]
    {
        if let Some(monitors) = linux_xrandr::enumerate() {
            if !monitors.is_empty() {
                return monitors;
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        let monitors = macos_cg::enumerate();
        if !monitors.is_empty() {
            return monitors;
        }
    }

    #[cfg(target_os = "windows")]
    {
        let monitors = windows_gdi::enumerate();
        if !monitors.is_empty() {
            return monitors;
        }
    }

    vec![Monitor {
        index: 0,
        name: "Primary Display".to_string(),
        rect: Rect {
            x: 0,
            y: 0,
            width: 0,
            height: 0,
        },
        is_primary: true,
    }]
}

#[cfg(target_os = "linux")]
mod linux_xrandr {
    use super::{Monitor, Rect};
    use std::process::Command;

    /// Parses `xrandr --query` output, e.g.
    /// `HDMI-1 connected primary 1920x1080+0+0 (normal left inverted...) 527mm x 296mm`.
    pub fn enumerate() -> Option<Vec<Monitor>> {
        let output = Command::new("xrandr").arg("--query").output().ok()?;
        if !output.status.success() {
            return None;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut monitors = Vec::new();
        let mut index = 0u32;

        for line in stdout.lines() {
            if !line.contains(" connected") {
                continue;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }

            let name = parts[0].to_string();
            let is_primary = line.contains("primary");
            let mut rect = Rect {
                x: 0,
                y: 0,
                width: 0,
                height: 0,
            };

            for part in &parts[2..] {
                if part.contains('x') && part.contains('+') {
                    if let Some((res, pos)) = part.split_once('+') {
                        if let Some((w, h)) = res.split_once('x') {
                            rect.width = w.parse().unwrap_or(0);
                            rect.height = h.parse().unwrap_or(0);
                        }
                        if let Some((x, y)) = pos.split_once('+') {
                            rect.x = x.parse().unwrap_or(0);
                            rect.y = y.parse().unwrap_or(0);
                        }
                    }
                    break;
                }
            }

            monitors.push(Monitor {
                index,
                name,
                rect,
                is_primary,
            });
            index += 1;
        }

        Some(monitors)
    }
}

#[cfg(target_os = "macos")]
mod macos_cg {
    use super::{Monitor, Rect};

    type CGDirectDisplayID = u32;

    extern "C" {
        fn CGMainDisplayID() -> CGDirectDisplayID;
        fn CGDisplayPixelsWide(display: CGDirectDisplayID) -> usize;
        fn CGDisplayPixelsHigh(display: CGDirectDisplayID) -> usize;
        fn CGGetActiveDisplayList(
            max_displays: u32,
            active_displays: *mut CGDirectDisplayID,
            display_count: *mut u32,
        ) -> i32;
    }

    pub fn enumerate() -> Vec<Monitor> {
        let mut monitors = Vec::new();
        let mut display_ids: [CGDirectDisplayID; 16] = [0; 16];
        let mut count: u32 = 0;

        let result = unsafe { CGGetActiveDisplayList(16, display_ids.as_mut_ptr(), &mut count) };
        if result != 0 || count == 0 {
            return monitors;
        }

        let main_id = unsafe { CGMainDisplayID() };
        for (i, &display_id) in display_ids.iter().take(count as usize).enumerate() {
            let width = unsafe { CGDisplayPixelsWide(display_id) } as u32;
            let height = unsafe { CGDisplayPixelsHigh(display_id) } as u32;
            monitors.push(Monitor {
                index: i as u32,
                name: format!("Display {display_id}"),
                rect: Rect {
                    x: 0,
                    y: 0,
                    width,
                    height,
                },
                is_primary: display_id == main_id,
            });
        }
        monitors
    }
}

#[cfg(target_os = "windows")]
mod windows_gdi {
    use super::{Monitor, Rect};
    use std::cell::RefCell;
    use windows::Win32::Foundation::{BOOL, LPARAM, RECT};
    use windows::Win32::Graphics::Gdi::{
        EnumDisplayMonitors, GetMonitorInfoW, HDC, HMONITOR, MONITORINFO, MONITORINFOF_PRIMARY,
    };

    thread_local! {
        static COLLECTED: RefCell<Vec<Monitor>> = RefCell::new(Vec::new());
    }

    pub fn enumerate() -> Vec<Monitor> {
        COLLECTED.with(|c| c.borrow_mut().clear());
        unsafe {
            let _ = EnumDisplayMonitors(None, None, Some(collect_monitor), LPARAM(0));
        }
        COLLECTED.with(|c| c.borrow().clone())
    }

    unsafe extern "system" fn collect_monitor(monitor: HMONITOR, _hdc: HDC, _rect: *mut RECT, _lparam: LPARAM) -> BOOL {
        let mut info = MONITORINFO {
            cbSize: std::mem::size_of::<MONITORINFO>() as u32,
            ..Default::default()
        };
        if GetMonitorInfoW(monitor, &mut info).as_bool() {
            COLLECTED.with(|c| {
                let mut monitors = c.borrow_mut();
                let index = monitors.len() as u32;
                monitors.push(Monitor {
                    index,
                    name: format!("Display {index}"),
                    rect: Rect {
                        x: info.rcMonitor.left,
                        y: info.rcMonitor.top,
                        width: (info.rcMonitor.right - info.rcMonitor.left) as u32,
                        height: (info.rcMonitor.bottom - info.rcMonitor.top) as u32,
                    },
                    is_primary: (info.monitorInfoFlags & MONITORINFOF_PRIMARY) != 0,
                });
            });
        }
        BOOL(1)
    }
}

/// Selects a back-end for `display_index`, trying each in the order spec
/// §4.1 prescribes (GPU-accelerated first, falling back to CPU paths),
/// and returning the first that constructs successfully.
pub fn create_capturer(display_index: u32) -> Result<Box<dyn Capturer>, CaptureError> {
    #[cfg(target_os = "windows")]
    {
        match dxgi::DesktopDuplicationCapturer::new(display_index) {
            Ok(c) => return Ok(Box::new(c)),
            Err(e) => tracing::warn!(%e, "Desktop Duplication unavailable, falling back to GDI"),
        }
        return Ok(Box::new(gdi::GdiCapturer::new(display_index)?));
    }

    #[cfg(target_os = "macos")]
    {
        return Ok(Box::new(sck::ScreenCaptureKitCapturer::new(display_index)?));
    }

    #[cfg(target_os = "linux")]
    {
        return Ok(Box::new(x11::X11Capturer::new(display_index)?));
    }

    #[allow(unreachable_code)]
    {
        let _ = display_index;
        Err(CaptureError::NotSupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pools::FramePool;

    #[test]
    fn crop_frame_extracts_subrect() {
        let pool = FramePool::new();
        // 2x2 RGBA image: red, green / blue, white
        #[rustfmt::skip]
        let data = vec![
            255, 0, 0, 255,    0, 255, 0, 255,
            0, 0, 255, 255,    255, 255, 255, 255,
        ];
        let frame = Frame::new(2, 2, 8, PixelFormat::Rgba, data, pool);
        let cropped = crop_frame(
            frame,
            Rect {
                x: 1,
                y: 0,
                width: 1,
                height: 1,
            },
        );
        assert_eq!(cropped.width, 1);
        assert_eq!(cropped.height, 1);
        assert_eq!(cropped.bytes(), &[0, 255, 0, 255]);
    }
}
