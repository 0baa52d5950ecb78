//! Windows Desktop Duplication capturer (spec §4.1 backend 1, preferred).
//!
//! Grounded on the desktop-duplication wrapper pattern in the retrieved
//! corpus (`win_desktop_duplication::duplication`): a D3D11 device per
//! adapter, `IDXGIOutputDuplication::AcquireNextFrame` for GPU textures,
//! `OpenInputDesktop`/`SetThreadDesktop` before attaching so secure
//! desktops are reachable, and access-lost recovery by re-duplicating the
//! output.

use std::ptr;

use rda_common::CaptureError;
use windows::core::Interface;
use windows::Win32::Foundation::GENERIC_READ;
use windows::Win32::Graphics::Direct3D::D3D_DRIVER_TYPE_UNKNOWN;
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D, D3D11_BIND_FLAG,
    D3D11_CPU_ACCESS_READ, D3D11_CREATE_DEVICE_FLAG, D3D11_RESOURCE_MISC_FLAG, D3D11_SDK_VERSION,
    D3D11_TEXTURE2D_DESC, D3D11_USAGE_STAGING,
};
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_SAMPLE_DESC};
use windows::Win32::Graphics::Dxgi::{
    IDXGIDevice, IDXGIOutput, IDXGIOutput1, IDXGIOutputDuplication, DXGI_ERROR_ACCESS_DENIED,
    DXGI_ERROR_ACCESS_LOST, DXGI_ERROR_WAIT_TIMEOUT,
};
use windows::Win32::Foundation::HANDLE;
use windows::Win32::System::StationsAndDesktops::{
    GetThreadDesktop, GetUserObjectInformationW, OpenInputDesktop, SetThreadDesktop,
    DESKTOP_SWITCHDESKTOP, UOI_NAME,
};
use windows::Win32::System::Threading::GetCurrentThreadId;

use super::{Capturer, CapturerCapabilities, DesktopSwitchNotifier, Frame, GpuCapture, GpuTexture, PixelFormat};
use crate::encode::D3D11DeviceHandle;
use crate::pools::FramePool;

const MAX_CONSECUTIVE_FAILURES: u32 = 3;

pub struct DesktopDuplicationCapturer {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    duplication: IDXGIOutputDuplication,
    width: u32,
    height: u32,
    pool: FramePool,
    staging: Option<ID3D11Texture2D>,
    consecutive_failures: u32,
    desktop_switched: bool,
    on_secure_desktop: bool,
    held_texture: bool,
}

unsafe impl Send for DesktopDuplicationCapturer {}

impl DesktopDuplicationCapturer {
    pub fn new(display_index: u32) -> Result<Self, CaptureError> {
        attach_input_desktop()?;

        let (device, context) = create_device()?;
        let output = get_output(&device, display_index)?;
        let duplication = duplicate_output(&device, &output)?;

        let desc = output_desc(&output)?;

        Ok(Self {
            device,
            context,
            duplication,
            width: desc.0,
            height: desc.1,
            pool: FramePool::new(),
            staging: None,
            consecutive_failures: 0,
            desktop_switched: false,
            on_secure_desktop: false,
            held_texture: false,
        })
    }

    fn reacquire(&mut self, display_index: u32) -> Result<(), CaptureError> {
        attach_input_desktop()?;
        self.desktop_switched = true;
        self.on_secure_desktop = !is_default_desktop();

        let output = get_output(&self.device, display_index)?;
        self.duplication = duplicate_output(&self.device, &output)?;
        Ok(())
    }

    fn readback_to_frame(&mut self, texture: &ID3D11Texture2D) -> Result<Frame, CaptureError> {
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { texture.GetDesc(&mut desc) };

        if self.staging.is_none() {
            let staging_desc = D3D11_TEXTURE2D_DESC {
                Width: desc.Width,
                Height: desc.Height,
                MipLevels: 1,
                ArraySize: 1,
                Format: desc.Format,
                SampleDesc: DXGI_SAMPLE_DESC {
                    Count: 1,
                    Quality: 0,
                },
                Usage: D3D11_USAGE_STAGING,
                BindFlags: D3D11_BIND_FLAG(0),
                CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
                MiscFlags: D3D11_RESOURCE_MISC_FLAG(0),
            };
            let mut out: Option<ID3D11Texture2D> = None;
            unsafe {
                self.device
                    .CreateTexture2D(&staging_desc, None, Some(&mut out))
                    .map_err(|e| CaptureError::TransientUnavailable(e.to_string()))?
            };
            self.staging = out;
        }

        let staging = self.staging.as_ref().unwrap();
        unsafe { self.context.CopyResource(staging, texture) };

        let mut mapped = Default::default();
        unsafe {
            self.context
                .Map(staging, 0, windows::Win32::Graphics::Direct3D11::D3D11_MAP_READ, 0, Some(&mut mapped))
                .map_err(|e| CaptureError::TransientUnavailable(e.to_string()))?;
        }

        let width = desc.Width;
        let height = desc.Height;
        let src_stride = mapped.RowPitch;
        let dst_stride = width * 4;
        let buf_len = (dst_stride * height) as usize;
        let mut buf = self.pool.checkout(buf_len);

        unsafe {
            let src = mapped.pData as *const u8;
            for row in 0..height {
                let src_row = src.add((row * src_stride) as usize);
                let dst_off = (row * dst_stride) as usize;
                ptr::copy_nonoverlapping(src_row, buf[dst_off..].as_mut_ptr(), dst_stride as usize);
            }
            self.context.Unmap(staging, 0);
        }

        self.width = width;
        self.height = height;

        Ok(Frame::new(width, height, dst_stride, PixelFormat::Bgra, buf, self.pool.clone()))
    }
}

impl Capturer for DesktopDuplicationCapturer {
    fn capture(&mut self) -> Result<Option<Frame>, CaptureError> {
        match self.capture_texture()? {
            Some(tex) => {
                let d3d_tex = tex
                    .downcast_ref::<ID3D11Texture2D>()
                    .cloned()
                    .ok_or(CaptureError::TransientUnavailable("non-D3D11 texture".into()))?;
                let frame = self.readback_to_frame(&d3d_tex);
                self.release_texture();
                frame.map(Some)
            }
            None => Ok(None),
        }
    }

    fn screen_bounds(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn close(&mut self) {
        self.release_texture();
    }

    fn capabilities(&self) -> CapturerCapabilities {
        CapturerCapabilities {
            is_bgra: true,
            tight_loop: true,
            gpu_texture: true,
            desktop_switch_notifier: true,
        }
    }

    fn as_gpu_capture(&mut self) -> Option<&mut dyn GpuCapture> {
        Some(self)
    }

    fn as_desktop_switch_notifier(&mut self) -> Option<&mut dyn DesktopSwitchNotifier> {
        Some(self)
    }
}

impl GpuCapture for DesktopDuplicationCapturer {
    fn capture_texture(&mut self) -> Result<Option<GpuTexture>, CaptureError> {
        if self.held_texture {
            self.release_texture();
        }

        let mut frame_info = Default::default();
        let mut resource = None;
        let status = unsafe { self.duplication.AcquireNextFrame(0, &mut frame_info, &mut resource) };

        match status {
            Ok(()) => {}
            Err(e) if e.code() == DXGI_ERROR_WAIT_TIMEOUT => return Ok(None),
            Err(e) if e.code() == DXGI_ERROR_ACCESS_LOST || e.code() == DXGI_ERROR_ACCESS_DENIED => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    return Err(CaptureError::DeviceLost);
                }
                self.reacquire(0)?;
                return Ok(None);
            }
            Err(e) => return Err(CaptureError::TransientUnavailable(e.to_string())),
        }

        self.consecutive_failures = 0;

        let resource = match resource {
            Some(r) => r,
            None => {
                unsafe { let _ = self.duplication.ReleaseFrame(); }
                return Ok(None);
            }
        };

        let texture: ID3D11Texture2D = resource
            .cast()
            .map_err(|e| CaptureError::TransientUnavailable(e.to_string()))?;

        self.held_texture = true;
        Ok(Some(GpuTexture::new(self.width, self.height, Box::new(texture))))
    }

    fn release_texture(&mut self) {
        if self.held_texture {
            unsafe {
                let _ = self.duplication.ReleaseFrame();
            }
            self.held_texture = false;
        }
    }

    fn d3d11_device(&self) -> Option<D3D11DeviceHandle> {
        Some(D3D11DeviceHandle {
            device: self.device.clone(),
            context: self.context.clone(),
        })
    }
}

impl DesktopSwitchNotifier for DesktopDuplicationCapturer {
    fn consume_desktop_switch(&mut self) -> bool {
        std::mem::replace(&mut self.desktop_switched, false)
    }

    fn on_secure_desktop(&self) -> bool {
        self.on_secure_desktop
    }
}

fn attach_input_desktop() -> Result<(), CaptureError> {
    let desktop = unsafe { OpenInputDesktop(DESKTOP_SWITCHDESKTOP, true, GENERIC_READ.0) }
        .map_err(|_| CaptureError::PermissionDenied)?;
    unsafe { SetThreadDesktop(desktop) }.map_err(|_| CaptureError::PermissionDenied)?;
    Ok(())
}

/// Reads the current thread's desktop name and compares it against
/// "Default" — anything else ("Winlogon", "Disconnect") is a secure
/// desktop (UAC prompt, lock screen, login screen).
fn is_default_desktop() -> bool {
    unsafe {
        let hdesk = GetThreadDesktop(GetCurrentThreadId());
        let mut buf = [0u16; 256];
        let mut needed: u32 = 0;
        let ok = GetUserObjectInformationW(
            HANDLE(hdesk.0),
            UOI_NAME,
            Some(buf.as_mut_ptr().cast()),
            std::mem::size_of_val(&buf) as u32,
            Some(&mut needed),
        );
        if ok.is_err() {
            return true;
        }
        let len = buf.iter().position(|&c| c == 0).unwrap_or(0);
        String::from_utf16_lossy(&buf[..len]).eq_ignore_ascii_case("default")
    }
}

fn create_device() -> Result<(ID3D11Device, ID3D11DeviceContext), CaptureError> {
    let mut device = None;
    let mut context = None;
    unsafe {
        D3D11CreateDevice(
            None,
            D3D_DRIVER_TYPE_UNKNOWN,
            None,
            D3D11_CREATE_DEVICE_FLAG(0),
            None,
            D3D11_SDK_VERSION,
            Some(&mut device),
            None,
            Some(&mut context),
        )
        .map_err(|e| CaptureError::TransientUnavailable(e.to_string()))?;
    }
    Ok((device.unwrap(), context.unwrap()))
}

fn get_output(device: &ID3D11Device, display_index: u32) -> Result<IDXGIOutput1, CaptureError> {
    let dxgi_device: IDXGIDevice = device
        .cast()
        .map_err(|e| CaptureError::TransientUnavailable(e.to_string()))?;
    let adapter = unsafe { dxgi_device.GetAdapter() }.map_err(|e| CaptureError::TransientUnavailable(e.to_string()))?;
    let output: IDXGIOutput =
        unsafe { adapter.EnumOutputs(display_index) }.map_err(|_| CaptureError::DisplayNotFound(display_index))?;
    output
        .cast()
        .map_err(|e| CaptureError::TransientUnavailable(e.to_string()))
}

fn duplicate_output(device: &ID3D11Device, output: &IDXGIOutput1) -> Result<IDXGIOutputDuplication, CaptureError> {
    unsafe { output.DuplicateOutput(device) }.map_err(|e| match e.code() {
        windows::Win32::Foundation::E_ACCESSDENIED => CaptureError::PermissionDenied,
        _ => CaptureError::TransientUnavailable(e.to_string()),
    })
}

fn output_desc(output: &IDXGIOutput1) -> Result<(u32, u32), CaptureError> {
    let mut desc = Default::default();
    unsafe { output.GetDesc(&mut desc) }.map_err(|e| CaptureError::TransientUnavailable(e.to_string()))?;
    let rect = desc.DesktopCoordinates;
    Ok(((rect.right - rect.left) as u32, (rect.bottom - rect.top) as u32))
}

