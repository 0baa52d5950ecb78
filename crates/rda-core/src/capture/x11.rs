//! Linux X11 capturer (spec §4.1 backend 4): MIT-SHM fast path with a
//! plain `GetImage` fallback when the shared-memory extension is
//! unavailable (remote X displays, sandboxed compositors).

#![cfg(target_os = "linux")]

use rda_common::CaptureError;
use x11rb::connection::Connection;
use x11rb::protocol::shm::{self, ConnectionExt as ShmConnectionExt};
use x11rb::protocol::xproto::{ConnectionExt, ImageFormat, Screen};
use x11rb::rust_connection::RustConnection;

use super::{Capturer, CapturerCapabilities, Frame, PixelFormat};
use crate::pools::FramePool;

struct ShmState {
    seg: shm::Seg,
    shmid: i32,
    addr: *mut u8,
    size: usize,
}

impl Drop for ShmState {
    fn drop(&mut self) {
        unsafe {
            libc_shmdt(self.addr);
            libc_shmctl_rmid(self.shmid);
        }
    }
}

// Minimal System-V shm bindings; x11rb's `shm` feature only covers the
// X11 protocol half of MIT-SHM, the attach/detach calls are plain POSIX.
extern "C" {
    #[link_name = "shmget"]
    fn libc_shmget(key: i32, size: usize, shmflg: i32) -> i32;
    #[link_name = "shmat"]
    fn libc_shmat(shmid: i32, shmaddr: *const u8, shmflg: i32) -> *mut u8;
    #[link_name = "shmdt"]
    fn libc_shmdt(shmaddr: *mut u8) -> i32;
    #[link_name = "shmctl"]
    fn libc_shmctl_rmid(shmid: i32) -> i32;
}

const IPC_PRIVATE: i32 = 0;
const IPC_CREAT: i32 = 0o1000;

pub struct X11Capturer {
    conn: RustConnection,
    screen: Screen,
    width: u32,
    height: u32,
    pool: FramePool,
    shm: Option<ShmState>,
}

impl X11Capturer {
    pub fn new(_display_index: u32) -> Result<Self, CaptureError> {
        let (conn, screen_num) =
            x11rb::connect(None).map_err(|e| CaptureError::TransientUnavailable(e.to_string()))?;
        let screen = conn.setup().roots[screen_num].clone();
        let width = screen.width_in_pixels as u32;
        let height = screen.height_in_pixels as u32;

        let shm = try_init_shm(&conn, width, height).ok();

        Ok(Self {
            conn,
            screen,
            width,
            height,
            pool: FramePool::new(),
            shm,
        })
    }

    fn capture_shm(&mut self) -> Result<Frame, CaptureError> {
        let state = self.shm.as_ref().unwrap();
        let root = self.screen.root;
        shm::get_image(
            &self.conn,
            root,
            0,
            0,
            self.width as u16,
            self.height as u16,
            !0,
            ImageFormat::Z_PIXMAP.into(),
            state.seg,
            0,
        )
        .map_err(|e| CaptureError::TransientUnavailable(e.to_string()))?
        .reply()
        .map_err(|e| CaptureError::TransientUnavailable(e.to_string()))?;

        let stride = self.width * 4;
        let len = (stride * self.height) as usize;
        let mut buf = self.pool.checkout(len);
        unsafe {
            std::ptr::copy_nonoverlapping(state.addr, buf.as_mut_ptr(), len.min(state.size));
        }
        Ok(Frame::new(self.width, self.height, stride, PixelFormat::Bgra, buf, self.pool.clone()))
    }

    fn capture_get_image(&mut self) -> Result<Frame, CaptureError> {
        let root = self.screen.root;
        let reply = self
            .conn
            .get_image(ImageFormat::Z_PIXMAP, root, 0, 0, self.width as u16, self.height as u16, !0)
            .map_err(|e| CaptureError::TransientUnavailable(e.to_string()))?
            .reply()
            .map_err(|e| CaptureError::TransientUnavailable(e.to_string()))?;

        let stride = self.width * 4;
        let len = (stride * self.height) as usize;
        let mut buf = self.pool.checkout(len);
        let src = &reply.data;
        let copy_len = len.min(src.len());
        buf[..copy_len].copy_from_slice(&src[..copy_len]);
        Ok(Frame::new(self.width, self.height, stride, PixelFormat::Bgra, buf, self.pool.clone()))
    }
}

impl Capturer for X11Capturer {
    fn capture(&mut self) -> Result<Option<Frame>, CaptureError> {
        let frame = if self.shm.is_some() {
            match self.capture_shm() {
                Ok(f) => f,
                Err(_) => {
                    self.shm = None;
                    self.capture_get_image()?
                }
            }
        } else {
            self.capture_get_image()?
        };
        Ok(Some(frame))
    }

    fn screen_bounds(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn close(&mut self) {
        self.shm = None;
    }

    fn capabilities(&self) -> CapturerCapabilities {
        CapturerCapabilities {
            is_bgra: true,
            tight_loop: false,
            gpu_texture: false,
            desktop_switch_notifier: false,
        }
    }
}

fn try_init_shm(conn: &RustConnection, width: u32, height: u32) -> Result<ShmState, CaptureError> {
    conn.extension_information(shm::X11_EXTENSION_NAME)
        .map_err(|e| CaptureError::TransientUnavailable(e.to_string()))?
        .ok_or(CaptureError::NotSupported)?;

    let size = (width * height * 4) as usize;
    let shmid = unsafe { libc_shmget(IPC_PRIVATE, size, IPC_CREAT | 0o600) };
    if shmid < 0 {
        return Err(CaptureError::TransientUnavailable("shmget failed".into()));
    }
    let addr = unsafe { libc_shmat(shmid, std::ptr::null(), 0) };
    if addr as isize == -1 {
        unsafe { libc_shmctl_rmid(shmid) };
        return Err(CaptureError::TransientUnavailable("shmat failed".into()));
    }

    let seg = conn
        .generate_id()
        .map_err(|e| CaptureError::TransientUnavailable(e.to_string()))?;
    shm::attach(conn, seg, shmid as u32, false)
        .map_err(|e| CaptureError::TransientUnavailable(e.to_string()))?
        .check()
        .map_err(|e| CaptureError::TransientUnavailable(e.to_string()))?;

    Ok(ShmState { seg, shmid, addr, size })
}
