//! Reusable frame/NV12 buffer pools (spec §2 component graph leaf: "Buffer
//! pools — reusable frame and NV12 buffers; no dependencies").
//!
//! A small mutex guards each pool's free list. Contention is negligible:
//! checkouts happen once per captured frame, put-backs once per release,
//! and the critical section is a `Vec::pop`/`push`.

use std::sync::{Arc, Mutex};

struct Inner {
    free: Vec<Vec<u8>>,
}

/// Pool of reusable byte buffers for captured pixel data. Cloning shares
/// the underlying free list (cheap `Arc` clone), matching how a [`crate::capture::Frame`]
/// needs to carry a handle back to the pool it was checked out from.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<Mutex<Inner>>,
}

impl FramePool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { free: Vec::new() })),
        }
    }

    /// Check out a buffer of at least `len` bytes, reusing a freed one
    /// when its capacity already fits.
    pub fn checkout(&self, len: usize) -> Vec<u8> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner.free.iter().position(|b| b.capacity() >= len) {
            let mut buf = inner.free.swap_remove(pos);
            buf.clear();
            buf.resize(len, 0);
            buf
        } else {
            vec![0u8; len]
        }
    }

    pub fn put_back(&self, buf: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        // Cap the free list so a burst of odd-sized frames can't grow
        // memory without bound.
        if inner.free.len() < 8 {
            inner.free.push(buf);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new()
    }
}

/// Pool of reusable NV12 plane buffers (Y + interleaved UV in one
/// allocation), keyed implicitly by the caller always requesting the same
/// dimensions within a session.
#[derive(Clone)]
pub struct Nv12Pool {
    inner: Arc<Mutex<Inner>>,
}

impl Nv12Pool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { free: Vec::new() })),
        }
    }

    /// NV12 buffer size for `width x height` (even dims): Y plane
    /// `width*height`, UV plane `width*height/2`.
    pub fn buffer_len(width: u32, height: u32) -> usize {
        (width as usize * height as usize) + (width as usize * height as usize / 2)
    }

    pub fn checkout(&self, width: u32, height: u32) -> Vec<u8> {
        let len = Self::buffer_len(width, height);
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner.free.iter().position(|b| b.capacity() >= len) {
            let mut buf = inner.free.swap_remove(pos);
            buf.clear();
            buf.resize(len, 0);
            buf
        } else {
            vec![0u8; len]
        }
    }

    pub fn put_back(&self, buf: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.free.len() < 8 {
            inner.free.push(buf);
        }
    }
}

impl Default for Nv12Pool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_reuses_released_buffer() {
        let pool = FramePool::new();
        let buf = pool.checkout(1024);
        let ptr_before = buf.as_ptr();
        pool.put_back(buf);
        assert_eq!(pool.len(), 1);

        let buf2 = pool.checkout(512);
        assert_eq!(buf2.as_ptr(), ptr_before);
        assert_eq!(buf2.len(), 512);
    }

    #[test]
    fn checkout_allocates_when_pool_empty() {
        let pool = FramePool::new();
        let buf = pool.checkout(256);
        assert_eq!(buf.len(), 256);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn nv12_buffer_len_matches_420_subsampling() {
        assert_eq!(Nv12Pool::buffer_len(4, 2), 4 * 2 + 4); // Y=8, UV=4
    }
}
