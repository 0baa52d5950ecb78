//! Row-band change detection (spec §4.3, §8): decides whether a captured
//! frame differs enough from the previous one to be worth encoding.

use crate::capture::Frame;

/// Number of horizontal bands a frame is split into for change detection.
/// Coarser than per-pixel diffing, cheap enough to run every frame.
const BAND_COUNT: u32 = 16;

pub struct FrameDiffer {
    band_crcs: Vec<u32>,
    width: u32,
    height: u32,
}

impl FrameDiffer {
    pub fn new() -> Self {
        Self {
            band_crcs: Vec::new(),
            width: 0,
            height: 0,
        }
    }

    /// Resets state so the next frame is always treated as changed. Called
    /// after a monitor swap or resolution change (spec §4.4).
    pub fn reset(&mut self) {
        self.band_crcs.clear();
        self.width = 0;
        self.height = 0;
    }

    /// Returns `true` if `frame` differs from the last one seen, and
    /// updates internal state to `frame`'s bands regardless of the
    /// verdict. Dimension changes always report a change.
    pub fn has_changed(&mut self, frame: &Frame) -> bool {
        if frame.width != self.width || frame.height != self.height {
            self.width = frame.width;
            self.height = frame.height;
            self.band_crcs = self.compute_bands(frame);
            return true;
        }

        let new_bands = self.compute_bands(frame);
        let changed = new_bands != self.band_crcs;
        self.band_crcs = new_bands;
        changed
    }

    fn compute_bands(&self, frame: &Frame) -> Vec<u32> {
        let bytes = frame.bytes();
        let stride = frame.stride as usize;
        let height = frame.height.max(1);
        let band_height = (height + BAND_COUNT - 1) / BAND_COUNT;

        (0..BAND_COUNT)
            .map(|band| {
                let row_start = (band * band_height).min(height) as usize;
                let row_end = ((band + 1) * band_height).min(height) as usize;
                let start = row_start * stride;
                let end = (row_end * stride).min(bytes.len());
                if start >= end {
                    0
                } else {
                    crc32fast::hash(&bytes[start..end])
                }
            })
            .collect()
    }
}

impl Default for FrameDiffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use crate::pools::FramePool;

    fn frame(bytes: Vec<u8>, width: u32, height: u32) -> Frame {
        let pool = FramePool::new();
        Frame::new(width, height, width * 4, PixelFormat::Rgba, bytes, pool)
    }

    #[test]
    fn first_frame_always_reports_changed() {
        let mut differ = FrameDiffer::new();
        let f = frame(vec![0u8; 64 * 64 * 4], 64, 64);
        assert!(differ.has_changed(&f));
    }

    #[test]
    fn identical_frame_reports_unchanged() {
        let mut differ = FrameDiffer::new();
        let f1 = frame(vec![7u8; 64 * 64 * 4], 64, 64);
        differ.has_changed(&f1);
        let f2 = frame(vec![7u8; 64 * 64 * 4], 64, 64);
        assert!(!differ.has_changed(&f2));
    }

    #[test]
    fn changed_region_reports_changed() {
        let mut differ = FrameDiffer::new();
        let f1 = frame(vec![0u8; 64 * 64 * 4], 64, 64);
        differ.has_changed(&f1);

        let mut data2 = vec![0u8; 64 * 64 * 4];
        data2[0] = 255;
        let f2 = frame(data2, 64, 64);
        assert!(differ.has_changed(&f2));
    }

    #[test]
    fn dimension_change_reports_changed_and_resets_tracked_size() {
        let mut differ = FrameDiffer::new();
        let f1 = frame(vec![3u8; 64 * 64 * 4], 64, 64);
        differ.has_changed(&f1);
        let f2 = frame(vec![3u8; 32 * 32 * 4], 32, 32);
        assert!(differ.has_changed(&f2));
    }

    #[test]
    fn reset_forces_next_frame_to_report_changed() {
        let mut differ = FrameDiffer::new();
        let f1 = frame(vec![9u8; 64 * 64 * 4], 64, 64);
        differ.has_changed(&f1);
        differ.reset();
        let f2 = frame(vec![9u8; 64 * 64 * 4], 64, 64);
        assert!(differ.has_changed(&f2));
    }
}
