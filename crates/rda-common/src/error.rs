//! Error taxonomy shared across the capture → encode → session pipeline.
//!
//! Each subsystem gets its own `thiserror` enum (spec §7); callers that
//! need a single error type at the binary boundary convert via `anyhow`.

/// Errors a `Capturer` backend can return from `capture()`/`capture_texture()`.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("permission denied acquiring the display")]
    PermissionDenied,

    #[error("display {0} not found")]
    DisplayNotFound(u32),

    #[error("capture temporarily unavailable: {0}")]
    TransientUnavailable(String),

    #[error("capture device lost")]
    DeviceLost,

    #[error("capability not supported by this backend")]
    NotSupported,
}

/// Errors an `Encoder` backend can return.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("invalid codec for this backend")]
    InvalidCodec,

    #[error("invalid quality preset: {0}")]
    InvalidQuality(u32),

    #[error("invalid bitrate: {0}")]
    InvalidBitrate(u32),

    #[error("invalid fps: {0}")]
    InvalidFps(u32),

    #[error("unsupported pixel format/media type")]
    InvalidMediaType,

    #[error("output buffer too small: need {need}, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    #[error("frame size mismatch: configured for {expected_w}x{expected_h}, got {got_w}x{got_h}")]
    SizeMismatch {
        expected_w: u32,
        expected_h: u32,
        got_w: u32,
        got_h: u32,
    },

    #[error("stream changed, renegotiation required")]
    StreamChange,

    #[error("encoder not initialised")]
    NotInitialised,

    #[error("fatal encoder error: {0}")]
    Fatal(String),
}

/// Errors surfaced by session lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("encoder backend is a placeholder, refusing to start")]
    PlaceholderEncoder,

    #[error("no display available")]
    NoDisplay,

    #[error("signalling failed: {0}")]
    SignalFailed(String),

    #[error("ICE gathering timed out")]
    IceTimeout,

    #[error("session already stopped")]
    AlreadyStopped,
}

/// Errors from the adaptive bitrate controller's public API.
#[derive(Debug, thiserror::Error)]
pub enum AdaptiveError {
    #[error("invalid bounds: min={min} max={max}")]
    InvalidBounds { min: u32, max: u32 },
}

/// Convenience alias for fallible operations that bubble up to the binary.
pub type AppResult<T> = anyhow::Result<T>;
