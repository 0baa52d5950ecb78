//! # rda-protocol
//!
//! Wire types shared between the agent core and its signalling/data-channel
//! collaborators (spec §6). Everything here is plain JSON via `serde` —
//! this core does not speak protobuf; the signalling transport and the
//! shape of these envelopes is the *contract*, not an implementation the
//! core owns.

pub mod control;
pub mod cursor;
pub mod input;
pub mod signalling;

pub use control::{ControlMessage, ControlValue};
pub use cursor::CursorUpdate;
pub use input::InputEvent;
pub use signalling::{IceServer, StartRequest, StartResponse};

/// Protocol version — bump on breaking wire changes to any of the
/// envelopes in this crate.
pub const PROTOCOL_VERSION: u32 = 1;

/// Hard ceiling any agent must reject `set_bitrate` values above,
/// independent of the adaptive controller's configured max.
pub const MAX_BITRATE_BPS: u32 = 20_000_000;
