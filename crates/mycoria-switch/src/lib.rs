//! # mycoria-switch
//!
//! Switch-label source routing: the variable-length label stack carried in
//! every frame, the per-hop rotation that turns a forward path into a return
//! path in place, and the path builder that sizes one buffer for every
//! rotation state.
//!
//! A switch label is a small integer identifying, at a given router, the next
//! outbound link. Labels 1..=127 encode to one varint byte ("routable"),
//! 128..=16383 to two bytes ("private"), and 0 terminates the stack.
//!
//! ## Modules
//!
//! - [`label`] — label type, varint codec, address-derived label assignment
//! - [`block`] — switch-block rotation and the return-path transform
//! - [`path`] — hop lists, block construction, exact block sizing

pub mod block;
pub mod label;
pub mod path;

pub use block::{next_rotate, to_return_block};
pub use label::SwitchLabel;
pub use path::{Hop, SwitchPath};

/// Error types for the switch-label codec.
#[derive(Debug, thiserror::Error)]
pub enum SwitchError {
    /// A buffer is too small for the requested write.
    #[error("buffer too small: need {need} bytes, have {have}")]
    BufTooSmall { need: usize, have: usize },

    /// A value exceeds its encodable range.
    #[error("value too big: {0}")]
    ValueTooBig(u64),

    /// A path or encoded label stack violates its invariants.
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

pub type Result<T> = std::result::Result<T, SwitchError>;
