//! Wire value model and frame codec for the scopes middleware
//!
//! This crate contains everything that crosses a process boundary:
//!
//! - [`Variant`] / [`VariantMap`]: the dynamically typed value model used
//!   for argument dictionaries, result records, and the surfacing cache.
//! - [`RequestFrame`] / [`ResponseFrame`]: the message frames exchanged
//!   between object adapters, with a fixed 8-byte header carrying the wire
//!   version and the body length.
//! - [`ExceptionInfo`] / [`ExceptionKind`]: the exception descriptor used to
//!   carry failures across the wire so the caller can re-materialize a
//!   typed error.
//!
//! The codec is hand-rolled over `bytes`; there is no reflection or schema
//! compiler involved. Frames are self-delimiting via the `body_len` header
//! field, so a transport only needs to read the header to know how much to
//! buffer.

pub mod error;
pub mod frame;
pub mod variant;

pub use error::{Result, WireError};
pub use frame::{
    ExceptionInfo, ExceptionKind, Frame, FrameHeader, FrameKind, RequestFrame, RequestMode,
    ResponseBody, ResponseFrame, DEFAULT_MAX_FRAME_SIZE, WIRE_VERSION,
};
pub use variant::{Variant, VariantArray, VariantMap, MAX_NESTING_DEPTH};
