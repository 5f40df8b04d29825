//! Codec-level building blocks for the recording pipeline.
//!
//! Everything here operates on raw NAL units and byte buffers; no protocol
//! parsing happens in this crate. The two muxers consume Annex-B framed
//! access units with timestamps already converted by the caller.

pub mod annexb;
pub mod dts;
pub mod errors;
pub mod fmp4;
pub mod h264;
pub mod h265;
pub mod mpegts;

pub use dts::DtsExtractor;
pub use errors::MediaError;
