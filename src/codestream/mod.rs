//! Codestream decomposition into JPIP data bins.
//!
//! This module provides the marker-level view of a JPEG 2000 codestream that
//! the streaming engine is built on:
//!
//! - [`markers`] - Marker constants, JP2 box walking, format classification
//! - [`bin`] - Data-bin and precinct identifier types
//! - [`source`] - The [`CodestreamSource`] collaborator trait and the
//!   built-in [`MarkerCodestream`] implementation
//!
//! The engine never decodes entropy-coded data. Everything below the marker
//! segment level (wavelet subbands, block coding passes) is the
//! responsibility of the [`CodestreamSource`] the host plugs in.

pub mod bin;
pub mod markers;
pub mod source;

pub use bin::{BinClass, DataBin, PrecinctId};
pub use markers::{
    find_codestream_offset, is_jp2_signature, marker_has_length, CodestreamFormat, CAP, EOC,
    JP2_SIGNATURE, SOC, SOD, SOT,
};
pub use source::{
    CodestreamSource, MarkerCodestream, TranscodeDirection, CAP_SCAN_PREFIX_LEN,
};
