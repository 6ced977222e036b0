//! The codestream collaborator trait and its built-in marker-level
//! implementation.
//!
//! The engine consumes a [`CodestreamSource`] with three operations:
//! classify a byte stream, split it into data bins, and transcode between
//! block-coding modes. [`MarkerCodestream`] ships with the crate and works
//! purely at the marker-segment level; hosts with a real entropy codec plug
//! in their own implementation.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::ProtocolError;

use super::bin::{BinClass, DataBin};
use super::markers::{
    find_codestream_offset, find_marker, is_jp2_signature, CodestreamFormat, CAP, EOC, SOC, SOD,
    SOT,
};

/// How many bytes of the codestream prefix are scanned for a `CAP` marker
/// during classification.
pub const CAP_SCAN_PREFIX_LEN: usize = 1024;

/// Transcoding direction between the two block-coding modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TranscodeDirection {
    /// Legacy Part 1 block coding to high-throughput (Part 15)
    ToHighThroughput,

    /// High-throughput back to legacy Part 1
    ToLegacy,
}

/// Source of codestream structure for the engine.
///
/// Implementations are expected to be cheap to call; the engine caches
/// transcoded results keyed by a 64-bit FNV-1a content hash, so hash
/// collision safety is delegated to the implementation (a host that cannot
/// tolerate the statistical collision risk should transcode eagerly).
///
/// # Contract
///
/// - `classify` fails with a parse error on streams with no `SOC` marker.
/// - `extract_data_bins` emits bins whose in-order concatenation of
///   `main_header` + tile parts reproduces the codestream structure.
/// - `transcode` is lossless: transcoding there and back yields a stream
///   that decodes identically.
#[async_trait]
pub trait CodestreamSource: Send + Sync {
    /// Classify the container and block-coding mode of `bytes`.
    async fn classify(&self, bytes: &[u8]) -> Result<CodestreamFormat, ProtocolError>;

    /// Split `bytes` into JPIP data bins.
    async fn extract_data_bins(&self, bytes: &[u8]) -> Result<Vec<DataBin>, ProtocolError>;

    /// Transcode `bytes` to the indicated block-coding mode.
    async fn transcode(
        &self,
        bytes: &[u8],
        direction: TranscodeDirection,
    ) -> Result<Bytes, ProtocolError>;
}

/// Marker-level [`CodestreamSource`].
///
/// Splits a codestream on `SOC`/`SOT`/`SOD`/`EOC` boundaries without
/// touching entropy-coded data. Its `transcode` is the identity transform,
/// which satisfies the lossless round-trip contract trivially.
///
/// A tile part whose declared length (`Psot`) is zero or runs past the end
/// of the stream is bounded by scanning for the next `SOT` or `EOC`
/// instead. Entropy-coded data containing `FF 90`/`FF D9` byte sequences
/// can mis-split under that fallback; honoring the codestream's escape
/// rules requires a real codec-backed source.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkerCodestream;

impl MarkerCodestream {
    pub fn new() -> Self {
        Self
    }

    /// Resolve the raw codestream within `bytes`, skipping JP2 boxes.
    ///
    /// Returns `(codestream_offset, had_container)`.
    fn resolve(bytes: &[u8]) -> Result<(usize, bool), ProtocolError> {
        if bytes.len() >= 2 && bytes[..2] == SOC {
            return Ok((0, false));
        }
        if is_jp2_signature(bytes) {
            if let Some(offset) = find_codestream_offset(bytes) {
                if bytes.len() >= offset + 2 && bytes[offset..offset + 2] == SOC {
                    return Ok((offset, true));
                }
                return Err(ProtocolError::Parse(
                    "jp2c box does not start with SOC".to_string(),
                ));
            }
            return Err(ProtocolError::Parse(
                "JP2 container has no jp2c box".to_string(),
            ));
        }
        Err(ProtocolError::Parse("no SOC marker".to_string()))
    }

    /// Scan a bounded prefix of the codestream for a `CAP` marker.
    fn has_cap_marker(codestream: &[u8]) -> bool {
        let prefix = &codestream[..codestream.len().min(CAP_SCAN_PREFIX_LEN)];
        find_marker(prefix, CAP, 0).is_some()
    }

    /// End bound for the tile data of the tile part starting at `sot`.
    ///
    /// `Psot` is honored when it is nonzero and lands within the stream at
    /// or after `data_start`; otherwise the bound is the next `SOT` or
    /// `EOC`, or end of stream.
    fn tile_data_end(codestream: &[u8], sot: usize, data_start: usize) -> usize {
        if sot + 10 <= codestream.len() {
            let psot = u32::from_be_bytes([
                codestream[sot + 6],
                codestream[sot + 7],
                codestream[sot + 8],
                codestream[sot + 9],
            ]) as usize;
            if psot > 0 && sot + psot <= codestream.len() && sot + psot >= data_start {
                return sot + psot;
            }
        }

        let next_sot = find_marker(codestream, SOT, data_start);
        let next_eoc = find_marker(codestream, EOC, data_start);
        match (next_sot, next_eoc) {
            (Some(s), Some(e)) => s.min(e),
            (Some(s), None) => s,
            (None, Some(e)) => e,
            (None, None) => codestream.len(),
        }
    }
}

#[async_trait]
impl CodestreamSource for MarkerCodestream {
    async fn classify(&self, bytes: &[u8]) -> Result<CodestreamFormat, ProtocolError> {
        let (offset, had_container) = Self::resolve(bytes)?;
        let high_throughput = Self::has_cap_marker(&bytes[offset..]);
        if had_container {
            Ok(CodestreamFormat::Jp2Container { high_throughput })
        } else {
            Ok(CodestreamFormat::Jpeg2000 { high_throughput })
        }
    }

    async fn extract_data_bins(&self, bytes: &[u8]) -> Result<Vec<DataBin>, ProtocolError> {
        let (offset, had_container) = Self::resolve(bytes)?;
        let codestream = &bytes[offset..];
        let mut bins = Vec::new();

        // JP2 header boxes ahead of the codestream become one metadata bin.
        if had_container && offset > 8 {
            bins.push(DataBin::new(
                BinClass::Metadata,
                0,
                Bytes::copy_from_slice(&bytes[..offset - 8]),
            ));
        }

        let first_sot = find_marker(codestream, SOT, 0);
        let main_end = first_sot.unwrap_or(codestream.len());
        bins.push(DataBin::new(
            BinClass::MainHeader,
            0,
            Bytes::copy_from_slice(&codestream[..main_end]),
        ));

        let Some(mut sot) = first_sot else {
            // No tile parts: one tile bin carries whatever follows the
            // main header, when anything does.
            if main_end < codestream.len() {
                bins.push(DataBin::new(
                    BinClass::Tile,
                    0,
                    Bytes::copy_from_slice(&codestream[main_end..]),
                ));
            }
            return Ok(bins);
        };

        let mut part_index = 0u32;
        loop {
            let tile_index = if sot + 6 <= codestream.len() {
                Some(u16::from_be_bytes([codestream[sot + 4], codestream[sot + 5]]) as u32)
            } else {
                None
            };

            // Tile-part header runs through the SOD marker.
            let (header_end, data_start) = match find_marker(codestream, SOD, sot) {
                Some(sod) => (sod + 2, sod + 2),
                None => (codestream.len(), codestream.len()),
            };

            let mut header_bin = DataBin::new(
                BinClass::TileHeader,
                part_index,
                Bytes::copy_from_slice(&codestream[sot..header_end]),
            );
            header_bin.tile_index = tile_index;
            bins.push(header_bin);

            let data_end = Self::tile_data_end(codestream, sot, data_start);
            if data_start < data_end {
                let mut tile_bin = DataBin::new(
                    BinClass::Tile,
                    part_index,
                    Bytes::copy_from_slice(&codestream[data_start..data_end]),
                );
                tile_bin.tile_index = tile_index;
                bins.push(tile_bin);
            }

            part_index += 1;
            match find_marker(codestream, SOT, data_end.max(data_start)) {
                Some(next) => sot = next,
                None => break,
            }
        }

        Ok(bins)
    }

    async fn transcode(
        &self,
        bytes: &[u8],
        _direction: TranscodeDirection,
    ) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}
