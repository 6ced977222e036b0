//! Data-bin and precinct identifier types.
//!
//! A data bin is the JPIP unit of delivery: a class-tagged, class-scoped
//! slice of the codestream. Class and id together uniquely identify a bin
//! within a target. A bin may arrive in several fragments; the in-order
//! union of fragments reconstructs the authoritative bytes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// The kind of a data bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinClass {
    /// Main codestream header (`SOC` up to the first `SOT`)
    MainHeader,

    /// One tile-part header (`SOT` through `SOD`)
    TileHeader,

    /// Precinct data within a tile
    Precinct,

    /// Entropy-coded tile data
    Tile,

    /// Extended precinct data (high-throughput streams)
    ExtendedPrecinct,

    /// Non-codestream metadata (JP2 header boxes, XML)
    Metadata,
}

impl BinClass {
    /// Wire encoding of the class as used in data-bin frame payloads.
    pub const fn as_u8(self) -> u8 {
        match self {
            BinClass::MainHeader => 0,
            BinClass::TileHeader => 1,
            BinClass::Precinct => 2,
            BinClass::Tile => 3,
            BinClass::ExtendedPrecinct => 4,
            BinClass::Metadata => 5,
        }
    }

    /// Decode a wire class byte.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(BinClass::MainHeader),
            1 => Some(BinClass::TileHeader),
            2 => Some(BinClass::Precinct),
            3 => Some(BinClass::Tile),
            4 => Some(BinClass::ExtendedPrecinct),
            5 => Some(BinClass::Metadata),
            _ => None,
        }
    }

    /// Short name used in cache keys and logs.
    pub const fn name(self) -> &'static str {
        match self {
            BinClass::MainHeader => "main_header",
            BinClass::TileHeader => "tile_header",
            BinClass::Precinct => "precinct",
            BinClass::Tile => "tile",
            BinClass::ExtendedPrecinct => "extended_precinct",
            BinClass::Metadata => "metadata",
        }
    }
}

impl std::fmt::Display for BinClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A unit of delivery: one class-scoped slice of the codestream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBin {
    /// Bin class
    pub class: BinClass,

    /// Class-scoped identifier
    pub id: u32,

    /// Payload bytes (possibly a fragment of the full bin)
    pub bytes: Bytes,

    /// Whether the payload is the complete bin
    pub is_complete: bool,

    /// Highest quality layer contained, if layered
    pub quality_layer: Option<u32>,

    /// Owning tile, for tile-scoped classes
    pub tile_index: Option<u32>,
}

impl DataBin {
    /// Create a complete bin with no layer or tile annotation.
    pub fn new(class: BinClass, id: u32, bytes: impl Into<Bytes>) -> Self {
        Self {
            class,
            id,
            bytes: bytes.into(),
            is_complete: true,
            quality_layer: None,
            tile_index: None,
        }
    }

    /// Cache key, unique within a target: `"<class>:<id>"`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.class, self.id)
    }

    /// Key for an arbitrary `(class, id)` pair without building a bin.
    pub fn key_for(class: BinClass, id: u32) -> String {
        format!("{class}:{id}")
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Identifies a precinct: the finest spatial subdivision of a resolution
/// level within a tile component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrecinctId {
    pub tile: u32,
    pub component: u32,
    pub resolution: u32,
    pub precinct_x: u32,
    pub precinct_y: u32,
}

impl PrecinctId {
    pub fn new(tile: u32, component: u32, resolution: u32, precinct_x: u32, precinct_y: u32) -> Self {
        Self {
            tile,
            component,
            resolution,
            precinct_x,
            precinct_y,
        }
    }
}

impl std::fmt::Display for PrecinctId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "t{}c{}r{}p{}x{}",
            self.tile, self.component, self.resolution, self.precinct_x, self.precinct_y
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_class_roundtrip() {
        for class in [
            BinClass::MainHeader,
            BinClass::TileHeader,
            BinClass::Precinct,
            BinClass::Tile,
            BinClass::ExtendedPrecinct,
            BinClass::Metadata,
        ] {
            assert_eq!(BinClass::from_u8(class.as_u8()), Some(class));
        }
        assert_eq!(BinClass::from_u8(6), None);
        assert_eq!(BinClass::from_u8(255), None);
    }

    #[test]
    fn test_bin_key() {
        let bin = DataBin::new(BinClass::Precinct, 7, vec![1, 2, 3]);
        assert_eq!(bin.key(), "precinct:7");
        assert_eq!(DataBin::key_for(BinClass::Tile, 3), "tile:3");
    }

    #[test]
    fn test_bin_defaults() {
        let bin = DataBin::new(BinClass::MainHeader, 0, vec![0xFF, 0x4F]);
        assert!(bin.is_complete);
        assert_eq!(bin.quality_layer, None);
        assert_eq!(bin.tile_index, None);
        assert_eq!(bin.len(), 2);
        assert!(!bin.is_empty());
    }

    #[test]
    fn test_precinct_id_display() {
        let id = PrecinctId::new(1, 0, 2, 3, 4);
        assert_eq!(id.to_string(), "t1c0r2p3x4");
    }
}
