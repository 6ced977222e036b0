//! JPEG 2000 marker constants and format classification.
//!
//! A codestream is a sequence of marker segments. Markers are two bytes,
//! `0xFF` followed by a code byte. `SOC`, `SOD` and `EOC` are bare markers;
//! every other marker carries a two-byte big-endian length that includes the
//! length field itself.
//!
//! A `.jp2` file wraps the codestream in ISO base media boxes: a 4-byte
//! big-endian length, a 4-byte ASCII box type, then the payload. The
//! contiguous codestream lives in the `jp2c` box.

/// Start of codestream marker (`FF 4F`).
pub const SOC: [u8; 2] = [0xFF, 0x4F];

/// Start of tile-part marker (`FF 90`).
pub const SOT: [u8; 2] = [0xFF, 0x90];

/// Start of data marker (`FF 93`). Ends a tile-part header.
pub const SOD: [u8; 2] = [0xFF, 0x93];

/// End of codestream marker (`FF D9`).
pub const EOC: [u8; 2] = [0xFF, 0xD9];

/// Extended capabilities marker (`FF 50`). Present in high-throughput streams.
pub const CAP: [u8; 2] = [0xFF, 0x50];

/// JP2 file signature box: length 12, type `jP  `, payload `0D 0A 87 0A`.
pub const JP2_SIGNATURE: [u8; 12] = [
    0x00, 0x00, 0x00, 0x0C, 0x6A, 0x50, 0x20, 0x20, 0x0D, 0x0A, 0x87, 0x0A,
];

/// Box type of the contiguous codestream box.
const JP2C_BOX_TYPE: &[u8; 4] = b"jp2c";

/// Classified container format of a byte stream.
///
/// The block-coding mode (legacy Part 1 vs high-throughput Part 15) is
/// carried alongside so callers can negotiate `JPIP-cap` / `pref` without a
/// second classification pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodestreamFormat {
    /// Raw codestream starting at `SOC`
    Jpeg2000 { high_throughput: bool },

    /// JP2 box container with a `jp2c` contiguous-codestream box
    Jp2Container { high_throughput: bool },
}

impl CodestreamFormat {
    /// Whether the stream uses the high-throughput block-coding mode.
    pub const fn is_high_throughput(&self) -> bool {
        match self {
            CodestreamFormat::Jpeg2000 { high_throughput }
            | CodestreamFormat::Jp2Container { high_throughput } => *high_throughput,
        }
    }

    /// The `JPIP-cap` capability token for this format.
    pub const fn capability(&self) -> &'static str {
        if self.is_high_throughput() {
            "htj2k"
        } else {
            "j2k"
        }
    }
}

/// Whether a marker code carries a two-byte big-endian length field.
///
/// Only `SOC`, `SOD` and `EOC` are bare.
pub fn marker_has_length(marker: [u8; 2]) -> bool {
    marker != SOC && marker != SOD && marker != EOC
}

/// Check if bytes begin with the JP2 file signature box.
pub fn is_jp2_signature(bytes: &[u8]) -> bool {
    bytes.len() >= JP2_SIGNATURE.len() && bytes[..JP2_SIGNATURE.len()] == JP2_SIGNATURE
}

/// Walk the JP2 box structure and return the offset of the codestream
/// inside the `jp2c` box, if present.
///
/// Box layout: 4-byte big-endian length, 4-byte ASCII type, payload at
/// `box_start + 8`. A length of 0 means the box extends to end of stream;
/// a length of 1 would indicate a 64-bit extended length, which no WSI-scale
/// codestream in practice needs before the `jp2c` box, so the walk stops
/// there.
pub fn find_codestream_offset(bytes: &[u8]) -> Option<usize> {
    let mut offset = 0usize;

    while offset + 8 <= bytes.len() {
        let len = u32::from_be_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]) as usize;
        let box_type = &bytes[offset + 4..offset + 8];

        if box_type == JP2C_BOX_TYPE {
            return Some(offset + 8);
        }

        match len {
            0 => break,           // box runs to end of stream, no jp2c found
            1 => break,           // extended length, unsupported
            l if l < 8 => break,  // malformed
            l => offset += l,
        }
    }

    None
}

/// Find the next occurrence of `marker` in `bytes` starting at `from`.
pub(crate) fn find_marker(bytes: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    if bytes.len() < 2 || from >= bytes.len() - 1 {
        return None;
    }
    bytes[from..]
        .windows(2)
        .position(|w| w == marker)
        .map(|pos| from + pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_has_length() {
        assert!(!marker_has_length(SOC));
        assert!(!marker_has_length(SOD));
        assert!(!marker_has_length(EOC));
        assert!(marker_has_length(SOT));
        assert!(marker_has_length(CAP));
        assert!(marker_has_length([0xFF, 0x52])); // COD
    }

    #[test]
    fn test_is_jp2_signature() {
        let mut file = JP2_SIGNATURE.to_vec();
        file.extend_from_slice(&[0x00, 0x00, 0x00, 0x14]);
        assert!(is_jp2_signature(&file));
        assert!(!is_jp2_signature(&file[1..]));
        assert!(!is_jp2_signature(&JP2_SIGNATURE[..8]));
    }

    #[test]
    fn test_find_codestream_offset() {
        // signature box (12) + ftyp box (16) + jp2c box
        let mut file = JP2_SIGNATURE.to_vec();
        file.extend_from_slice(&[0x00, 0x00, 0x00, 0x10]);
        file.extend_from_slice(b"ftyp");
        file.extend_from_slice(&[0u8; 8]);
        let jp2c_start = file.len();
        file.extend_from_slice(&[0x00, 0x00, 0x00, 0x0C]);
        file.extend_from_slice(b"jp2c");
        file.extend_from_slice(&SOC);
        file.extend_from_slice(&EOC);

        assert_eq!(find_codestream_offset(&file), Some(jp2c_start + 8));
    }

    #[test]
    fn test_find_codestream_offset_absent() {
        let mut file = JP2_SIGNATURE.to_vec();
        file.extend_from_slice(&[0x00, 0x00, 0x00, 0x10]);
        file.extend_from_slice(b"ftyp");
        file.extend_from_slice(&[0u8; 8]);
        assert_eq!(find_codestream_offset(&file), None);
    }

    #[test]
    fn test_find_codestream_offset_malformed_box() {
        // Declared box length smaller than the header
        let bytes = [0x00, 0x00, 0x00, 0x04, b'f', b't', b'y', b'p', 0, 0];
        assert_eq!(find_codestream_offset(&bytes), None);
    }

    #[test]
    fn test_find_marker() {
        let bytes = [0x00, 0xFF, 0x90, 0x00, 0xFF, 0x90];
        assert_eq!(find_marker(&bytes, SOT, 0), Some(1));
        assert_eq!(find_marker(&bytes, SOT, 2), Some(4));
        assert_eq!(find_marker(&bytes, SOT, 5), None);
        assert_eq!(find_marker(&bytes, EOC, 0), None);
    }

    #[test]
    fn test_capability_tokens() {
        let legacy = CodestreamFormat::Jpeg2000 {
            high_throughput: false,
        };
        let ht = CodestreamFormat::Jp2Container {
            high_throughput: true,
        };
        assert_eq!(legacy.capability(), "j2k");
        assert_eq!(ht.capability(), "htj2k");
        assert!(!legacy.is_high_throughput());
        assert!(ht.is_high_throughput());
    }
}
