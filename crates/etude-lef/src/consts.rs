//! LEF layout constants and enumerated field values
//!
//! All multi-byte integers in the container are little-endian; strings
//! are fixed-length null-padded UTF-8.

use etude_core::{Error, Result};
use flagset::flags;

/// `"LEF\0"` read as a little-endian u32.
pub const LEF_MAGIC: u32 = 0x4645_4C00;

pub const LEF_VERSION_MAJOR: u16 = 1;
pub const LEF_VERSION_MINOR: u16 = 0;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 56;

/// Fixed model-metadata block size in bytes.
pub const METADATA_SIZE: usize = 296;

/// Packed layer-index entry size: `layer_id u16 + offset u64 + size u32`.
pub const INDEX_ENTRY_SIZE: usize = 14;

/// Packed per-layer header size.
pub const LAYER_HEADER_SIZE: usize = 26;

/// Quantization-params blob: `scale f32 + zero_point i32`.
pub const QUANT_PARAMS_SIZE: usize = 8;

/// First byte past header + metadata; the index never starts earlier.
pub const DATA_START: usize = HEADER_SIZE + METADATA_SIZE;

/// Layer ids are u16, so a file holds at most this many layers.
pub const MAX_LAYERS: usize = u16::MAX as usize;

flags! {
    /// File-level flags (header `flags` field).
    pub enum FileFlag: u32 {
        Compressed = 1,
        Quantized = 2,
        Extended = 4,
    }

    /// Per-layer flags (layer header `flags` field).
    pub enum LayerFlag: u16 {
        /// An 8-byte quantization-params blob follows the layer header.
        QuantParams = 1,
        /// A length-prefixed metadata blob follows (after quant params).
        Metadata = 2,
    }
}

/// What a layer's tensor parameterizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Linear,
    Conv1d,
    Attention,
    Embedding,
    Norm,
    Vocoder,
    Custom,
}

impl LayerKind {
    pub fn to_u8(self) -> u8 {
        match self {
            LayerKind::Linear => 0,
            LayerKind::Conv1d => 1,
            LayerKind::Attention => 2,
            LayerKind::Embedding => 3,
            LayerKind::Norm => 4,
            LayerKind::Vocoder => 5,
            LayerKind::Custom => 255,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => LayerKind::Linear,
            1 => LayerKind::Conv1d,
            2 => LayerKind::Attention,
            3 => LayerKind::Embedding,
            4 => LayerKind::Norm,
            5 => LayerKind::Vocoder,
            255 => LayerKind::Custom,
            other => {
                return Err(Error::format(format!("unknown layer kind {other}")));
            }
        })
    }
}

/// How a layer's bytes are quantized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QuantKind {
    #[default]
    None,
    Fp16,
    Bf16,
    Int8,
    Int4,
    Mixed,
}

impl QuantKind {
    pub fn to_u8(self) -> u8 {
        match self {
            QuantKind::None => 0,
            QuantKind::Fp16 => 1,
            QuantKind::Bf16 => 2,
            QuantKind::Int8 => 3,
            QuantKind::Int4 => 4,
            QuantKind::Mixed => 5,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => QuantKind::None,
            1 => QuantKind::Fp16,
            2 => QuantKind::Bf16,
            3 => QuantKind::Int8,
            4 => QuantKind::Int4,
            5 => QuantKind::Mixed,
            other => {
                return Err(Error::format(format!("unknown quantization kind {other}")));
            }
        })
    }
}

/// Payload compression codec. Recorded in the first reserved header byte
/// so the reader knows how to undo it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Lz4,
    /// Zstandard at the given level.
    Zstd(i32),
}

impl Compression {
    pub fn codec_byte(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Lz4 => 1,
            Compression::Zstd(_) => 2,
        }
    }

    pub fn from_codec_byte(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Compression::None,
            1 => Compression::Lz4,
            2 => Compression::Zstd(0),
            other => {
                return Err(Error::format(format!("unknown compression codec {other}")));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_spells_lef() {
        let bytes = LEF_MAGIC.to_le_bytes();
        assert_eq!(&bytes, &[0x00, 0x4C, 0x45, 0x46]);
        assert_eq!(&bytes[1..], b"LEF");
    }

    #[test]
    fn test_enum_round_trips() {
        for kind in [
            LayerKind::Linear,
            LayerKind::Conv1d,
            LayerKind::Attention,
            LayerKind::Embedding,
            LayerKind::Norm,
            LayerKind::Vocoder,
            LayerKind::Custom,
        ] {
            assert_eq!(LayerKind::from_u8(kind.to_u8()).unwrap(), kind);
        }
        for quant in [
            QuantKind::None,
            QuantKind::Fp16,
            QuantKind::Bf16,
            QuantKind::Int8,
            QuantKind::Int4,
            QuantKind::Mixed,
        ] {
            assert_eq!(QuantKind::from_u8(quant.to_u8()).unwrap(), quant);
        }
    }

    #[test]
    fn test_unknown_values_are_format_errors() {
        assert!(matches!(LayerKind::from_u8(77), Err(Error::Format(_))));
        assert!(matches!(QuantKind::from_u8(77), Err(Error::Format(_))));
        assert!(matches!(
            Compression::from_codec_byte(9),
            Err(Error::Format(_))
        ));
    }
}
