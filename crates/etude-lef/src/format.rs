//! Packed on-disk structures and their little-endian serialization
//!
//! Every structure here writes and reads a byte-exact layout; sizes come
//! from [`crate::consts`] and serialization is field-by-field (no struct
//! casting), so the representation is stable across platforms.

use etude_core::{Error, Result};
use flagset::FlagSet;

use crate::consts::{
    Compression, FileFlag, LayerFlag, LayerKind, QuantKind, HEADER_SIZE, INDEX_ENTRY_SIZE,
    LAYER_HEADER_SIZE, LEF_MAGIC, METADATA_SIZE, QUANT_PARAMS_SIZE,
};

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

/// Fixed 56-byte file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LefHeader {
    pub version_major: u16,
    pub version_minor: u16,
    pub flags: FlagSet<FileFlag>,
    pub timestamp: u64,
    pub file_size: u64,
    pub model_hash: u32,
    pub layer_index_offset: u64,
    pub layer_data_offset: u64,
    pub compression: Compression,
}

impl LefHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&LEF_MAGIC.to_le_bytes());
        out[4..6].copy_from_slice(&self.version_major.to_le_bytes());
        out[6..8].copy_from_slice(&self.version_minor.to_le_bytes());
        out[8..12].copy_from_slice(&self.flags.bits().to_le_bytes());
        out[12..20].copy_from_slice(&self.timestamp.to_le_bytes());
        out[20..28].copy_from_slice(&self.file_size.to_le_bytes());
        out[28..32].copy_from_slice(&self.model_hash.to_le_bytes());
        out[32..40].copy_from_slice(&self.layer_index_offset.to_le_bytes());
        out[40..48].copy_from_slice(&self.layer_data_offset.to_le_bytes());
        // Reserved bytes 48..56; the first carries the payload codec.
        out[48] = self.compression.codec_byte();
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::format(format!(
                "header truncated: {} of {HEADER_SIZE} bytes",
                bytes.len()
            )));
        }
        let magic = read_u32(bytes, 0);
        if magic != LEF_MAGIC {
            return Err(Error::format(format!(
                "bad magic 0x{magic:08X}, expected 0x{LEF_MAGIC:08X}"
            )));
        }
        let flags = FlagSet::<FileFlag>::new(read_u32(bytes, 8))
            .map_err(|_| Error::format("unknown bits in file flags"))?;
        Ok(Self {
            version_major: read_u16(bytes, 4),
            version_minor: read_u16(bytes, 6),
            flags,
            timestamp: read_u64(bytes, 12),
            file_size: read_u64(bytes, 20),
            model_hash: read_u32(bytes, 28),
            layer_index_offset: read_u64(bytes, 32),
            layer_data_offset: read_u64(bytes, 40),
            compression: Compression::from_codec_byte(bytes[48])?,
        })
    }
}

fn write_padded(dst: &mut [u8], text: &str, field: &str) -> Result<()> {
    let raw = text.as_bytes();
    if raw.len() > dst.len() {
        return Err(Error::invalid_argument(format!(
            "{field} is {} bytes, limit {}",
            raw.len(),
            dst.len()
        )));
    }
    dst[..raw.len()].copy_from_slice(raw);
    Ok(())
}

fn read_padded(src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}

/// Fixed 296-byte model metadata block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModelMetadata {
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    pub input_dim: u32,
    pub output_dim: u32,
    pub hidden_dim: u32,
    pub num_layers: u32,
    pub num_heads: u32,
    pub vocab_size: u32,
    pub sample_rate: u32,
    pub mel_channels: u32,
    pub hop_length: u32,
    pub win_length: u32,
    pub default_quantization: QuantKind,
}

impl ModelMetadata {
    pub fn to_bytes(&self) -> Result<[u8; METADATA_SIZE]> {
        let mut out = [0u8; METADATA_SIZE];
        write_padded(&mut out[0..64], &self.name, "model name")?;
        write_padded(&mut out[64..80], &self.version, "model version")?;
        write_padded(&mut out[80..112], &self.author, "author")?;
        write_padded(&mut out[112..240], &self.description, "description")?;
        out[240..244].copy_from_slice(&self.input_dim.to_le_bytes());
        out[244..248].copy_from_slice(&self.output_dim.to_le_bytes());
        out[248..252].copy_from_slice(&self.hidden_dim.to_le_bytes());
        out[252..256].copy_from_slice(&self.num_layers.to_le_bytes());
        out[256..260].copy_from_slice(&self.num_heads.to_le_bytes());
        out[260..264].copy_from_slice(&self.vocab_size.to_le_bytes());
        out[264..268].copy_from_slice(&self.sample_rate.to_le_bytes());
        out[268..272].copy_from_slice(&self.mel_channels.to_le_bytes());
        out[272..276].copy_from_slice(&self.hop_length.to_le_bytes());
        out[276..280].copy_from_slice(&self.win_length.to_le_bytes());
        out[280] = self.default_quantization.to_u8();
        // 281..296 reserved.
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < METADATA_SIZE {
            return Err(Error::format(format!(
                "metadata truncated: {} of {METADATA_SIZE} bytes",
                bytes.len()
            )));
        }
        Ok(Self {
            name: read_padded(&bytes[0..64]),
            version: read_padded(&bytes[64..80]),
            author: read_padded(&bytes[80..112]),
            description: read_padded(&bytes[112..240]),
            input_dim: read_u32(bytes, 240),
            output_dim: read_u32(bytes, 244),
            hidden_dim: read_u32(bytes, 248),
            num_layers: read_u32(bytes, 252),
            num_heads: read_u32(bytes, 256),
            vocab_size: read_u32(bytes, 260),
            sample_rate: read_u32(bytes, 264),
            mel_channels: read_u32(bytes, 268),
            hop_length: read_u32(bytes, 272),
            win_length: read_u32(bytes, 276),
            default_quantization: QuantKind::from_u8(bytes[280])?,
        })
    }

    /// Deterministic digest of the normalized (fixed-length, null-padded,
    /// little-endian) metadata block. Serves as the file's model hash.
    pub fn hash(&self) -> Result<u32> {
        Ok(crc32fast::hash(&self.to_bytes()?))
    }
}

/// One packed layer-index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerIndexEntry {
    pub layer_id: u16,
    /// Absolute offset of the layer record (its header).
    pub offset: u64,
    /// Total record size in bytes.
    pub size: u32,
}

impl LayerIndexEntry {
    pub fn to_bytes(&self) -> [u8; INDEX_ENTRY_SIZE] {
        let mut out = [0u8; INDEX_ENTRY_SIZE];
        out[0..2].copy_from_slice(&self.layer_id.to_le_bytes());
        out[2..10].copy_from_slice(&self.offset.to_le_bytes());
        out[10..14].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < INDEX_ENTRY_SIZE {
            return Err(Error::format("layer index entry truncated"));
        }
        Ok(Self {
            layer_id: read_u16(bytes, 0),
            offset: read_u64(bytes, 2),
            size: read_u32(bytes, 10),
        })
    }
}

/// Packed per-layer header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerHeader {
    pub layer_id: u16,
    pub kind: LayerKind,
    pub quantization: QuantKind,
    pub flags: FlagSet<LayerFlag>,
    /// Raw (uncompressed) byte count.
    pub data_size: u32,
    /// Stored byte count; equals `data_size` when uncompressed.
    pub compressed_size: u32,
    /// Absolute offset of the payload bytes.
    pub data_offset: u64,
    /// CRC-32 of the raw (post-decompression) bytes.
    pub checksum: u32,
}

impl LayerHeader {
    pub fn to_bytes(&self) -> [u8; LAYER_HEADER_SIZE] {
        let mut out = [0u8; LAYER_HEADER_SIZE];
        out[0..2].copy_from_slice(&self.layer_id.to_le_bytes());
        out[2] = self.kind.to_u8();
        out[3] = self.quantization.to_u8();
        out[4..6].copy_from_slice(&self.flags.bits().to_le_bytes());
        out[6..10].copy_from_slice(&self.data_size.to_le_bytes());
        out[10..14].copy_from_slice(&self.compressed_size.to_le_bytes());
        out[14..22].copy_from_slice(&self.data_offset.to_le_bytes());
        out[22..26].copy_from_slice(&self.checksum.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < LAYER_HEADER_SIZE {
            return Err(Error::format("layer header truncated"));
        }
        let flags = FlagSet::<LayerFlag>::new(read_u16(bytes, 4))
            .map_err(|_| Error::format("unknown bits in layer flags"))?;
        let header = Self {
            layer_id: read_u16(bytes, 0),
            kind: LayerKind::from_u8(bytes[2])?,
            quantization: QuantKind::from_u8(bytes[3])?,
            flags,
            data_size: read_u32(bytes, 6),
            compressed_size: read_u32(bytes, 10),
            data_offset: read_u64(bytes, 14),
            checksum: read_u32(bytes, 22),
        };
        if header.compressed_size > header.data_size {
            return Err(Error::format(format!(
                "layer {}: compressed size {} exceeds raw size {}",
                header.layer_id, header.compressed_size, header.data_size
            )));
        }
        Ok(header)
    }
}

/// Linear quantization parameters stored alongside quantized layers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i32,
}

impl QuantParams {
    pub fn to_bytes(&self) -> [u8; QUANT_PARAMS_SIZE] {
        let mut out = [0u8; QUANT_PARAMS_SIZE];
        out[0..4].copy_from_slice(&self.scale.to_le_bytes());
        out[4..8].copy_from_slice(&self.zero_point.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < QUANT_PARAMS_SIZE {
            return Err(Error::format("quantization params truncated"));
        }
        Ok(Self {
            scale: f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            zero_point: i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> LefHeader {
        LefHeader {
            version_major: 1,
            version_minor: 0,
            flags: FileFlag::Compressed | FileFlag::Quantized,
            timestamp: 1_700_000_000,
            file_size: 4096,
            model_hash: 0xDEAD_BEEF,
            layer_index_offset: 352,
            layer_data_offset: 380,
            compression: Compression::Lz4,
        }
    }

    #[test]
    fn test_header_round_trip() {
        let header = sample_header();
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        let parsed = LefHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_header_bad_magic() {
        let mut bytes = sample_header().to_bytes();
        bytes[1] ^= 0xFF;
        assert!(matches!(
            LefHeader::from_bytes(&bytes),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_metadata_round_trip_and_hash_stability() {
        let meta = ModelMetadata {
            name: "voice-small".into(),
            version: "1.2.0".into(),
            author: "etude".into(),
            description: "test fixture".into(),
            input_dim: 80,
            output_dim: 1,
            hidden_dim: 256,
            num_layers: 4,
            num_heads: 4,
            vocab_size: 256,
            sample_rate: 22_050,
            mel_channels: 80,
            hop_length: 256,
            win_length: 1024,
            default_quantization: QuantKind::None,
        };
        let bytes = meta.to_bytes().unwrap();
        assert_eq!(bytes.len(), METADATA_SIZE);
        let parsed = ModelMetadata::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, meta);
        // Equal metadata always hashes equally.
        assert_eq!(meta.hash().unwrap(), parsed.hash().unwrap());
    }

    #[test]
    fn test_metadata_oversized_string_rejected() {
        let meta = ModelMetadata {
            name: "x".repeat(65),
            ..ModelMetadata::default()
        };
        assert!(matches!(
            meta.to_bytes(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_index_entry_is_14_bytes() {
        let entry = LayerIndexEntry {
            layer_id: 7,
            offset: 1234,
            size: 567,
        };
        let bytes = entry.to_bytes();
        assert_eq!(bytes.len(), 14);
        assert_eq!(LayerIndexEntry::from_bytes(&bytes).unwrap(), entry);
    }

    #[test]
    fn test_layer_header_round_trip() {
        let header = LayerHeader {
            layer_id: 3,
            kind: LayerKind::Attention,
            quantization: QuantKind::Int8,
            flags: LayerFlag::QuantParams.into(),
            data_size: 1000,
            compressed_size: 400,
            data_offset: 2048,
            checksum: 0x1234_5678,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), LAYER_HEADER_SIZE);
        assert_eq!(LayerHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_layer_header_rejects_inflated_compression() {
        let header = LayerHeader {
            layer_id: 0,
            kind: LayerKind::Linear,
            quantization: QuantKind::None,
            flags: Default::default(),
            data_size: 100,
            compressed_size: 200,
            data_offset: 0,
            checksum: 0,
        };
        assert!(matches!(
            LayerHeader::from_bytes(&header.to_bytes()),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_quant_params_round_trip() {
        let params = QuantParams {
            scale: 0.125,
            zero_point: -3,
        };
        assert_eq!(QuantParams::from_bytes(&params.to_bytes()).unwrap(), params);
    }
}
