//! LEF reader with layer-granular random access
//!
//! Validation happens up front in a strict order (magic, version gate,
//! file size, metadata hash, index bounds) before any offset in the file
//! is trusted. Layer payloads are fetched lazily: `get_layer_data`
//! decompresses and verifies the per-layer CRC-32 at fetch time, not at
//! load.

use std::path::Path;

use etude_core::{Error, Result};
use log::debug;

use crate::consts::{
    Compression, DATA_START, INDEX_ENTRY_SIZE, LAYER_HEADER_SIZE, LEF_VERSION_MAJOR,
    LEF_VERSION_MINOR, QUANT_PARAMS_SIZE,
};
use crate::format::{LayerHeader, LayerIndexEntry, LefHeader, ModelMetadata, QuantParams};

/// Version window this build accepts. Models from other major versions
/// are not portable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompatRange {
    pub min_major: u16,
    pub min_minor: u16,
    pub max_major: u16,
    pub max_minor: u16,
}

impl CompatRange {
    /// Current build: major 1, any minor.
    pub const SUPPORTED: CompatRange = CompatRange {
        min_major: LEF_VERSION_MAJOR,
        min_minor: LEF_VERSION_MINOR,
        max_major: LEF_VERSION_MAJOR,
        max_minor: u16::MAX,
    };

    pub fn accepts(&self, major: u16, minor: u16) -> bool {
        if major < self.min_major || major > self.max_major {
            return false;
        }
        if major == self.min_major && minor < self.min_minor {
            return false;
        }
        if major == self.max_major && minor > self.max_minor {
            return false;
        }
        true
    }
}

/// Parsed container with the raw bytes owned alongside the index.
#[derive(Debug)]
pub struct LefReader {
    bytes: Vec<u8>,
    header: LefHeader,
    metadata: ModelMetadata,
    index: Vec<LayerIndexEntry>,
}

impl LefReader {
    /// Reads and validates a container file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_bytes(std::fs::read(path)?)
    }

    /// Validates a container already in memory.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::with_compat(bytes, CompatRange::SUPPORTED)
    }

    /// Validates against an explicit version window.
    pub fn with_compat(bytes: Vec<u8>, compat: CompatRange) -> Result<Self> {
        if bytes.len() < DATA_START {
            return Err(Error::format(format!(
                "file of {} bytes cannot hold header and metadata ({DATA_START})",
                bytes.len()
            )));
        }

        let header = LefHeader::from_bytes(&bytes)?;
        if !compat.accepts(header.version_major, header.version_minor) {
            return Err(Error::format(format!(
                "version {}.{} outside supported window {}.{}..={}.{}",
                header.version_major,
                header.version_minor,
                compat.min_major,
                compat.min_minor,
                compat.max_major,
                compat.max_minor,
            )));
        }
        if header.file_size != bytes.len() as u64 {
            return Err(Error::format(format!(
                "header claims {} bytes, file holds {}",
                header.file_size,
                bytes.len()
            )));
        }

        let metadata = ModelMetadata::from_bytes(&bytes[crate::consts::HEADER_SIZE..])?;
        let expected_hash = metadata.hash()?;
        if header.model_hash != expected_hash {
            return Err(Error::integrity(format!(
                "model hash 0x{:08X} does not match metadata (0x{expected_hash:08X})",
                header.model_hash
            )));
        }

        let num_layers = metadata.num_layers as usize;
        let index_offset = header.layer_index_offset as usize;
        let index_end = index_offset + num_layers * INDEX_ENTRY_SIZE;

        // Offsets must sit inside the region past header + metadata.
        // A zero-layer file legitimately points at end-of-file.
        let in_range = |offset: usize| {
            if num_layers == 0 {
                offset >= DATA_START && offset <= bytes.len()
            } else {
                offset >= DATA_START && offset < bytes.len()
            }
        };
        if !in_range(index_offset) || !in_range(header.layer_data_offset as usize) {
            return Err(Error::format(format!(
                "section offsets ({index_offset}, {}) outside [{DATA_START}, {})",
                header.layer_data_offset,
                bytes.len()
            )));
        }
        if index_end > bytes.len() {
            return Err(Error::format(format!(
                "layer index ({num_layers} entries) runs past end of file"
            )));
        }

        let mut index: Vec<LayerIndexEntry> = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let at = index_offset + i * INDEX_ENTRY_SIZE;
            let entry = LayerIndexEntry::from_bytes(&bytes[at..])?;
            if let Some(prev) = index.last() {
                if entry.layer_id <= prev.layer_id {
                    return Err(Error::format(format!(
                        "layer index not strictly ordered at id {}",
                        entry.layer_id
                    )));
                }
            }
            let record_end = entry.offset as usize + entry.size as usize;
            if (entry.offset as usize) < DATA_START || record_end > bytes.len() {
                return Err(Error::format(format!(
                    "layer {} record [{}, {record_end}) outside file",
                    entry.layer_id, entry.offset
                )));
            }
            index.push(entry);
        }

        debug!(
            "opened LEF '{}': v{}.{}, {} layers",
            metadata.name, header.version_major, header.version_minor, num_layers
        );
        Ok(Self {
            bytes,
            header,
            metadata,
            index,
        })
    }

    pub fn header(&self) -> &LefHeader {
        &self.header
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn num_layers(&self) -> usize {
        self.index.len()
    }

    pub fn layer_ids(&self) -> Vec<u16> {
        self.index.iter().map(|e| e.layer_id).collect()
    }

    fn entry(&self, layer_id: u16) -> Result<&LayerIndexEntry> {
        self.index
            .binary_search_by_key(&layer_id, |e| e.layer_id)
            .map(|i| &self.index[i])
            .map_err(|_| Error::not_found(format!("layer {layer_id}")))
    }

    /// Parses a layer's packed header.
    pub fn get_layer_header(&self, layer_id: u16) -> Result<LayerHeader> {
        let entry = self.entry(layer_id)?;
        let at = entry.offset as usize;
        let header = LayerHeader::from_bytes(&self.bytes[at..])?;
        if header.layer_id != layer_id {
            return Err(Error::format(format!(
                "index points layer {layer_id} at a record labeled {}",
                header.layer_id
            )));
        }
        Ok(header)
    }

    /// Offset of the first optional blob, right after the packed header.
    fn blob_region(&self, entry: &LayerIndexEntry) -> usize {
        entry.offset as usize + LAYER_HEADER_SIZE
    }

    /// The layer's quantization parameters, when present.
    pub fn get_quant_params(&self, layer_id: u16) -> Result<Option<QuantParams>> {
        let entry = self.entry(layer_id)?;
        let header = self.get_layer_header(layer_id)?;
        if !header.flags.contains(crate::consts::LayerFlag::QuantParams) {
            return Ok(None);
        }
        let at = self.blob_region(entry);
        if at + QUANT_PARAMS_SIZE > self.bytes.len() {
            return Err(Error::format(format!(
                "layer {layer_id}: quant params run past end of file"
            )));
        }
        QuantParams::from_bytes(&self.bytes[at..]).map(Some)
    }

    /// The layer's free-form metadata blob, when present.
    pub fn get_layer_metadata(&self, layer_id: u16) -> Result<Option<Vec<u8>>> {
        let entry = self.entry(layer_id)?;
        let header = self.get_layer_header(layer_id)?;
        if !header.flags.contains(crate::consts::LayerFlag::Metadata) {
            return Ok(None);
        }
        let mut at = self.blob_region(entry);
        if header.flags.contains(crate::consts::LayerFlag::QuantParams) {
            at += QUANT_PARAMS_SIZE;
        }
        if at + 4 > self.bytes.len() {
            return Err(Error::format(format!(
                "layer {layer_id}: metadata length runs past end of file"
            )));
        }
        let len = u32::from_le_bytes([
            self.bytes[at],
            self.bytes[at + 1],
            self.bytes[at + 2],
            self.bytes[at + 3],
        ]) as usize;
        let start = at + 4;
        if start + len > self.bytes.len() {
            return Err(Error::format(format!(
                "layer {layer_id}: metadata blob runs past end of file"
            )));
        }
        Ok(Some(self.bytes[start..start + len].to_vec()))
    }

    /// Fetches a layer's raw bytes, decompressing when needed and
    /// verifying the per-layer CRC-32 against the stored checksum.
    pub fn get_layer_data(&self, layer_id: u16) -> Result<Vec<u8>> {
        let header = self.get_layer_header(layer_id)?;
        let start = header.data_offset as usize;
        let end = start + header.compressed_size as usize;
        if start < DATA_START || end > self.bytes.len() {
            return Err(Error::format(format!(
                "layer {layer_id}: payload [{start}, {end}) outside file"
            )));
        }
        let payload = &self.bytes[start..end];

        let raw = if header.compressed_size < header.data_size {
            let raw = match self.header.compression {
                Compression::None => {
                    return Err(Error::format(format!(
                        "layer {layer_id} is compressed but the file declares no codec"
                    )));
                }
                Compression::Lz4 => {
                    lz4::block::decompress(payload, Some(header.data_size as i32))
                        .map_err(|e| Error::format(format!("layer {layer_id}: lz4: {e}")))?
                }
                Compression::Zstd(_) => {
                    zstd::bulk::decompress(payload, header.data_size as usize)
                        .map_err(|e| Error::format(format!("layer {layer_id}: zstd: {e}")))?
                }
            };
            if raw.len() != header.data_size as usize {
                return Err(Error::format(format!(
                    "layer {layer_id}: decompressed to {} bytes, header says {}",
                    raw.len(),
                    header.data_size
                )));
            }
            raw
        } else {
            payload.to_vec()
        };

        let crc = crc32fast::hash(&raw);
        if crc != header.checksum {
            return Err(Error::integrity(format!(
                "layer {layer_id}: CRC-32 0x{crc:08X} does not match stored 0x{:08X}",
                header.checksum
            )));
        }
        Ok(raw)
    }
}
