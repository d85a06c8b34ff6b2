//! LEF serialization context
//!
//! Stages layer records, then `finalize` lays the whole container out:
//! placeholder header, metadata, layer index with correct offsets, each
//! layer's header and (optionally compressed) payload, and finally a
//! seek back to rewrite the header with the real file size.

use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use etude_core::{Error, Result};
use flagset::FlagSet;
use log::debug;

use crate::consts::{
    Compression, FileFlag, LayerFlag, LayerKind, QuantKind, DATA_START, INDEX_ENTRY_SIZE,
    LAYER_HEADER_SIZE, LEF_VERSION_MAJOR, LEF_VERSION_MINOR, MAX_LAYERS, QUANT_PARAMS_SIZE,
};
use crate::format::{LayerHeader, LayerIndexEntry, LefHeader, ModelMetadata, QuantParams};

/// Writer configuration.
#[derive(Debug, Clone, Default)]
pub struct WriterOptions {
    pub compression: Compression,
    pub default_quantization: QuantKind,
    /// Stored verbatim in the header; fix it for reproducible files.
    pub timestamp: u64,
}

/// One staged layer.
pub struct LayerSpec {
    pub layer_id: u16,
    pub kind: LayerKind,
    pub quantization: QuantKind,
    /// Raw (possibly pre-quantized) tensor bytes.
    pub data: Vec<u8>,
    pub quant_params: Option<QuantParams>,
    /// Free-form per-layer blob (this crate writes tensor shapes here as
    /// JSON).
    pub metadata: Option<Vec<u8>>,
}

impl LayerSpec {
    /// Stages an unquantized f32 tensor, recording its shape in the
    /// per-layer metadata blob.
    pub fn f32(layer_id: u16, kind: LayerKind, values: &[f32], shape: &[usize]) -> Result<Self> {
        let count: usize = shape.iter().product();
        if count != values.len() {
            return Err(Error::invalid_argument(format!(
                "layer {layer_id}: {} values do not fill shape {shape:?}",
                values.len()
            )));
        }
        let mut data = Vec::with_capacity(values.len() * 4);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        let metadata = serde_json::to_vec(&serde_json::json!({ "shape": shape }))
            .map_err(|e| Error::format(format!("layer metadata: {e}")))?;
        Ok(Self {
            layer_id,
            kind,
            quantization: QuantKind::None,
            data,
            quant_params: None,
            metadata: Some(metadata),
        })
    }
}

/// Serialization context for one LEF file.
pub struct LefWriter {
    metadata: ModelMetadata,
    options: WriterOptions,
    layers: Vec<LayerSpec>,
    staged_ids: std::collections::HashSet<u16>,
}

impl LefWriter {
    pub fn new(metadata: ModelMetadata, options: WriterOptions) -> Self {
        Self {
            metadata,
            options,
            layers: Vec::new(),
            staged_ids: std::collections::HashSet::new(),
        }
    }

    /// Stages a layer. Duplicate ids are an [`Error::InvalidState`].
    pub fn add_layer(&mut self, spec: LayerSpec) -> Result<()> {
        if self.staged_ids.contains(&spec.layer_id) {
            return Err(Error::invalid_state(format!(
                "layer {} already staged",
                spec.layer_id
            )));
        }
        if self.layers.len() >= MAX_LAYERS {
            return Err(Error::invalid_argument(format!(
                "layer count limit {MAX_LAYERS} reached"
            )));
        }
        self.staged_ids.insert(spec.layer_id);
        self.layers.push(spec);
        Ok(())
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    fn compress(&self, raw: &[u8]) -> Result<Option<Vec<u8>>> {
        let compressed = match self.options.compression {
            Compression::None => return Ok(None),
            Compression::Lz4 => lz4::block::compress(raw, None, false)
                .map_err(|e| Error::format(format!("lz4 compression: {e}")))?,
            Compression::Zstd(level) => zstd::bulk::compress(raw, level)
                .map_err(|e| Error::format(format!("zstd compression: {e}")))?,
        };
        // Incompressible payloads are stored raw so that
        // compressed_size <= data_size always holds.
        if compressed.len() >= raw.len() {
            Ok(None)
        } else {
            Ok(Some(compressed))
        }
    }

    /// Writes the container. Consumes the writer; the target must
    /// support seeking so the header can be rewritten with the final
    /// file size.
    pub fn finalize<W: Write + Seek>(mut self, target: &mut W) -> Result<()> {
        self.layers.sort_by_key(|l| l.layer_id);
        self.metadata.num_layers = self.layers.len() as u32;
        self.metadata.default_quantization = self.options.default_quantization;

        let meta_bytes = self.metadata.to_bytes()?;
        let model_hash = crc32fast::hash(&meta_bytes);

        // Compress payloads and size every record up front so the index
        // carries correct offsets.
        struct Staged {
            header: LayerHeader,
            quant_params: Option<QuantParams>,
            metadata: Option<Vec<u8>>,
            payload: Vec<u8>,
        }

        let mut any_compressed = false;
        let mut any_quantized = false;
        let mut any_extended = false;
        let mut staged = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let checksum = crc32fast::hash(&layer.data);
            let payload = match self.compress(&layer.data)? {
                Some(compressed) => {
                    any_compressed = true;
                    compressed
                }
                None => layer.data.clone(),
            };
            if layer.quantization != QuantKind::None {
                any_quantized = true;
            }
            if layer.metadata.is_some() {
                any_extended = true;
            }
            let mut flags: FlagSet<LayerFlag> = Default::default();
            if layer.quant_params.is_some() {
                flags |= LayerFlag::QuantParams;
            }
            if layer.metadata.is_some() {
                flags |= LayerFlag::Metadata;
            }
            staged.push(Staged {
                header: LayerHeader {
                    layer_id: layer.layer_id,
                    kind: layer.kind,
                    quantization: layer.quantization,
                    flags,
                    data_size: layer.data.len() as u32,
                    compressed_size: payload.len() as u32,
                    data_offset: 0,
                    checksum,
                },
                quant_params: layer.quant_params,
                metadata: layer.metadata.clone(),
                payload,
            });
        }

        let index_offset = DATA_START as u64;
        let records_start = index_offset + (staged.len() * INDEX_ENTRY_SIZE) as u64;

        let mut index = Vec::with_capacity(staged.len());
        let mut cursor = records_start;
        for item in staged.iter_mut() {
            let mut record_size = LAYER_HEADER_SIZE;
            if item.quant_params.is_some() {
                record_size += QUANT_PARAMS_SIZE;
            }
            if let Some(meta) = &item.metadata {
                record_size += 4 + meta.len();
            }
            item.header.data_offset = cursor + record_size as u64;
            record_size += item.payload.len();

            index.push(LayerIndexEntry {
                layer_id: item.header.layer_id,
                offset: cursor,
                size: record_size as u32,
            });
            cursor += record_size as u64;
        }
        let file_size = cursor;

        let mut file_flags: FlagSet<FileFlag> = Default::default();
        if any_compressed {
            file_flags |= FileFlag::Compressed;
        }
        if any_quantized {
            file_flags |= FileFlag::Quantized;
        }
        if any_extended {
            file_flags |= FileFlag::Extended;
        }

        let mut header = LefHeader {
            version_major: LEF_VERSION_MAJOR,
            version_minor: LEF_VERSION_MINOR,
            flags: file_flags,
            timestamp: self.options.timestamp,
            file_size: 0,
            model_hash,
            layer_index_offset: index_offset,
            layer_data_offset: records_start,
            compression: if any_compressed {
                self.options.compression
            } else {
                Compression::None
            },
        };

        // Placeholder header first; the final size is rewritten below.
        let start = target.stream_position()?;
        target.write_all(&header.to_bytes())?;
        target.write_all(&meta_bytes)?;
        for entry in &index {
            target.write_all(&entry.to_bytes())?;
        }
        for item in &staged {
            target.write_all(&item.header.to_bytes())?;
            if let Some(params) = &item.quant_params {
                target.write_all(&params.to_bytes())?;
            }
            if let Some(meta) = &item.metadata {
                target.write_all(&(meta.len() as u32).to_le_bytes())?;
                target.write_all(meta)?;
            }
            target.write_all(&item.payload)?;
        }

        header.file_size = file_size;
        target.seek(SeekFrom::Start(start))?;
        target.write_all(&header.to_bytes())?;
        target.seek(SeekFrom::Start(start + file_size))?;
        target.flush()?;

        debug!(
            "wrote LEF '{}': {} layers, {} bytes",
            self.metadata.name,
            index.len(),
            file_size
        );
        Ok(())
    }

    /// Convenience wrapper writing to a file path.
    pub fn write_to_file<P: AsRef<Path>>(self, path: P) -> Result<()> {
        let mut file = std::fs::File::create(path)?;
        self.finalize(&mut file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn meta() -> ModelMetadata {
        ModelMetadata {
            name: "writer-test".into(),
            version: "0.1".into(),
            ..Default::default()
        }
    }

    fn finalize_to_vec(writer: LefWriter) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        writer.finalize(&mut cursor).unwrap();
        cursor.into_inner()
    }

    #[test]
    fn test_zero_layer_file_is_exactly_header_plus_metadata() {
        let bytes = finalize_to_vec(LefWriter::new(meta(), WriterOptions::default()));
        assert_eq!(bytes.len(), DATA_START);
        let header = LefHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.file_size, DATA_START as u64);
        assert_eq!(header.layer_index_offset, DATA_START as u64);
    }

    #[test]
    fn test_duplicate_layer_id_rejected() {
        let mut writer = LefWriter::new(meta(), WriterOptions::default());
        writer
            .add_layer(LayerSpec::f32(1, LayerKind::Linear, &[1.0], &[1]).unwrap())
            .unwrap();
        let err = writer
            .add_layer(LayerSpec::f32(1, LayerKind::Linear, &[2.0], &[1]).unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn test_layers_written_in_id_order() {
        let mut writer = LefWriter::new(meta(), WriterOptions::default());
        writer
            .add_layer(LayerSpec::f32(5, LayerKind::Linear, &[5.0], &[1]).unwrap())
            .unwrap();
        writer
            .add_layer(LayerSpec::f32(2, LayerKind::Norm, &[2.0], &[1]).unwrap())
            .unwrap();
        let bytes = finalize_to_vec(writer);

        let first = LayerIndexEntry::from_bytes(&bytes[DATA_START..]).unwrap();
        let second =
            LayerIndexEntry::from_bytes(&bytes[DATA_START + INDEX_ENTRY_SIZE..]).unwrap();
        assert_eq!(first.layer_id, 2);
        assert_eq!(second.layer_id, 5);
        assert!(first.offset < second.offset);
    }

    #[test]
    fn test_deterministic_output() {
        let build = || {
            let mut writer = LefWriter::new(
                meta(),
                WriterOptions {
                    timestamp: 42,
                    ..Default::default()
                },
            );
            writer
                .add_layer(
                    LayerSpec::f32(0, LayerKind::Linear, &[1.0, 2.0, 3.0], &[3]).unwrap(),
                )
                .unwrap();
            finalize_to_vec(writer)
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_layer_count_capped_at_id_space() {
        let mut writer = LefWriter::new(meta(), WriterOptions::default());
        for id in 0..MAX_LAYERS as u16 {
            writer
                .add_layer(LayerSpec {
                    layer_id: id,
                    kind: LayerKind::Custom,
                    quantization: QuantKind::None,
                    data: Vec::new(),
                    quant_params: None,
                    metadata: None,
                })
                .unwrap();
        }
        let err = writer
            .add_layer(LayerSpec {
                layer_id: u16::MAX,
                kind: LayerKind::Custom,
                quantization: QuantKind::None,
                data: Vec::new(),
                quant_params: None,
                metadata: None,
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_compression_shrinks_repetitive_payload() {
        let values = vec![1.0f32; 4096];
        let raw_len = {
            let mut writer = LefWriter::new(meta(), WriterOptions::default());
            writer
                .add_layer(LayerSpec::f32(0, LayerKind::Linear, &values, &[4096]).unwrap())
                .unwrap();
            finalize_to_vec(writer).len()
        };
        let lz4_len = {
            let mut writer = LefWriter::new(
                meta(),
                WriterOptions {
                    compression: Compression::Lz4,
                    ..Default::default()
                },
            );
            writer
                .add_layer(LayerSpec::f32(0, LayerKind::Linear, &values, &[4096]).unwrap())
                .unwrap();
            finalize_to_vec(writer).len()
        };
        assert!(lz4_len < raw_len, "{lz4_len} vs {raw_len}");
    }
}
