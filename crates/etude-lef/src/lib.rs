//! LEF: the LibEtude model container format
//!
//! A binary container for quantized/compressed layer tensors with
//! versioning, integrity checks, and layer-granular random access:
//!
//! - [`consts`]: layout constants, layer/quantization kinds, flags
//! - [`format`]: packed structures and their little-endian codecs
//! - [`writer`]: serialization context (`add_layer` + `finalize`)
//! - [`reader`]: validation-first reader with lazy CRC-checked fetch
//! - [`model`]: loaded-model handle (pool + layer-id -> tensor map)

pub mod consts;
pub mod format;
pub mod model;
pub mod reader;
pub mod writer;

pub use consts::{Compression, FileFlag, LayerFlag, LayerKind, QuantKind};
pub use format::{LayerHeader, LayerIndexEntry, LefHeader, ModelMetadata, QuantParams};
pub use model::Model;
pub use reader::{CompatRange, LefReader};
pub use writer::{LayerSpec, LefWriter, WriterOptions};
