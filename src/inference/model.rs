//! Model files and load configuration
//!
//! GGUF header checks run before a file is handed to llama.cpp, which aborts
//! the process on some malformed inputs instead of returning an error.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
const GGUF_HEADER_LEN: u64 = 24;

const SUPPORTED_VERSIONS: std::ops::RangeInclusive<u32> = 2..=3;

/// Errors raised while inspecting a model file
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read model file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF ({0} bytes)")]
    FileTooSmall(u64),
}

/// Fixed-size header at the start of every GGUF file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

impl GgufHeader {
    /// Parses the header from the start of `reader`
    pub fn read<R: Read>(reader: &mut R) -> Result<Self, ModelError> {
        let magic = u32::from_le_bytes(read_array(reader)?);
        if magic != GGUF_MAGIC {
            return Err(ModelError::InvalidMagic(magic));
        }

        let version = u32::from_le_bytes(read_array(reader)?);
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(ModelError::UnsupportedVersion(version));
        }

        Ok(Self {
            version,
            tensor_count: u64::from_le_bytes(read_array(reader)?),
            metadata_kv_count: u64::from_le_bytes(read_array(reader)?),
        })
    }
}

fn read_array<R: Read, const N: usize>(reader: &mut R) -> Result<[u8; N], ModelError> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Checks that `path` exists and starts with a supported GGUF header
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufHeader, ModelError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ModelError::NotFound(path.to_path_buf()));
    }

    let file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < GGUF_HEADER_LEN {
        return Err(ModelError::FileTooSmall(len));
    }

    GgufHeader::read(&mut BufReader::new(file))
}

/// Configuration used to load a model and size its contexts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    /// Path to the GGUF model file
    pub model_path: PathBuf,
    /// Context window in tokens (0 = the model's training context)
    pub n_ctx: u32,
    /// Maximum tokens evaluated per forward pass
    pub n_batch: u32,
    /// Layers offloaded to the GPU (0 = CPU only)
    pub n_gpu_layers: u32,
    /// Worker threads for evaluation (None = llama.cpp default)
    pub n_threads: Option<i32>,
    /// Whether contexts are created with embedding output enabled
    pub embedding: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            n_ctx: 2048,
            n_batch: 512,
            n_gpu_layers: 0,
            n_threads: None,
            embedding: false,
        }
    }
}

/// Model information after loading
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedModelInfo {
    pub path: String,
    pub vocab_size: i32,
    pub embedding_dim: i32,
    /// Context length the model was trained with
    pub train_context_length: u32,
    /// Context window contexts are created with
    pub n_ctx: u32,
    pub n_batch: u32,
    pub param_count: u64,
    pub size_bytes: u64,
    pub embedding: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_header(magic: u32, version: u32) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        file.write_all(&magic.to_le_bytes()).unwrap();
        file.write_all(&version.to_le_bytes()).unwrap();
        file.write_all(&291u64.to_le_bytes()).unwrap();
        file.write_all(&19u64.to_le_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_validate_gguf_valid() {
        let file = write_header(GGUF_MAGIC, 3);
        let header = validate_gguf(file.path()).unwrap();

        assert_eq!(header.version, 3);
        assert_eq!(header.tensor_count, 291);
        assert_eq!(header.metadata_kv_count, 19);
    }

    #[test]
    fn test_validate_gguf_missing_file() {
        let result = validate_gguf("/nonexistent/models/ggml-model-q6k.gguf");
        assert!(matches!(result, Err(ModelError::NotFound(_))));
    }

    #[test]
    fn test_validate_gguf_invalid_magic() {
        let file = write_header(0x67676a74, 3);
        let result = validate_gguf(file.path());
        assert!(matches!(result, Err(ModelError::InvalidMagic(0x67676a74))));
    }

    #[test]
    fn test_validate_gguf_old_version() {
        let file = write_header(GGUF_MAGIC, 1);
        let result = validate_gguf(file.path());
        assert!(matches!(result, Err(ModelError::UnsupportedVersion(1))));
    }

    #[test]
    fn test_validate_gguf_truncated() {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        file.write_all(&GGUF_MAGIC.to_le_bytes()).unwrap();
        file.flush().unwrap();

        let result = validate_gguf(file.path());
        assert!(matches!(result, Err(ModelError::FileTooSmall(4))));
    }

    #[test]
    fn test_header_from_reader() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&7u64.to_le_bytes());
        bytes.extend_from_slice(&3u64.to_le_bytes());

        let header = GgufHeader::read(&mut bytes.as_slice()).unwrap();
        assert_eq!(
            header,
            GgufHeader {
                version: 2,
                tensor_count: 7,
                metadata_kv_count: 3
            }
        );
    }
}
