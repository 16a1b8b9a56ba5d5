//! Models directory
//!
//! Lists installed GGUF files and resolves model names given on the command
//! line.

use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Information about a GGUF model file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Full path to the model file
    pub path: PathBuf,
    /// Filename of the model
    pub filename: String,
    /// File size in bytes
    pub size_bytes: u64,
}

impl ModelInfo {
    fn from_path(path: PathBuf) -> Result<Self, std::io::Error> {
        let metadata = fs::metadata(&path)?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        Ok(Self {
            path,
            filename,
            size_bytes: metadata.len(),
        })
    }

    /// Get a human-readable size string
    pub fn size_string(&self) -> String {
        const KB: f64 = 1024.0;
        let bytes = self.size_bytes as f64;

        if bytes < KB {
            format!("{} B", self.size_bytes)
        } else if bytes < KB * KB {
            format!("{:.2} KB", bytes / KB)
        } else if bytes < KB * KB * KB {
            format!("{:.2} MB", bytes / (KB * KB))
        } else {
            format!("{:.2} GB", bytes / (KB * KB * KB))
        }
    }
}

fn is_gguf(path: &Path) -> bool {
    path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("gguf")
}

/// Lists the .gguf files in `directory`, sorted by filename.
///
/// A missing directory is an empty list, not an error.
pub fn scan_models_directory(directory: &Path) -> Result<Vec<ModelInfo>, StorageError> {
    if !directory.is_dir() {
        tracing::warn!("Models directory does not exist: {}", directory.display());
        return Ok(vec![]);
    }

    let mut models = vec![];
    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        if !is_gguf(&path) {
            continue;
        }
        match ModelInfo::from_path(path.clone()) {
            Ok(model_info) => {
                tracing::debug!("Found model: {}", model_info.filename);
                models.push(model_info);
            }
            Err(e) => tracing::warn!("Failed to read model file {:?}: {}", path, e),
        }
    }

    models.sort_by(|a, b| a.filename.cmp(&b.filename));
    tracing::info!("Found {} model(s) in {}", models.len(), directory.display());
    Ok(models)
}

/// Resolves `name` to a model file.
///
/// An existing path is used as is. A bare file name is looked up in
/// `models_dir`, with `.gguf` appended if needed.
pub fn resolve_model_path(name: &str, models_dir: &Path) -> Result<PathBuf, StorageError> {
    let direct = PathBuf::from(name);
    if direct.is_file() {
        return Ok(direct);
    }

    let is_bare = direct.components().count() == 1;
    if is_bare {
        let candidates = [models_dir.join(name), models_dir.join(format!("{name}.gguf"))];
        if let Some(found) = candidates.into_iter().find(|p| p.is_file()) {
            tracing::debug!(path = %found.display(), "Resolved model in models directory");
            return Ok(found);
        }
    }

    Err(StorageError::ModelNotFound(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    #[test]
    fn test_model_info_from_path() {
        let temp_dir = TempDir::new().unwrap();
        let model_path = temp_dir.path().join("test_model.gguf");
        File::create(&model_path).unwrap();

        let model_info = ModelInfo::from_path(model_path.clone()).unwrap();

        assert_eq!(model_info.filename, "test_model.gguf");
        assert_eq!(model_info.path, model_path);
        assert_eq!(model_info.size_bytes, 0);
    }

    #[test]
    fn test_size_string() {
        let model = |size_bytes| ModelInfo {
            path: PathBuf::from("m.gguf"),
            filename: "m.gguf".to_string(),
            size_bytes,
        };

        assert_eq!(model(512).size_string(), "512 B");
        assert_eq!(model(1024).size_string(), "1.00 KB");
        assert!(model(1024 * 1024 * 1024 * 3).size_string().contains("GB"));
    }

    #[test]
    fn test_scan_models_directory() {
        let temp_dir = TempDir::new().unwrap();
        File::create(temp_dir.path().join("zeta.gguf")).unwrap();
        File::create(temp_dir.path().join("alpha.gguf")).unwrap();
        File::create(temp_dir.path().join("not_a_model.txt")).unwrap();
        fs::create_dir(temp_dir.path().join("dir.gguf")).unwrap();

        let models = scan_models_directory(temp_dir.path()).unwrap();

        let names: Vec<&str> = models.iter().map(|m| m.filename.as_str()).collect();
        assert_eq!(names, vec!["alpha.gguf", "zeta.gguf"]);
    }

    #[test]
    fn test_scan_nonexistent_directory() {
        let models = scan_models_directory(Path::new("/this/path/does/not/exist")).unwrap();
        assert!(models.is_empty());
    }

    #[test]
    fn test_resolve_model_path() {
        let temp_dir = TempDir::new().unwrap();
        let model = temp_dir.path().join("tiny.gguf");
        File::create(&model).unwrap();

        assert_eq!(resolve_model_path("tiny.gguf", temp_dir.path()).unwrap(), model);
        assert_eq!(resolve_model_path("tiny", temp_dir.path()).unwrap(), model);

        let absolute = model.to_string_lossy().to_string();
        assert_eq!(
            resolve_model_path(&absolute, Path::new("/elsewhere")).unwrap(),
            model
        );

        assert!(matches!(
            resolve_model_path("missing", temp_dir.path()),
            Err(StorageError::ModelNotFound(_))
        ));
    }
}
