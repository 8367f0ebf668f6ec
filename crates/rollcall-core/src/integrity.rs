//! Integrity checks for ONNX model files.
//!
//! Models are verified against pinned SHA-256 digests before a session is
//! built from them; a tampered or half-downloaded file falls back to the
//! classical encoder instead of producing silently wrong embeddings.

use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Pinned model file: expected name, download source and SHA-256 digest.
pub struct ModelSpec {
    pub name: &'static str,
    pub url: &'static str,
    pub sha256: &'static str,
}

/// Detection model (SCRFD, insightface buffalo_l export).
pub const DETECTOR_MODEL: ModelSpec = ModelSpec {
    name: "det_10g.onnx",
    url: "https://huggingface.co/public-data/insightface/resolve/main/models/buffalo_l/det_10g.onnx",
    sha256: "5838f7fe053675b1c7a08b633df49e7af5495cee0493c7dcf6697200b85b5b91",
};

/// Embedding model (ArcFace w600k_r50, insightface buffalo_l export).
pub const EMBEDDER_MODEL: ModelSpec = ModelSpec {
    name: "w600k_r50.onnx",
    url: "https://huggingface.co/public-data/insightface/resolve/main/models/buffalo_l/w600k_r50.onnx",
    sha256: "4c06341c33c2ca1f86781dab0e829f88ad5b64be9fba56e56bc9ebdefc619e43",
};

#[derive(Error, Debug)]
pub enum ModelIntegrityError {
    #[error("model file not found: {name} ({path}) — download from {url}")]
    Missing {
        name: &'static str,
        path: PathBuf,
        url: &'static str,
    },

    #[error("failed to read model file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("model checksum mismatch for {name}: expected {expected}, got {got}")]
    ChecksumMismatch {
        name: &'static str,
        expected: String,
        got: String,
    },
}

impl ModelSpec {
    /// Resolve this model inside a directory and verify its digest.
    pub fn verify_in(&self, model_dir: &Path) -> Result<PathBuf, ModelIntegrityError> {
        let path = model_dir.join(self.name);
        if !path.exists() {
            return Err(ModelIntegrityError::Missing {
                name: self.name,
                path,
                url: self.url,
            });
        }

        let digest = sha256_file_hex(&path)?;
        if digest != self.sha256 {
            return Err(ModelIntegrityError::ChecksumMismatch {
                name: self.name,
                expected: self.sha256.to_string(),
                got: digest,
            });
        }
        Ok(path)
    }
}

fn sha256_file_hex(path: &Path) -> Result<String, ModelIntegrityError> {
    let mut file = fs::File::open(path).map_err(|source| ModelIntegrityError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf).map_err(|source| ModelIntegrityError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "rollcall-integrity-{tag}-{}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn missing_model_is_reported_with_source_url() {
        let dir = temp_dir("missing");
        let err = DETECTOR_MODEL.verify_in(&dir).unwrap_err();
        assert!(matches!(err, ModelIntegrityError::Missing { .. }));
        assert!(err.to_string().contains("huggingface.co"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn wrong_content_fails_checksum() {
        let dir = temp_dir("mismatch");
        fs::write(dir.join(DETECTOR_MODEL.name), b"not a model").unwrap();
        let err = DETECTOR_MODEL.verify_in(&dir).unwrap_err();
        assert!(matches!(err, ModelIntegrityError::ChecksumMismatch { .. }));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn matching_digest_passes() {
        let dir = temp_dir("match");
        let path = dir.join("fake.onnx");
        fs::write(&path, b"hello").unwrap();
        let digest = sha256_file_hex(&path).unwrap();
        assert_eq!(
            digest,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        let _ = fs::remove_dir_all(&dir);
    }
}
