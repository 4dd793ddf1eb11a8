//! GGUF model file probing.
//!
//! The gateway does not parse tensors; it only needs to know that the file
//! the operator pointed at is a plausible GGUF model and how large it is,
//! which feeds the GPU-layer heuristic at startup.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::RuntimeError;

/// Little-endian "GGUF".
const GGUF_MAGIC: [u8; 4] = *b"GGUF";

/// Result of probing a model file on disk.
#[derive(Debug, Clone)]
pub struct ModelFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub version: u32,
}

/// Validate the GGUF header of `path` and report its size.
pub fn probe(path: &Path) -> Result<ModelFile, RuntimeError> {
    let mut file = File::open(path)
        .map_err(|e| RuntimeError::ModelLoad(format!("{}: {}", path.display(), e)))?;

    let mut header = [0u8; 8];
    file.read_exact(&mut header)
        .map_err(|e| RuntimeError::ModelLoad(format!("{}: short read: {}", path.display(), e)))?;

    if header[..4] != GGUF_MAGIC {
        return Err(RuntimeError::ModelLoad(format!(
            "{}: not a GGUF file",
            path.display()
        )));
    }

    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version == 0 {
        return Err(RuntimeError::ModelLoad(format!(
            "{}: invalid GGUF version 0",
            path.display()
        )));
    }

    let size_bytes = file
        .metadata()
        .map_err(|e| RuntimeError::ModelLoad(format!("{}: {}", path.display(), e)))?
        .len();

    Ok(ModelFile {
        path: path.to_path_buf(),
        size_bytes,
        version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_model(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        path
    }

    #[test]
    fn test_probe_valid_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"GGUF");
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 128]);
        let path = write_model(&dir, "model.gguf", &bytes);

        let probed = probe(&path).unwrap();
        assert_eq!(probed.version, 3);
        assert_eq!(probed.size_bytes, bytes.len() as u64);
    }

    #[test]
    fn test_probe_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_model(&dir, "model.gguf", b"NOTAGGUFFILE");

        let err = probe(&path).unwrap_err();
        assert!(err.to_string().contains("not a GGUF file"));
    }

    #[test]
    fn test_probe_rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_model(&dir, "model.gguf", b"GG");

        assert!(probe(&path).is_err());
    }

    #[test]
    fn test_probe_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.gguf");

        assert!(probe(&path).is_err());
    }

    #[test]
    fn test_probe_rejects_version_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"GGUF");
        bytes.extend_from_slice(&0u32.to_le_bytes());
        let path = write_model(&dir, "model.gguf", &bytes);

        let err = probe(&path).unwrap_err();
        assert!(err.to_string().contains("version 0"));
    }
}
