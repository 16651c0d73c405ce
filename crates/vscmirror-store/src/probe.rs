use crate::StoreError;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// SHA-256 of a file's contents, streamed in fixed chunks.
pub fn file_sha256(path: &Path) -> Result<String, StoreError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Satisfaction probe: does `path` already hold the expected payload?
///
/// A missing file, a size mismatch, or a digest mismatch all answer `false`
/// (a corrupted file is treated as absent, so the caller re-downloads). When
/// no expectations are given, bare existence is enough.
pub fn satisfies(path: &Path, expected_size: Option<u64>, expected_sha256: Option<&str>) -> bool {
    let Ok(meta) = path.metadata() else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    if let Some(size) = expected_size {
        if meta.len() != size {
            return false;
        }
    }
    if let Some(expected) = expected_sha256 {
        match file_sha256(path) {
            Ok(actual) => {
                if !actual.eq_ignore_ascii_case(expected) {
                    return false;
                }
            }
            Err(_) => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    // sha256("hello world")
    const HELLO_SHA: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn sha256_of_known_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"hello world").unwrap();
        assert_eq!(file_sha256(&path).unwrap(), HELLO_SHA);
    }

    #[test]
    fn satisfies_checks_existence_size_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"hello world").unwrap();

        assert!(satisfies(&path, None, None));
        assert!(satisfies(&path, Some(11), None));
        assert!(satisfies(&path, Some(11), Some(HELLO_SHA)));
        // upstream hashes sometimes arrive uppercased
        assert!(satisfies(&path, None, Some(&HELLO_SHA.to_uppercase())));

        assert!(!satisfies(&path, Some(10), None), "size mismatch is absent");
        assert!(!satisfies(&path, None, Some(&"0".repeat(64))), "hash mismatch is absent");
        assert!(!satisfies(&dir.path().join("missing"), None, None));
    }

    #[test]
    fn satisfies_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!satisfies(dir.path(), None, None));
    }
}
