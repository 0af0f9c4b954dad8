use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{DrydockError, Result};

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(DrydockError::IoError)?;

    let mut hasher = Sha256::new();
    let mut buffer = [0; 8192];
    loop {
        let count = file.read(&mut buffer).map_err(DrydockError::IoError)?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Whether the file at `path` exists and hashes to `expected`.
pub fn matches(path: &Path, expected: &str) -> bool {
    path.is_file()
        && sha256_file(path)
            .map(|actual| actual.eq_ignore_ascii_case(expected))
            .unwrap_or(false)
}
