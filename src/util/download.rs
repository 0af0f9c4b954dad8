use std::io::{Read, Write};
use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::Client;
use tracing::info;

use crate::error::{DrydockError, Result};

/// Download a file from `url` to `dest` atomically.
///
/// The data is first written to a temporary file beside `dest` and renamed
/// into place on success, so an interrupted download never leaves a
/// truncated archive in the shard store. `file://` URLs are copied.
pub fn download_file(url: &str, dest: &Path, timeout: u64, verbose: bool) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(DrydockError::IoError)?;
    }

    if let Some(path_str) = url.strip_prefix("file://") {
        let src_path = Path::new(path_str);
        if !src_path.is_file() {
            return Err(DrydockError::NetworkError(format!(
                "local path not found: {}",
                path_str
            )));
        }
        std::fs::copy(src_path, dest).map_err(DrydockError::IoError)?;
        return Ok(());
    }

    let client = Client::builder()
        .user_agent(concat!("drydock/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(std::time::Duration::from_secs(timeout))
        .timeout(std::time::Duration::from_secs(timeout))
        .build()
        .map_err(|e| DrydockError::NetworkError(format!("failed to create client: {}", e)))?;

    let mut response = client.get(url).send().map_err(|e| {
        DrydockError::NetworkError(format!("failed to send request to {}: {}", url, e))
    })?;

    if !response.status().is_success() {
        return Err(DrydockError::NetworkError(format!(
            "failed to download from {}: status {}",
            url,
            response.status()
        )));
    }

    let total_size = response.content_length().unwrap_or(0);

    let pb = if verbose {
        info!("Downloading {}", url);
        let pb = ProgressBar::new(total_size);
        if let Ok(style) = ProgressStyle::default_bar().template(
            "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})",
        ) {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    } else {
        ProgressBar::hidden()
    };

    let dest_dir = dest.parent().unwrap_or(Path::new("."));
    let tmp_file = tempfile::NamedTempFile::new_in(dest_dir).map_err(DrydockError::IoError)?;
    let mut file = tmp_file.as_file().try_clone().map_err(DrydockError::IoError)?;

    let mut downloaded: u64 = 0;
    let mut buffer = [0; 8192];

    loop {
        let n = response.read(&mut buffer).map_err(DrydockError::IoError)?;
        if n == 0 {
            break;
        }
        file.write_all(&buffer[..n]).map_err(DrydockError::IoError)?;
        downloaded += n as u64;
        pb.set_position(downloaded);
    }

    pb.finish_and_clear();

    tmp_file
        .persist(dest)
        .map_err(|e| DrydockError::IoError(e.error))?;

    Ok(())
}
