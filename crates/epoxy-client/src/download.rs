//! Artifact download with integrity checking.
//!
//! Boot artifacts (kernels, initramfs images) can be large and the links to
//! them slow, so downloads stream to disk, log progress at a steady cadence,
//! and verify a SHA-256 checksum when the file spec carries one.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

/// How often download progress is logged.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Errors raised while fetching a file.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The HTTP request failed outright.
    #[error("download of {url} failed: {detail}")]
    Http {
        /// The requested URL.
        url: String,
        /// Transport-level detail.
        detail: String,
    },

    /// The server answered with a non-success status.
    #[error("bad status code for {url}: got {status}, expected 200")]
    BadStatus {
        /// The requested URL.
        url: String,
        /// The status received.
        status: u16,
    },

    /// The `sha256` value in the file spec is not valid lowercase hex.
    #[error("invalid sha256 {checksum:?}: {detail}")]
    BadChecksum {
        /// The checksum as given.
        checksum: String,
        /// Decoding detail.
        detail: String,
    },

    /// The downloaded bytes do not hash to the expected value.
    #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// The requested URL.
        url: String,
        /// The expected digest, lowercase hex.
        expected: String,
        /// The actual digest, lowercase hex.
        actual: String,
    },

    /// Writing the local file failed.
    #[error("writing download: {0}")]
    Io(#[from] std::io::Error),
}

/// Streams `url` into `dest`, verifying `sha256` when present.
///
/// Progress is logged every few seconds. The destination file is left in
/// place on failure; callers own deletion through their cleanup list.
///
/// # Errors
///
/// Fails on transport errors, non-2xx statuses, local I/O errors, an
/// undecodable checksum, or a digest mismatch over the full body.
pub fn fetch_to_file(
    client: &reqwest::blocking::Client,
    url: &str,
    dest: &Path,
    sha256: Option<&str>,
) -> Result<(), DownloadError> {
    let expected = sha256
        .map(|checksum| {
            hex::decode(checksum).map_err(|err| DownloadError::BadChecksum {
                checksum: checksum.to_string(),
                detail: err.to_string(),
            })
        })
        .transpose()?;

    info!(url, dest = %dest.display(), "download starting");
    let mut response = client
        .get(url)
        .send()
        .map_err(|err| DownloadError::Http { url: url.to_string(), detail: err.to_string() })?;
    if !response.status().is_success() {
        return Err(DownloadError::BadStatus {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }
    let total = response.content_length();

    let mut file = File::create(dest)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut transferred: u64 = 0;
    let mut last_progress = Instant::now();

    loop {
        let n = response
            .read(&mut buf)
            .map_err(|err| DownloadError::Http { url: url.to_string(), detail: err.to_string() })?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
        hasher.update(&buf[..n]);
        transferred += n as u64;

        if last_progress.elapsed() >= PROGRESS_INTERVAL {
            match total {
                Some(total) if total > 0 => info!(
                    "  transferred {transferred} / {total} bytes ({:.2}%)",
                    100.0 * transferred as f64 / total as f64
                ),
                _ => info!("  transferred {transferred} bytes"),
            }
            last_progress = Instant::now();
        }
    }
    file.flush()?;

    if let Some(expected) = expected {
        let actual = hasher.finalize();
        if actual.as_slice() != expected.as_slice() {
            return Err(DownloadError::ChecksumMismatch {
                url: url.to_string(),
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            });
        }
    }

    info!(dest = %dest.display(), transferred, "download saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;

    /// Serves `body` at `/file` from a background tokio runtime, returning
    /// the listener address.
    fn serve_bytes(body: &'static [u8]) -> SocketAddr {
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            runtime.block_on(async move {
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
                tx.send(listener.local_addr().unwrap()).unwrap();
                let app = axum::Router::new()
                    .route("/file", axum::routing::get(move || async move { body }));
                axum::serve(listener, app).await.unwrap();
            });
        });
        rx.recv().unwrap()
    }

    fn digest(body: &[u8]) -> String {
        hex::encode(Sha256::digest(body))
    }

    #[test]
    fn download_verifies_matching_checksum() {
        let addr = serve_bytes(b"boot-image-bytes");
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("image");

        let client = reqwest::blocking::Client::new();
        fetch_to_file(
            &client,
            &format!("http://{addr}/file"),
            &dest,
            Some(&digest(b"boot-image-bytes")),
        )
        .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"boot-image-bytes");
    }

    #[test]
    fn download_without_checksum_skips_verification() {
        let addr = serve_bytes(b"anything");
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("image");

        let client = reqwest::blocking::Client::new();
        fetch_to_file(&client, &format!("http://{addr}/file"), &dest, None).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"anything");
    }

    #[test]
    fn checksum_mismatch_is_fatal() {
        let addr = serve_bytes(b"tampered-bytes");
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("image");

        let client = reqwest::blocking::Client::new();
        let err = fetch_to_file(
            &client,
            &format!("http://{addr}/file"),
            &dest,
            Some(&digest(b"expected-bytes")),
        )
        .unwrap_err();
        assert!(matches!(err, DownloadError::ChecksumMismatch { .. }));
    }

    #[test]
    fn invalid_checksum_string_is_fatal() {
        let client = reqwest::blocking::Client::new();
        let dir = tempfile::tempdir().unwrap();
        let err = fetch_to_file(&client, "http://unused", &dir.path().join("x"), Some("zz"))
            .unwrap_err();
        assert!(matches!(err, DownloadError::BadChecksum { .. }));
    }

    #[test]
    fn non_success_status_is_fatal() {
        let addr = serve_bytes(b"ignored");
        let dir = tempfile::tempdir().unwrap();
        let client = reqwest::blocking::Client::new();
        let err = fetch_to_file(
            &client,
            &format!("http://{addr}/missing"),
            &dir.path().join("x"),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, DownloadError::BadStatus { status: 404, .. }));
    }
}
