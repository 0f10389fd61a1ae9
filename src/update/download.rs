//! Streaming download of release installers.

use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;

use super::{DownloadProgress, UpdateError};

/// Minimum time between progress reports
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Suffix of the in-progress download file
const TEMP_SUFFIX: &str = "part";

/// Result of a successful download
#[derive(Debug)]
pub struct DownloadResult {
    pub file_path: PathBuf,
    pub bytes: u64,
}

/// Download `url` to `dest_path`, reporting progress along the way.
///
/// Downloads to a `.part` temporary file, then renames on success.
pub async fn download_asset<F>(
    client: &reqwest::Client,
    url: &str,
    dest_path: &Path,
    mut on_progress: F,
) -> Result<DownloadResult, UpdateError>
where
    F: FnMut(DownloadProgress),
{
    let download_start = Instant::now();

    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(UpdateError::Api {
            status: response.status().as_u16(),
            body: response
                .status()
                .canonical_reason()
                .unwrap_or("Unknown error")
                .to_string(),
        });
    }

    let total_size = response.content_length().unwrap_or(0);
    on_progress(DownloadProgress {
        total_bytes: total_size,
        ..Default::default()
    });

    if let Some(parent) = dest_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let temp_path = temp_path_for(dest_path);
    let written = match write_body(response, &temp_path, total_size, &mut on_progress).await {
        Ok(written) => tokio::fs::rename(&temp_path, dest_path)
            .await
            .map(|()| written)
            .map_err(UpdateError::from),
        Err(e) => Err(e),
    };
    let downloaded = match written {
        Ok(downloaded) => downloaded,
        Err(e) => {
            if let Err(cleanup) = tokio::fs::remove_file(&temp_path).await {
                tracing::debug!("Could not remove {}: {}", temp_path.display(), cleanup);
            }
            return Err(e);
        }
    };

    let elapsed = download_start.elapsed().as_secs_f32();
    tracing::info!(
        "Download complete: {:.1} MB in {:.1}s",
        downloaded as f32 / 1_000_000.0,
        elapsed
    );

    Ok(DownloadResult {
        file_path: dest_path.to_path_buf(),
        bytes: downloaded,
    })
}

/// Stream the response body into `temp_path`; returns the byte count
async fn write_body<F>(
    response: reqwest::Response,
    temp_path: &Path,
    total_size: u64,
    on_progress: &mut F,
) -> Result<u64, UpdateError>
where
    F: FnMut(DownloadProgress),
{
    let mut file = tokio::fs::File::create(temp_path).await?;

    // Stream the response body to disk
    let mut stream = response.bytes_stream();
    let mut downloaded: u64 = 0;
    let mut last_progress_time = Instant::now();
    let mut last_downloaded: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result?;
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;

        let now = Instant::now();
        let elapsed = now.duration_since(last_progress_time);
        if elapsed >= PROGRESS_INTERVAL {
            let bytes_since_last = downloaded - last_downloaded;
            on_progress(DownloadProgress {
                bytes_downloaded: downloaded,
                total_bytes: total_size,
                bytes_per_second: (bytes_since_last as f64 / elapsed.as_secs_f64()) as u64,
            });
            last_downloaded = downloaded;
            last_progress_time = now;
        }
    }

    file.sync_all().await?;
    drop(file);

    on_progress(DownloadProgress {
        bytes_downloaded: downloaded,
        total_bytes: total_size.max(downloaded),
        bytes_per_second: 0,
    });

    Ok(downloaded)
}

fn temp_path_for(dest_path: &Path) -> PathBuf {
    let mut name = dest_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(TEMP_SUFFIX);
    dest_path.with_file_name(name)
}

/// Get the download cache directory.
pub fn download_dir() -> anyhow::Result<PathBuf> {
    let download_dir = crate::config::data_dir()?.join("downloads");
    std::fs::create_dir_all(&download_dir)?;
    Ok(download_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_path_keeps_extension() {
        let temp = temp_path_for(Path::new("/tmp/downloads/Launcher-1.4.0.dmg"));
        assert_eq!(temp, Path::new("/tmp/downloads/Launcher-1.4.0.dmg.part"));
    }

    /// Serve one response that promises more bytes than it sends
    fn truncated_server() -> u16 {
        use std::io::{Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0u8; 1024];
            let _ = stream.read(&mut request);
            let _ = stream.write_all(
                b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\nConnection: close\r\n\r\nonly-a-few-bytes",
            );
        });
        port
    }

    #[tokio::test]
    async fn test_interrupted_download_removes_partial_file() {
        let port = truncated_server();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("installer.exe");

        let result = download_asset(
            &reqwest::Client::new(),
            &format!("http://127.0.0.1:{}/installer.exe", port),
            &dest,
            |_| {},
        )
        .await;

        assert!(matches!(result, Err(UpdateError::Http(_))));
        assert!(!dest.exists());
        assert!(!temp_path_for(&dest).exists());
    }

    #[tokio::test]
    async fn test_refused_connection_is_http_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("installer.exe");
        let client = reqwest::Client::new();
        let mut reports = 0;

        let result = download_asset(
            &client,
            &format!("http://127.0.0.1:{}/installer.exe", port),
            &dest,
            |_| reports += 1,
        )
        .await;

        assert!(matches!(result, Err(UpdateError::Http(_))));
        assert_eq!(reports, 0);
        assert!(!dest.exists());
    }
}
