//! Media handler: downloads generated images/videos using a
//! fresh JWT, emits either an inline base64 data URI or a self-hosted
//! static path, and runs a periodic sweep that deletes old files. The
//! self-hosted base URL is derived from the inbound request's
//! forwarded-proto/host headers so links work behind a reverse proxy.

use std::path::{Path, PathBuf};
use std::time::Duration;

use acctrelay_core::time::now_ts;
use sha2::{Digest, Sha256};

use crate::settings::MediaOutputMode;

#[derive(Debug, Clone)]
pub struct GeneratedFile {
    pub file_id: String,
    pub mime_type: String,
    pub session_path: String,
}

#[derive(Debug)]
pub enum MediaError {
    Download(String),
}

impl std::fmt::Display for MediaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaError::Download(e) => write!(f, "media download failed: {e}"),
        }
    }
}

impl std::error::Error for MediaError {}

pub struct MediaHandler {
    pub media_dir: PathBuf,
    pub upstream_base: String,
}

fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        _ => "bin",
    }
}

fn hash_file_id(file_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_id.as_bytes());
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

impl MediaHandler {
    pub fn new(media_dir: PathBuf, upstream_base: String) -> Self {
        MediaHandler {
            media_dir,
            upstream_base,
        }
    }

    /// Fetch file bytes authenticated with a fresh JWT.
    pub async fn download(
        &self,
        client: &reqwest::Client,
        session_path: &str,
        file_id: &str,
        jwt: &str,
    ) -> Result<bytes::Bytes, MediaError> {
        let url = format!("{}/v1alpha/{}/files/{}:download", self.upstream_base, session_path, file_id);
        let resp = client
            .get(url)
            .bearer_auth(jwt)
            .send()
            .await
            .map_err(|e| MediaError::Download(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(MediaError::Download(format!("status {}", resp.status())));
        }
        resp.bytes().await.map_err(|e| MediaError::Download(e.to_string()))
    }

    /// Persist bytes under the media directory, returning the relative
    /// static path (`/images/<hash>.<ext>` / `/videos/<hash>.<ext>`).
    pub fn persist(&self, file: &GeneratedFile, bytes: &[u8]) -> std::io::Result<String> {
        let is_video = file.mime_type.starts_with("video/");
        let subdir = if is_video { "videos" } else { "images" };
        std::fs::create_dir_all(self.media_dir.join(subdir))?;
        let ext = extension_for_mime(&file.mime_type);
        let name = format!("{}.{ext}", hash_file_id(&file.file_id));
        let path = self.media_dir.join(subdir).join(&name);
        std::fs::write(&path, bytes)?;
        Ok(format!("/{subdir}/{name}"))
    }

    /// Emit the fragment text for a successfully downloaded/persisted file
    /// (Markdown image/data-URI, or an HTML `<video>` fragment).
    pub fn render_fragment(
        &self,
        file: &GeneratedFile,
        mode: MediaOutputMode,
        bytes: &[u8],
        base_url: &str,
    ) -> std::io::Result<String> {
        let is_video = file.mime_type.starts_with("video/");
        match mode {
            MediaOutputMode::InlineBase64 => {
                use base64::engine::general_purpose::STANDARD;
                use base64::Engine;
                let data = STANDARD.encode(bytes);
                if is_video {
                    Ok(format!(
                        "\n\n<video controls src=\"data:{};base64,{data}\"></video>\n",
                        file.mime_type
                    ))
                } else {
                    Ok(format!("\n\n![generated image](data:{};base64,{data})\n", file.mime_type))
                }
            }
            MediaOutputMode::SelfHosted => {
                let rel_path = self.persist(file, bytes)?;
                let url = format!("{base_url}{rel_path}");
                if is_video {
                    Ok(format!("\n\n<video controls src=\"{url}\"></video>\n"))
                } else {
                    Ok(format!("\n\n![generated image]({url})\n"))
                }
            }
        }
    }

    /// Sweeper: delete files whose mtime is older than `max_age`.
    pub fn sweep_once(&self, max_age: Duration) -> std::io::Result<usize> {
        let mut removed = 0;
        for subdir in ["images", "videos"] {
            let dir = self.media_dir.join(subdir);
            if !dir.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let Ok(metadata) = entry.metadata() else { continue };
                let Ok(modified) = metadata.modified() else { continue };
                let age = modified.elapsed().unwrap_or_default();
                if age > max_age {
                    let _ = std::fs::remove_file(&path);
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// Derive the self-hosted base URL from forwarded-proto/host headers
/// falling back to the request's own host/scheme.
pub fn derive_base_url(forwarded_proto: Option<&str>, forwarded_host: Option<&str>, host: &str) -> String {
    let proto = forwarded_proto.unwrap_or("http");
    let host = forwarded_host.unwrap_or(host);
    format!("{proto}://{host}")
}

pub fn spawn_sweeper(media_dir: PathBuf, interval_secs: u64, max_age_secs: i64) {
    std::thread::spawn(move || {
        let handler = MediaHandler::new(media_dir, String::new());
        crate::poll_loop::run_blocking_poll_loop(
            "media_sweep",
            Duration::from_secs(interval_secs),
            Duration::from_secs(5),
            Duration::from_secs(3600),
            || {
                handler
                    .sweep_once(Duration::from_secs(max_age_secs.max(0) as u64))
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            },
            |_| true,
        );
    });
}

pub fn now_epoch() -> i64 {
    now_ts()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_base_url_prefers_forwarded_headers() {
        let url = derive_base_url(Some("https"), Some("public.example"), "127.0.0.1:8080");
        assert_eq!(url, "https://public.example");
    }

    #[test]
    fn derive_base_url_falls_back_to_host() {
        let url = derive_base_url(None, None, "localhost:8080");
        assert_eq!(url, "http://localhost:8080");
    }

    #[test]
    fn persist_writes_under_expected_subdir() {
        let dir = std::env::temp_dir().join(format!("acctrelay-media-test-{}", now_ts()));
        let handler = MediaHandler::new(dir.clone(), String::new());
        let file = GeneratedFile {
            file_id: "f1".to_string(),
            mime_type: "image/png".to_string(),
            session_path: "projects/p/sessions/s".to_string(),
        };
        let rel = handler.persist(&file, b"fake-png-bytes").expect("persist");
        assert!(rel.starts_with("/images/"));
        assert!(rel.ends_with(".png"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn sweep_once_removes_only_stale_files() {
        let dir = std::env::temp_dir().join(format!("acctrelay-media-sweep-test-{}", now_ts()));
        std::fs::create_dir_all(dir.join("images")).unwrap();
        std::fs::write(dir.join("images").join("fresh.png"), b"x").unwrap();
        let handler = MediaHandler::new(dir.clone(), String::new());
        let removed = handler.sweep_once(Duration::from_secs(3600)).expect("sweep");
        assert_eq!(removed, 0);
        assert!(dir.join("images").join("fresh.png").is_file());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[allow(dead_code)]
    fn path_exists(path: &Path) -> bool {
        path.exists()
    }
}
