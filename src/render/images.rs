use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::TypesetterSettings;
use crate::Result;

/// A fixed 1x1 gray PNG substituted whenever an image cannot be
/// fetched. A render never fails because an image is unreachable.
pub const PLACEHOLDER_PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x00, 0x00, 0x00, 0x00, 0x3a,
    0x7e, 0x9b, 0x55, 0x00, 0x00, 0x00, 0x0a, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x68,
    0x00, 0x00, 0x00, 0x82, 0x00, 0x81, 0x77, 0xcd, 0x72, 0xb6, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

pub const PLACEHOLDER_FILE: &str = "placeholder.png";

/// Stable cache key for a source URL.
pub fn url_hash(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

/// Workdir-relative filename an image URL is staged under. Keeps the
/// source extension so the typesetter can sniff the format.
pub fn staged_name(url: &str) -> String {
    let ext = url
        .rsplit('/')
        .next()
        .and_then(|seg| seg.rsplit_once('.'))
        .map(|(_, e)| e.to_ascii_lowercase())
        .filter(|e| matches!(e.as_str(), "png" | "jpg" | "jpeg" | "gif" | "svg" | "webp"))
        .unwrap_or_else(|| "png".to_string());
    format!("img-{}.{ext}", &url_hash(url)[..16])
}

/// Disk-backed image fetch cache shared by all renders. Entries carry a
/// sidecar expiry stamp; a background sweeper removes aged files.
pub struct ImageCache {
    dir: PathBuf,
    max_age: Duration,
    max_bytes: u64,
    client: reqwest::Client,
}

impl ImageCache {
    /// An empty configured directory selects a process-private ephemeral
    /// location with no cross-process sharing.
    pub fn new(settings: &TypesetterSettings) -> Result<Self> {
        let dir = if settings.image_cache_dir.is_empty() {
            std::env::temp_dir().join(format!("docsmith-images-{}", Uuid::new_v4()))
        } else {
            PathBuf::from(&settings.image_cache_dir)
        };
        std::fs::create_dir_all(&dir)?;
        let placeholder = dir.join(PLACEHOLDER_FILE);
        if !placeholder.exists() {
            std::fs::write(&placeholder, PLACEHOLDER_PNG)?;
        }
        let client = reqwest::Client::builder()
            .timeout(settings.image_fetch_timeout())
            .build()
            .map_err(|e| crate::EngineError::Internal(e.to_string()))?;
        Ok(Self {
            dir,
            max_age: settings.image_cache_max_age(),
            max_bytes: settings.image_max_bytes,
            client,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn placeholder_path(&self) -> PathBuf {
        self.dir.join(PLACEHOLDER_FILE)
    }

    /// Returns a local path holding the image bytes for `url`. Failures
    /// of any kind degrade to the placeholder.
    pub async fn fetch(&self, url: &str) -> PathBuf {
        if url.is_empty() {
            return self.placeholder_path();
        }
        let hash = url_hash(url);
        let path = self.dir.join(&hash);
        if self.is_fresh(&path) {
            return path;
        }
        match self.download(url, &path).await {
            Ok(()) => path,
            Err(error) => {
                warn!(url = %url, error = %error, "image fetch failed, substituting placeholder");
                self.placeholder_path()
            }
        }
    }

    fn is_fresh(&self, path: &Path) -> bool {
        if !path.exists() {
            return false;
        }
        match std::fs::read_to_string(meta_path(path)) {
            Ok(stamp) => stamp
                .trim()
                .parse::<u64>()
                .map(|expiry| expiry > unix_now())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn download(&self, url: &str, path: &Path) -> std::result::Result<(), String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("status {}", response.status()));
        }
        if let Some(len) = response.content_length() {
            if len > self.max_bytes {
                return Err(format!("body of {len} bytes exceeds cap"));
            }
        }
        let bytes = response.bytes().await.map_err(|e| e.to_string())?;
        if bytes.len() as u64 > self.max_bytes {
            return Err(format!("body of {} bytes exceeds cap", bytes.len()));
        }
        std::fs::write(path, &bytes).map_err(|e| e.to_string())?;
        let expiry = unix_now() + self.max_age.as_secs();
        std::fs::write(meta_path(path), expiry.to_string()).map_err(|e| e.to_string())?;
        debug!(url = %url, bytes = bytes.len(), "image cached");
        Ok(())
    }

    /// Deletes entries past their expiry stamp. Run periodically by the
    /// engine's background sweeper.
    pub fn sweep(&self) -> usize {
        let mut removed = 0;
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        let now = unix_now();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name == PLACEHOLDER_FILE || name.ends_with(".meta") {
                continue;
            }
            let expired = match std::fs::read_to_string(meta_path(&path)) {
                Ok(stamp) => stamp
                    .trim()
                    .parse::<u64>()
                    .map(|expiry| expiry <= now)
                    .unwrap_or(true),
                Err(_) => true,
            };
            if expired {
                let _ = std::fs::remove_file(meta_path(&path));
                if std::fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
        removed
    }
}

fn meta_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".meta");
    PathBuf::from(name)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(dir: &Path, max_age: u64) -> TypesetterSettings {
        TypesetterSettings {
            image_cache_dir: dir.to_string_lossy().to_string(),
            image_cache_max_age_seconds: max_age,
            image_fetch_timeout_seconds: 1,
            ..Default::default()
        }
    }

    #[test]
    fn staged_names_keep_known_extensions() {
        assert!(staged_name("https://cdn.example/logo.png").ends_with(".png"));
        assert!(staged_name("https://cdn.example/photo.JPG").ends_with(".jpg"));
        assert!(staged_name("https://cdn.example/logo").ends_with(".png"));
        assert_ne!(
            staged_name("https://a.example/x.png"),
            staged_name("https://b.example/x.png")
        );
    }

    #[tokio::test]
    async fn unreachable_url_yields_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(&settings(dir.path(), 60)).unwrap();
        let path = cache
            .fetch("http://127.0.0.1:1/never-there.png")
            .await;
        assert_eq!(path, cache.placeholder_path());
        assert_eq!(std::fs::read(path).unwrap(), PLACEHOLDER_PNG);
    }

    #[tokio::test]
    async fn fetches_and_reuses_cached_bytes() {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_ip().unwrap();
        let hits = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let server_hits = std::sync::Arc::clone(&hits);
        let handle = std::thread::spawn(move || {
            // Serve at most two requests; the test should only need one.
            for _ in 0..2 {
                let Ok(Some(request)) = server.recv_timeout(Duration::from_secs(2)) else {
                    return;
                };
                server_hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let _ = request.respond(tiny_http::Response::from_data(vec![1u8, 2, 3]));
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(&settings(dir.path(), 60)).unwrap();
        let url = format!("http://{addr}/pic.png");
        let first = cache.fetch(&url).await;
        assert_eq!(std::fs::read(&first).unwrap(), vec![1, 2, 3]);
        let second = cache.fetch(&url).await;
        assert_eq!(first, second);
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn sweep_removes_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(&settings(dir.path(), 60)).unwrap();
        let stale = dir.path().join("deadbeef");
        std::fs::write(&stale, b"old").unwrap();
        std::fs::write(meta_path(&stale), "1").unwrap();
        let fresh = dir.path().join("cafef00d");
        std::fs::write(&fresh, b"new").unwrap();
        std::fs::write(meta_path(&fresh), (unix_now() + 600).to_string()).unwrap();

        assert_eq!(cache.sweep(), 1);
        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(cache.placeholder_path().exists());
    }
}
