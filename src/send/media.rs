//! Resolution of outbound media: remote URLs, data URLs and server-local
//! files, all bounded by the configured size cap.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::header::CONTENT_TYPE;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use wagate_core::config::MediaConfig;
use wagate_core::error::GatewayError;

const FALLBACK_MIME: &str = "application/octet-stream";

/// Media bytes with the best MIME type we could establish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMedia {
    pub data: Vec<u8>,
    pub mimetype: String,
    pub file_name: Option<String>,
}

/// Guess a MIME type from magic bytes.
pub fn sniff_mime(data: &[u8]) -> Option<&'static str> {
    let starts = |magic: &[u8]| data.starts_with(magic);
    if starts(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if starts(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if starts(b"GIF87a") || starts(b"GIF89a") {
        Some("image/gif")
    } else if starts(b"RIFF") && data.get(8..12) == Some(b"WEBP") {
        Some("image/webp")
    } else if starts(b"%PDF-") {
        Some("application/pdf")
    } else if starts(b"OggS") {
        Some("audio/ogg")
    } else if starts(b"ID3") || starts(&[0xFF, 0xFB]) || starts(&[0xFF, 0xF3]) {
        Some("audio/mpeg")
    } else if data.get(4..8) == Some(b"ftyp") {
        match data.get(8..12) {
            Some(b"M4A ") => Some("audio/mp4"),
            Some(b"qt  ") => Some("video/quicktime"),
            _ => Some("video/mp4"),
        }
    } else if starts(&[0x1A, 0x45, 0xDF, 0xA3]) {
        Some("video/webm")
    } else if starts(b"PK\x03\x04") {
        Some("application/zip")
    } else {
        None
    }
}

/// Pick the declared type, then sniffed bytes, then the server's header.
fn pick_mime(declared: Option<&str>, data: &[u8], header: Option<&str>) -> String {
    declared
        .map(str::to_string)
        .or_else(|| sniff_mime(data).map(str::to_string))
        .or_else(|| {
            header
                .map(|h| h.split(';').next().unwrap_or(h).trim().to_string())
                .filter(|h| !h.is_empty() && h != FALLBACK_MIME)
        })
        .unwrap_or_else(|| FALLBACK_MIME.to_string())
}

#[derive(Clone)]
pub struct MediaFetcher {
    http: reqwest::Client,
    max_bytes: u64,
    local_root: Option<PathBuf>,
}

impl MediaFetcher {
    pub fn new(cfg: &MediaConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.fetch_timeout_secs))
            .user_agent(concat!("wagate/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|e| {
                warn!("media client builder failed, using defaults: {e}");
                reqwest::Client::new()
            });
        let local_root = cfg.local_root.as_deref().and_then(|root| {
            match std::fs::canonicalize(root) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!("media local_root '{root}' is unusable, local paths disabled: {e}");
                    None
                }
            }
        });
        Self {
            http,
            max_bytes: cfg.max_bytes,
            local_root,
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    fn too_large(&self, size: u64) -> GatewayError {
        GatewayError::MediaTooLarge {
            size,
            limit: self.max_bytes,
        }
    }

    /// Load `source` into memory.
    pub async fn resolve(
        &self,
        source: &str,
        declared_mime: Option<&str>,
    ) -> Result<ResolvedMedia, GatewayError> {
        let source = source.trim();
        if let Some(rest) = source.strip_prefix("data:") {
            return self.decode_data_url(rest, declared_mime);
        }
        if source.starts_with("http://") || source.starts_with("https://") {
            return self.fetch_url(source, declared_mime).await;
        }
        if source.starts_with('/') || source.starts_with("file://") {
            return self
                .read_local(source.strip_prefix("file://").unwrap_or(source), declared_mime)
                .await;
        }
        Err(GatewayError::Validation(
            "media must be an http(s) URL, a data URL or a server-local path".into(),
        ))
    }

    fn decode_data_url(
        &self,
        rest: &str,
        declared_mime: Option<&str>,
    ) -> Result<ResolvedMedia, GatewayError> {
        let (meta, payload) = rest
            .split_once(',')
            .ok_or_else(|| GatewayError::Validation("malformed data URL".into()))?;
        let Some(mime) = meta.strip_suffix(";base64") else {
            return Err(GatewayError::Validation(
                "only base64 data URLs are supported".into(),
            ));
        };
        let estimated = (payload.len() as u64 / 4) * 3;
        if estimated > self.max_bytes {
            return Err(self.too_large(estimated));
        }
        let data = STANDARD
            .decode(payload.trim())
            .map_err(|e| GatewayError::Validation(format!("invalid base64 media: {e}")))?;
        if data.len() as u64 > self.max_bytes {
            return Err(self.too_large(data.len() as u64));
        }
        let header = (!mime.is_empty()).then_some(mime);
        Ok(ResolvedMedia {
            mimetype: pick_mime(declared_mime, &data, header),
            data,
            file_name: None,
        })
    }

    async fn fetch_url(
        &self,
        url: &str,
        declared_mime: Option<&str>,
    ) -> Result<ResolvedMedia, GatewayError> {
        let mut resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| GatewayError::MediaFetchFailed(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(GatewayError::MediaFetchFailed(format!(
                "GET {url} returned HTTP {status}"
            )));
        }
        if let Some(len) = resp.content_length() {
            if len > self.max_bytes {
                return Err(self.too_large(len));
            }
        }
        let header = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let file_name = resp
            .url()
            .path_segments()
            .and_then(|mut s| s.next_back())
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let mut data = Vec::new();
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| GatewayError::MediaFetchFailed(e.to_string()))?
        {
            let size = (data.len() + chunk.len()) as u64;
            if size > self.max_bytes {
                return Err(self.too_large(size));
            }
            data.extend_from_slice(&chunk);
        }
        debug!("fetched {} bytes of media from {url}", data.len());
        Ok(ResolvedMedia {
            mimetype: pick_mime(declared_mime, &data, header.as_deref()),
            data,
            file_name,
        })
    }

    async fn read_local(
        &self,
        path: &str,
        declared_mime: Option<&str>,
    ) -> Result<ResolvedMedia, GatewayError> {
        let Some(root) = &self.local_root else {
            return Err(GatewayError::Validation(
                "server-local media paths are disabled".into(),
            ));
        };
        let resolved = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| GatewayError::MediaFetchFailed(format!("{path}: {e}")))?;
        if !resolved.starts_with(root) {
            return Err(GatewayError::Validation(format!(
                "media path '{path}' is outside the allowed directory"
            )));
        }
        let meta = tokio::fs::metadata(&resolved)
            .await
            .map_err(|e| GatewayError::MediaFetchFailed(format!("{path}: {e}")))?;
        if !meta.is_file() {
            return Err(GatewayError::MediaFetchFailed(format!("{path} is not a file")));
        }
        if meta.len() > self.max_bytes {
            return Err(self.too_large(meta.len()));
        }
        let data = tokio::fs::read(&resolved)
            .await
            .map_err(|e| GatewayError::MediaFetchFailed(format!("{path}: {e}")))?;
        Ok(ResolvedMedia {
            mimetype: pick_mime(declared_mime, &data, None),
            file_name: file_name_of(&resolved),
            data,
        })
    }
}

fn file_name_of(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
}
