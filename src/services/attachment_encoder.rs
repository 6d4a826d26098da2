use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use thiserror::Error;
use tracing::warn;

const FALLBACK_MIME: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("Failed to fetch attachment {url}: {reason}")]
    FetchFailed { url: String, reason: String },
}

/// A model-ready attachment: media type plus raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedAttachment {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl EncodedAttachment {
    pub fn base64_data(&self) -> String {
        BASE64_STANDARD.encode(&self.data)
    }

    pub fn to_data_uri(&self) -> String {
        to_data_uri(&self.mime_type, &self.data)
    }
}

/// Self-describing inline reference for a payload.
pub fn to_data_uri(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{mime_type};base64,{}", BASE64_STANDARD.encode(bytes))
}

/// Decode an inline `data:` reference. Synchronous, no network I/O.
/// Returns `None` for anything that is not a well-formed base64 data URI.
pub fn decode_inline(reference: &str) -> Option<EncodedAttachment> {
    let rest = reference.strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(',')?;
    let mime = meta.strip_suffix(";base64")?;
    let data = BASE64_STANDARD.decode(payload).ok()?;
    let mime_type = if mime.is_empty() {
        FALLBACK_MIME.to_string()
    } else {
        mime.to_string()
    };
    Some(EncodedAttachment { mime_type, data })
}

fn is_url(reference: &str) -> bool {
    reference.starts_with("http://") || reference.starts_with("https://")
}

/// Normalize an attachment reference into a `(mime type, data)` pair.
///
/// Inline data URIs decode synchronously; URLs are fetched and re-encoded.
/// A failed fetch is `FetchFailed`; the caller decides fallback policy.
/// References that are neither inline nor a URL are treated as absent.
pub async fn encode(
    reference: &str,
    http: &reqwest::Client,
) -> Result<Option<EncodedAttachment>, AttachmentError> {
    if reference.starts_with("data:") {
        let decoded = decode_inline(reference);
        if decoded.is_none() {
            warn!("Discarding malformed inline attachment reference");
        }
        return Ok(decoded);
    }

    if !is_url(reference) {
        return Ok(None);
    }

    let response = http
        .get(reference)
        .send()
        .await
        .map_err(|e| AttachmentError::FetchFailed {
            url: reference.to_string(),
            reason: e.to_string(),
        })?;

    if !response.status().is_success() {
        return Err(AttachmentError::FetchFailed {
            url: reference.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let mime_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| FALLBACK_MIME.to_string());

    let data = response
        .bytes()
        .await
        .map_err(|e| AttachmentError::FetchFailed {
            url: reference.to_string(),
            reason: format!("Failed to read response body: {e}"),
        })?
        .to_vec();

    Ok(Some(EncodedAttachment { mime_type, data }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_inline_round_trip() {
        let uri = to_data_uri("image/png", &[1, 2, 3, 4]);
        let decoded = decode_inline(&uri).unwrap();
        assert_eq!(decoded.mime_type, "image/png");
        assert_eq!(decoded.data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_decode_inline_rejects_non_base64_shapes() {
        assert!(decode_inline("data:text/plain,hello").is_none());
        assert!(decode_inline("data:image/png;base64,not-base64!!!").is_none());
        assert!(decode_inline("file:///tmp/cat.png").is_none());
    }

    #[tokio::test]
    async fn test_unknown_shape_is_absent_not_error() {
        let http = reqwest::Client::new();
        let result = encode("gs://bucket/object", &http).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_inline_encode_needs_no_network() {
        let http = reqwest::Client::new();
        let uri = to_data_uri("application/pdf", b"%PDF-");
        let encoded = encode(&uri, &http).await.unwrap().unwrap();
        assert_eq!(encoded.mime_type, "application/pdf");
    }

    #[tokio::test]
    async fn test_unreachable_url_is_fetch_failed() {
        let http = reqwest::Client::new();
        let result = encode("http://127.0.0.1:1/missing.png", &http).await;
        assert!(matches!(
            result,
            Err(AttachmentError::FetchFailed { .. })
        ));
    }
}
