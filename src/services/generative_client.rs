use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::models::provider_config::{ImageRoute, ProviderConfig};

use super::turn_composer::ComposedRequest;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Request timeout in seconds. Streams are bounded by the read timeout of the
/// underlying transport, not an engine-level deadline.
const REQUEST_TIMEOUT_SECS: u64 = 300;

const FALLBACK_IMAGE_MIME: &str = "image/png";

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("Request to model provider failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Model provider rejected the request (HTTP {status}): {message}")]
    Provider { status: u16, message: String },

    #[error("Malformed provider response: {message}")]
    MalformedResponse { message: String },

    #[error(
        "Model '{model}' declined to generate an image: {text}. Configure an image-capable model and try again."
    )]
    GenerationDeclined { model: String, text: String },

    #[error("Model '{model}' returned text where an image was expected: {text}")]
    UnexpectedTextResponse { model: String, text: String },

    #[error("Model '{model}' returned no image data")]
    NoImageData { model: String },
}

/// Stream chunks emitted during responses.
///
/// Exactly one terminal chunk (`Done` xor `Error`) is emitted per stream;
/// nothing follows a terminal chunk.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Text(String),
    Done,
    Error(String),
}

/// Type alias for response streams
pub type ResponseStream = BoxStream<'static, Result<StreamChunk>>;

/// Cooperative cancellation handle for an in-flight stream.
///
/// Once set, the drive loop drops the transport and delivers no further
/// chunks, including the terminal one.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// A generated image as returned by the provider: media type plus base64
/// payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub mime_type: String,
    pub data: String,
}

impl InlineImage {
    /// Self-describing inline reference, suitable for a `Message.image` field.
    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

// ---- wire types ----

#[derive(Debug, Clone, Serialize)]
pub struct TurnPayload {
    pub role: String,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

impl Part {
    pub fn text(text: &str) -> Self {
        Part::Text {
            text: text.to_string(),
        }
    }

    pub fn inline(mime_type: &str, base64_data: String) -> Self {
        Part::InlineData {
            inline_data: InlineData {
                mime_type: mime_type.to_string(),
                data: base64_data,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Serialize)]
struct GenerateContentRequest {
    contents: Vec<TurnPayload>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    text: Option<String>,
    inline_data: Option<InlineDataResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineDataResponse {
    mime_type: Option<String>,
    data: String,
}

#[derive(Serialize)]
struct PredictRequest {
    instances: Vec<PredictInstance>,
    parameters: PredictParameters,
}

#[derive(Serialize)]
struct PredictInstance {
    prompt: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictParameters {
    sample_count: u32,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    predictions: Option<Vec<Prediction>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Prediction {
    bytes_base64_encoded: String,
    mime_type: Option<String>,
}

#[derive(Deserialize)]
struct ErrorWrapper {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
    status: Option<String>,
}

// ---- client ----

/// HTTP client for the generative provider boundary.
///
/// One instance per provider configuration; credential and endpoint come from
/// the configuration. A missing credential is forwarded as an empty key and
/// fails at the provider boundary, so misconfiguration surfaces on the same
/// error path as any other provider rejection.
#[derive(Clone)]
pub struct GenerativeClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GenerativeClient {
    pub fn from_config(config: &ProviderConfig) -> Result<Self, GenerateError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent("Parley/0.1 (Conversation Engine)")
            .build()?;

        Ok(Self {
            http,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: config.api_key.clone().unwrap_or_default(),
            model: config.model.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self, verb: &str, sse: bool) -> String {
        let alt = if sse { "alt=sse&" } else { "" };
        format!(
            "{}/{}:{verb}?{alt}key={}",
            self.base_url.trim_end_matches('/'),
            self.model,
            self.api_key
        )
    }

    /// Open a streamed generation call.
    ///
    /// Pre-stream failures (transport, provider rejection) surface as an
    /// immediate terminal `Error` chunk so the caller has a single consumption
    /// path.
    pub async fn chat_stream(&self, composed: ComposedRequest, cancel: CancelFlag) -> ResponseStream {
        let body = GenerateContentRequest {
            contents: composed.into_contents(),
        };
        let request = self
            .http
            .post(self.endpoint("streamGenerateContent", true))
            .json(&body);

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return terminal_error(format!("Request to model provider failed: {e}")),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error body".to_string());
            return terminal_error(provider_error(status.as_u16(), &body).to_string());
        }

        stream_from_bytes(response.bytes_stream(), cancel)
    }

    /// Plain non-streaming completion. Used for short auxiliary generations
    /// such as conversation titles.
    pub async fn prompt(&self, text: &str) -> Result<String, GenerateError> {
        let body = GenerateContentRequest {
            contents: vec![TurnPayload {
                role: "user".to_string(),
                parts: vec![Part::text(text)],
            }],
        };
        let response: GenerateContentResponse =
            self.post_json(&self.endpoint("generateContent", false), &body).await?;

        extract_text(&response)
            .filter(|text| !text.is_empty())
            .ok_or_else(|| GenerateError::MalformedResponse {
                message: "response contained no text part".to_string(),
            })
    }

    /// Generate a single image for `prompt`, dispatched by the configured
    /// route.
    pub async fn generate_image(
        &self,
        prompt: &str,
        route: ImageRoute,
    ) -> Result<InlineImage, GenerateError> {
        match route {
            ImageRoute::Dedicated => self.generate_image_dedicated(prompt).await,
            ImageRoute::Multimodal => self.generate_image_multimodal(prompt).await,
        }
    }

    async fn generate_image_dedicated(&self, prompt: &str) -> Result<InlineImage, GenerateError> {
        let body = PredictRequest {
            instances: vec![PredictInstance {
                prompt: prompt.to_string(),
            }],
            parameters: PredictParameters { sample_count: 1 },
        };
        let response: PredictResponse =
            self.post_json(&self.endpoint("predict", false), &body).await?;

        response
            .predictions
            .and_then(|mut predictions| {
                if predictions.is_empty() {
                    None
                } else {
                    Some(predictions.remove(0))
                }
            })
            .map(|prediction| InlineImage {
                mime_type: prediction
                    .mime_type
                    .unwrap_or_else(|| FALLBACK_IMAGE_MIME.to_string()),
                data: prediction.bytes_base64_encoded,
            })
            .ok_or_else(|| GenerateError::NoImageData {
                model: self.model.clone(),
            })
    }

    async fn generate_image_multimodal(&self, prompt: &str) -> Result<InlineImage, GenerateError> {
        let body = GenerateContentRequest {
            contents: vec![TurnPayload {
                role: "user".to_string(),
                parts: vec![Part::text(prompt)],
            }],
        };
        let response: GenerateContentResponse =
            self.post_json(&self.endpoint("generateContent", false), &body).await?;

        resolve_image_response(response, &self.model)
    }

    async fn post_json<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T, GenerateError> {
        let response = self.http.post(url).json(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error body".to_string());
            return Err(provider_error(status.as_u16(), &body));
        }

        response
            .json()
            .await
            .map_err(|e| GenerateError::MalformedResponse {
                message: e.to_string(),
            })
    }
}

fn terminal_error(message: String) -> ResponseStream {
    Box::pin(futures::stream::iter(vec![Ok(StreamChunk::Error(message))]))
}

/// Map a non-success provider reply to a `Provider` error, preferring the
/// structured diagnostic when the body carries one.
fn provider_error(status: u16, body: &str) -> GenerateError {
    let message = serde_json::from_str::<ErrorWrapper>(body)
        .map(|wrapper| {
            let status_text = wrapper.error.status.unwrap_or_default();
            let msg = wrapper.error.message.unwrap_or_else(|| body.to_string());
            if status_text.is_empty() {
                msg
            } else {
                format!("{status_text}: {msg}")
            }
        })
        .unwrap_or_else(|_| body.to_string());

    GenerateError::Provider { status, message }
}

/// One parsed server-sent line.
#[derive(Debug, PartialEq)]
pub(crate) enum SseEvent {
    /// Keep-alive, comment, end marker, or a frame with no text.
    Ignore,
    Fragment(String),
    Malformed(String),
}

pub(crate) fn parse_sse_line(line: &str) -> SseEvent {
    let Some(data) = line.strip_prefix("data:").map(str::trim_start) else {
        return SseEvent::Ignore;
    };
    if data.is_empty() || data == "[DONE]" {
        return SseEvent::Ignore;
    }

    match serde_json::from_str::<GenerateContentResponse>(data) {
        Ok(response) => match extract_text(&response) {
            Some(text) if !text.is_empty() => SseEvent::Fragment(text),
            _ => SseEvent::Ignore,
        },
        Err(e) => SseEvent::Malformed(e.to_string()),
    }
}

/// Concatenated text parts of the response candidates.
fn extract_text(response: &GenerateContentResponse) -> Option<String> {
    let candidates = response.candidates.as_ref()?;
    let mut text = String::new();
    for candidate in candidates {
        if let Some(content) = &candidate.content {
            for part in &content.parts {
                if let Some(fragment) = &part.text {
                    text.push_str(fragment);
                }
            }
        }
    }
    Some(text)
}

/// Convert a raw byte stream of SSE lines into a chunk stream.
///
/// Yields `Text` per fragment in arrival order, then exactly one terminal
/// chunk: `Done` on clean exhaustion, `Error` on transport failure or a
/// malformed frame. A set cancel flag ends the stream with no further chunks.
pub(crate) fn stream_from_bytes<S, E>(source: S, cancel: CancelFlag) -> ResponseStream
where
    S: futures::Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    Box::pin(async_stream::stream! {
        futures::pin_mut!(source);
        let mut buf: Vec<u8> = Vec::new();

        while let Some(item) = source.next().await {
            if cancel.is_cancelled() {
                debug!("Stream cancelled, dropping transport");
                return;
            }
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Ok(StreamChunk::Error(e.to_string()));
                    return;
                }
            };
            buf.extend_from_slice(&chunk);

            // Frames are line-delimited; only complete lines are parsed so a
            // multi-byte character split across chunks never tears.
            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                match parse_sse_line(line.trim_end()) {
                    SseEvent::Fragment(text) => yield Ok(StreamChunk::Text(text)),
                    SseEvent::Malformed(reason) => {
                        yield Ok(StreamChunk::Error(format!("Malformed stream frame: {reason}")));
                        return;
                    }
                    SseEvent::Ignore => {}
                }
            }
        }

        // A final frame may arrive without a trailing newline.
        if !buf.is_empty() {
            let line = String::from_utf8_lossy(&buf);
            match parse_sse_line(line.trim_end()) {
                SseEvent::Fragment(text) => yield Ok(StreamChunk::Text(text)),
                SseEvent::Malformed(reason) => {
                    yield Ok(StreamChunk::Error(format!("Malformed stream frame: {reason}")));
                    return;
                }
                SseEvent::Ignore => {}
            }
        }

        yield Ok(StreamChunk::Done);
    })
}

/// Disambiguate an overloaded content response when an image was requested.
///
/// The provider answers text and image requests on the same endpoint with no
/// discriminant field, so the shape of the parts decides: the first inline
/// binary part wins; otherwise text is surfaced as a descriptive failure;
/// otherwise there is no image data at all.
fn resolve_image_response(
    response: GenerateContentResponse,
    model: &str,
) -> Result<InlineImage, GenerateError> {
    let mut text = String::new();

    for candidate in response.candidates.unwrap_or_default() {
        let Some(content) = candidate.content else {
            continue;
        };
        for part in content.parts {
            if let Some(inline) = part.inline_data {
                return Ok(InlineImage {
                    mime_type: inline
                        .mime_type
                        .unwrap_or_else(|| FALLBACK_IMAGE_MIME.to_string()),
                    data: inline.data,
                });
            }
            if let Some(fragment) = part.text {
                text.push_str(&fragment);
            }
        }
    }

    let text = text.trim().to_string();
    if text.is_empty() {
        return Err(GenerateError::NoImageData {
            model: model.to_string(),
        });
    }

    let summary = truncate_chars(&text, 200);
    if looks_like_refusal(&text) {
        Err(GenerateError::GenerationDeclined {
            model: model.to_string(),
            text: summary,
        })
    } else {
        Err(GenerateError::UnexpectedTextResponse {
            model: model.to_string(),
            text: summary,
        })
    }
}

fn looks_like_refusal(text: &str) -> bool {
    let lowered = text.to_lowercase();
    ["cannot", "can't", "can not", "unable to", "not able to"]
        .iter()
        .any(|marker| lowered.contains(marker))
}

fn truncate_chars(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_len).collect();
        format!("{truncated}…")
    }
}
