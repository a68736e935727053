use super::prompt::{self, GenerationParams};
use super::{FragmentStream, ModelClient, ModelError, ModelRequest};
use crate::aws::eventstream::{Frame, FrameDecoder};
use crate::aws::sigv4::{self, SignableRequest, SigningParams};
use crate::aws::{regional_endpoint, CredentialsProvider};
use async_trait::async_trait;
use base64::Engine as _;
use chrono::Utc;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::sync::Arc;

/// Hard limit the runtime API enforces on the request body.
pub const MAX_REQUEST_BYTES: usize = 25_000_000;

/// Body format a model expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// Legacy `prompt` / `completion` text-completion API.
    ClaudeText,
    /// Messages API with `content_block_delta` events.
    ClaudeMessages,
}

pub const SUPPORTED_MODELS: &[(&str, ModelFamily)] = &[
    ("anthropic.claude-v1", ModelFamily::ClaudeText),
    ("anthropic.claude-v2", ModelFamily::ClaudeText),
    ("anthropic.claude-v2:1", ModelFamily::ClaudeText),
    ("anthropic.claude-instant-v1", ModelFamily::ClaudeText),
    ("anthropic.claude-3-haiku-20240307-v1:0", ModelFamily::ClaudeMessages),
    ("anthropic.claude-3-sonnet-20240229-v1:0", ModelFamily::ClaudeMessages),
    ("anthropic.claude-3-5-sonnet-20240620-v1:0", ModelFamily::ClaudeMessages),
];

pub fn model_family(model_id: &str) -> Option<ModelFamily> {
    SUPPORTED_MODELS
        .iter()
        .find(|(id, _)| *id == model_id)
        .map(|(_, family)| *family)
}

/// Bedrock runtime client using `InvokeModelWithResponseStream`.
pub struct BedrockClient {
    http: reqwest::Client,
    credentials: Arc<CredentialsProvider>,
    endpoint: String,
    region: String,
    model_id: String,
    family: Option<ModelFamily>,
    params: GenerationParams,
}

impl BedrockClient {
    /// An unsupported `model_id` does not fail here; every `stream` call
    /// reports it instead.
    pub fn new(
        credentials: Arc<CredentialsProvider>,
        region: &str,
        model_id: &str,
        params: GenerationParams,
    ) -> Self {
        Self::with_endpoint(
            credentials,
            region,
            regional_endpoint("bedrock-runtime", region),
            model_id,
            params,
        )
    }

    pub fn with_endpoint(
        credentials: Arc<CredentialsProvider>,
        region: &str,
        endpoint: impl Into<String>,
        model_id: &str,
        params: GenerationParams,
    ) -> Self {
        let family = model_family(model_id);
        if family.is_none() {
            tracing::error!(model_id, "Configured Bedrock model is not supported");
        }
        Self {
            http: reqwest::Client::new(),
            credentials,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            region: region.to_string(),
            model_id: model_id.to_string(),
            family,
            params,
        }
    }

    pub fn ensure_supported(&self) -> Result<ModelFamily, ModelError> {
        self.family
            .ok_or_else(|| ModelError::UnsupportedModel(self.model_id.clone()))
    }

    fn request_body(&self, family: ModelFamily, request: &ModelRequest) -> Result<Vec<u8>, ModelError> {
        let body = match family {
            ModelFamily::ClaudeText => prompt::text_completion_body(request, &self.params),
            ModelFamily::ClaudeMessages => prompt::messages_body(request, &self.params),
        };
        let bytes = serde_json::to_vec(&body)
            .map_err(|e| ModelError::Upstream(format!("failed to encode request: {e}")))?;
        if bytes.len() > MAX_REQUEST_BYTES {
            return Err(ModelError::InputTooLarge {
                size: bytes.len(),
                limit: MAX_REQUEST_BYTES,
            });
        }
        Ok(bytes)
    }
}

#[async_trait]
impl ModelClient for BedrockClient {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn stream(&self, request: ModelRequest) -> Result<FragmentStream, ModelError> {
        let family = self.ensure_supported()?;
        let body = self.request_body(family, &request)?;
        let size = body.len();

        let path = format!(
            "/model/{}/invoke-with-response-stream",
            sigv4::uri_encode(&self.model_id, true)
        );
        let url = format!("{}{path}", self.endpoint);
        let host = crate::aws::json_client::host_header(&url)
            .map_err(|e| ModelError::Upstream(e.to_string()))?;
        let credentials = self
            .credentials
            .credentials()
            .await
            .map_err(|e| ModelError::Upstream(e.to_string()))?;

        let unsigned = vec![
            ("accept".to_string(), "application/vnd.amazon.eventstream".to_string()),
            ("content-type".to_string(), "application/json".to_string()),
            ("host".to_string(), host),
        ];
        let signed = sigv4::sign(
            &SignableRequest {
                method: "POST",
                path: &path,
                query: &[],
                headers: unsigned.clone(),
                body: &body,
            },
            &SigningParams {
                credentials: &credentials,
                region: &self.region,
                service: "bedrock",
                time: Utc::now(),
            },
        );

        let mut builder = self.http.post(&url).body(body);
        for (name, value) in unsigned.iter().chain(signed.iter()) {
            if name != "host" {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }

        tracing::debug!(
            model_id = %self.model_id,
            conversation_id = %request.conversation_id,
            role = %request.role,
            history = request.history.len(),
            "Invoking Bedrock model"
        );
        let resp = builder
            .send()
            .await
            .map_err(|e| ModelError::Upstream(format!("Bedrock request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), &text, size));
        }

        let chunks = resp
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| ModelError::Upstream(format!("Bedrock stream interrupted: {e}")))
            })
            .boxed();
        Ok(fragments_from_body(chunks, family))
    }
}

fn status_error(status: u16, body: &str, request_size: usize) -> ModelError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("Message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string());

    if status == 400 && is_length_error(&message) {
        return ModelError::InputTooLarge {
            size: request_size,
            limit: MAX_REQUEST_BYTES,
        };
    }
    ModelError::Upstream(format!("Bedrock returned {status}: {message}"))
}

fn is_length_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("length less than or equal to")
        || lower.contains("too long")
        || lower.contains("maximum context length")
}

struct DecodeState {
    body: BoxStream<'static, Result<Vec<u8>, ModelError>>,
    decoder: FrameDecoder,
    family: ModelFamily,
    done: bool,
}

/// Turn a raw event-stream body into text fragments. Empty deltas are
/// skipped; the first error ends the stream.
pub fn fragments_from_body(
    body: BoxStream<'static, Result<Vec<u8>, ModelError>>,
    family: ModelFamily,
) -> FragmentStream {
    let state = DecodeState {
        body,
        decoder: FrameDecoder::new(),
        family,
        done: false,
    };
    stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        loop {
            match state.decoder.next_frame() {
                Ok(Some(frame)) => match fragment_from_frame(&frame, state.family) {
                    Ok(Some(text)) => return Some((Ok(text), state)),
                    Ok(None) => continue,
                    Err(err) => {
                        state.done = true;
                        return Some((Err(err), state));
                    }
                },
                Ok(None) => {}
                Err(err) => {
                    state.done = true;
                    return Some((Err(ModelError::Upstream(err.to_string())), state));
                }
            }

            match state.body.next().await {
                Some(Ok(chunk)) => state.decoder.push(&chunk),
                Some(Err(err)) => {
                    state.done = true;
                    return Some((Err(err), state));
                }
                None if state.decoder.buffered() > 0 => {
                    state.done = true;
                    let leftover = state.decoder.buffered();
                    return Some((
                        Err(ModelError::Upstream(format!(
                            "stream ended with {leftover} undecoded bytes"
                        ))),
                        state,
                    ));
                }
                None => return None,
            }
        }
    })
    .boxed()
}

fn fragment_from_frame(frame: &Frame, family: ModelFamily) -> Result<Option<String>, ModelError> {
    match frame.message_type() {
        "exception" | "error" => {
            let kind = frame.exception_type().unwrap_or("UnknownException");
            let detail = String::from_utf8_lossy(&frame.payload);
            return Err(ModelError::Upstream(format!("{kind}: {detail}")));
        }
        _ => {}
    }
    if frame.event_type() != Some("chunk") {
        return Ok(None);
    }

    let envelope: Value = serde_json::from_slice(&frame.payload)
        .map_err(|e| ModelError::Upstream(format!("malformed chunk envelope: {e}")))?;
    let encoded = envelope
        .get("bytes")
        .and_then(Value::as_str)
        .ok_or_else(|| ModelError::Upstream("chunk without bytes".into()))?;
    let raw = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| ModelError::Upstream(format!("chunk bytes are not base64: {e}")))?;
    let chunk: Value = serde_json::from_slice(&raw)
        .map_err(|e| ModelError::Upstream(format!("malformed chunk: {e}")))?;

    let text = match family {
        ModelFamily::ClaudeText => chunk.get("completion").and_then(Value::as_str),
        ModelFamily::ClaudeMessages => {
            if chunk.get("type").and_then(Value::as_str) == Some("content_block_delta") {
                chunk.pointer("/delta/text").and_then(Value::as_str)
            } else {
                None
            }
        }
    };
    Ok(text.filter(|t| !t.is_empty()).map(str::to_string))
}
