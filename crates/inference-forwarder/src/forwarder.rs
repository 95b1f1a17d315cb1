//! Sync and streaming forwarders
//!
//! Each forwarder is bound to one backend URL. The sync forwarder awaits the
//! full backend response; the streaming forwarder reads the backend's
//! server-sent events and yields one decoded JSON chunk per event, lazily,
//! as they arrive.

use axum::http::{header, StatusCode};
use endpoint_common::CallbackAuth;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use tracing::debug;

use crate::config::ChannelConfig;
use crate::error::{ForwardError, Result};

/// Inbound inference request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloudpickle: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_auth: Option<CallbackAuth>,

    #[serde(default)]
    pub return_pickled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_path: Option<String>,
}

impl PredictRequest {
    /// Decode a request body
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| ForwardError::Decode(e.to_string()))
    }

    /// Whether `args` is present and non-empty
    pub fn has_args(&self) -> bool {
        match &self.args {
            None | Some(Value::Null) => false,
            Some(Value::Object(map)) => !map.is_empty(),
            Some(_) => true,
        }
    }

    /// `args.stream == true`
    pub fn stream_requested(&self) -> bool {
        self.args
            .as_ref()
            .and_then(|args| args.get("stream"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    fn backend_payload(&self, unwrap: bool) -> Value {
        if unwrap {
            self.args.clone().unwrap_or_else(|| json!({}))
        } else {
            serde_json::to_value(self).unwrap_or_else(|_| json!({}))
        }
    }
}

/// Full backend response after shaping
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardedResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl ForwardedResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Lazy, single-pass sequence of backend chunks
pub type ChunkStream = BoxStream<'static, Result<Value>>;

/// Forwards a request and awaits the whole backend response
#[derive(Debug, Clone)]
pub struct SyncForwarder {
    client: reqwest::Client,
    channel: ChannelConfig,
    url: String,
}

impl SyncForwarder {
    pub fn new(client: reqwest::Client, channel: ChannelConfig) -> Self {
        let url = channel.predict_url();
        Self {
            client,
            channel,
            url,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn forward(&self, request: &PredictRequest) -> Result<ForwardedResponse> {
        let payload = request.backend_payload(self.channel.model_engine_unwrap);
        debug!("Forwarding sync request to {}", self.url);

        let response = self.client.post(&self.url).json(&payload).send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        let body = decode_body(&bytes);

        if !status.is_success() {
            if self.channel.forward_http_status {
                return Ok(ForwardedResponse { status, body });
            }
            return Err(ForwardError::Backend {
                status,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        let mut result = body;
        if self.channel.serialize_results_as_string && !result.is_string() {
            result = Value::String(result.to_string());
        }
        if self.channel.wrap_response {
            result = json!({ "result": result });
        }

        Ok(ForwardedResponse {
            status,
            body: result,
        })
    }
}

/// Forwards a request and relays the backend's event stream
#[derive(Debug, Clone)]
pub struct StreamingForwarder {
    client: reqwest::Client,
    channel: ChannelConfig,
    url: String,
}

impl StreamingForwarder {
    pub fn new(client: reqwest::Client, channel: ChannelConfig) -> Self {
        let url = channel.predict_url();
        Self {
            client,
            channel,
            url,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Start the backend call; chunks are produced as the stream is polled
    pub async fn forward(&self, request: &PredictRequest) -> Result<ChunkStream> {
        let payload = request.backend_payload(self.channel.model_engine_unwrap);
        debug!("Forwarding streaming request to {}", self.url);

        let response = self
            .client
            .post(&self.url)
            .header(header::ACCEPT, "text/event-stream")
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ForwardError::Backend { status, body });
        }

        let wrap = self.channel.wrap_response;
        let state = (
            response.bytes_stream().boxed(),
            SseDecoder::default(),
            VecDeque::new(),
            false,
        );

        let chunks = stream::unfold(state, |(mut bytes, mut decoder, mut ready, mut done)| async move {
            loop {
                if let Some(item) = ready.pop_front() {
                    return Some((item, (bytes, decoder, ready, done)));
                }
                if done {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => ready.extend(decoder.push(&chunk)),
                    Some(Err(e)) => {
                        done = true;
                        ready.push_back(Err(ForwardError::Transport(e)));
                    }
                    None => {
                        done = true;
                        ready.extend(decoder.finish());
                    }
                }
            }
        })
        .map(move |chunk| chunk.map(|value| if wrap { json!({ "result": value }) } else { value }));

        Ok(chunks.boxed())
    }
}

fn decode_body(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

/// Incremental server-sent-events decoder yielding the JSON `data` of each event
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed raw bytes; returns every event completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<Value>> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data.push(data.strip_prefix(' ').unwrap_or(data).to_string());
            }
            // Comments, `event:`, `id:` and `retry:` lines carry no payload
        }
        events
    }

    /// Flush an event left unterminated when the backend closed
    pub fn finish(&mut self) -> Vec<Result<Value>> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            events.extend(self.push(b"\n"));
        }
        events.extend(self.dispatch());
        events
    }

    fn dispatch(&mut self) -> Option<Result<Value>> {
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(
            serde_json::from_str(&data)
                .map_err(|e| ForwardError::BadResponse(format!("{}: {}", e, data))),
        )
    }
}
