use crate::protocol::{parse_line, ChatMessage, ChatRequest};
use futures::StreamExt;
use reqwest::Client as HttpClient;
use std::error::Error;
use std::time::Duration;

pub const CONNECT_ERROR_PREFIX: &str = "Error connecting to the LLM service:";

type ClientResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: String,
    pub model: String,
    pub timeout: Duration,
}

pub struct LlmClient {
    http: HttpClient,
    endpoint: String,
    model: String,
}

impl LlmClient {
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        let http = HttpClient::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            endpoint: normalize_endpoint(&config.endpoint),
            model: config.model,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// One request/response cycle against the inference endpoint.
    ///
    /// Never fails: every transport-level problem is folded into the answer
    /// text, prefixed with [`CONNECT_ERROR_PREFIX`] so the caller can flag
    /// the turn instead of handling an error.
    pub async fn chat(&self, history: &[ChatMessage]) -> String {
        match self.request_answer(history).await {
            Ok(answer) => {
                if answer.truncated {
                    tracing::warn!(
                        "response stream ended before a done chunk; answer may be truncated"
                    );
                }
                answer.text
            }
            Err(err) => format!("{} {}", CONNECT_ERROR_PREFIX, err),
        }
    }

    async fn request_answer(&self, history: &[ChatMessage]) -> ClientResult<Answer> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: history.to_vec(),
            stream: true,
        };

        let response = self
            .http
            .post(format!("{}/api/chat", self.endpoint))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("service returned {}: {}", status, body).into());
        }

        let mut stream = response.bytes_stream();
        let mut aggregator = Aggregator::default();
        while let Some(chunk) = stream.next().await {
            if aggregator.push_bytes(&chunk?) {
                // First done-flagged fragment ends the answer; anything the
                // service sends after it is dropped unread.
                break;
            }
        }
        Ok(aggregator.finish())
    }
}

/// Final assembled answer. `truncated` is set when the stream closed before
/// any done-flagged fragment arrived; the text is still usable.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Answer {
    pub(crate) text: String,
    pub(crate) truncated: bool,
}

/// Folds wire bytes into one answer: buffers partial lines, decodes each
/// complete line as a chunk, and concatenates the deltas in arrival order.
#[derive(Debug, Default)]
pub(crate) struct Aggregator {
    pending: String,
    text: String,
    done: bool,
}

impl Aggregator {
    /// Returns true once a done-flagged fragment has been seen.
    pub(crate) fn push_bytes(&mut self, bytes: &[u8]) -> bool {
        self.pending.push_str(&String::from_utf8_lossy(bytes));
        while !self.done {
            let Some(idx) = self.pending.find('\n') else {
                break;
            };
            let line: String = self.pending.drain(..=idx).collect();
            self.push_line(&line);
        }
        self.done
    }

    fn push_line(&mut self, line: &str) {
        let Some(chunk) = parse_line(line) else {
            if !line.trim().is_empty() {
                tracing::debug!(line, "skipping undecodable stream line");
            }
            return;
        };
        if let Some(message) = chunk.message {
            self.text.push_str(&message.content);
        }
        if chunk.done {
            self.done = true;
        }
    }

    pub(crate) fn finish(mut self) -> Answer {
        if !self.done {
            // The stream may end on a line with no trailing newline.
            let rest = std::mem::take(&mut self.pending);
            self.push_line(&rest);
        }
        Answer {
            text: self.text,
            truncated: !self.done,
        }
    }
}

fn normalize_endpoint(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}
