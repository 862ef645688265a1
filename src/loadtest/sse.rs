//! Server-sent events client for the completion stream.
//!
//! [`SseParser`] turns raw body chunks into dispatched frames following the
//! `text/event-stream` line format. [`EventSource`] owns the connection and
//! reconnects after transport failures, honouring the stream's `retry:` hint.

use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{Client, Url};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::UserId;
use crate::api::ApiError;

/// Default reconnection delay when the server sends no `retry:` field.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(3000);

/// One dispatched event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

#[derive(Debug, Default)]
pub struct SseParser {
    line: Vec<u8>,
    event: Option<String>,
    data: String,
    has_data: bool,
    last_event_id: Option<String>,
    retry: Option<Duration>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    pub fn retry(&self) -> Option<Duration> {
        self.retry
    }

    /// Feed a body chunk; returns every frame completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                let mut line = std::mem::take(&mut self.line);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                let line = String::from_utf8_lossy(&line).into_owned();
                if let Some(frame) = self.process_line(&line) {
                    frames.push(frame);
                }
            } else {
                self.line.push(byte);
            }
        }
        frames
    }

    /// Drop any partially received event, as after a disconnect.
    pub fn reset(&mut self) {
        self.line.clear();
        self.event = None;
        self.data.clear();
        self.has_data = false;
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            "id" if !value.contains('\0') => self.last_event_id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(Duration::from_millis(ms));
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if !self.has_data {
            return None;
        }
        self.has_data = false;
        Some(SseFrame {
            event: event
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| "message".to_string()),
            data: std::mem::take(&mut self.data),
            id: self.last_event_id.clone(),
        })
    }
}

/// Connection-level events reported to the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Connected; carries the user id the subscription URL is scoped to.
    Open { subscribed_as: Option<UserId> },
    Message(SseFrame),
    /// Transport failure; a reconnect follows.
    Error(String),
    /// The server refused the stream; no reconnect follows.
    Closed(String),
}

pub struct EventSource {
    client: Client,
    url: Url,
    reconnect_delay: Duration,
}

impl EventSource {
    pub fn new(url: Url, connect_timeout: Duration, reconnect_delay: Duration) -> reqwest::Result<Self> {
        // No overall timeout: the body is an endless stream.
        let client = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self {
            client,
            url,
            reconnect_delay,
        })
    }

    /// `{base}/print/sse?userId={user_id}`
    pub fn subscription_url(base_url: &str, user_id: UserId) -> Result<Url, ApiError> {
        let mut url = Url::parse(&format!("{}/print/sse", base_url.trim_end_matches('/')))
            .map_err(|e| ApiError::InvalidUrl(format!("{base_url}: {e}")))?;
        url.query_pairs_mut()
            .append_pair("userId", &user_id.to_string());
        Ok(url)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Run the connection loop on a background task, reporting through `sink`.
    pub fn spawn<F>(self, sink: F) -> JoinHandle<()>
    where
        F: Fn(StreamEvent) + Send + Sync + 'static,
    {
        tokio::spawn(self.run(sink))
    }

    async fn run<F>(self, sink: F)
    where
        F: Fn(StreamEvent) + Send + Sync + 'static,
    {
        let subscribed_as = subscribed_user(&self.url);
        let mut parser = SseParser::new();
        let mut delay = self.reconnect_delay;

        loop {
            info!(url = %self.url, "connecting to completion stream");
            let mut request = self
                .client
                .get(self.url.clone())
                .header(ACCEPT, "text/event-stream")
                .header(CACHE_CONTROL, "no-cache");
            if let Some(id) = parser.last_event_id() {
                request = request.header("Last-Event-ID", id);
            }

            let reason = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    let is_stream = response
                        .headers()
                        .get(CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(|v| v.starts_with("text/event-stream"))
                        .unwrap_or(false);
                    if !status.is_success() || !is_stream {
                        let reason = format!("stream refused with status {status}");
                        warn!(url = %self.url, %status, is_stream, "completion stream refused");
                        sink(StreamEvent::Closed(reason));
                        return;
                    }

                    sink(StreamEvent::Open { subscribed_as });
                    let mut body = response.bytes_stream();
                    loop {
                        match body.next().await {
                            Some(Ok(chunk)) => {
                                for frame in parser.feed(&chunk) {
                                    sink(StreamEvent::Message(frame));
                                }
                            }
                            Some(Err(e)) => break e.to_string(),
                            None => break "stream ended".to_string(),
                        }
                    }
                }
                Err(e) => e.to_string(),
            };

            parser.reset();
            if let Some(retry) = parser.retry() {
                delay = retry;
            }
            warn!(url = %self.url, %reason, retry_ms = delay.as_millis() as u64, "completion stream lost");
            sink(StreamEvent::Error(reason));
            tokio::time::sleep(delay).await;
            debug!(url = %self.url, "retrying completion stream");
        }
    }
}

fn subscribed_user(url: &Url) -> Option<UserId> {
    url.query_pairs()
        .find(|(k, _)| k == "userId")
        .and_then(|(_, v)| v.parse::<u32>().ok())
        .map(UserId::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_message() {
        let mut p = SseParser::new();
        let frames = p.feed(b"data: {\"token\":\"abc\"}\n\n");
        assert_eq!(
            frames,
            vec![SseFrame {
                event: "message".into(),
                data: "{\"token\":\"abc\"}".into(),
                id: None,
            }]
        );
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let mut p = SseParser::new();
        assert!(p.feed(b"event: mess").is_empty());
        assert!(p.feed(b"age\r\ndata: {\"tok").is_empty());
        let frames = p.feed(b"en\":\"x\"}\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "message");
        assert_eq!(frames[0].data, "{\"token\":\"x\"}");
    }

    #[test]
    fn test_multiline_data_and_comments() {
        let mut p = SseParser::new();
        let frames = p.feed(b": keep-alive\n\ndata: line one\ndata:line two\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "line one\nline two");
    }

    #[test]
    fn test_named_event_id_and_retry() {
        let mut p = SseParser::new();
        let frames = p.feed(b"retry: 1500\nid: 7\nevent: ping\ndata: x\n\n");
        assert_eq!(frames[0].event, "ping");
        assert_eq!(frames[0].id.as_deref(), Some("7"));
        assert_eq!(p.retry(), Some(Duration::from_millis(1500)));
        assert_eq!(p.last_event_id(), Some("7"));

        // Event type does not leak into the next frame.
        let frames = p.feed(b"data: y\n\n");
        assert_eq!(frames[0].event, "message");
    }

    #[test]
    fn test_blank_line_without_data_dispatches_nothing() {
        let mut p = SseParser::new();
        assert!(p.feed(b"event: ping\n\n\n").is_empty());
    }

    #[test]
    fn test_reset_discards_partial_event() {
        let mut p = SseParser::new();
        p.feed(b"data: half");
        p.reset();
        assert!(p.feed(b"\n\n").is_empty());
    }

    #[test]
    fn test_subscription_url() {
        let url = EventSource::subscription_url("http://localhost:4000/", UserId::new(512)).unwrap();
        assert_eq!(url.as_str(), "http://localhost:4000/print/sse?userId=512");
        assert_eq!(subscribed_user(&url), Some(UserId::new(512)));
    }

    #[test]
    fn test_subscription_url_rejects_garbage() {
        assert!(EventSource::subscription_url("not a url", UserId::new(1)).is_err());
    }
}
