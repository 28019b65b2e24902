//! HTTP transport for the Syncline API: typed REST calls plus a reconnecting
//! SSE subscriber.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::StatusCode;
use shared::models::{
    Channel, HeartbeatRequest, HeartbeatResponse, Message, MessageUpsert, PresenceUpdate,
    PresenceUpsertRequest, UpdateEnvelope, UpsertReceipt,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Delay between SSE reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Envelopes buffered per subscription before the reader stops pulling from
/// the socket.
const SUBSCRIPTION_DEPTH: usize = 64;

/// Transport failures surfaced by [`LiveClient`] calls.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The request never completed or the response body could not be read.
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    /// The server answered with a non-success status.
    #[error("server rejected the request: {status}")]
    Rejected {
        /// Status the server answered with.
        status: StatusCode,
    },
}

/// Transport seam the chat sync loop runs against.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Opens the live update stream for a conversation.
    fn subscribe_chat(
        &self,
        chat_id: &str,
        client_id: Option<&str>,
    ) -> (SubscriptionHandle, mpsc::Receiver<UpdateEnvelope>);

    /// Loads the most recent message window, newest first.
    async fn chat_load(&self, chat_id: &str, limit: i64) -> Result<Vec<Message>, ClientError>;

    /// Writes one message upsert and returns the authoritative receipt.
    async fn chat_upsert(
        &self,
        chat_id: &str,
        upsert: &MessageUpsert,
    ) -> Result<UpsertReceipt, ClientError>;
}

/// Transport seam the presence sync loop runs against.
#[async_trait]
pub trait PresenceTransport: Send + Sync {
    /// Opens the presence diff stream for a channel.
    fn subscribe_presence(
        &self,
        channel_id: &str,
        client_id: Option<&str>,
    ) -> (SubscriptionHandle, mpsc::Receiver<UpdateEnvelope>);

    /// Reads the current presence set as a batch of upsert diffs.
    async fn presence_snapshot(&self, channel_id: &str)
    -> Result<Vec<PresenceUpdate>, ClientError>;

    /// Writes this client's presence entry.
    async fn presence_upsert(
        &self,
        channel_id: &str,
        request: &PresenceUpsertRequest,
    ) -> Result<(), ClientError>;

    /// Refreshes this client's liveness.
    async fn presence_heartbeat(
        &self,
        channel_id: &str,
        client_id: &str,
    ) -> Result<HeartbeatResponse, ClientError>;
}

/// Typed client for the Syncline HTTP API.
#[derive(Debug, Clone)]
pub struct LiveClient {
    http: reqwest::Client,
    base_url: String,
}

impl LiveClient {
    /// A client for the server at `base_url` (scheme and authority; a
    /// trailing slash is tolerated).
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api{path}", self.base_url)
    }

    fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(ClientError::Rejected {
                status: response.status(),
            })
        }
    }

    /// Opens an SSE subscription on a channel. The reader task keeps
    /// reconnecting with a fixed delay until the handle is stopped or
    /// dropped; decoded envelopes arrive on the returned receiver.
    #[must_use]
    pub fn subscribe(
        &self,
        channel: &Channel,
        client_id: Option<&str>,
    ) -> (SubscriptionHandle, mpsc::Receiver<UpdateEnvelope>) {
        let url = self.api_url(&format!("/channels/{}/subscribe", channel.name()));
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_DEPTH);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_subscription(
            self.http.clone(),
            url,
            client_id.map(str::to_string),
            cancel.clone(),
            sender,
        ));

        (SubscriptionHandle::new(cancel, task), receiver)
    }

    /// Publishes a raw envelope on a channel.
    ///
    /// # Errors
    /// Returns [`ClientError`] when the request fails or is rejected.
    pub async fn publish(
        &self,
        channel: &Channel,
        envelope: &UpdateEnvelope,
    ) -> Result<(), ClientError> {
        let url = self.api_url(&format!("/channels/{}/publish", channel.name()));
        let response = self.http.post(url).json(envelope).send().await?;
        Self::check(response)?;
        Ok(())
    }

    /// Loads the newest `limit` messages of a conversation, newest first.
    ///
    /// # Errors
    /// Returns [`ClientError`] when the request fails or is rejected.
    pub async fn chat_load(&self, chat_id: &str, limit: i64) -> Result<Vec<Message>, ClientError> {
        let url = self.api_url(&format!("/chats/{chat_id}/messages"));
        let response = self.http.get(url).query(&[("limit", limit)]).send().await?;
        Ok(Self::check(response)?.json().await?)
    }

    /// Writes one message upsert and returns the authoritative receipt.
    ///
    /// # Errors
    /// Returns [`ClientError`] when the request fails or is rejected.
    pub async fn chat_upsert(
        &self,
        chat_id: &str,
        upsert: &MessageUpsert,
    ) -> Result<UpsertReceipt, ClientError> {
        let url = self.api_url(&format!("/chats/{chat_id}/messages"));
        let response = self.http.post(url).json(upsert).send().await?;
        Ok(Self::check(response)?.json().await?)
    }

    /// Reads the current presence set for a channel.
    ///
    /// # Errors
    /// Returns [`ClientError`] when the request fails or is rejected.
    pub async fn presence_snapshot(
        &self,
        channel_id: &str,
    ) -> Result<Vec<PresenceUpdate>, ClientError> {
        let url = self.api_url(&format!("/presence/{channel_id}"));
        let response = self.http.get(url).send().await?;
        Ok(Self::check(response)?.json().await?)
    }

    /// Writes this client's presence entry.
    ///
    /// # Errors
    /// Returns [`ClientError`] when the request fails or is rejected.
    pub async fn presence_upsert(
        &self,
        channel_id: &str,
        request: &PresenceUpsertRequest,
    ) -> Result<(), ClientError> {
        let url = self.api_url(&format!("/presence/{channel_id}"));
        let response = self.http.post(url).json(request).send().await?;
        Self::check(response)?;
        Ok(())
    }

    /// Refreshes this client's liveness on a channel.
    ///
    /// # Errors
    /// Returns [`ClientError`] when the request fails or is rejected.
    pub async fn presence_heartbeat(
        &self,
        channel_id: &str,
        client_id: &str,
    ) -> Result<HeartbeatResponse, ClientError> {
        let url = self.api_url(&format!("/presence/{channel_id}/heartbeat"));
        let request = HeartbeatRequest {
            client_id: client_id.to_string(),
        };
        let response = self.http.post(url).json(&request).send().await?;
        Ok(Self::check(response)?.json().await?)
    }
}

#[async_trait]
impl ChatTransport for LiveClient {
    fn subscribe_chat(
        &self,
        chat_id: &str,
        client_id: Option<&str>,
    ) -> (SubscriptionHandle, mpsc::Receiver<UpdateEnvelope>) {
        self.subscribe(&Channel::content(chat_id), client_id)
    }

    async fn chat_load(&self, chat_id: &str, limit: i64) -> Result<Vec<Message>, ClientError> {
        LiveClient::chat_load(self, chat_id, limit).await
    }

    async fn chat_upsert(
        &self,
        chat_id: &str,
        upsert: &MessageUpsert,
    ) -> Result<UpsertReceipt, ClientError> {
        LiveClient::chat_upsert(self, chat_id, upsert).await
    }
}

#[async_trait]
impl PresenceTransport for LiveClient {
    fn subscribe_presence(
        &self,
        channel_id: &str,
        client_id: Option<&str>,
    ) -> (SubscriptionHandle, mpsc::Receiver<UpdateEnvelope>) {
        self.subscribe(&Channel::presence(channel_id), client_id)
    }

    async fn presence_snapshot(
        &self,
        channel_id: &str,
    ) -> Result<Vec<PresenceUpdate>, ClientError> {
        LiveClient::presence_snapshot(self, channel_id).await
    }

    async fn presence_upsert(
        &self,
        channel_id: &str,
        request: &PresenceUpsertRequest,
    ) -> Result<(), ClientError> {
        LiveClient::presence_upsert(self, channel_id, request).await
    }

    async fn presence_heartbeat(
        &self,
        channel_id: &str,
        client_id: &str,
    ) -> Result<HeartbeatResponse, ClientError> {
        LiveClient::presence_heartbeat(self, channel_id, client_id).await
    }
}

/// Handle keeping one SSE subscription alive. Dropping it disconnects.
#[derive(Debug)]
pub struct SubscriptionHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub(crate) fn new(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Disconnects and waits for the reader task to wind down.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.await.ok();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_subscription(
    http: reqwest::Client,
    url: String,
    client_id: Option<String>,
    cancel: CancellationToken,
    sender: mpsc::Sender<UpdateEnvelope>,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }

        let mut request = http.get(&url);
        if let Some(client_id) = client_id.as_deref() {
            request = request.query(&[("clientId", client_id)]);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(%url, "subscribed");
                if !stream_frames(response, &cancel, &sender).await {
                    return;
                }
                debug!(%url, "stream ended, reconnecting");
            }
            Ok(response) => {
                warn!(%url, status = %response.status(), "subscribe rejected, retrying");
            }
            Err(err) => {
                warn!(%url, error = %err, "subscribe failed, retrying");
            }
        }

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

/// Pumps one connection. Returns `false` when the subscription is over for
/// good (cancelled, or the receiving side went away) and `true` when the
/// connection dropped and a reconnect is in order.
async fn stream_frames(
    response: reqwest::Response,
    cancel: &CancellationToken,
    sender: &mpsc::Sender<UpdateEnvelope>,
) -> bool {
    let mut decoder = SseDecoder::default();
    let mut frames = response.bytes_stream();

    loop {
        let chunk = tokio::select! {
            () = cancel.cancelled() => return false,
            chunk = frames.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                for payload in decoder.push_chunk(&bytes) {
                    match UpdateEnvelope::from_payload(&payload) {
                        Ok(envelope) => {
                            if sender.send(envelope).await.is_err() {
                                return false;
                            }
                        }
                        Err(err) => warn!(error = %err, "discarding undecodable frame"),
                    }
                }
            }
            Some(Err(err)) => {
                warn!(error = %err, "stream failed");
                return true;
            }
            None => return true,
        }
    }
}

/// Incremental SSE frame parser.
///
/// Accumulates `data:` lines and emits the joined payload at each blank line.
/// Partial lines are buffered across chunks, so frame boundaries need not
/// align with transport reads. Comments (keep-alives) and non-data fields are
/// dropped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    partial_line: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    /// Feeds one transport chunk, returning every payload it completes.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut payloads = Vec::new();
        for byte in chunk {
            if *byte == b'\n' {
                let line = String::from_utf8_lossy(&self.partial_line).into_owned();
                self.partial_line.clear();
                if let Some(payload) = self.push_line(line.trim_end_matches('\r')) {
                    payloads.push(payload);
                }
            } else {
                self.partial_line.push(*byte);
            }
        }
        payloads
    }

    fn push_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            if self.data_lines.is_empty() {
                return None;
            }
            let payload = self.data_lines.join("\n");
            self.data_lines.clear();
            return Some(payload);
        }
        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            self.data_lines.push(value.to_string());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn decode_all(decoder: &mut SseDecoder, input: &str) -> Vec<String> {
        decoder.push_chunk(input.as_bytes())
    }

    #[test]
    fn single_frame_parses() {
        let mut decoder = SseDecoder::default();

        let payloads = decode_all(&mut decoder, "data: {\"clientId\":null}\n\n");

        assert_eq!(payloads, vec!["{\"clientId\":null}"]);
    }

    #[test]
    fn multiple_data_lines_join_with_newlines() {
        let mut decoder = SseDecoder::default();

        let payloads = decode_all(&mut decoder, "data: part one\ndata: part two\n\n");

        assert_eq!(payloads, vec!["part one\npart two"]);
    }

    #[test]
    fn keep_alive_comments_are_dropped() {
        let mut decoder = SseDecoder::default();

        let payloads = decode_all(&mut decoder, ": keep-alive\n\n: keep-alive\n\n");

        assert!(payloads.is_empty());
    }

    #[test]
    fn crlf_line_endings_are_accepted() {
        let mut decoder = SseDecoder::default();

        let payloads = decode_all(&mut decoder, "data: hello\r\n\r\n");

        assert_eq!(payloads, vec!["hello"]);
    }

    #[test]
    fn non_data_fields_are_ignored() {
        let mut decoder = SseDecoder::default();

        let payloads = decode_all(
            &mut decoder,
            "event: update\nid: 7\nretry: 500\ndata: x\n\n",
        );

        assert_eq!(payloads, vec!["x"]);
    }

    #[test]
    fn partial_line_waits_for_the_rest() {
        let mut decoder = SseDecoder::default();

        assert!(decoder.push_chunk(b"data: hel").is_empty());
        assert!(decoder.push_chunk(b"lo\n").is_empty());
        let payloads = decoder.push_chunk(b"\n");

        assert_eq!(payloads, vec!["hello"]);
    }

    #[test_case(1; "byte at a time")]
    #[test_case(3; "tiny chunks")]
    #[test_case(7; "odd chunks")]
    #[test_case(64; "large chunks")]
    fn chunking_never_changes_the_payloads(chunk_size: usize) {
        let transcript =
            "data: {\"a\":1}\n\n: keep-alive\n\ndata: first\ndata: second\n\ndata: tail\n\n";
        let mut decoder = SseDecoder::default();
        let mut payloads = Vec::new();

        for chunk in transcript.as_bytes().chunks(chunk_size) {
            payloads.extend(decoder.push_chunk(chunk));
        }

        assert_eq!(payloads, vec!["{\"a\":1}", "first\nsecond", "tail"]);
    }
}
