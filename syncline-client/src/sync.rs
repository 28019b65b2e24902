//! Background sync loops: one per conversation, one per presence channel.
//!
//! Each loop owns its replica and a transport, consumes live envelopes and
//! local commands, and publishes the reconciled view on a watch channel. The
//! subscription is opened before the snapshot is loaded; an update observed
//! twice is harmless, one missed during the gap is not.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use shared::models::{
    Message, MessageUpsert, PresenceEntry, PresenceUpdate, PresenceUpsertRequest, UpdateEnvelope,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::presence::PresenceReplica;
use crate::replica::ChatReplica;
use crate::ticker::Ticker;
use crate::transport::{ChatTransport, PresenceTransport};

/// Queued local commands per loop before senders wait.
const COMMAND_DEPTH: usize = 16;

/// Handle to a running conversation sync loop.
///
/// Dropping the handle stops the loop and closes the subscription.
#[derive(Debug)]
pub struct ChatSync {
    view: watch::Receiver<Vec<Message>>,
    edits: mpsc::Sender<MessageUpsert>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ChatSync {
    /// Spawns the sync loop for one conversation. `client_id` names this
    /// connection on every write, so the server's echo suppression keeps the
    /// loop from seeing its own broadcasts; promotion of local edits happens
    /// through the write receipt instead.
    #[must_use]
    pub fn spawn(
        transport: Arc<dyn ChatTransport>,
        chat_id: impl Into<String>,
        client_id: impl Into<String>,
        window: usize,
    ) -> Self {
        let chat_id = chat_id.into();
        let (view_sender, view) = watch::channel(Vec::new());
        let (edits, edit_commands) = mpsc::channel(COMMAND_DEPTH);
        let cancel = CancellationToken::new();

        let task = ChatSyncTask {
            transport,
            chat_id: chat_id.clone(),
            client_id: client_id.into(),
            replica: ChatReplica::with_window(chat_id, window),
            view: view_sender,
        };
        let task = tokio::spawn(task.run(edit_commands, cancel.clone()));

        Self {
            view,
            edits,
            cancel,
            task: Some(task),
        }
    }

    /// A watch receiver over the reconciled view, ascending by conversation
    /// sequence.
    #[must_use]
    pub fn view(&self) -> watch::Receiver<Vec<Message>> {
        self.view.clone()
    }

    /// Queues a local edit. The view shows it optimistically right away; the
    /// loop stamps this connection's client id on the write before sending
    /// it. Returns `false` when the loop has already stopped.
    pub async fn edit(&self, upsert: MessageUpsert) -> bool {
        self.edits.send(upsert).await.is_ok()
    }

    /// Stops the loop and tears the subscription down.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.await.ok();
        }
    }
}

impl Drop for ChatSync {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct ChatSyncTask {
    transport: Arc<dyn ChatTransport>,
    chat_id: String,
    client_id: String,
    replica: ChatReplica,
    view: watch::Sender<Vec<Message>>,
}

impl ChatSyncTask {
    async fn run(mut self, mut edits: mpsc::Receiver<MessageUpsert>, cancel: CancellationToken) {
        let (subscription, mut live) = self
            .transport
            .subscribe_chat(&self.chat_id, Some(&self.client_id));

        let limit = i64::try_from(self.replica.window()).unwrap_or(i64::MAX);
        match self.transport.chat_load(&self.chat_id, limit).await {
            Ok(rows) => self.replica.apply_snapshot(rows),
            Err(err) => {
                warn!(error = %err, chat_id = %self.chat_id, "snapshot load failed");
            }
        }
        self.publish();

        let mut live_open = true;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                envelope = live.recv(), if live_open => match envelope {
                    Some(envelope) => {
                        self.apply_envelope(&envelope);
                        self.publish();
                    }
                    None => {
                        debug!(chat_id = %self.chat_id, "live stream closed");
                        live_open = false;
                    }
                },
                command = edits.recv() => {
                    let Some(mut upsert) = command else { break };
                    upsert.client_id = Some(self.client_id.clone());
                    self.write(upsert).await;
                }
            }
        }

        subscription.stop().await;
    }

    async fn write(&mut self, upsert: MessageUpsert) {
        self.replica.upsert_local(&upsert);
        self.publish();

        match self.transport.chat_upsert(&self.chat_id, &upsert).await {
            Ok(receipt) => {
                let row = Message::authoritative(self.chat_id.as_str(), &upsert, &receipt);
                self.replica.apply_authoritative(row);
                self.publish();
            }
            Err(err) => {
                // The optimistic row stays visible; a retry of the edit or a
                // fresh snapshot reconciles it.
                warn!(
                    error = %err,
                    chat_id = %self.chat_id,
                    message_id = %upsert.message_id,
                    "write failed"
                );
            }
        }
    }

    fn apply_envelope(&mut self, envelope: &UpdateEnvelope) {
        match envelope.decode::<Message>() {
            Ok(rows) => {
                for row in rows {
                    self.replica.apply_authoritative(row);
                }
            }
            Err(err) => warn!(error = %err, "ignoring envelope without chat rows"),
        }
    }

    fn publish(&self) {
        self.view.send_replace(self.replica.view());
    }
}

/// Handle to a running presence sync loop.
///
/// The loop keeps this client's own entry alive (heartbeat on a [`Ticker`],
/// re-upsert when the server reports the entry expired) and mirrors everyone
/// else's entries from diff broadcasts. Dropping the handle stops it.
#[derive(Debug)]
pub struct PresenceSync {
    view: watch::Receiver<Vec<PresenceEntry>>,
    updates: mpsc::Sender<Value>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PresenceSync {
    /// Spawns the presence loop for one channel, announcing `initial_data`
    /// as this client's state.
    #[must_use]
    pub fn spawn(
        transport: Arc<dyn PresenceTransport>,
        channel_id: impl Into<String>,
        client_id: impl Into<String>,
        initial_data: Value,
        heartbeat_period: Duration,
    ) -> Self {
        let channel_id = channel_id.into();
        let (view_sender, view) = watch::channel(Vec::new());
        let (updates, update_commands) = mpsc::channel(COMMAND_DEPTH);
        let cancel = CancellationToken::new();

        let task = PresenceSyncTask {
            transport,
            channel_id: channel_id.clone(),
            client_id: client_id.into(),
            current: initial_data,
            replica: PresenceReplica::new(channel_id),
            view: view_sender,
        };
        let task = tokio::spawn(task.run(heartbeat_period, update_commands, cancel.clone()));

        Self {
            view,
            updates,
            cancel,
            task: Some(task),
        }
    }

    /// A watch receiver over the live entries, ordered by client id.
    #[must_use]
    pub fn view(&self) -> watch::Receiver<Vec<PresenceEntry>> {
        self.view.clone()
    }

    /// Publishes new state for this client. Returns `false` when the loop
    /// has already stopped.
    pub async fn update(&self, data: Value) -> bool {
        self.updates.send(data).await.is_ok()
    }

    /// Stops the loop. The entry is left to expire server-side; there is no
    /// goodbye message, exactly as when a client loses its connection.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.await.ok();
        }
    }
}

impl Drop for PresenceSync {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct PresenceSyncTask {
    transport: Arc<dyn PresenceTransport>,
    channel_id: String,
    client_id: String,
    current: Value,
    replica: PresenceReplica,
    view: watch::Sender<Vec<PresenceEntry>>,
}

impl PresenceSyncTask {
    async fn run(
        mut self,
        heartbeat_period: Duration,
        mut updates: mpsc::Receiver<Value>,
        cancel: CancellationToken,
    ) {
        let (subscription, mut live) = self
            .transport
            .subscribe_presence(&self.channel_id, Some(&self.client_id));

        match self.transport.presence_snapshot(&self.channel_id).await {
            Ok(snapshot) => self.replica.apply_snapshot(snapshot),
            Err(err) => {
                warn!(error = %err, channel_id = %self.channel_id, "presence snapshot failed");
            }
        }

        let (tick_sender, mut ticks) = mpsc::channel::<()>(1);
        let ticker = Ticker::spawn(heartbeat_period, move || {
            let tick_sender = tick_sender.clone();
            async move {
                // A tick already waiting covers this one.
                tick_sender.try_send(()).ok();
            }
        });

        self.upsert_self(&ticker).await;
        self.publish();

        let mut live_open = true;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                envelope = live.recv(), if live_open => match envelope {
                    Some(envelope) => {
                        self.apply_envelope(&envelope);
                        self.publish();
                    }
                    None => {
                        debug!(channel_id = %self.channel_id, "live stream closed");
                        live_open = false;
                    }
                },
                command = updates.recv() => {
                    let Some(data) = command else { break };
                    self.current = data;
                    self.upsert_self(&ticker).await;
                    self.publish();
                }
                tick = ticks.recv() => {
                    if tick.is_none() {
                        break;
                    }
                    self.heartbeat(&ticker).await;
                }
            }
        }

        ticker.stop().await;
        subscription.stop().await;
    }

    /// Writes `current` as this client's entry. The diff comes back
    /// echo-suppressed, so the local mirror is updated here.
    async fn upsert_self(&mut self, ticker: &Ticker) {
        let request = PresenceUpsertRequest {
            client_id: self.client_id.clone(),
            data: self.current.clone(),
        };
        match self.transport.presence_upsert(&self.channel_id, &request).await {
            Ok(()) => {
                self.replica.apply(PresenceUpdate::Upsert {
                    channel_id: self.channel_id.clone(),
                    client_id: self.client_id.clone(),
                    data: self.current.clone(),
                });
                // The write already refreshed liveness; the next heartbeat
                // can wait a full period.
                ticker.reset();
            }
            Err(err) => {
                warn!(error = %err, channel_id = %self.channel_id, "presence upsert failed");
            }
        }
    }

    async fn heartbeat(&mut self, ticker: &Ticker) {
        match self
            .transport
            .presence_heartbeat(&self.channel_id, &self.client_id)
            .await
        {
            Ok(response) if response.refreshed => {}
            Ok(_) => {
                debug!(channel_id = %self.channel_id, "entry expired, re-upserting");
                self.upsert_self(ticker).await;
                self.publish();
            }
            Err(err) => {
                warn!(error = %err, channel_id = %self.channel_id, "heartbeat failed");
            }
        }
    }

    fn apply_envelope(&mut self, envelope: &UpdateEnvelope) {
        match envelope.decode::<PresenceUpdate>() {
            Ok(diffs) => {
                for diff in diffs {
                    self.replica.apply(diff);
                }
            }
            Err(err) => warn!(error = %err, "ignoring envelope without presence diffs"),
        }
    }

    fn publish(&self) {
        self.view.send_replace(self.replica.entries());
    }
}
