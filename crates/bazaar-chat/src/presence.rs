use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use bazaar_db::Database;

use crate::error::ChatError;
use crate::typing::{TYPING_WINDOW, TypingDebouncer};

/// Default interval between online heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

enum PresenceWrite {
    Typing(Option<Uuid>),
    Online(bool, Option<oneshot::Sender<anyhow::Result<()>>>),
    Flush(oneshot::Sender<()>),
}

/// Writes the caller's own presence row.
///
/// Writes are queued to one task that applies them on the blocking pool in
/// the order they were issued, so the row always ends on the last write.
#[derive(Clone)]
pub(crate) struct PresenceWriter {
    user_id: Uuid,
    writes: mpsc::UnboundedSender<PresenceWrite>,
}

impl PresenceWriter {
    /// Must be called inside a tokio runtime. The write task ends once every
    /// handle is dropped and the queue is drained.
    pub(crate) fn spawn(db: Arc<Database>, user_id: Uuid) -> Self {
        let (writes, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let uid = user_id.to_string();
            while let Some(write) = rx.recv().await {
                match write {
                    PresenceWrite::Typing(conversation_id) => {
                        let (uid, value) = (uid.clone(), conversation_id.map(|c| c.to_string()));
                        // best effort: a lost typing write only leaves a stale
                        // indicator until the next one
                        if let Err(e) = apply(&db, move |db| db.set_typing(&uid, value.as_deref())).await {
                            warn!("typing write for {} failed: {}", user_id, e);
                        }
                    }
                    PresenceWrite::Online(online, reply) => {
                        let uid = uid.clone();
                        let result = apply(&db, move |db| db.set_online(&uid, online)).await;
                        match reply {
                            Some(reply) => {
                                let _ = reply.send(result);
                            }
                            None => {
                                if let Err(e) = result {
                                    warn!("presence heartbeat for {} failed: {}", user_id, e);
                                }
                            }
                        }
                    }
                    PresenceWrite::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Presence writer for {} stopped", user_id);
        });
        Self { user_id, writes }
    }

    pub(crate) fn write_typing(&self, conversation_id: Option<Uuid>) {
        self.queue(PresenceWrite::Typing(conversation_id));
    }

    fn heartbeat(&self) {
        self.queue(PresenceWrite::Online(true, None));
    }

    async fn write_online(&self, online: bool) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.queue(PresenceWrite::Online(online, Some(tx)));
        rx.await
            .map_err(|_| anyhow::anyhow!("presence writer for {} is gone", self.user_id))?
    }

    pub(crate) async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.queue(PresenceWrite::Flush(tx));
        let _ = rx.await;
    }

    fn queue(&self, write: PresenceWrite) {
        if self.writes.send(write).is_err() {
            debug!("Presence writer for {} is gone, write dropped", self.user_id);
        }
    }
}

async fn apply<F>(db: &Arc<Database>, f: F) -> anyhow::Result<()>
where
    F: FnOnce(&Database) -> anyhow::Result<()> + Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || f(&db)).await.map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        anyhow::anyhow!("task join error: {}", e)
    })?
}

/// Publishes the signed-in user's online state and typing indicator.
///
/// The typing field is single-valued: typing in two conversations at once
/// reports only the most recent one.
pub struct PresenceTracker {
    writer: PresenceWriter,
    typing: TypingDebouncer,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceTracker {
    /// Must be called inside a tokio runtime.
    pub fn new(db: Arc<Database>, user_id: Uuid) -> Self {
        let writer = PresenceWriter::spawn(db, user_id);
        Self {
            typing: TypingDebouncer::new(writer.clone(), TYPING_WINDOW),
            writer,
            heartbeat: Mutex::new(None),
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.writer.user_id
    }

    pub async fn go_online(&self) -> Result<(), ChatError> {
        self.writer.write_online(true).await?;
        debug!("{} online", self.writer.user_id);
        Ok(())
    }

    /// Stops the heartbeat and clears both the online flag and typing.
    pub async fn go_offline(&self) -> Result<(), ChatError> {
        self.stop_heartbeat();
        self.typing.cancel();
        self.writer.write_online(false).await?;
        debug!("{} offline", self.writer.user_id);
        Ok(())
    }

    /// Mark online now and then again every `interval` until stopped.
    /// Replaces a running heartbeat.
    pub fn start_heartbeat(&self, interval: Duration) {
        let writer = self.writer.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                writer.heartbeat();
            }
        });

        let previous = self
            .heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        info!("Presence heartbeat started for {} every {:?}", self.writer.user_id, interval);
    }

    pub fn stop_heartbeat(&self) {
        if let Some(task) = self.heartbeat.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }

    pub fn start_typing(&self, conversation_id: Uuid) {
        self.typing.kick(conversation_id);
    }

    /// Clear the indicator immediately, on send or unmount.
    pub fn stop_typing(&self) {
        self.typing.cancel();
    }

    /// Clear only if the indicator points at `conversation_id`.
    pub fn stop_typing_in(&self, conversation_id: Uuid) {
        self.typing.cancel_in(conversation_id);
    }

    pub fn typing_in(&self) -> Option<Uuid> {
        self.typing.active_conversation()
    }

    /// Wait until every presence write issued so far has landed.
    pub async fn flush(&self) {
        self.writer.flush().await;
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}
