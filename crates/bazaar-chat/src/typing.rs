use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::presence::PresenceWriter;

/// Inactivity window after which a typing indicator clears itself. Also
/// the minimum spacing between two typing writes for the same conversation.
pub const TYPING_WINDOW: Duration = Duration::from_secs(2);

/// Owns the typing write and its auto-clear timer.
///
/// `kick` on every keystroke: the write is issued at most once per window,
/// and the clear timer restarts from the latest keystroke. `cancel` clears
/// immediately. Every write is queued while the state lock is held, so the
/// queued order always matches the recorded state. Must be used inside a
/// tokio runtime.
pub struct TypingDebouncer {
    writer: PresenceWriter,
    window: Duration,
    state: Arc<Mutex<TypingState>>,
}

#[derive(Default)]
struct TypingState {
    conversation: Option<Uuid>,
    last_write: Option<Instant>,
    clear_timer: Option<JoinHandle<()>>,
    /// Bumped on every kick/cancel so a timer that already fired but lost
    /// the race for the lock knows it was superseded.
    epoch: u64,
}

impl TypingDebouncer {
    pub(crate) fn new(writer: PresenceWriter, window: Duration) -> Self {
        Self {
            writer,
            window,
            state: Arc::new(Mutex::new(TypingState::default())),
        }
    }

    pub fn kick(&self, conversation_id: Uuid) {
        let now = Instant::now();
        let mut st = lock(&self.state);

        let due = st.conversation != Some(conversation_id)
            || st.last_write.is_none_or(|at| now.duration_since(at) >= self.window);
        if due {
            self.writer.write_typing(Some(conversation_id));
            st.conversation = Some(conversation_id);
            st.last_write = Some(now);
        }

        if let Some(timer) = st.clear_timer.take() {
            timer.abort();
        }
        st.epoch += 1;
        let epoch = st.epoch;

        let state = self.state.clone();
        let writer = self.writer.clone();
        let deadline = now + self.window;
        st.clear_timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let mut st = lock(&state);
            if st.epoch != epoch {
                return;
            }
            st.conversation = None;
            st.last_write = None;
            st.clear_timer = None;
            writer.write_typing(None);
        }));
    }

    /// Clear now, whatever conversation the indicator is on.
    pub fn cancel(&self) {
        self.reset(|_| true);
    }

    /// Clear only if the indicator currently points at `conversation_id`,
    /// so closing one window does not wipe typing shown for another.
    pub fn cancel_in(&self, conversation_id: Uuid) {
        self.reset(|current| current == conversation_id);
    }

    pub fn active_conversation(&self) -> Option<Uuid> {
        lock(&self.state).conversation
    }

    fn reset(&self, should: impl FnOnce(Uuid) -> bool) {
        let mut st = lock(&self.state);
        let Some(current) = st.conversation else {
            return;
        };
        if !should(current) {
            return;
        }
        if let Some(timer) = st.clear_timer.take() {
            timer.abort();
        }
        st.epoch += 1;
        st.last_write = None;
        st.conversation = None;
        self.writer.write_typing(None);
    }
}

impl Drop for TypingDebouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn lock(state: &Mutex<TypingState>) -> MutexGuard<'_, TypingState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use bazaar_db::Database;
    use bazaar_realtime::{ChangeFeed, ChangeFilter, Subscription};
    use bazaar_types::events::Table;

    struct Rig {
        db: Arc<Database>,
        user: Uuid,
        writes: Subscription,
        writer: PresenceWriter,
        typing: TypingDebouncer,
    }

    fn rig() -> Rig {
        let db = Arc::new(Database::open_in_memory(ChangeFeed::new()).unwrap());
        let user = Uuid::new_v4();
        db.create_profile(&user.to_string(), "typist").unwrap();
        let writes = db.feed().subscribe(ChangeFilter::table(Table::Profiles).eq("id", user));
        let writer = PresenceWriter::spawn(db.clone(), user);
        let typing = TypingDebouncer::new(writer.clone(), TYPING_WINDOW);
        Rig {
            db,
            user,
            writes,
            writer,
            typing,
        }
    }

    impl Rig {
        /// The stored field once every queued write has landed.
        async fn typing_field(&self) -> Option<String> {
            self.writer.flush().await;
            self.db.get_profile(&self.user.to_string()).unwrap().unwrap().typing_in_conversation
        }

        async fn drain_writes(&mut self) -> usize {
            self.writer.flush().await;
            let mut n = 0;
            while self.writes.try_recv().is_some() {
                n += 1;
            }
            n
        }
    }

    async fn advance(ms: u64) {
        tokio::time::advance(Duration::from_millis(ms)).await;
        // let the woken timer task run
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn clears_two_seconds_after_single_keystroke() {
        let mut r = rig();
        let conversation = Uuid::new_v4();

        r.typing.kick(conversation);
        assert_eq!(r.typing_field().await, Some(conversation.to_string()));
        assert_eq!(r.drain_writes().await, 1);

        advance(1999).await;
        assert_eq!(r.typing_field().await, Some(conversation.to_string()));

        advance(1).await;
        assert_eq!(r.typing_field().await, None);
        assert_eq!(r.drain_writes().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_keystroke_extends_without_rewriting() {
        let mut r = rig();
        let conversation = Uuid::new_v4();

        r.typing.kick(conversation);
        advance(1000).await;
        r.typing.kick(conversation);
        assert_eq!(r.drain_writes().await, 1, "keystroke inside the window must not re-write");

        advance(1999).await;
        assert_eq!(r.typing_field().await, Some(conversation.to_string()));

        advance(1).await;
        assert_eq!(r.typing_field().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_typing_rewrites_once_per_window() {
        let mut r = rig();
        let conversation = Uuid::new_v4();

        for _ in 0..10 {
            r.typing.kick(conversation);
            advance(500).await;
        }
        // kicks at 0, 0.5, .. 4.5s; writes at 0, 2 and 4s
        assert_eq!(r.drain_writes().await, 3);
        assert_eq!(r.typing_field().await, Some(conversation.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_clears_immediately_and_stops_timer() {
        let mut r = rig();
        let conversation = Uuid::new_v4();

        r.typing.kick(conversation);
        r.typing.cancel();
        assert_eq!(r.typing_field().await, None);
        assert_eq!(r.drain_writes().await, 2);

        advance(5000).await;
        assert_eq!(r.drain_writes().await, 0);
        r.typing.cancel();
        assert_eq!(r.drain_writes().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_in_leaves_other_conversation_alone() {
        let r = rig();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        r.typing.kick(a);
        r.typing.kick(b);
        // last writer wins: only b is reported
        assert_eq!(r.typing_field().await, Some(b.to_string()));

        r.typing.cancel_in(a);
        assert_eq!(r.typing.active_conversation(), Some(b));
        r.typing.cancel_in(b);
        assert_eq!(r.typing_field().await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stored_field_matches_state_after_racing_kicks_and_cancels() {
        let r = rig();
        let typing = Arc::new(r.typing);
        let conversation = Uuid::new_v4();

        for round in 0..50 {
            let tasks: Vec<_> = (0..4)
                .map(|i| {
                    let typing = typing.clone();
                    tokio::spawn(async move {
                        if (i + round) % 2 == 0 {
                            typing.kick(conversation);
                        } else {
                            typing.cancel();
                        }
                    })
                })
                .collect();
            for task in tasks {
                task.await.unwrap();
            }

            r.writer.flush().await;
            let stored = r.db.get_profile(&r.user.to_string()).unwrap().unwrap().typing_in_conversation;
            assert_eq!(stored, typing.active_conversation().map(|c| c.to_string()));
        }
    }
}
