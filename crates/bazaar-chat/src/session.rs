//! Controller for one open conversation window.
//!
//! A session loads the conversation, subscribes to every table that can
//! change what the window shows, and re-renders by re-fetching on each
//! notification. The feed may deliver an event more than once, so handlers
//! never patch the view from event contents.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use bazaar_realtime::{ChangeFilter, Subscription};
use bazaar_types::events::{ChangeEvent, ChangeKind, Table};
use bazaar_types::models::{
    Conversation, Message, MessagePayload, OutgoingMessage, PriceOffer, Profile, ReactionGroup,
};

use crate::ChatServices;
use crate::error::ChatError;
use crate::reactions::ReactionToggle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Loading,
    Ready,
    /// Either party blocked the other. History stays readable, sending and
    /// live updates stop.
    Blocked,
    /// The conversation is gone or was never viewable.
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageView {
    pub message: Message,
    pub reactions: Vec<ReactionGroup>,
    /// Set for price-offer messages.
    pub offer: Option<PriceOffer>,
}

/// Snapshot rendered by the window.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub state: SessionState,
    pub conversation: Option<Conversation>,
    pub counterpart: Option<Profile>,
    pub counterpart_typing: bool,
    /// Oldest first.
    pub messages: Vec<MessageView>,
}

impl Default for SessionView {
    fn default() -> Self {
        Self {
            state: SessionState::Loading,
            conversation: None,
            counterpart: None,
            counterpart_typing: false,
            messages: Vec::new(),
        }
    }
}

struct Shared {
    view: watch::Sender<SessionView>,
    next_seq: AtomicU64,
    applied_seq: Mutex<u64>,
}

impl Shared {
    fn state(&self) -> SessionState {
        self.view.borrow().state
    }

    fn set_state(&self, state: SessionState) {
        self.view.send_if_modified(|view| {
            let changed = view.state != state;
            view.state = state;
            changed
        });
    }

    /// Ticket for a message fetch about to start.
    fn begin(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Apply a fetched message list unless a later fetch already landed or
    /// the session was torn down while it was in flight.
    fn apply_messages(&self, seq: u64, cancel: &CancellationToken, messages: Vec<MessageView>) -> bool {
        let mut applied = self.applied_seq.lock().unwrap_or_else(|e| e.into_inner());
        if cancel.is_cancelled() || seq <= *applied {
            debug!("Discarding stale message fetch #{} (applied #{})", seq, *applied);
            return false;
        }
        *applied = seq;
        self.view.send_modify(|view| view.messages = messages);
        true
    }
}

pub struct ConversationSession {
    conversation_id: Uuid,
    viewer_id: Uuid,
    services: ChatServices,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ConversationSession {
    /// Open the window for `viewer_id`. Returns at once in `Loading`; the
    /// load and the live updates run on a background task.
    pub fn open(services: ChatServices, conversation_id: Uuid, viewer_id: Uuid) -> Self {
        let (view, _) = watch::channel(SessionView::default());
        let shared = Arc::new(Shared {
            view,
            next_seq: AtomicU64::new(0),
            applied_seq: Mutex::new(0),
        });
        let cancel = CancellationToken::new();

        let runner = Runner {
            conversation_id,
            viewer_id,
            services: services.clone(),
            shared: shared.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(runner.run());

        Self {
            conversation_id,
            viewer_id,
            services,
            shared,
            cancel,
            task: Some(task),
        }
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn view(&self) -> SessionView {
        self.shared.view.borrow().clone()
    }

    /// Receiver that wakes on every view change.
    pub fn watch(&self) -> watch::Receiver<SessionView> {
        self.shared.view.subscribe()
    }

    pub async fn send(&self, outgoing: OutgoingMessage) -> Result<Message, ChatError> {
        self.ready().inspect_err(|e| self.surface(e))?;

        // the message itself ends the typing burst
        self.services.presence.stop_typing_in(self.conversation_id);

        match self.services.store.send(self.conversation_id, self.viewer_id, outgoing).await {
            Ok(message) => {
                debug!("Sent {} in {}", message.id, self.conversation_id);
                Ok(message)
            }
            Err(e) => {
                match e {
                    ChatError::Blocked => self.shared.set_state(SessionState::Blocked),
                    ChatError::NotFound("conversation", _) => self.shared.set_state(SessionState::Closed),
                    _ => {}
                }
                self.surface(&e);
                Err(e)
            }
        }
    }

    pub async fn send_text(&self, content: impl Into<String>) -> Result<Message, ChatError> {
        self.send(OutgoingMessage::Text { content: content.into() }).await
    }

    /// Keystroke in the composer. Ignored unless the session is live.
    pub fn start_typing(&self) {
        if self.state() == SessionState::Ready {
            self.services.presence.start_typing(self.conversation_id);
        }
    }

    pub fn stop_typing(&self) {
        self.services.presence.stop_typing_in(self.conversation_id);
    }

    pub async fn toggle_reaction(&self, message_id: Uuid, emoji: &str) -> Result<ReactionToggle, ChatError> {
        self.ready().inspect_err(|e| self.surface(e))?;
        self.services
            .reactions
            .toggle(self.conversation_id, message_id, self.viewer_id, emoji)
            .await
            .inspect_err(|e| self.surface(e))
    }

    pub async fn respond_to_offer(&self, offer_id: Uuid, accept: bool) -> Result<PriceOffer, ChatError> {
        self.ready().inspect_err(|e| self.surface(e))?;
        self.services
            .store
            .respond_to_offer(offer_id, self.viewer_id, accept)
            .await
            .inspect_err(|e| self.surface(e))
    }

    /// Mark every unread message addressed to the viewer as read.
    pub async fn mark_read(&self) -> Result<usize, ChatError> {
        let unread: Vec<Uuid> = self
            .shared
            .view
            .borrow()
            .messages
            .iter()
            .filter(|v| v.message.receiver_id == self.viewer_id && !v.message.is_read)
            .map(|v| v.message.id)
            .collect();
        if unread.is_empty() {
            return Ok(0);
        }
        self.services.store.mark_read(&unread).await
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), ChatError> {
        self.services
            .store
            .set_muted(self.conversation_id, self.viewer_id, muted)
            .await
            .inspect_err(|e| self.surface(e))
    }

    /// Delete the conversation for both parties.
    pub async fn delete(&self) -> Result<(), ChatError> {
        self.services
            .store
            .delete_conversation(self.conversation_id, self.viewer_id)
            .await
            .inspect_err(|e| self.surface(e))?;
        self.shared.set_state(SessionState::Closed);
        Ok(())
    }

    /// Tear down: subscriptions are released and the viewer's typing
    /// indicator for this conversation is cleared before this returns.
    pub async fn close(mut self) {
        self.cancel.cancel();
        self.services.presence.stop_typing_in(self.conversation_id);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Session task for {} ended abnormally: {}", self.conversation_id, e);
            }
        }
        self.services.presence.flush().await;
        debug!("Session {} closed", self.conversation_id);
    }

    fn ready(&self) -> Result<(), ChatError> {
        match self.state() {
            SessionState::Ready => Ok(()),
            SessionState::Loading => Err(ChatError::NotReady),
            SessionState::Blocked => Err(ChatError::Blocked),
            SessionState::Closed => Err(ChatError::Closed),
        }
    }

    fn surface(&self, e: &ChatError) {
        self.services.toasts.error(e.user_message());
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
            self.services.presence.stop_typing_in(self.conversation_id);
        }
    }
}

struct Subscriptions {
    messages: Subscription,
    reactions: Subscription,
    offers: Subscription,
    conversation: Subscription,
    counterpart: Subscription,
    blocks: Subscription,
}

struct Runner {
    conversation_id: Uuid,
    viewer_id: Uuid,
    services: ChatServices,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl Runner {
    async fn run(self) {
        let Some(subs) = self.load().await else {
            return;
        };
        self.listen(subs).await;
        debug!("Session {} stopped listening", self.conversation_id);
    }

    /// Initial load. Returns the live subscriptions when the session went
    /// `Ready`, `None` when it ended in any other state.
    async fn load(&self) -> Option<Subscriptions> {
        let conversation = match self.services.store.conversation(self.conversation_id).await {
            Ok(c) => c,
            Err(e) => {
                self.fail_load(e);
                return None;
            }
        };

        let Some(counterpart_id) = conversation.counterpart_of(self.viewer_id) else {
            self.fail_load(ChatError::NotParticipant {
                user: self.viewer_id,
                conversation: self.conversation_id,
            });
            return None;
        };

        let blocked = match self.services.store.is_blocked(self.viewer_id, counterpart_id).await {
            Ok(b) => b,
            Err(e) => {
                self.fail_load(e);
                return None;
            }
        };

        let counterpart = match self.services.store.profile(counterpart_id).await {
            Ok(p) => p,
            Err(e) => {
                self.fail_load(e);
                return None;
            }
        };
        // both parties must resolve before the window is usable
        if let Err(e) = self.services.store.profile(self.viewer_id).await {
            self.fail_load(e);
            return None;
        }

        if blocked {
            info!("Conversation {} opened read-only, parties are blocked", self.conversation_id);
            let seq = self.shared.begin();
            let messages = match self.fetch_messages().await {
                Ok(m) => m,
                Err(e) => {
                    warn!("History fetch for blocked {} failed: {}", self.conversation_id, e);
                    Vec::new()
                }
            };
            self.shared.apply_messages(seq, &self.cancel, messages);
            self.publish_loaded(SessionState::Blocked, conversation, counterpart);
            return None;
        }

        // subscribe before fetching so nothing committed in between is missed
        let feed = &self.services.feed;
        let subs = Subscriptions {
            messages: feed.subscribe(ChangeFilter::table(Table::Messages).eq("conversation_id", self.conversation_id)),
            reactions: feed.subscribe(ChangeFilter::table(Table::Reactions).eq("conversation_id", self.conversation_id)),
            offers: feed.subscribe(ChangeFilter::table(Table::PriceOffers).eq("conversation_id", self.conversation_id)),
            conversation: feed.subscribe(ChangeFilter::table(Table::Conversations).eq("id", self.conversation_id)),
            counterpart: feed.subscribe(ChangeFilter::table(Table::Profiles).eq("id", counterpart_id)),
            blocks: feed.subscribe(ChangeFilter::table(Table::BlockedUsers)),
        };

        let seq = self.shared.begin();
        let messages = match self.fetch_messages().await {
            Ok(m) => m,
            Err(e) => {
                self.fail_load(e);
                return None;
            }
        };

        if self.cancel.is_cancelled() {
            return None;
        }
        self.shared.apply_messages(seq, &self.cancel, messages);
        self.publish_loaded(SessionState::Ready, conversation, counterpart);
        info!("Conversation {} ready for {}", self.conversation_id, self.viewer_id);
        Some(subs)
    }

    fn publish_loaded(&self, state: SessionState, conversation: Conversation, counterpart: Profile) {
        if self.cancel.is_cancelled() {
            return;
        }
        let typing = counterpart.presence.is_typing_in(self.conversation_id);
        self.shared.view.send_modify(|view| {
            view.state = state;
            view.conversation = Some(conversation);
            view.counterpart = Some(counterpart);
            view.counterpart_typing = typing;
        });
    }

    /// A transient failure leaves the window in `Loading` with a toast; a
    /// missing or foreign conversation closes it.
    fn fail_load(&self, e: ChatError) {
        warn!("Loading conversation {} failed: {}", self.conversation_id, e);
        match e {
            ChatError::NotFound(..) | ChatError::NotParticipant { .. } => {
                self.shared.set_state(SessionState::Closed);
            }
            _ => {}
        }
        self.services.toasts.error(e.user_message());
    }

    async fn listen(&self, mut subs: Subscriptions) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = subs.messages.recv() => {
                    let Some(first) = result else { break };
                    drain(first, &mut subs.messages);
                    self.refresh_messages().await;
                }
                result = subs.reactions.recv() => {
                    let Some(first) = result else { break };
                    drain(first, &mut subs.reactions);
                    self.refresh_messages().await;
                }
                result = subs.offers.recv() => {
                    let Some(first) = result else { break };
                    drain(first, &mut subs.offers);
                    self.refresh_messages().await;
                }
                result = subs.conversation.recv() => {
                    let Some(first) = result else { break };
                    let events = drain(first, &mut subs.conversation);
                    if events.iter().any(|e| e.kind == ChangeKind::Delete) {
                        info!("Conversation {} was deleted", self.conversation_id);
                        self.shared.set_state(SessionState::Closed);
                        break;
                    }
                    self.refresh_conversation().await;
                }
                result = subs.counterpart.recv() => {
                    let Some(first) = result else { break };
                    drain(first, &mut subs.counterpart);
                    self.refresh_counterpart().await;
                }
                result = subs.blocks.recv() => {
                    let Some(first) = result else { break };
                    let events = drain(first, &mut subs.blocks);
                    if events.iter().any(|e| self.involves_pair(e)) && self.recheck_block().await {
                        break;
                    }
                }
            }
        }
    }

    async fn fetch_messages(&self) -> Result<Vec<MessageView>, ChatError> {
        let store = &self.services.store;
        let messages = store.list_messages(self.conversation_id, self.viewer_id).await?;
        let ids: Vec<Uuid> = messages.iter().map(|m| m.id).collect();
        let mut reactions = self.services.reactions.reactions_for(&ids).await?;
        let offers: HashMap<Uuid, PriceOffer> = store
            .offers(self.conversation_id)
            .await?
            .into_iter()
            .map(|o| (o.id, o))
            .collect();

        Ok(messages
            .into_iter()
            .map(|message| {
                let offer = match &message.payload {
                    MessagePayload::PriceOffer { offer_id } => offers.get(offer_id).cloned(),
                    _ => None,
                };
                MessageView {
                    reactions: reactions.remove(&message.id).unwrap_or_default(),
                    offer,
                    message,
                }
            })
            .collect())
    }

    async fn refresh_messages(&self) {
        let seq = self.shared.begin();
        match self.fetch_messages().await {
            Ok(messages) => {
                self.shared.apply_messages(seq, &self.cancel, messages);
            }
            // a deletion arrives on the conversation subscription
            Err(ChatError::NotFound(..)) => {}
            Err(e) => {
                warn!("Refreshing messages for {} failed: {}", self.conversation_id, e);
                self.services.toasts.error(e.user_message());
            }
        }
    }

    async fn refresh_conversation(&self) {
        match self.services.store.conversation(self.conversation_id).await {
            Ok(conversation) if !self.cancel.is_cancelled() => {
                self.shared.view.send_modify(|view| view.conversation = Some(conversation));
            }
            Ok(_) => debug!("Discarding conversation refresh for closed session {}", self.conversation_id),
            Err(e) => warn!("Refreshing conversation {} failed: {}", self.conversation_id, e),
        }
    }

    async fn refresh_counterpart(&self) {
        let Some(counterpart_id) = self.counterpart_id() else {
            return;
        };
        match self.services.store.profile(counterpart_id).await {
            Ok(profile) if !self.cancel.is_cancelled() => {
                let typing = profile.presence.is_typing_in(self.conversation_id);
                self.shared.view.send_modify(|view| {
                    view.counterpart_typing = typing;
                    view.counterpart = Some(profile);
                });
            }
            Ok(_) => debug!("Discarding presence refresh for closed session {}", self.conversation_id),
            Err(e) => warn!("Refreshing presence of {} failed: {}", counterpart_id, e),
        }
    }

    /// True when the pair is now blocked and the session went `Blocked`.
    async fn recheck_block(&self) -> bool {
        let Some(counterpart_id) = self.counterpart_id() else {
            return false;
        };
        match self.services.store.is_blocked(self.viewer_id, counterpart_id).await {
            Ok(true) => {
                info!("Conversation {} is now blocked", self.conversation_id);
                self.shared.set_state(SessionState::Blocked);
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!("Block check for {} failed: {}", self.conversation_id, e);
                false
            }
        }
    }

    fn counterpart_id(&self) -> Option<Uuid> {
        self.shared
            .view
            .borrow()
            .conversation
            .as_ref()
            .and_then(|c| c.counterpart_of(self.viewer_id))
    }

    fn involves_pair(&self, event: &ChangeEvent) -> bool {
        let Some(counterpart) = self.counterpart_id() else {
            return false;
        };
        let (viewer, counterpart) = (self.viewer_id.to_string(), counterpart.to_string());
        match (event.key("blocker_id"), event.key("blocked_id")) {
            (Some(a), Some(b)) => (a == viewer && b == counterpart) || (a == counterpart && b == viewer),
            _ => false,
        }
    }
}

/// Collect the event that woke us plus anything already queued behind it.
/// One re-fetch covers the whole batch.
fn drain(first: ChangeEvent, sub: &mut Subscription) -> Vec<ChangeEvent> {
    let mut events = vec![first];
    while let Some(event) = sub.try_recv() {
        events.push(event);
    }
    if events.len() > 1 {
        debug!("Coalesced {} events on {}", events.len(), sub.filter());
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn shared() -> Shared {
        let (view, _) = watch::channel(SessionView::default());
        Shared {
            view,
            next_seq: AtomicU64::new(0),
            applied_seq: Mutex::new(0),
        }
    }

    fn fetched(content: &str) -> Vec<MessageView> {
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            receiver_id: Uuid::new_v4(),
            content: content.to_string(),
            payload: MessagePayload::Text,
            is_read: false,
            created_at: Utc::now(),
        };
        vec![MessageView {
            message,
            reactions: Vec::new(),
            offer: None,
        }]
    }

    fn shown(shared: &Shared) -> Vec<String> {
        shared
            .view
            .borrow()
            .messages
            .iter()
            .map(|m| m.message.content.clone())
            .collect()
    }

    #[test]
    fn older_fetch_landing_late_is_discarded() {
        let shared = shared();
        let cancel = CancellationToken::new();
        let first = shared.begin();
        let second = shared.begin();

        assert!(shared.apply_messages(second, &cancel, fetched("newer")));
        assert!(!shared.apply_messages(first, &cancel, fetched("older")));
        assert_eq!(shown(&shared), vec!["newer"]);
    }

    #[test]
    fn fetch_finishing_after_teardown_is_discarded() {
        let shared = shared();
        let cancel = CancellationToken::new();
        let seq = shared.begin();

        cancel.cancel();
        assert!(!shared.apply_messages(seq, &cancel, fetched("too late")));
        assert!(shown(&shared).is_empty());
    }
}
