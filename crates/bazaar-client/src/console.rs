use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use bazaar_chat::{ChatServices, ConversationSession, MessageView, SessionState, SessionView};
use bazaar_notify::{Navigator, NotificationGateway, NotificationRouter};
use bazaar_types::api::{NotificationData, Route};
use bazaar_types::models::OutgoingMessage;

pub const HELP: &str = "\
commands:
  /new <listing-id> <seller-id>   start or resume a conversation about a listing
  /open <conversation-id>         open a conversation
  /typing                         signal a keystroke
  /react <message-id> <emoji>     toggle a reaction
  /offer <amount>                 make a price offer, e.g. /offer 25.50
  /accept <offer-id>              accept an offer made to you
  /reject <offer-id>              reject an offer made to you
  /mute, /unmute                  silence push for this conversation
  /delete                         delete this conversation
  /unread                         unread messages across conversations
  /tap <json>                     simulate tapping a push notification
  /logout                         remove this device's push registration
  /quit
anything else is sent as a text message";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    New { listing: Uuid, seller: Uuid },
    Open(Uuid),
    Send(String),
    Typing,
    React { message: Uuid, emoji: String },
    Offer(i64),
    Respond { offer: Uuid, accept: bool },
    Mute(bool),
    Delete,
    Unread,
    Tap(NotificationData),
    Logout,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Self::Send(line.to_string()));
        };

        let (name, args) = rest.split_once(' ').unwrap_or((rest, ""));
        let args = args.trim();
        let mut words = args.split_whitespace();
        let mut id = |what: &str| -> Result<Uuid, String> {
            let word = words.next().ok_or_else(|| format!("missing {what}"))?;
            word.parse().map_err(|_| format!("'{word}' is not a valid {what}"))
        };

        let cmd = match name {
            "new" => {
                let listing = id("listing id")?;
                let seller = id("seller id")?;
                Self::New { listing, seller }
            }
            "open" => Self::Open(id("conversation id")?),
            "typing" => Self::Typing,
            "react" => {
                let message = id("message id")?;
                let emoji = words.next().ok_or("missing emoji")?.to_string();
                Self::React { message, emoji }
            }
            "offer" => Self::Offer(parse_amount(args)?),
            "accept" => Self::Respond { offer: id("offer id")?, accept: true },
            "reject" => Self::Respond { offer: id("offer id")?, accept: false },
            "mute" => Self::Mute(true),
            "unmute" => Self::Mute(false),
            "delete" => Self::Delete,
            "unread" => Self::Unread,
            "tap" => Self::Tap(serde_json::from_str(args).map_err(|e| format!("bad payload: {e}"))?),
            "logout" => Self::Logout,
            "help" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => return Err(format!("unknown command /{other}")),
        };
        Ok(cmd)
    }
}

/// "25", "25.5" and "25.50" in major units to minor units. Digits only, so
/// a sign anywhere is rejected.
fn parse_amount(text: &str) -> Result<i64, String> {
    let invalid = || format!("'{text}' is not an amount");
    let digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());

    let (major, minor) = text.split_once('.').unwrap_or((text, "0"));
    if !digits(major) || !digits(minor) || minor.len() > 2 {
        return Err(invalid());
    }
    let major: i64 = major.parse().map_err(|_| invalid())?;
    let minor: i64 = format!("{minor:0<2}").parse().map_err(|_| invalid())?;
    major
        .checked_mul(100)
        .and_then(|m| m.checked_add(minor))
        .ok_or_else(invalid)
}

/// Conversation id carried by a `/messages?conversation=<id>` route.
pub fn conversation_from_route(route: &Route) -> Option<Uuid> {
    route
        .as_str()
        .strip_prefix("/messages?conversation=")?
        .parse()
        .ok()
}

/// Hands routes from the notification router to the console loop.
pub struct ConsoleNavigator {
    routes: mpsc::UnboundedSender<Route>,
}

impl ConsoleNavigator {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Route>) {
        let (routes, rx) = mpsc::unbounded_channel();
        (Self { routes }, rx)
    }
}

impl Navigator for ConsoleNavigator {
    fn navigate(&self, route: &Route) {
        if self.routes.send(route.clone()).is_err() {
            debug!("Console gone, dropping route {}", route);
        }
    }
}

pub struct Console {
    user: Uuid,
    services: ChatServices,
    router: NotificationRouter,
    gateway: Arc<NotificationGateway>,
    session: Option<ConversationSession>,
    renderer: Option<JoinHandle<()>>,
    closed: mpsc::UnboundedSender<Uuid>,
}

impl Console {
    /// The receiver yields the id of an open conversation once it closes
    /// underneath the user; hand it back to [`Console::leave_closed`].
    pub fn new(
        user: Uuid,
        services: ChatServices,
        router: NotificationRouter,
        gateway: Arc<NotificationGateway>,
    ) -> (Self, mpsc::UnboundedReceiver<Uuid>) {
        let (closed, closed_rx) = mpsc::unbounded_channel();
        let console = Self {
            user,
            services,
            router,
            gateway,
            session: None,
            renderer: None,
            closed,
        };
        (console, closed_rx)
    }

    /// Run one command. Returns false when the console should exit.
    pub async fn execute(&mut self, command: Command) -> bool {
        match command {
            Command::Quit => return false,
            Command::Help => println!("{HELP}"),
            Command::New { listing, seller } => {
                let opened = self.services.store.open_conversation(listing, self.user, seller).await;
                match opened {
                    Ok(conversation) => self.open(conversation.id).await,
                    Err(e) => self.services.toasts.error(e.user_message()),
                }
            }
            Command::Open(id) => self.open(id).await,
            Command::Unread => match self.services.store.unread_count(self.user).await {
                Ok(n) => println!("{n} unread"),
                Err(e) => self.services.toasts.error(e.user_message()),
            },
            Command::Tap(data) => {
                if self.router.handle_tap(&data).is_none() {
                    println!("(notification has no destination)");
                }
            }
            Command::Logout => match self.gateway.unregister().await {
                Ok(()) => println!("push registration removed"),
                Err(e) => warn!("Push unregister failed: {}", e),
            },
            other => self.in_session(other).await,
        }
        true
    }

    /// Commands that act on the open conversation. Failures were already
    /// surfaced as toasts by the session.
    async fn in_session(&mut self, command: Command) {
        let Some(session) = &self.session else {
            println!("no conversation open, use /open or /new");
            return;
        };

        let result = match command {
            Command::Send(text) if text.is_empty() => Ok(()),
            Command::Send(text) => session.send_text(text).await.map(drop),
            Command::Typing => {
                session.start_typing();
                Ok(())
            }
            Command::React { message, emoji } => session.toggle_reaction(message, &emoji).await.map(drop),
            Command::Offer(amount) => session.send(OutgoingMessage::PriceOffer { amount }).await.map(drop),
            Command::Respond { offer, accept } => session.respond_to_offer(offer, accept).await.map(drop),
            Command::Mute(muted) => session.set_muted(muted).await,
            Command::Delete => session.delete().await,
            _ => Ok(()),
        };
        if let Err(e) = result {
            debug!("Console command failed: {}", e);
        }
    }

    pub async fn open(&mut self, conversation_id: Uuid) {
        self.close_session().await;

        let session = ConversationSession::open(self.services.clone(), conversation_id, self.user);
        let mut views = session.watch();
        let closed = self.closed.clone();
        self.renderer = Some(tokio::spawn(async move {
            let mut printed = Printed::default();
            // the first pass renders whatever the session reached before
            // this task started
            loop {
                let view = views.borrow_and_update().clone();
                for line in printed.render(&view) {
                    println!("{line}");
                }
                if view.state == SessionState::Closed {
                    let _ = closed.send(conversation_id);
                    break;
                }
                if views.changed().await.is_err() {
                    break;
                }
            }
        }));
        self.session = Some(session);
        info!("Opened conversation {}", conversation_id);
    }

    /// Follow a route delivered by the notification router.
    pub async fn navigate(&mut self, route: Route) {
        match conversation_from_route(&route) {
            Some(id) => self.open(id).await,
            None => println!("=> {route}"),
        }
    }

    pub fn open_conversation(&self) -> Option<Uuid> {
        self.session.as_ref().map(ConversationSession::conversation_id)
    }

    /// Navigate away from a conversation that closed while open. A stale
    /// notice for a window already left is ignored.
    pub async fn leave_closed(&mut self, conversation_id: Uuid) {
        if self.open_conversation() != Some(conversation_id) {
            debug!("Ignoring close of {}, no longer open", conversation_id);
            return;
        }
        self.close_session().await;
        println!("-- back to your conversations, use /open or /new");
    }

    async fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        if let Some(renderer) = self.renderer.take() {
            renderer.abort();
        }
    }

    pub async fn shutdown(mut self) {
        self.close_session().await;
        self.router.unmount();
    }
}

/// Incremental terminal rendering of a session view. A message is printed
/// when it first appears and again whenever its reactions or offer change.
#[derive(Default)]
struct Printed {
    state: Option<SessionState>,
    lines: HashMap<Uuid, String>,
    typing: bool,
}

impl Printed {
    fn render(&mut self, view: &SessionView) -> Vec<String> {
        let mut out = Vec::new();

        if self.state != Some(view.state) {
            self.state = Some(view.state);
            match view.state {
                SessionState::Loading => {}
                SessionState::Ready => {
                    if let Some(counterpart) = &view.counterpart {
                        let status = if counterpart.presence.is_online { "online" } else { "offline" };
                        out.push(format!("-- chatting with {} ({status})", counterpart.display_name));
                    }
                }
                SessionState::Blocked => out.push("-- you can't message this person".to_string()),
                SessionState::Closed => out.push("-- conversation closed".to_string()),
            }
        }

        let counterpart = view.counterpart.as_ref().map(|p| p.id);
        for item in &view.messages {
            let line = message_line(item, counterpart);
            match self.lines.insert(item.message.id, line.clone()) {
                None => out.push(line),
                Some(previous) if previous != line => out.push(format!("{line}  (updated)")),
                Some(_) => {}
            }
        }

        if view.counterpart_typing != self.typing {
            self.typing = view.counterpart_typing;
            if self.typing {
                out.push("   typing...".to_string());
            }
        }
        out
    }
}

fn message_line(item: &MessageView, counterpart: Option<Uuid>) -> String {
    let m = &item.message;
    let reactions: Vec<String> = item.reactions.iter().map(|g| format!("{}{}", g.emoji, g.count)).collect();
    let offer = item
        .offer
        .as_ref()
        .map(|o| format!(" [{}]", o.status.as_str()))
        .unwrap_or_default();
    format!(
        "[{}] {}: {}{} {}  ({})",
        m.created_at.format("%H:%M"),
        if Some(m.sender_id) == counterpart { "them" } else { "you" },
        m.content,
        offer,
        reactions.join(" "),
        m.id
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;

    use bazaar_chat::PresenceTracker;
    use bazaar_db::Database;
    use bazaar_notify::select_platform;
    use bazaar_realtime::ChangeFeed;
    use bazaar_types::models::{Message, MessagePayload, PriceOffer, PriceOfferStatus, ReactionGroup};
    use bazaar_types::toast::Toasts;

    #[test]
    fn plain_text_is_a_message() {
        assert_eq!("hello there".parse::<Command>(), Ok(Command::Send("hello there".into())));
    }

    #[test]
    fn commands_parse_their_arguments() {
        let id = Uuid::new_v4();
        assert_eq!(format!("/open {id}").parse::<Command>(), Ok(Command::Open(id)));
        assert_eq!(
            format!("/react {id} 👍").parse::<Command>(),
            Ok(Command::React { message: id, emoji: "👍".into() })
        );
        assert_eq!(
            format!("/reject {id}").parse::<Command>(),
            Ok(Command::Respond { offer: id, accept: false })
        );
        assert_eq!(
            r#"/tap {"type":"payment"}"#.parse::<Command>(),
            Ok(Command::Tap(NotificationData::from([("type", "payment")])))
        );
        assert!("/open not-a-uuid".parse::<Command>().is_err());
        assert!("/frobnicate".parse::<Command>().is_err());
    }

    #[test]
    fn amounts_are_in_major_units() {
        assert_eq!(parse_amount("25"), Ok(2500));
        assert_eq!(parse_amount("25.5"), Ok(2550));
        assert_eq!(parse_amount("0.05"), Ok(5));
        assert!(parse_amount("1.234").is_err());
        assert!(parse_amount("abc").is_err());
        assert!(parse_amount("3.").is_err());
    }

    #[test]
    fn signs_are_never_accepted() {
        assert!(parse_amount("-0.50").is_err());
        assert!(parse_amount("-5").is_err());
        assert!(parse_amount("+5").is_err());
        assert!(parse_amount("1.-5").is_err());
        assert!(parse_amount("1.+5").is_err());
        assert!(parse_amount(".50").is_err());
        assert!("/offer -0.50".parse::<Command>().is_err());
    }

    #[test]
    fn message_routes_carry_the_conversation() {
        let id = Uuid::new_v4();
        assert_eq!(conversation_from_route(&Route::new(format!("/messages?conversation={id}"))), Some(id));
        assert_eq!(conversation_from_route(&Route::new("/messages")), None);
        assert_eq!(conversation_from_route(&Route::new("/listing/L9")), None);
    }

    fn view_with(offer: Option<PriceOfferStatus>, hearts: usize) -> (SessionView, Uuid) {
        let (me, them, conversation) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let id = Uuid::from_u128(7);
        let message = Message {
            id,
            conversation_id: conversation,
            sender_id: me,
            receiver_id: them,
            content: "Offered 25.00".to_string(),
            payload: MessagePayload::PriceOffer { offer_id: id },
            is_read: false,
            created_at: Utc::now(),
        };
        let offer = offer.map(|status| PriceOffer {
            id,
            conversation_id: conversation,
            listing_id: Uuid::new_v4(),
            sender_id: me,
            receiver_id: them,
            amount: 2500,
            status,
            created_at: message.created_at,
        });
        let reactions = (hearts > 0)
            .then(|| ReactionGroup {
                emoji: "❤️".to_string(),
                count: hearts,
                user_ids: vec![them; hearts],
            })
            .into_iter()
            .collect();
        let view = SessionView {
            state: SessionState::Ready,
            messages: vec![MessageView { message, reactions, offer }],
            ..SessionView::default()
        };
        (view, id)
    }

    #[test]
    fn changed_messages_are_printed_again() {
        let mut printed = Printed::default();
        let (view, id) = view_with(Some(PriceOfferStatus::Pending), 0);
        let lines = printed.render(&view);
        assert!(lines.iter().any(|l| l.contains("[pending]") && l.contains(&id.to_string())));

        // an identical view prints nothing
        assert!(printed.render(&view).is_empty());

        let (accepted, _) = view_with(Some(PriceOfferStatus::Accepted), 1);
        let lines = printed.render(&accepted);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("[accepted]"));
        assert!(lines[0].contains("❤️1"));
        assert!(lines[0].ends_with("(updated)"));
    }

    #[tokio::test]
    async fn closed_conversation_is_left() {
        let db = Arc::new(Database::open_in_memory(ChangeFeed::new()).unwrap());
        let (buyer, seller) = (Uuid::new_v4(), Uuid::new_v4());
        db.create_profile(&buyer.to_string(), "buyer").unwrap();
        db.create_profile(&seller.to_string(), "seller").unwrap();

        let presence = Arc::new(PresenceTracker::new(db.clone(), buyer));
        let services = ChatServices::new(db.clone(), presence, Toasts::disabled());
        let router = NotificationRouter::default();
        let gateway = Arc::new(NotificationGateway::new(
            select_platform(None),
            db.clone(),
            router.clone(),
            Toasts::disabled(),
        ));
        let (mut console, mut closed) = Console::new(buyer, services.clone(), router, gateway);

        assert!(console.execute(Command::New { listing: Uuid::new_v4(), seller }).await);
        let conversation = console.open_conversation().unwrap();

        services.store.delete_conversation(conversation, seller).await.unwrap();
        let id = tokio::time::timeout(Duration::from_secs(5), closed.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, conversation);

        console.leave_closed(id).await;
        assert_eq!(console.open_conversation(), None);
        assert_eq!(db.feed().subscriber_count(), 0);

        // a late duplicate notice is harmless
        console.leave_closed(id).await;
        console.shutdown().await;
    }
}
