use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use bazaar_db::Database;
use bazaar_notify::{
    GatewayState, NativeHost, NativePush, Navigator, NotificationGateway, NotificationRouter, PushEmitter,
    PushError, PushRequest, select_platform,
};
use bazaar_realtime::ChangeFeed;
use bazaar_types::api::{ForegroundNotification, NotificationData, Route};
use bazaar_types::events::PushEvent;
use bazaar_types::models::PermissionStatus;
use bazaar_types::toast::Toasts;

/// Scripted native side: answers permission checks from shared state and
/// counts the calls the gateway makes.
#[derive(Clone)]
struct Script {
    current: Arc<Mutex<PermissionStatus>>,
    answer: Arc<Mutex<PermissionStatus>>,
    prompts: Arc<AtomicUsize>,
    registers: Arc<AtomicUsize>,
    unregisters: Arc<AtomicUsize>,
}

impl Script {
    fn new(current: PermissionStatus, answer: PermissionStatus) -> Self {
        Self {
            current: Arc::new(Mutex::new(current)),
            answer: Arc::new(Mutex::new(answer)),
            prompts: Arc::default(),
            registers: Arc::default(),
            unregisters: Arc::default(),
        }
    }

    fn serve(&self, mut host: NativeHost) -> PushEmitter {
        let emitter = host.emitter();
        let script = self.clone();
        tokio::spawn(async move {
            while let Some(request) = host.next_request().await {
                match request {
                    PushRequest::CheckPermission(reply) => {
                        let _ = reply.send(*script.current.lock().unwrap());
                    }
                    PushRequest::RequestPermission(reply) => {
                        script.prompts.fetch_add(1, Ordering::SeqCst);
                        let answer = *script.answer.lock().unwrap();
                        *script.current.lock().unwrap() = answer;
                        let _ = reply.send(answer);
                    }
                    PushRequest::Register(reply) => {
                        let n = script.registers.fetch_add(1, Ordering::SeqCst);
                        let _ = reply.send(Ok(format!("token-{n}")));
                    }
                    PushRequest::Unregister(reply) => {
                        script.unregisters.fetch_add(1, Ordering::SeqCst);
                        let _ = reply.send(());
                    }
                }
            }
        });
        emitter
    }
}

#[derive(Default)]
struct Recorder(Mutex<Vec<Route>>);

impl Navigator for Recorder {
    fn navigate(&self, route: &Route) {
        self.0.lock().unwrap().push(route.clone());
    }
}

struct Rig {
    db: Arc<Database>,
    user: Uuid,
    gateway: NotificationGateway,
    router: NotificationRouter,
    events: PushEmitter,
    toasts: tokio::sync::mpsc::UnboundedReceiver<bazaar_types::toast::Toast>,
}

fn rig(script: &Script) -> Rig {
    let db = Arc::new(Database::open_in_memory(ChangeFeed::new()).unwrap());
    let user = Uuid::new_v4();
    db.create_profile(&user.to_string(), "seller").unwrap();

    let (native, host) = NativePush::new();
    let events = script.serve(host);
    let router = NotificationRouter::new(Duration::from_millis(10));
    let (toasts, toast_rx) = Toasts::channel();
    let gateway = NotificationGateway::new(select_platform(Some(native)), db.clone(), router.clone(), toasts);

    Rig {
        db,
        user,
        gateway,
        router,
        events,
        toasts: toast_rx,
    }
}

impl Rig {
    fn stored_token(&self) -> Option<String> {
        self.db
            .get_push_registration(&self.user.to_string())
            .unwrap()
            .map(|r| r.token)
    }
}

async fn eventually(what: &str, mut f: impl FnMut() -> bool) {
    for _ in 0..200 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn prompt_then_grant_persists_token() {
    let script = Script::new(PermissionStatus::Prompt, PermissionStatus::Granted);
    let r = rig(&script);

    let state = r.gateway.on_authenticated(r.user).await.unwrap();
    assert_eq!(state, GatewayState::TokenObtained);
    assert_eq!(script.prompts.load(Ordering::SeqCst), 1);
    assert_eq!(r.gateway.token().as_deref(), Some("token-0"));
    assert_eq!(r.stored_token().as_deref(), Some("token-0"));

    let registration = r.gateway.registration().await.unwrap().unwrap();
    assert_eq!(registration.permission, PermissionStatus::Granted);
    assert_eq!(registration.user_id, r.user);
}

#[tokio::test]
async fn already_granted_skips_the_prompt() {
    let script = Script::new(PermissionStatus::Granted, PermissionStatus::Denied);
    let r = rig(&script);

    assert_eq!(r.gateway.on_authenticated(r.user).await.unwrap(), GatewayState::TokenObtained);
    assert_eq!(script.prompts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn reauthentication_overwrites_the_token() {
    let script = Script::new(PermissionStatus::Granted, PermissionStatus::Granted);
    let r = rig(&script);

    r.gateway.on_authenticated(r.user).await.unwrap();
    r.gateway.on_authenticated(r.user).await.unwrap();
    assert_eq!(r.stored_token().as_deref(), Some("token-1"));
}

#[tokio::test]
async fn rotated_token_is_persisted() {
    let script = Script::new(PermissionStatus::Granted, PermissionStatus::Granted);
    let r = rig(&script);
    r.gateway.on_authenticated(r.user).await.unwrap();

    r.events.emit(PushEvent::TokenRefreshed { token: "rotated".to_string() });
    eventually("rotated token", || r.stored_token().as_deref() == Some("rotated")).await;
    assert_eq!(r.gateway.token().as_deref(), Some("rotated"));
}

#[tokio::test]
async fn denial_is_terminal_until_settings_retry() {
    let script = Script::new(PermissionStatus::Prompt, PermissionStatus::Denied);
    let r = rig(&script);

    assert_eq!(r.gateway.on_authenticated(r.user).await.unwrap(), GatewayState::Denied);
    assert_eq!(r.gateway.on_authenticated(r.user).await.unwrap(), GatewayState::Denied);
    assert_eq!(script.prompts.load(Ordering::SeqCst), 1, "denied must not prompt again");
    assert_eq!(r.stored_token(), None);

    // the user flips the switch in OS settings
    *script.current.lock().unwrap() = PermissionStatus::Granted;
    assert_eq!(r.gateway.retry_from_settings().await.unwrap(), GatewayState::TokenObtained);
    assert!(r.stored_token().is_some());
}

#[tokio::test]
async fn unregister_twice_is_not_an_error() {
    let script = Script::new(PermissionStatus::Granted, PermissionStatus::Granted);
    let r = rig(&script);
    r.gateway.on_authenticated(r.user).await.unwrap();

    r.gateway.unregister().await.unwrap();
    r.gateway.unregister().await.unwrap();

    assert_eq!(r.gateway.state(), GatewayState::Unregistered);
    assert_eq!(r.gateway.token(), None);
    assert_eq!(r.stored_token(), None);
    assert_eq!(script.unregisters.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unregister_removes_listeners() {
    let script = Script::new(PermissionStatus::Granted, PermissionStatus::Granted);
    let r = rig(&script);
    r.gateway.on_authenticated(r.user).await.unwrap();
    r.gateway.unregister().await.unwrap();

    // give the aborted listener a chance to go away
    eventually("listener dropped", || r.events.listeners() == 0).await;
}

#[tokio::test]
async fn tap_is_routed_and_foreground_only_toasts() {
    let script = Script::new(PermissionStatus::Granted, PermissionStatus::Granted);
    let mut r = rig(&script);
    let recorder = Arc::new(Recorder::default());
    r.router.mount(recorder.clone());
    r.gateway.on_authenticated(r.user).await.unwrap();

    r.events
        .emit(PushEvent::Foreground(ForegroundNotification {
            title: "New offer".to_string(),
            body: "Someone offered 25.00".to_string(),
            data: NotificationData::from([("type", "offer"), ("listingId", "L1")]),
        }));
    let toast = tokio::time::timeout(Duration::from_secs(2), r.toasts.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(toast.title, "New offer");
    assert!(recorder.0.lock().unwrap().is_empty(), "foreground delivery must not navigate");

    r.events
        .emit(PushEvent::Tapped {
            data: NotificationData::from([("type", "payment")]),
        });
    eventually("navigation", || recorder.0.lock().unwrap().len() == 1).await;
    assert_eq!(recorder.0.lock().unwrap()[0], Route::new("/transactions"));
}

#[tokio::test]
async fn tap_that_launched_the_app_navigates_after_startup() {
    let script = Script::new(PermissionStatus::Prompt, PermissionStatus::Granted);
    let r = rig(&script);

    // the OS delivers the tap before anything in the app is listening
    let heard = r.events.emit(PushEvent::Tapped {
        data: NotificationData::from([("type", "payment")]),
    });
    assert_eq!(heard, 0);

    r.gateway.on_authenticated(r.user).await.unwrap();
    let recorder = Arc::new(Recorder::default());
    r.router.mount(recorder.clone());

    eventually("launch navigation", || recorder.0.lock().unwrap().len() == 1).await;
    assert_eq!(recorder.0.lock().unwrap()[0], Route::new("/transactions"));

    // authenticating again does not replay it
    r.gateway.on_authenticated(r.user).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.0.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn taps_are_routed_while_permission_is_denied() {
    let script = Script::new(PermissionStatus::Denied, PermissionStatus::Denied);
    let r = rig(&script);
    let recorder = Arc::new(Recorder::default());
    r.router.mount(recorder.clone());

    assert_eq!(r.gateway.on_authenticated(r.user).await.unwrap(), GatewayState::Denied);
    assert_eq!(r.events.listeners(), 1);

    r.events.emit(PushEvent::Tapped {
        data: NotificationData::from([("type", "listing"), ("listingId", "L4")]),
    });
    eventually("navigation", || recorder.0.lock().unwrap().len() == 1).await;
    assert_eq!(recorder.0.lock().unwrap()[0], Route::new("/listing/L4"));
}

#[tokio::test]
async fn muted_conversation_raises_no_toast() {
    let script = Script::new(PermissionStatus::Granted, PermissionStatus::Granted);
    let mut r = rig(&script);
    let other = Uuid::new_v4();
    let conversation = Uuid::new_v4();
    r.db.create_profile(&other.to_string(), "buyer").unwrap();
    r.db.create_conversation(
        &conversation.to_string(),
        &Uuid::new_v4().to_string(),
        &other.to_string(),
        &r.user.to_string(),
    )
    .unwrap();
    r.db.set_muted(&conversation.to_string(), &r.user.to_string(), true).unwrap();
    r.gateway.on_authenticated(r.user).await.unwrap();

    let message = |title: &str, conversation: &str| {
        PushEvent::Foreground(ForegroundNotification {
            title: title.to_string(),
            body: "hi".to_string(),
            data: NotificationData::from([("type", "message"), ("conversationId", conversation)]),
        })
    };
    r.events.emit(message("muted", &conversation.to_string()));
    r.events.emit(message("loud", &Uuid::new_v4().to_string()));

    let toast = tokio::time::timeout(Duration::from_secs(2), r.toasts.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(toast.title, "loud");
}

#[tokio::test]
async fn unsupported_platform_stays_unregistered() {
    let db = Arc::new(Database::open_in_memory(ChangeFeed::new()).unwrap());
    let gateway = NotificationGateway::new(
        select_platform(None),
        db,
        NotificationRouter::default(),
        Toasts::disabled(),
    );
    let user = Uuid::new_v4();

    assert_eq!(gateway.on_authenticated(user).await.unwrap(), GatewayState::Unregistered);
    assert!(matches!(gateway.retry_from_settings().await, Err(PushError::Unsupported)));
    gateway.unregister().await.unwrap();
    gateway.unregister().await.unwrap();
}
