//! Push capability behind one interface: a bridge to the native push
//! subsystem where one exists, a no-op everywhere else.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};

use bazaar_types::api::NotificationData;
use bazaar_types::events::PushEvent;
use bazaar_types::models::PermissionStatus;

use crate::error::PushError;

const EVENT_CAPACITY: usize = 64;
const REQUEST_CAPACITY: usize = 16;

#[async_trait]
pub trait PushPlatform: Send + Sync {
    /// Whether this platform can deliver push at all.
    fn is_supported(&self) -> bool;

    async fn check_permission(&self) -> Result<PermissionStatus, PushError>;

    /// Show the OS permission prompt.
    async fn request_permission(&self) -> Result<PermissionStatus, PushError>;

    /// Obtain a device token. Only valid once permission is granted.
    async fn register(&self) -> Result<String, PushError>;

    async fn unregister(&self) -> Result<(), PushError>;

    /// Token rotation, foreground delivery and tap events. Subscribe before
    /// the call that may trigger them.
    fn events(&self) -> broadcast::Receiver<PushEvent>;

    /// The tap that launched the app, if it arrived before anyone was
    /// listening. Taken at most once.
    fn take_launch_tap(&self) -> Option<NotificationData> {
        None
    }
}

/// Platforms without native push (web, headless).
pub struct NoopPush {
    events: broadcast::Sender<PushEvent>,
}

impl NoopPush {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1);
        Self { events }
    }
}

impl Default for NoopPush {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushPlatform for NoopPush {
    fn is_supported(&self) -> bool {
        false
    }

    async fn check_permission(&self) -> Result<PermissionStatus, PushError> {
        Err(PushError::Unsupported)
    }

    async fn request_permission(&self) -> Result<PermissionStatus, PushError> {
        Err(PushError::Unsupported)
    }

    async fn register(&self) -> Result<String, PushError> {
        Err(PushError::Unsupported)
    }

    async fn unregister(&self) -> Result<(), PushError> {
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<PushEvent> {
        self.events.subscribe()
    }
}

/// A call into the native push subsystem, answered by the [`NativeHost`].
#[derive(Debug)]
pub enum PushRequest {
    CheckPermission(oneshot::Sender<PermissionStatus>),
    RequestPermission(oneshot::Sender<PermissionStatus>),
    Register(oneshot::Sender<Result<String, PushError>>),
    Unregister(oneshot::Sender<()>),
}

/// App-side handle of the native bridge.
pub struct NativePush {
    requests: mpsc::Sender<PushRequest>,
    emitter: PushEmitter,
}

/// Native side of the bridge: answers [`PushRequest`]s and emits OS events.
pub struct NativeHost {
    requests: mpsc::Receiver<PushRequest>,
    emitter: PushEmitter,
}

/// Emits OS events into the bridge. A tap that finds no listener is parked
/// until the app takes it as its launch tap.
#[derive(Clone)]
pub struct PushEmitter {
    events: broadcast::Sender<PushEvent>,
    launch_tap: Arc<Mutex<Option<NotificationData>>>,
}

impl PushEmitter {
    /// Deliver an OS event to every listener. Returns how many received it.
    pub fn emit(&self, event: PushEvent) -> usize {
        // held across send so a subscriber either receives the tap or finds
        // it parked
        let mut parked = self.launch_tap.lock().unwrap_or_else(|e| e.into_inner());
        match self.events.send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(PushEvent::Tapped { data })) => {
                debug!("Tap arrived before any listener, keeping it as launch tap");
                *parked = Some(data);
                0
            }
            Err(_) => {
                debug!("Push event emitted with no listener");
                0
            }
        }
    }

    pub fn listeners(&self) -> usize {
        self.events.receiver_count()
    }

    fn take_launch_tap(&self) -> Option<NotificationData> {
        self.launch_tap.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

impl NativePush {
    pub fn new() -> (Self, NativeHost) {
        let (req_tx, req_rx) = mpsc::channel(REQUEST_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let emitter = PushEmitter {
            events,
            launch_tap: Arc::new(Mutex::new(None)),
        };
        (
            Self {
                requests: req_tx,
                emitter: emitter.clone(),
            },
            NativeHost {
                requests: req_rx,
                emitter,
            },
        )
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> PushRequest) -> Result<T, PushError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(make(tx))
            .await
            .map_err(|_| PushError::Platform("native push host is gone".to_string()))?;
        rx.await
            .map_err(|_| PushError::Platform("native push host dropped the request".to_string()))
    }
}

#[async_trait]
impl PushPlatform for NativePush {
    fn is_supported(&self) -> bool {
        true
    }

    async fn check_permission(&self) -> Result<PermissionStatus, PushError> {
        self.call(PushRequest::CheckPermission).await
    }

    async fn request_permission(&self) -> Result<PermissionStatus, PushError> {
        self.call(PushRequest::RequestPermission).await
    }

    async fn register(&self) -> Result<String, PushError> {
        self.call(PushRequest::Register).await?
    }

    async fn unregister(&self) -> Result<(), PushError> {
        self.call(PushRequest::Unregister).await
    }

    fn events(&self) -> broadcast::Receiver<PushEvent> {
        self.emitter.events.subscribe()
    }

    fn take_launch_tap(&self) -> Option<NotificationData> {
        self.emitter.take_launch_tap()
    }
}

impl NativeHost {
    pub async fn next_request(&mut self) -> Option<PushRequest> {
        self.requests.recv().await
    }

    pub fn emit(&self, event: PushEvent) -> usize {
        self.emitter.emit(event)
    }

    /// Handle for emitting events from elsewhere once the request loop owns
    /// the host.
    pub fn emitter(&self) -> PushEmitter {
        self.emitter.clone()
    }
}

/// Pick the push implementation once at startup.
pub fn select_platform(native: Option<NativePush>) -> Arc<dyn PushPlatform> {
    match native {
        Some(native) => {
            info!("Using native push bridge");
            Arc::new(native)
        }
        None => {
            info!("Native push unavailable, push notifications disabled");
            Arc::new(NoopPush::new())
        }
    }
}
