use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use bazaar_db::Database;
use bazaar_types::api::ForegroundNotification;
use bazaar_types::events::PushEvent;
use bazaar_types::models::{PermissionStatus, PushRegistration};
use bazaar_types::toast::Toasts;

use crate::error::PushError;
use crate::platform::PushPlatform;
use crate::router::NotificationRouter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Unregistered,
    PermissionPending,
    Granted,
    TokenObtained,
    /// Terminal for the session until `retry_from_settings`.
    Denied,
}

/// Owns this device's push registration for the signed-in user.
pub struct NotificationGateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    platform: Arc<dyn PushPlatform>,
    db: Arc<Database>,
    router: NotificationRouter,
    toasts: Toasts,
    state: Mutex<GatewayState>,
    token: Mutex<Option<String>>,
    user: Mutex<Option<Uuid>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationGateway {
    pub fn new(
        platform: Arc<dyn PushPlatform>,
        db: Arc<Database>,
        router: NotificationRouter,
        toasts: Toasts,
    ) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                platform,
                db,
                router,
                toasts,
                state: Mutex::new(GatewayState::Unregistered),
                token: Mutex::new(None),
                user: Mutex::new(None),
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> GatewayState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn token(&self) -> Option<String> {
        self.inner.token.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Run after every successful sign-in: start listening for push events,
    /// then check or request permission, obtain a token and persist it
    /// against `user_id`.
    ///
    /// Taps are routed whatever the registration outcome, including the tap
    /// that launched the app.
    pub async fn on_authenticated(&self, user_id: Uuid) -> Result<GatewayState, PushError> {
        *self.inner.user.lock().unwrap_or_else(|e| e.into_inner()) = Some(user_id);
        self.ensure_listener();

        if !self.inner.platform.is_supported() {
            debug!("Push unsupported, gateway stays unregistered");
            return Ok(self.state());
        }
        if self.state() == GatewayState::Denied {
            info!("Push permission was denied, waiting for the user to retry from settings");
            return Ok(GatewayState::Denied);
        }
        self.register(user_id).await
    }

    /// The user re-enabled notifications in settings.
    pub async fn retry_from_settings(&self) -> Result<GatewayState, PushError> {
        let Some(user_id) = *self.inner.user.lock().unwrap_or_else(|e| e.into_inner()) else {
            debug!("Settings retry before sign-in ignored");
            return Ok(self.state());
        };
        if !self.inner.platform.is_supported() {
            return Err(PushError::Unsupported);
        }
        info!("Retrying push registration from settings");
        self.ensure_listener();
        self.inner.set_state(GatewayState::Unregistered);
        self.register(user_id).await
    }

    async fn register(&self, user_id: Uuid) -> Result<GatewayState, PushError> {
        let platform = &self.inner.platform;

        let mut permission = platform.check_permission().await?;
        if permission == PermissionStatus::Prompt {
            self.inner.set_state(GatewayState::PermissionPending);
            permission = platform.request_permission().await?;
        }

        match permission {
            PermissionStatus::Granted => {}
            PermissionStatus::Denied => {
                self.inner.set_state(GatewayState::Denied);
                return Ok(GatewayState::Denied);
            }
            PermissionStatus::Prompt => {
                // prompt dismissed without an answer
                self.inner.set_state(GatewayState::Unregistered);
                return Ok(GatewayState::Unregistered);
            }
        }
        self.inner.set_state(GatewayState::Granted);

        let token = match platform.register().await {
            Ok(token) => token,
            Err(PushError::Denied) => {
                self.inner.set_state(GatewayState::Denied);
                return Ok(GatewayState::Denied);
            }
            Err(e) => return Err(e),
        };
        self.inner.persist_token(user_id, token).await?;
        self.inner.set_state(GatewayState::TokenObtained);
        info!("Push registered for {}", user_id);
        Ok(GatewayState::TokenObtained)
    }

    /// Subscribe to platform events unless a listener is already running,
    /// then hand any launch tap to the router. The subscription comes first,
    /// so a tap is either parked or delivered, never dropped.
    fn ensure_listener(&self) {
        let mut listener = self.inner.listener.lock().unwrap_or_else(|e| e.into_inner());
        if listener.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let mut events = self.inner.platform.events();
        if let Some(data) = self.inner.platform.take_launch_tap() {
            info!("Routing the tap that launched the app");
            self.inner.router.handle_tap(&data);
        }

        let inner = self.inner.clone();
        *listener = Some(tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Push listener lagged by {} events", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                match event {
                    PushEvent::TokenRefreshed { token } => inner.rotate_token(token).await,
                    PushEvent::Foreground(notification) => inner.show_foreground(notification).await,
                    PushEvent::Tapped { data } => {
                        inner.router.handle_tap(&data);
                    }
                }
            }
            debug!("Push listener stopped");
        }));
    }

    /// Remove listeners, the local token and the persisted registration.
    /// Safe to call any number of times.
    pub async fn unregister(&self) -> Result<(), PushError> {
        self.inner.stop_listener();
        let had_token = self.inner.token.lock().unwrap_or_else(|e| e.into_inner()).take().is_some();

        let user = *self.inner.user.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(user_id) = user {
            let db = self.inner.db.clone();
            let removed = tokio::task::spawn_blocking(move || db.delete_push_registration(&user_id.to_string()))
                .await
                .map_err(|e| PushError::Persist(anyhow::anyhow!("task join error: {}", e)))??;
            if removed {
                debug!("Push registration for {} removed", user_id);
            }
        }

        if had_token {
            self.inner.platform.unregister().await?;
            info!("Push unregistered");
        }
        self.inner.set_state(GatewayState::Unregistered);
        Ok(())
    }

    /// The persisted registration of the signed-in user.
    pub async fn registration(&self) -> Result<Option<PushRegistration>, PushError> {
        let Some(user_id) = *self.inner.user.lock().unwrap_or_else(|e| e.into_inner()) else {
            return Ok(None);
        };
        let db = self.inner.db.clone();
        let row = tokio::task::spawn_blocking(move || db.get_push_registration(&user_id.to_string()))
            .await
            .map_err(|e| PushError::Persist(anyhow::anyhow!("task join error: {}", e)))??;

        let Some(row) = row else {
            return Ok(None);
        };
        let permission = row.permission.parse().map_err(|e: String| PushError::Persist(anyhow::anyhow!(e)))?;
        let updated_at = row
            .updated_at
            .parse()
            .map_err(|e| PushError::Persist(anyhow::anyhow!("corrupt updated_at: {}", e)))?;
        Ok(Some(PushRegistration {
            user_id,
            token: row.token,
            permission,
            updated_at,
        }))
    }
}

impl Drop for NotificationGateway {
    fn drop(&mut self) {
        self.inner.stop_listener();
    }
}

impl GatewayInner {
    fn set_state(&self, next: GatewayState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != next {
            debug!("Push gateway {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    fn stop_listener(&self) {
        if let Some(task) = self.listener.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }

    /// Overwrites whatever token the user had before.
    async fn persist_token(&self, user_id: Uuid, token: String) -> Result<(), PushError> {
        let db = self.db.clone();
        let stored = token.clone();
        tokio::task::spawn_blocking(move || {
            db.upsert_push_registration(&user_id.to_string(), &stored, PermissionStatus::Granted.as_str())
        })
        .await
        .map_err(|e| PushError::Persist(anyhow::anyhow!("task join error: {}", e)))??;

        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = Some(token);
        debug!("Push token stored for {}", user_id);
        Ok(())
    }

    fn user(&self) -> Option<Uuid> {
        *self.user.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A rotated token only matters once this device holds a registration.
    async fn rotate_token(&self, token: String) {
        let registered = self.token.lock().unwrap_or_else(|e| e.into_inner()).is_some();
        let Some(user_id) = self.user().filter(|_| registered) else {
            debug!("Token rotation before registration ignored");
            return;
        };
        if let Err(e) = self.persist_token(user_id, token).await {
            error!("Failed to persist rotated push token: {}", e);
        }
    }

    /// Toast only; a foreground notification never navigates.
    async fn show_foreground(&self, notification: ForegroundNotification) {
        if let (Some(user_id), Some(conversation_id)) = (self.user(), notification.data.get("conversationId")) {
            if self.is_muted(user_id, conversation_id).await {
                debug!("Suppressed notification for muted conversation {}", conversation_id);
                return;
            }
        }
        self.toasts.info(notification.title, notification.body);
    }

    async fn is_muted(&self, user_id: Uuid, conversation_id: &str) -> bool {
        let db = self.db.clone();
        let id = conversation_id.to_string();
        let row = match tokio::task::spawn_blocking(move || db.get_conversation(&id)).await {
            Ok(Ok(row)) => row,
            Ok(Err(e)) => {
                warn!("Mute lookup failed: {}", e);
                return false;
            }
            Err(e) => {
                error!("Mute lookup task failed: {}", e);
                return false;
            }
        };
        row.is_some_and(|row| {
            row.muted_by
                .iter()
                .any(|u| u.parse::<Uuid>().is_ok_and(|u| u == user_id))
        })
    }
}
