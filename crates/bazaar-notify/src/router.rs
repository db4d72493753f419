//! Notification taps to in-app routes.
//!
//! A tap may land before the UI has mounted, so the decoded route waits in
//! a single slot that the first check after mount drains.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use bazaar_types::api::{NotificationData, Route};

/// Delay between mount and the pending-route check, so the check does not
/// race the navigation controller's own startup.
pub const ROUTE_SETTLE_DELAY: Duration = Duration::from_millis(300);

/// Decode a notification payload into a route.
///
/// An explicit `route` wins; otherwise `type` picks the screen. Unknown or
/// incomplete payloads decode to `None`.
pub fn decode_route(data: &NotificationData) -> Option<Route> {
    if let Some(route) = data.get("route") {
        return Some(Route::new(route));
    }

    let route = match data.get("type")? {
        "message" => match data.get("conversationId") {
            Some(id) => format!("/messages?conversation={id}"),
            None => "/messages".to_string(),
        },
        "offer" | "listing" | "like" => format!("/listing/{}", data.get("listingId")?),
        "payment" => "/transactions".to_string(),
        "follower" => match data.get("followerId") {
            Some(id) => format!("/seller/{id}"),
            None => "/profile".to_string(),
        },
        "review" => "/profile".to_string(),
        _ => return None,
    };
    Some(Route::new(route))
}

/// Decode a raw JSON payload. Malformed JSON is just another undecodable
/// notification.
pub fn decode_payload(json: &str) -> Option<Route> {
    match serde_json::from_str::<NotificationData>(json) {
        Ok(data) => decode_route(&data),
        Err(e) => {
            debug!("Ignoring malformed notification payload: {}", e);
            None
        }
    }
}

/// Holds at most one route. `take` reads and clears under one lock, so two
/// concurrent consumers can never both receive the same route.
#[derive(Debug, Default)]
pub struct PendingRouteSlot {
    slot: Mutex<Option<Route>>,
}

impl PendingRouteSlot {
    /// Store `route`, replacing any route not yet consumed.
    pub fn set(&self, route: Route) -> Option<Route> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).replace(route)
    }

    pub fn take(&self) -> Option<Route> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

/// The root navigation controller.
pub trait Navigator: Send + Sync {
    fn navigate(&self, route: &Route);
}

#[derive(Clone)]
pub struct NotificationRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    slot: PendingRouteSlot,
    navigator: Mutex<Option<Arc<dyn Navigator>>>,
    settle: Duration,
    settle_task: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationRouter {
    pub fn new(settle: Duration) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                slot: PendingRouteSlot::default(),
                navigator: Mutex::new(None),
                settle,
                settle_task: Mutex::new(None),
            }),
        }
    }

    pub fn slot(&self) -> &PendingRouteSlot {
        &self.inner.slot
    }

    pub fn is_mounted(&self) -> bool {
        self.navigator().is_some()
    }

    /// A notification was tapped. The route is parked in the slot and, if
    /// the UI is already up, delivered right away.
    pub fn handle_tap(&self, data: &NotificationData) -> Option<Route> {
        let Some(route) = decode_route(data) else {
            debug!("Tapped notification has no route: {:?}", data);
            return None;
        };

        if let Some(dropped) = self.inner.slot.set(route.clone()) {
            debug!("Pending route {} replaced by {}", dropped, route);
        }
        if self.is_mounted() {
            self.check_pending();
        }
        Some(route)
    }

    /// The UI root is up. The pending slot is checked once after the settle
    /// delay.
    pub fn mount(&self, navigator: Arc<dyn Navigator>) {
        *self.inner.navigator.lock().unwrap_or_else(|e| e.into_inner()) = Some(navigator);

        let router = self.clone();
        let settle = self.inner.settle;
        let deadline = tokio::time::Instant::now() + settle;
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            router.check_pending();
        });

        let previous = self
            .inner
            .settle_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        info!("Notification router mounted, checking pending route in {:?}", settle);
    }

    pub fn unmount(&self) {
        self.inner.navigator.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = self.inner.settle_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        debug!("Notification router unmounted");
    }

    /// Deliver the pending route, if any, to the mounted navigator. Returns
    /// whether navigation happened. Without a navigator the slot is left
    /// untouched.
    pub fn check_pending(&self) -> bool {
        let Some(navigator) = self.navigator() else {
            warn!("Pending route check before mount");
            return false;
        };
        match self.inner.slot.take() {
            Some(route) => {
                info!("Navigating to {}", route);
                navigator.navigate(&route);
                true
            }
            None => false,
        }
    }

    fn navigator(&self) -> Option<Arc<dyn Navigator>> {
        self.inner.navigator.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for NotificationRouter {
    fn default() -> Self {
        Self::new(ROUTE_SETTLE_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(pairs: &[(&str, &str)]) -> Option<String> {
        let data = pairs
            .iter()
            .fold(NotificationData::default(), |d, (k, v)| d.with(k, *v));
        decode_route(&data).map(|r| r.as_str().to_string())
    }

    #[test]
    fn decodes_by_type() {
        assert_eq!(route(&[("type", "message"), ("conversationId", "c1")]).as_deref(), Some("/messages?conversation=c1"));
        assert_eq!(route(&[("type", "listing"), ("listingId", "L9")]).as_deref(), Some("/listing/L9"));
        assert_eq!(route(&[("type", "offer"), ("listingId", "L2")]).as_deref(), Some("/listing/L2"));
        assert_eq!(route(&[("type", "like"), ("listingId", "L3")]).as_deref(), Some("/listing/L3"));
        assert_eq!(route(&[("type", "payment")]).as_deref(), Some("/transactions"));
        assert_eq!(route(&[("type", "follower"), ("followerId", "u7")]).as_deref(), Some("/seller/u7"));
        assert_eq!(route(&[("type", "follower")]).as_deref(), Some("/profile"));
        assert_eq!(route(&[("type", "review")]).as_deref(), Some("/profile"));
    }

    #[test]
    fn explicit_route_wins_over_type() {
        assert_eq!(route(&[("route", "/custom"), ("type", "payment")]).as_deref(), Some("/custom"));
        assert_eq!(route(&[("route", "/custom")]).as_deref(), Some("/custom"));
    }

    #[test]
    fn undecodable_payloads_yield_no_route() {
        assert_eq!(route(&[("type", "unknown")]), None);
        assert_eq!(route(&[]), None);
        assert_eq!(route(&[("type", "listing")]), None);
        assert_eq!(route(&[("type", "message")]).as_deref(), Some("/messages"));
        assert_eq!(route(&[("route", ""), ("type", "payment")]).as_deref(), Some("/transactions"));
    }

    #[test]
    fn raw_payloads() {
        assert_eq!(
            decode_payload(r#"{"type":"listing","listingId":"L9"}"#).map(|r| r.to_string()),
            Some("/listing/L9".to_string())
        );
        assert_eq!(decode_payload("not json"), None);
        assert_eq!(decode_payload(r#"{"type": 4}"#), None);
    }

    #[test]
    fn slot_take_clears() {
        let slot = PendingRouteSlot::default();
        assert!(slot.set(Route::new("/a")).is_none());
        assert_eq!(slot.set(Route::new("/b")), Some(Route::new("/a")));
        assert_eq!(slot.take(), Some(Route::new("/b")));
        assert_eq!(slot.take(), None);
        assert!(slot.is_empty());
    }
}
