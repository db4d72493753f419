//! Push notification plumbing: device registration, foreground delivery
//! and tap routing.

pub mod error;
pub mod gateway;
pub mod platform;
pub mod router;

pub use error::PushError;
pub use gateway::{GatewayState, NotificationGateway};
pub use platform::{NativeHost, NativePush, NoopPush, PushEmitter, PushPlatform, PushRequest, select_platform};
pub use router::{
    NotificationRouter, Navigator, PendingRouteSlot, ROUTE_SETTLE_DELAY, decode_payload, decode_route,
};
