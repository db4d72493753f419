//! In-process realtime change feed.
//!
//! Writers publish a [`ChangeEvent`](bazaar_types::events::ChangeEvent)
//! after every committed row change; readers hold a [`Subscription`] keyed
//! by table plus column predicates. Dropping the subscription unregisters
//! it synchronously, so a torn-down consumer never sees another event.

pub mod dispatcher;
pub mod subscription;

pub use dispatcher::ChangeFeed;
pub use subscription::{ChangeFilter, Subscription};
