use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::api::{ForegroundNotification, NotificationData};

/// Tables that publish row changes on the realtime feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Profiles,
    Conversations,
    Messages,
    PriceOffers,
    Reactions,
    BlockedUsers,
    PushRegistrations,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Profiles => "profiles",
            Self::Conversations => "conversations",
            Self::Messages => "messages",
            Self::PriceOffers => "price_offers",
            Self::Reactions => "reactions",
            Self::BlockedUsers => "blocked_users",
            Self::PushRegistrations => "push_registrations",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row change on the realtime feed.
///
/// Delivery is at-least-once and unordered: consumers treat an event as a
/// signal that something under their filter changed and re-fetch, rather
/// than patching local state from `keys`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    /// Filterable column values of the affected row, stringified.
    pub keys: BTreeMap<String, String>,
}

impl ChangeEvent {
    pub fn new(table: Table, kind: ChangeKind) -> Self {
        Self {
            table,
            kind,
            keys: BTreeMap::new(),
        }
    }

    pub fn with_key(mut self, column: &str, value: impl ToString) -> Self {
        self.keys.insert(column.to_string(), value.to_string());
        self
    }

    pub fn key(&self, column: &str) -> Option<&str> {
        self.keys.get(column).map(String::as_str)
    }
}

/// Events raised by the native push subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PushEvent {
    /// The OS rotated the device token
    TokenRefreshed { token: String },

    /// A notification arrived while the app was in the foreground
    Foreground(ForegroundNotification),

    /// The user tapped a notification
    Tapped { data: NotificationData },
}
