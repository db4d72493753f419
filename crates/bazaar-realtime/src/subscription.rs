use std::collections::BTreeMap;
use std::fmt;
use std::sync::Weak;

use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use bazaar_types::events::{ChangeEvent, Table};

use crate::dispatcher::FeedInner;

/// Table plus equality predicates on stringified column values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFilter {
    table: Table,
    predicates: BTreeMap<String, String>,
}

impl ChangeFilter {
    /// Every change on `table`.
    pub fn table(table: Table) -> Self {
        Self {
            table,
            predicates: BTreeMap::new(),
        }
    }

    /// Narrow to rows whose `column` equals `value`.
    pub fn eq(mut self, column: &str, value: impl ToString) -> Self {
        self.predicates.insert(column.to_string(), value.to_string());
        self
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        event.table == self.table
            && self
                .predicates
                .iter()
                .all(|(column, value)| event.key(column) == Some(value.as_str()))
    }
}

impl fmt::Display for ChangeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.table)?;
        for (column, value) in &self.predicates {
            write!(f, " {}=eq.{}", column, value)?;
        }
        Ok(())
    }
}

/// A live subscription on the change feed. Unregisters on drop.
pub struct Subscription {
    id: Uuid,
    filter: ChangeFilter,
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
    feed: Weak<FeedInner>,
}

impl Subscription {
    pub(crate) fn new(
        id: Uuid,
        filter: ChangeFilter,
        rx: mpsc::UnboundedReceiver<ChangeEvent>,
        feed: Weak<FeedInner>,
    ) -> Self {
        Self { id, filter, rx, feed }
    }

    pub fn filter(&self) -> &ChangeFilter {
        &self.filter
    }

    /// Wait for the next matching change. `None` once the feed is gone.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(feed) = self.feed.upgrade() else {
            return;
        };
        feed.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
        trace!("unsubscribe {} on {}", self.id, self.filter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bazaar_types::events::ChangeKind;

    #[test]
    fn predicates_must_all_match() {
        let filter = ChangeFilter::table(Table::Reactions)
            .eq("conversation_id", "c1")
            .eq("user_id", "u1");

        let hit = ChangeEvent::new(Table::Reactions, ChangeKind::Delete)
            .with_key("conversation_id", "c1")
            .with_key("user_id", "u1")
            .with_key("emoji", "👍");
        let wrong_user = ChangeEvent::new(Table::Reactions, ChangeKind::Delete)
            .with_key("conversation_id", "c1")
            .with_key("user_id", "u2");
        let wrong_table = ChangeEvent::new(Table::Messages, ChangeKind::Insert)
            .with_key("conversation_id", "c1")
            .with_key("user_id", "u1");

        assert!(filter.matches(&hit));
        assert!(!filter.matches(&wrong_user));
        assert!(!filter.matches(&wrong_table));
    }

    #[test]
    fn display_reads_like_a_realtime_filter() {
        let filter = ChangeFilter::table(Table::Messages).eq("conversation_id", "c1");
        assert_eq!(filter.to_string(), "messages conversation_id=eq.c1");
    }
}
