//! Notifications and category filters.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use strand_core::NotificationId;

/// Delivery priority (ordinal; higher is more urgent).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// An immutable message published to a [`Hub`](crate::Hub).
///
/// Published once and shared (behind an `Arc`) by every subscriber it is
/// fanned out to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification<P> {
    pub id: NotificationId,
    /// Category tag matched against subscriber filters
    pub category: String,
    pub payload: P,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
}

impl<P> Notification<P> {
    pub fn new(category: impl Into<String>, payload: P) -> Self {
        Self {
            id: NotificationId::new(),
            category: category.into(),
            payload,
            priority: Priority::Normal,
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Which categories a subscriber receives.
///
/// `All` is a wildcard, not a category name: a real category called `"ALL"`
/// is matched only by `All` or by an `Only` set containing `"ALL"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryFilter {
    All,
    Only(BTreeSet<String>),
}

impl CategoryFilter {
    pub fn all() -> Self {
        Self::All
    }

    pub fn only<I, S>(categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only(categories.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, category: &str) -> bool {
        match self {
            CategoryFilter::All => true,
            CategoryFilter::Only(set) => set.contains(category),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_are_ordered() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::High < Priority::Critical);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn wildcard_matches_everything() {
        let filter = CategoryFilter::all();
        assert!(filter.matches("X"));
        assert!(filter.matches(""));
    }

    #[test]
    fn only_matches_listed_categories() {
        let filter = CategoryFilter::only(["orders", "billing"]);
        assert!(filter.matches("orders"));
        assert!(!filter.matches("shipping"));
    }

    #[test]
    fn literal_all_category_is_not_a_wildcard() {
        let filter = CategoryFilter::only(["ALL"]);
        assert!(filter.matches("ALL"));
        assert!(!filter.matches("X"));
    }

    #[test]
    fn notification_serializes_payload() {
        let n = Notification::new("X", serde_json::json!({"k": 1})).with_priority(Priority::High);
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["category"], "X");
        assert_eq!(json["priority"], "high");
        assert_eq!(json["payload"]["k"], 1);
    }
}
