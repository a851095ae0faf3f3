//! Redis key naming.
//!
//! Every queue owns four lists named `<queue>_<tag>`, and every live
//! item owns two records derived from its item key: `item-<key>` for
//! the payload and `meta-<key>` for the bookkeeping hash.  All naming
//! goes through [`KeySpace`] so the layout exists in exactly one place.

use crate::item::ItemKey;

/// The four lists a queue is made of.
///
/// `Processed` is reserved for API symmetry; none of the core paths
/// write to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sublist {
    /// Items waiting to be claimed.  Producers push onto the head,
    /// consumers pop from the tail, so the tail is the oldest end.
    Unprocessed,
    /// Items currently claimed by a consumer.
    Working,
    /// Reserved.
    Processed,
    /// Items parked after exhausting their retries, awaiting an
    /// operator.
    Failed,
}

impl Sublist {
    pub const ALL: [Sublist; 4] = [
        Sublist::Unprocessed,
        Sublist::Working,
        Sublist::Processed,
        Sublist::Failed,
    ];

    pub(crate) fn tag(self) -> &'static str {
        match self {
            Sublist::Unprocessed => "unprocessed",
            Sublist::Working => "working",
            Sublist::Processed => "processed",
            Sublist::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Sublist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Deterministic key names for one queue.
#[derive(Debug, Clone)]
pub(crate) struct KeySpace {
    queue_name: String,
}

impl KeySpace {
    pub(crate) fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
        }
    }

    /// The Redis key of one of the queue's sublists.
    pub(crate) fn sublist(&self, sublist: Sublist) -> String {
        format!("{}_{}", self.queue_name, sublist.tag())
    }

    /// Mints a fresh item key: the queue name plus 128 random bits as
    /// 32 hex characters.  Uniqueness is relied upon; the enqueue path
    /// refuses to overwrite on the (negligible) collision.
    pub(crate) fn mint_item_key(&self) -> ItemKey {
        ItemKey::new(format!(
            "{}-{}",
            self.queue_name,
            uuid::Uuid::new_v4().simple()
        ))
    }

    /// A one-shot scratch list name used while batch-processing the
    /// failed sublist.
    pub(crate) fn scratch_failed(&self) -> String {
        format!("temp-failed-{}", uuid::Uuid::new_v4().simple())
    }
}

/// The payload record key for an item.
pub(crate) fn payload_key(item_key: &str) -> String {
    format!("item-{item_key}")
}

/// The metadata record key for an item.
pub(crate) fn meta_key(item_key: &str) -> String {
    format!("meta-{item_key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sublist_keys_join_with_a_single_underscore() {
        let keys = KeySpace::new("jobs");
        assert_eq!(keys.sublist(Sublist::Unprocessed), "jobs_unprocessed");
        assert_eq!(keys.sublist(Sublist::Working), "jobs_working");
        assert_eq!(keys.sublist(Sublist::Processed), "jobs_processed");
        assert_eq!(keys.sublist(Sublist::Failed), "jobs_failed");
    }

    #[test]
    fn minted_keys_carry_the_queue_name_and_32_hex_chars() {
        let keys = KeySpace::new("jobs");
        let key = keys.mint_item_key();
        let suffix = key.strip_prefix("jobs-").expect("queue-name prefix");
        assert_eq!(suffix.len(), 32);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn minted_keys_are_unique() {
        let keys = KeySpace::new("jobs");
        assert_ne!(keys.mint_item_key(), keys.mint_item_key());
    }

    #[test]
    fn record_keys_derive_from_the_item_key() {
        assert_eq!(payload_key("jobs-ab12"), "item-jobs-ab12");
        assert_eq!(meta_key("jobs-ab12"), "meta-jobs-ab12");
    }

    #[test]
    fn scratch_names_are_prefixed_and_unique() {
        let keys = KeySpace::new("jobs");
        let a = keys.scratch_failed();
        let b = keys.scratch_failed();
        assert!(a.starts_with("temp-failed-"));
        assert_ne!(a, b);
    }
}
