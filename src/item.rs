use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey(pub(crate) String);

impl ItemKey {
    /// Creates a new [`ItemKey`].
    ///
    /// Item keys are minted by the queue when a payload is enqueued;
    /// user code only ever receives them attached to an [`Item`], which
    /// is what keeps a key tied to the queue that minted it.
    #[must_use]
    pub(crate) fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl AsRef<str> for ItemKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::ops::Deref for ItemKey {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Bookkeeping stored in the `meta-<item_key>` hash.
///
/// Timestamps are float seconds since the Unix epoch, which is also
/// their wire format on the server.  `time_created` never changes after
/// the item is minted; `time_enqueued` is refreshed every time the item
/// (re-)enters the unprocessed sublist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemMeta {
    /// How many times a consumer has claimed this item.
    pub process_count: u64,
    /// How many times the item overran the requeue limit and was
    /// parked in the failed sublist.
    pub bail_count: u64,
    pub time_created: f64,
    pub time_enqueued: f64,
    /// The most recent error annotation attached by a requeue.
    pub last_error: Option<String>,
}

impl ItemMeta {
    /// Builds metadata from an `HGETALL` reply.
    ///
    /// Parsing is deliberately lenient: a missing or garbled field is
    /// warned about and defaulted rather than failing the whole fetch,
    /// since bulk paths run concurrently with acknowledgers and
    /// reclaimers that may be rewriting the hash.
    pub(crate) fn from_map(item_key: &str, map: &HashMap<String, String>) -> Self {
        Self {
            process_count: parse_field(map, "process_count", item_key),
            bail_count: parse_field(map, "bail_count", item_key),
            time_created: parse_field(map, "time_created", item_key),
            time_enqueued: parse_field(map, "time_enqueued", item_key),
            last_error: map
                .get("last_error")
                .filter(|error| !error.is_empty())
                .cloned(),
        }
    }
}

fn parse_field<T>(map: &HashMap<String, String>, field: &str, item_key: &str) -> T
where
    T: std::str::FromStr + Default,
{
    let Some(raw) = map.get(field) else {
        return T::default();
    };
    match raw.parse() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(
                item = item_key,
                field,
                value = %raw,
                "metadata field did not parse; assuming the default"
            );
            T::default()
        }
    }
}

/// One unit of work.
///
/// The key names the item across sublists and record keys.  The
/// payload is the byte string the producer stored; the queue never
/// interprets it.  The metadata is a snapshot taken when the item was
/// fetched and is not updated afterwards.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Item {
    pub key: ItemKey,
    pub payload: Vec<u8>,
    pub meta: ItemMeta,
}

impl Item {
    pub(crate) fn new(key: ItemKey, payload: Vec<u8>, meta: ItemMeta) -> Self {
        Self { key, payload, meta }
    }
}

/// Current wall-clock time as float seconds since the epoch, the
/// timestamp format stored in item metadata.
pub(crate) fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(fields: &[(&str, &str)]) -> HashMap<String, String> {
        fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn meta_parses_a_complete_hash() {
        let meta = ItemMeta::from_map(
            "jobs-1",
            &map(&[
                ("process_count", "3"),
                ("bail_count", "1"),
                ("time_created", "100.5"),
                ("time_enqueued", "200.25"),
                ("last_error", "boom"),
            ]),
        );
        assert_eq!(meta.process_count, 3);
        assert_eq!(meta.bail_count, 1);
        assert_eq!(meta.time_created, 100.5);
        assert_eq!(meta.time_enqueued, 200.25);
        assert_eq!(meta.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn missing_fields_default_to_zero() {
        let meta = ItemMeta::from_map("jobs-1", &map(&[]));
        assert_eq!(meta, ItemMeta::default());
    }

    #[test]
    fn garbled_fields_fall_back_to_the_default() {
        let meta = ItemMeta::from_map("jobs-1", &map(&[("process_count", "many")]));
        assert_eq!(meta.process_count, 0);
    }

    #[test]
    fn empty_error_annotations_read_as_absent() {
        let meta = ItemMeta::from_map("jobs-1", &map(&[("last_error", "")]));
        assert_eq!(meta.last_error, None);
    }

    #[test]
    fn now_epoch_is_recent() {
        assert!(now_epoch() > 1_500_000_000.0);
    }
}
