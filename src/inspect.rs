//! Non-core surface: destructive flush, length and age probes,
//! non-destructive peeks, memory pressure, and raw snapshots.

use std::time::Duration;

use redis::AsyncCommands as _;

use crate::error::QueueError;
use crate::item::{now_epoch, Item};
use crate::keys::{self, Sublist};
use crate::queue::{ReliableQueue, RECORD_DELETE_CHUNK};

/// Which end of a sublist to look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The oldest entry, the next one a consumer would claim.
    Front,
    /// The newest entry.
    Back,
}

/// Lengths of all four sublists, taken in one round trip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub unprocessed: usize,
    pub working: usize,
    pub processed: usize,
    pub failed: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.unprocessed + self.working + self.processed + self.failed
    }
}

impl ReliableQueue {
    /// Deletes everything this queue owns: the records referenced by
    /// all four sublists, then the sublists themselves.
    #[tracing::instrument(skip(self), fields(queue = %self.config.queue_name))]
    pub async fn flush_queue(&mut self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        for sublist in Sublist::ALL {
            let list = self.keys.sublist(sublist);
            let item_keys: Vec<String> =
                conn.lrange(&list, 0, -1)
                    .await
                    .map_err(|source| QueueError::Command {
                        op: "listing items to flush",
                        source,
                    })?;
            for chunk in item_keys.chunks(RECORD_DELETE_CHUNK) {
                let mut pipe = redis::pipe();
                for key in chunk {
                    pipe.cmd("DEL")
                        .arg(keys::meta_key(key))
                        .arg(keys::payload_key(key))
                        .ignore();
                }
                let _: () = pipe
                    .query_async(&mut conn)
                    .await
                    .map_err(|source| QueueError::Command {
                        op: "flushing item records",
                        source,
                    })?;
            }
            let _: i64 = conn
                .del(&list)
                .await
                .map_err(|source| QueueError::Command {
                    op: "flushing a sublist",
                    source,
                })?;
        }
        Ok(())
    }

    /// How many items a sublist currently holds.
    pub async fn queue_length(&mut self, sublist: Sublist) -> Result<usize, QueueError> {
        let list = self.keys.sublist(sublist);
        let mut conn = self.conn.clone();
        let length: i64 = conn
            .llen(&list)
            .await
            .map_err(|source| QueueError::Command {
                op: "measuring a sublist",
                source,
            })?;
        Ok(length.max(0) as usize)
    }

    /// All four sublist lengths in a single pipeline.
    pub async fn stats(&mut self) -> Result<QueueStats, QueueError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for sublist in Sublist::ALL {
            pipe.cmd("LLEN").arg(self.keys.sublist(sublist));
        }
        let lengths: Vec<i64> =
            pipe.query_async(&mut conn)
                .await
                .map_err(|source| QueueError::Command {
                    op: "measuring the queue",
                    source,
                })?;
        let at = |index: usize| lengths.get(index).copied().unwrap_or(0).max(0) as usize;
        Ok(QueueStats {
            unprocessed: at(0),
            working: at(1),
            processed: at(2),
            failed: at(3),
        })
    }

    /// Looks at one end of a sublist without disturbing it.
    pub async fn peek_item(
        &mut self,
        sublist: Sublist,
        direction: Direction,
    ) -> Result<Option<Item>, QueueError> {
        let list = self.keys.sublist(sublist);
        let mut conn = self.conn.clone();
        // Producers push onto the head, so the oldest entry sits at
        // index -1.
        let index: i64 = match direction {
            Direction::Front => -1,
            Direction::Back => 0,
        };
        let item_key: Option<String> = redis::cmd("LINDEX")
            .arg(&list)
            .arg(index)
            .query_async(&mut conn)
            .await
            .map_err(|source| QueueError::Command {
                op: "peeking at a sublist",
                source,
            })?;
        match item_key {
            Some(key) => Ok(self.hydrate(&mut conn, vec![key], false, false).await?.pop()),
            None => Ok(None),
        }
    }

    /// Age of the oldest item in a sublist, measured from its creation
    /// time.  `None` when the sublist is empty.
    pub async fn get_item_age(&mut self, sublist: Sublist) -> Result<Option<Duration>, QueueError> {
        let Some(item) = self.peek_item(sublist, Direction::Front).await? else {
            return Ok(None);
        };
        let age = (now_epoch() - item.meta.time_created).max(0.0);
        Ok(Some(Duration::from_secs_f64(age)))
    }

    /// Server memory in use as a percentage of `maxmemory`, or `None`
    /// when no limit is configured.
    pub async fn percent_memory_used(&mut self) -> Result<Option<f64>, QueueError> {
        let mut conn = self.conn.clone();
        let info: String = redis::cmd("INFO")
            .arg("memory")
            .query_async(&mut conn)
            .await
            .map_err(|source| QueueError::Command {
                op: "reading server memory info",
                source,
            })?;
        let used = parse_info_field(&info, "used_memory");
        let max = parse_info_field(&info, "maxmemory");
        Ok(match (used, max) {
            (Some(used), Some(max)) if max > 0.0 => Some(used / max * 100.0),
            _ => None,
        })
    }

    /// Head-to-tail snapshot of the unprocessed sublist, up to `count`
    /// items (all of them when 0), without claiming anything.
    pub async fn raw_items_unprocessed(&mut self, count: usize) -> Result<Vec<Item>, QueueError> {
        self.raw_items(Sublist::Unprocessed, count).await
    }

    /// Head-to-tail snapshot of the working sublist.
    pub async fn raw_items_working(&mut self, count: usize) -> Result<Vec<Item>, QueueError> {
        self.raw_items(Sublist::Working, count).await
    }

    /// Head-to-tail snapshot of the failed sublist.
    pub async fn raw_items_failed(&mut self, count: usize) -> Result<Vec<Item>, QueueError> {
        self.raw_items(Sublist::Failed, count).await
    }

    async fn raw_items(&mut self, sublist: Sublist, count: usize) -> Result<Vec<Item>, QueueError> {
        let list = self.keys.sublist(sublist);
        let mut conn = self.conn.clone();
        let stop = if count == 0 { -1 } else { count as isize - 1 };
        let item_keys: Vec<String> =
            conn.lrange(&list, 0, stop)
                .await
                .map_err(|source| QueueError::Command {
                    op: "reading a raw sublist snapshot",
                    source,
                })?;
        self.hydrate(&mut conn, item_keys, false, false).await
    }
}

fn parse_info_field(info: &str, field: &str) -> Option<f64> {
    let prefix = format!("{field}:");
    info.lines()
        .find_map(|line| line.strip_prefix(&prefix))
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const INFO: &str = "# Memory\r\nused_memory:1048576\r\nused_memory_human:1.00M\r\nmaxmemory:2097152\r\nmaxmemory_policy:noeviction\r\n";

    #[test]
    fn info_fields_parse_exactly() {
        assert_eq!(parse_info_field(INFO, "used_memory"), Some(1_048_576.0));
        assert_eq!(parse_info_field(INFO, "maxmemory"), Some(2_097_152.0));
        assert_eq!(parse_info_field(INFO, "missing"), None);
    }

    #[test]
    fn prefixed_fields_do_not_shadow_each_other() {
        // "used_memory" must not match the "used_memory_human" line.
        assert_eq!(
            parse_info_field("used_memory_human:1.00M\r\nused_memory:42\r\n", "used_memory"),
            Some(42.0)
        );
    }

    #[test]
    fn stats_totals_add_up() {
        let stats = QueueStats {
            unprocessed: 3,
            working: 2,
            processed: 0,
            failed: 1,
        };
        assert_eq!(stats.total(), 6);
    }
}
