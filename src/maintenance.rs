//! Operator-facing maintenance: batch-processing the failed sublist
//! and reclaiming items whose consumer died.

use std::time::Duration;

use redis::AsyncCommands as _;

use crate::error::QueueError;
use crate::item::{now_epoch, Item};
use crate::keys::{self, Sublist};
use crate::queue::{ReliableQueue, RECORD_DELETE_CHUNK};
use crate::script::RequeuePolicy;

/// What to do with every item in the failed sublist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedAction {
    /// Put the items back into circulation, attempt counts untouched.
    Requeue,
    /// Pull the items out of the failed sublist and hand them to the
    /// caller; their records are left in place for inspection.
    Return,
}

/// What to do with items stuck in the working sublist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryAction {
    /// Send them through the regular busy-requeue path.
    Requeue,
    /// Drop them from the working sublist.  Their records are
    /// deliberately left behind for the operator.
    Drop,
}

/// Retention criteria for [`ReliableQueue::remove_failed_items`].  At
/// least one of the two criteria must be set.
#[derive(Debug, Clone)]
pub struct RemoveFailedOptions {
    /// Remove items created longer ago than this.
    pub min_age: Option<Duration>,
    /// Remove items claimed at least this many times.
    pub min_fail_count: Option<u64>,
    /// How many failed items one call examines.
    pub chunk: usize,
    /// Cap on how many removed keys are named in the log line.
    pub log_limit: usize,
}

impl Default for RemoveFailedOptions {
    fn default() -> Self {
        Self {
            min_age: None,
            min_fail_count: None,
            chunk: 100,
            log_limit: 100,
        }
    }
}

/// Result type for the callback handed to
/// [`ReliableQueue::process_failed_items`].
pub type CallbackResult = Result<(), Box<dyn std::error::Error + Send + Sync + 'static>>;

impl ReliableQueue {
    /// Snapshots the failed sublist and feeds up to `max_count` items
    /// (all of them when 0) through `callback`.
    ///
    /// The sublist is atomically renamed to a scratch list first, so
    /// producers parking new failures during the run are never caught
    /// up in it.  Consumed items are gone afterwards; items beyond
    /// `max_count` are drained back into the failed sublist in their
    /// original order.
    ///
    /// The callback is isolated: its errors are counted, not
    /// propagated.  Returns `(item_count, error_count)`.
    #[tracing::instrument(skip(self, callback), fields(queue = %self.config.queue_name))]
    pub async fn process_failed_items<F>(
        &mut self,
        max_count: usize,
        mut callback: F,
    ) -> Result<(usize, usize), QueueError>
    where
        F: FnMut(&Item) -> CallbackResult,
    {
        let failed = self.keys.sublist(Sublist::Failed);
        let scratch = self.keys.scratch_failed();
        let mut conn = self.conn.clone();

        let renamed: i64 = match redis::cmd("RENAMENX")
            .arg(&failed)
            .arg(&scratch)
            .query_async(&mut conn)
            .await
        {
            Ok(renamed) => renamed,
            Err(source) if is_missing_source(&source) => return Ok((0, 0)),
            Err(source) => {
                return Err(QueueError::Command {
                    op: "snapshotting the failed sublist",
                    source,
                })
            }
        };
        if renamed == 0 {
            return Err(QueueError::ScratchCollision { temp_key: scratch });
        }

        let stop = if max_count == 0 {
            -1
        } else {
            max_count as isize - 1
        };
        let item_keys: Vec<String> =
            conn.lrange(&scratch, 0, stop)
                .await
                .map_err(|source| QueueError::Command {
                    op: "reading the failed snapshot",
                    source,
                })?;
        let items = self.hydrate(&mut conn, item_keys, false, false).await?;

        let mut error_count = 0;
        for item in &items {
            if let Err(error) = callback(item) {
                error_count += 1;
                tracing::warn!(item = %item.key, error = %error, "failed-item callback errored; continuing");
            }
        }

        if max_count > 0 {
            // Drop the consumed prefix, then walk the remainder back
            // tail-first so its relative order survives and concurrent
            // parks interleave safely.
            let _: () = conn
                .ltrim(&scratch, max_count as isize, -1)
                .await
                .map_err(|source| QueueError::Command {
                    op: "trimming the failed snapshot",
                    source,
                })?;
            loop {
                let moved: Option<String> = redis::cmd("RPOPLPUSH")
                    .arg(&scratch)
                    .arg(&failed)
                    .query_async(&mut conn)
                    .await
                    .map_err(|source| QueueError::Command {
                        op: "restoring unprocessed failures",
                        source,
                    })?;
                if moved.is_none() {
                    break;
                }
            }
        }
        let _: i64 = conn
            .del(&scratch)
            .await
            .map_err(|source| QueueError::Command {
                op: "dropping the failed snapshot",
                source,
            })?;

        Ok((items.len(), error_count))
    }

    /// Applies one action to everything currently parked in the failed
    /// sublist and returns the affected items.
    #[tracing::instrument(skip(self), fields(queue = %self.config.queue_name))]
    pub async fn handle_failed_items(
        &mut self,
        action: FailedAction,
    ) -> Result<Vec<Item>, QueueError> {
        let failed = self.keys.sublist(Sublist::Failed);
        let mut conn = self.conn.clone();
        let item_keys: Vec<String> =
            conn.lrange(&failed, 0, -1)
                .await
                .map_err(|source| QueueError::Command {
                    op: "listing failed items",
                    source,
                })?;
        let items = self.hydrate(&mut conn, item_keys, false, false).await?;

        let mut handled = Vec::with_capacity(items.len());
        for item in items {
            let moved = match action {
                FailedAction::Requeue => {
                    let error = item.meta.last_error.clone().unwrap_or_default();
                    match self
                        .run_requeue_script(RequeuePolicy::resurrect_failed(), &item.key, &error)
                        .await
                    {
                        Ok(moved) => moved,
                        Err(err) => {
                            tracing::error!(item = %item.key, error = %err, "requeue script failed; skipping item");
                            false
                        }
                    }
                }
                FailedAction::Return => {
                    let removed: i64 = conn
                        .lrem(&failed, -1, item.key.as_ref())
                        .await
                        .map_err(|source| QueueError::Command {
                            op: "removing a failed item",
                            source,
                        })?;
                    removed > 0
                }
            };
            if moved {
                handled.push(item);
            }
        }
        Ok(handled)
    }

    /// Garbage-collects the failed sublist.
    ///
    /// One snapshot pass over up to `chunk` items: anything old enough
    /// or failed often enough is removed for good, records included;
    /// everything else is parked again.  Returns
    /// `(removed, examined)`; callers wanting a full sweep loop until
    /// `examined` comes up short of `chunk`.
    #[tracing::instrument(skip(self), fields(queue = %self.config.queue_name))]
    pub async fn remove_failed_items(
        &mut self,
        options: RemoveFailedOptions,
    ) -> Result<(usize, usize), QueueError> {
        if options.min_age.is_none() && options.min_fail_count.is_none() {
            return Err(QueueError::NoRemovalCriteria);
        }
        let now = now_epoch();
        let min_age = options.min_age.map(|age| age.as_secs_f64());

        let mut drop_keys: Vec<String> = Vec::new();
        let mut keep_keys: Vec<String> = Vec::new();
        let (examined, _) = self
            .process_failed_items(options.chunk, |item| {
                let too_old = min_age.is_some_and(|age| item.meta.time_created < now - age);
                let failed_enough = options
                    .min_fail_count
                    .is_some_and(|count| item.meta.process_count >= count);
                if too_old || failed_enough {
                    drop_keys.push(item.key.to_string());
                } else {
                    keep_keys.push(item.key.to_string());
                }
                Ok(())
            })
            .await?;

        let mut conn = self.conn.clone();
        if !keep_keys.is_empty() {
            let failed = self.keys.sublist(Sublist::Failed);
            let mut pipe = redis::pipe();
            for key in &keep_keys {
                pipe.cmd("LPUSH").arg(&failed).arg(key).ignore();
            }
            let _: () = pipe
                .query_async(&mut conn)
                .await
                .map_err(|source| QueueError::Command {
                    op: "re-parking retained failures",
                    source,
                })?;
        }
        for chunk in drop_keys.chunks(RECORD_DELETE_CHUNK) {
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
                    op: "purging removed failures",
                    source,
                })?;
        }
        if !drop_keys.is_empty() {
            let shown: Vec<&str> = drop_keys
                .iter()
                .take(options.log_limit)
                .map(String::as_str)
                .collect();
            tracing::info!(
                removed = drop_keys.len(),
                kept = keep_keys.len(),
                items = ?shown,
                "removed failed items"
            );
        }
        Ok((drop_keys.len(), examined))
    }

    /// Rescues items whose consumer never finished.
    ///
    /// Scans the working sublist for items enqueued longer than
    /// `timeout` ago (the configured `busy_expiry_time` when `None`)
    /// and either requeues them through the regular busy path or drops
    /// them.  Returns the affected items.
    ///
    /// A slow-but-alive consumer can lose its item to this scan; its
    /// eventual acknowledgement then lands in the `failed` half of the
    /// outcome, which is the documented way that race resolves.  Keep
    /// `busy_expiry_time` above the worst-case processing time.
    #[tracing::instrument(skip(self), fields(queue = %self.config.queue_name))]
    pub async fn handle_expired_items(
        &mut self,
        timeout: Option<Duration>,
        action: ExpiryAction,
    ) -> Result<Vec<Item>, QueueError> {
        let timeout = timeout.unwrap_or(self.config.busy_expiry_time).as_secs_f64();
        let cutoff = now_epoch() - timeout;
        let working = self.keys.sublist(Sublist::Working);
        let mut conn = self.conn.clone();

        let item_keys: Vec<String> =
            conn.lrange(&working, 0, -1)
                .await
                .map_err(|source| QueueError::Command {
                    op: "listing working items",
                    source,
                })?;
        let items = self.hydrate(&mut conn, item_keys, false, false).await?;

        let mut affected = Vec::new();
        for item in items {
            if item.meta.time_enqueued >= cutoff {
                continue;
            }
            let recovered = match action {
                ExpiryAction::Requeue => {
                    let policy = RequeuePolicy::busy(self.config.requeue_limit);
                    match self.run_requeue_script(policy, &item.key, "").await {
                        Ok(moved) => moved,
                        Err(err) => {
                            tracing::error!(item = %item.key, error = %err, "requeue script failed; skipping item");
                            false
                        }
                    }
                }
                ExpiryAction::Drop => {
                    // Records stay behind for the operator.
                    let removed: i64 = conn
                        .lrem(&working, -1, item.key.as_ref())
                        .await
                        .map_err(|source| QueueError::Command {
                            op: "dropping an expired item",
                            source,
                        })?;
                    removed > 0
                }
            };
            if recovered {
                affected.push(item);
            }
        }
        Ok(affected)
    }
}

fn is_missing_source(error: &redis::RedisError) -> bool {
    error.kind() == redis::ErrorKind::ResponseError && error.to_string().contains("no such key")
}
