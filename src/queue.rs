use std::collections::HashMap;

use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::AsyncCommands as _;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::item::{now_epoch, Item, ItemKey, ItemMeta};
use crate::keys::{self, KeySpace, Sublist};
use crate::script::{requeue_script, RequeuePolicy};

/// Records are purged in batches of this many items per round trip.
pub(crate) const RECORD_DELETE_CHUNK: usize = 100;

/// A handle to one reliable FIFO queue on one Redis server.
///
/// The handle owns a single logical connection and is meant to be
/// driven from one task at a time; every operation takes `&mut self`,
/// so the borrow checker enforces that.  Run as many handles in
/// parallel as you like; all coordination happens through Redis
/// primitives, never through client state.
pub struct ReliableQueue {
    pub(crate) config: QueueConfig,
    pub(crate) keys: KeySpace,
    pub(crate) conn: ConnectionManager,
    pub(crate) requeue_script: redis::Script,
}

/// The two halves of an acknowledgement.
///
/// `flushed` items were removed from the working sublist and their
/// records purged.  `failed` items were no longer there (almost always
/// because the expiry reclaimer got to them first) and were left
/// untouched.
#[derive(Debug, Default)]
pub struct AckOutcome {
    pub flushed: Vec<Item>,
    pub failed: Vec<Item>,
}

impl ReliableQueue {
    /// Connects to the configured server and returns a ready handle.
    ///
    /// The connection reconnects transparently; the default schedule
    /// retries with backoff and gives up after roughly a minute of
    /// the server staying unreachable.
    pub async fn connect(config: QueueConfig) -> Result<Self, QueueError> {
        let options = ConnectionManagerConfig::new()
            .set_number_of_retries(6)
            .set_max_delay(10_000);
        Self::connect_with_redis_options(config, options).await
    }

    /// Like [`connect`](Self::connect), with full control over the
    /// connection manager's retry and timeout behavior.
    pub async fn connect_with_redis_options(
        config: QueueConfig,
        options: ConnectionManagerConfig,
    ) -> Result<Self, QueueError> {
        let url = config.redis_url();
        let client = redis::Client::open(url.as_str()).map_err(|source| QueueError::Connection {
            addr: url.clone(),
            source,
        })?;
        let conn = ConnectionManager::new_with_config(client, options)
            .await
            .map_err(|source| QueueError::Connection { addr: url, source })?;
        Ok(Self {
            keys: KeySpace::new(&config.queue_name),
            conn,
            requeue_script: requeue_script(),
            config,
        })
    }

    /// The logical queue name this handle operates on.
    pub fn queue_name(&self) -> &str {
        &self.config.queue_name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Stores the given payloads and makes them claimable, in order.
    ///
    /// Each payload gets a freshly minted item key, a payload record, a
    /// metadata record, and an entry at the head of the unprocessed
    /// sublist.  The steps are pipelined but not atomic as a group: a
    /// crash part-way leaves unreferenced records behind, never a
    /// half-visible item.
    #[tracing::instrument(skip(self, payloads), fields(queue = %self.config.queue_name, count = payloads.len()))]
    pub async fn enqueue_items<P>(&mut self, payloads: Vec<P>) -> Result<Vec<Item>, QueueError>
    where
        P: Into<Vec<u8>>,
    {
        if payloads.is_empty() {
            return Err(QueueError::NothingToEnqueue);
        }
        let payloads: Vec<Vec<u8>> = payloads.into_iter().map(Into::into).collect();
        let minted: Vec<ItemKey> = payloads.iter().map(|_| self.keys.mint_item_key()).collect();
        let now = now_epoch();
        let mut conn = self.conn.clone();

        // Payloads land first, conditionally.  Nothing references them
        // yet, so a collision can bail out without leaving a stray
        // entry in any sublist.
        let mut pipe = redis::pipe();
        for (key, payload) in minted.iter().zip(&payloads) {
            pipe.cmd("SETNX")
                .arg(keys::payload_key(key))
                .arg(payload.as_slice());
        }
        let stored: Vec<i64> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|source| QueueError::Command {
                op: "storing payloads",
                source,
            })?;
        if let Some(position) = stored.iter().position(|&fresh| fresh == 0) {
            return Err(QueueError::KeyCollision {
                item_key: minted[position].to_string(),
            });
        }

        let unprocessed = self.keys.sublist(Sublist::Unprocessed);
        let mut pipe = redis::pipe();
        for key in &minted {
            pipe.cmd("HSET")
                .arg(keys::meta_key(key))
                .arg("process_count")
                .arg(0)
                .arg("bail_count")
                .arg(0)
                .arg("time_created")
                .arg(now)
                .arg("time_enqueued")
                .arg(now)
                .ignore();
            pipe.cmd("LPUSH").arg(&unprocessed).arg(key.as_ref()).ignore();
        }
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|source| QueueError::Command {
                op: "publishing enqueued items",
                source,
            })?;

        let meta = ItemMeta {
            time_created: now,
            time_enqueued: now,
            ..ItemMeta::default()
        };
        Ok(minted
            .into_iter()
            .zip(payloads)
            .map(|(key, payload)| Item::new(key, payload, meta.clone()))
            .collect())
    }

    /// Claims up to `count` items, waiting up to the configured
    /// `claim_wait_timeout` when the queue is empty.
    ///
    /// Items come back oldest first.  Fewer than `count` items (or
    /// none at all, after the wait) is a normal outcome, not an
    /// error.
    #[tracing::instrument(skip(self), fields(queue = %self.config.queue_name))]
    pub async fn claim_items(&mut self, count: usize) -> Result<Vec<Item>, QueueError> {
        self.claim(count, true).await
    }

    /// Claims up to `count` items without ever blocking.
    #[tracing::instrument(skip(self), fields(queue = %self.config.queue_name))]
    pub async fn claim_items_nonblocking(&mut self, count: usize) -> Result<Vec<Item>, QueueError> {
        self.claim(count, false).await
    }

    async fn claim(&mut self, count: usize, blocking: bool) -> Result<Vec<Item>, QueueError> {
        match count {
            0 => Err(QueueError::BadClaimCount { count }),
            1 => Ok(self.claim_one(blocking).await?.into_iter().collect()),
            _ => self.claim_bulk(count, blocking).await,
        }
    }

    async fn claim_one(&mut self, blocking: bool) -> Result<Option<Item>, QueueError> {
        let unprocessed = self.keys.sublist(Sublist::Unprocessed);
        let working = self.keys.sublist(Sublist::Working);
        let mut conn = self.conn.clone();

        // Cheap fast path first; the blocking variant only pays off
        // when the queue is actually empty.
        let mut key: Option<String> = redis::cmd("RPOPLPUSH")
            .arg(&unprocessed)
            .arg(&working)
            .query_async(&mut conn)
            .await
            .map_err(|source| QueueError::Command {
                op: "claiming an item",
                source,
            })?;
        if key.is_none() && blocking {
            key = redis::cmd("BRPOPLPUSH")
                .arg(&unprocessed)
                .arg(&working)
                .arg(self.config.claim_wait_timeout.as_secs_f64())
                .query_async(&mut conn)
                .await
                .map_err(|source| QueueError::Command {
                    op: "waiting for an item",
                    source,
                })?;
        }
        match key {
            Some(key) => Ok(self.hydrate(&mut conn, vec![key], true, true).await?.pop()),
            None => Ok(None),
        }
    }

    async fn claim_bulk(&mut self, count: usize, blocking: bool) -> Result<Vec<Item>, QueueError> {
        let unprocessed = self.keys.sublist(Sublist::Unprocessed);
        let working = self.keys.sublist(Sublist::Working);
        let mut conn = self.conn.clone();

        // Best effort: clamp to what the list holds right now.  A
        // concurrent enqueue in between merely shortens this batch.
        let backlog: i64 = conn
            .llen(&unprocessed)
            .await
            .map_err(|source| QueueError::Command {
                op: "sizing the unprocessed sublist",
                source,
            })?;
        let mut claimed = self
            .pop_unprocessed(&mut conn, count.min(backlog.max(0) as usize))
            .await?;

        if claimed.is_empty() && blocking {
            let first: Option<String> = redis::cmd("BRPOPLPUSH")
                .arg(&unprocessed)
                .arg(&working)
                .arg(self.config.claim_wait_timeout.as_secs_f64())
                .query_async(&mut conn)
                .await
                .map_err(|source| QueueError::Command {
                    op: "waiting for an item",
                    source,
                })?;
            if let Some(first) = first {
                claimed.push(first);
                let more = self.pop_unprocessed(&mut conn, count - 1).await?;
                claimed.extend(more);
            }
        }

        self.hydrate(&mut conn, claimed, true, false).await
    }

    async fn pop_unprocessed(
        &self,
        conn: &mut ConnectionManager,
        count: usize,
    ) -> Result<Vec<String>, QueueError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let unprocessed = self.keys.sublist(Sublist::Unprocessed);
        let working = self.keys.sublist(Sublist::Working);
        let mut pipe = redis::pipe();
        for _ in 0..count {
            pipe.cmd("RPOPLPUSH").arg(&unprocessed).arg(&working);
        }
        let popped: Vec<Option<String>> =
            pipe.query_async(conn)
                .await
                .map_err(|source| QueueError::Command {
                    op: "claiming items",
                    source,
                })?;
        Ok(popped.into_iter().flatten().collect())
    }

    /// Fetches payload and metadata for the given item keys, in order.
    ///
    /// With `count_attempt`, each item's `process_count` is bumped
    /// before the metadata is read.  The claim paths use this, and the
    /// returned snapshot already reflects the claim.
    ///
    /// Strict mode turns a missing payload into an error; the lenient
    /// mode used by bulk and snapshot paths warns and drops the entry
    /// instead, leaving the stray list entry for the reclaimer or a
    /// later sweep.
    pub(crate) async fn hydrate(
        &self,
        conn: &mut ConnectionManager,
        item_keys: Vec<String>,
        count_attempt: bool,
        strict: bool,
    ) -> Result<Vec<Item>, QueueError> {
        if item_keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for key in &item_keys {
            if count_attempt {
                pipe.cmd("HINCRBY")
                    .arg(keys::meta_key(key))
                    .arg("process_count")
                    .arg(1)
                    .ignore();
            }
            pipe.cmd("HGETALL").arg(keys::meta_key(key));
            pipe.cmd("GET").arg(keys::payload_key(key));
        }
        let raw: Vec<redis::Value> = match pipe.query_async(conn).await {
            Ok(raw) => raw,
            Err(source) if !strict => {
                tracing::error!(
                    error = %source,
                    "bulk record fetch failed; claimed items stay in the working sublist for reclamation"
                );
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(QueueError::Command {
                    op: "fetching item records",
                    source,
                })
            }
        };

        let mut items = Vec::with_capacity(item_keys.len());
        for (key, replies) in item_keys.iter().zip(raw.chunks_exact(2)) {
            let map: HashMap<String, String> = match redis::from_redis_value(&replies[0]) {
                Ok(map) => map,
                Err(source) => {
                    if strict {
                        return Err(QueueError::Command {
                            op: "decoding item metadata",
                            source,
                        });
                    }
                    tracing::warn!(item = %key, error = %source, "metadata reply did not decode; skipping item");
                    continue;
                }
            };
            let payload: Option<Vec<u8>> = match redis::from_redis_value(&replies[1]) {
                Ok(payload) => payload,
                Err(source) => {
                    if strict {
                        return Err(QueueError::Command {
                            op: "decoding item payload",
                            source,
                        });
                    }
                    tracing::warn!(item = %key, error = %source, "payload reply did not decode; skipping item");
                    continue;
                }
            };
            let Some(payload) = payload else {
                if strict {
                    return Err(QueueError::MissingPayload {
                        item_key: key.clone(),
                    });
                }
                tracing::warn!(item = %key, "listed item has no stored payload; skipping it");
                continue;
            };
            if map.is_empty() {
                tracing::warn!(item = %key, "metadata hash is missing; continuing with defaults");
            }
            items.push(Item::new(
                ItemKey::new(key.clone()),
                payload,
                ItemMeta::from_map(key, &map),
            ));
        }
        Ok(items)
    }

    /// Acknowledges finished items: removes them from the working
    /// sublist and purges their records.
    ///
    /// Items that were no longer in the working sublist come back in
    /// the `failed` half of the outcome instead of erroring.  The
    /// usual cause is a slow consumer whose item was already reclaimed,
    /// and re-acknowledging is always safe.
    #[tracing::instrument(skip(self, items), fields(queue = %self.config.queue_name, count = items.len()))]
    pub async fn mark_items_as_processed(
        &mut self,
        items: Vec<Item>,
    ) -> Result<AckOutcome, QueueError> {
        if items.is_empty() {
            return Ok(AckOutcome::default());
        }
        let working = self.keys.sublist(Sublist::Working);
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        for item in &items {
            pipe.cmd("LREM").arg(&working).arg(1).arg(item.key.as_ref());
        }
        let removed: Vec<i64> =
            pipe.query_async(&mut conn)
                .await
                .map_err(|source| QueueError::Command {
                    op: "acknowledging items",
                    source,
                })?;

        let mut outcome = AckOutcome::default();
        for (item, removed) in items.into_iter().zip(removed) {
            if removed > 0 {
                outcome.flushed.push(item);
            } else {
                tracing::warn!(
                    item = %item.key,
                    "item was no longer in the working sublist; it was likely reclaimed"
                );
                outcome.failed.push(item);
            }
        }

        for chunk in outcome.flushed.chunks(RECORD_DELETE_CHUNK) {
            let mut pipe = redis::pipe();
            for item in chunk {
                pipe.cmd("DEL")
                    .arg(keys::meta_key(&item.key))
                    .arg(keys::payload_key(&item.key));
            }
            let deleted: Vec<i64> =
                pipe.query_async(&mut conn)
                    .await
                    .map_err(|source| QueueError::Command {
                        op: "purging item records",
                        source,
                    })?;
            let deleted: i64 = deleted.iter().sum();
            let expected = 2 * chunk.len() as i64;
            if deleted != expected {
                tracing::warn!(
                    deleted,
                    expected,
                    "fewer records purged than expected; another client may have cleaned up already"
                );
            }
        }

        Ok(outcome)
    }

    /// Returns unstarted items to the front of the line.
    ///
    /// The attempt counter is untouched and the item can never be
    /// parked by this path.
    pub async fn unclaim(&mut self, items: &[Item]) -> Result<usize, QueueError> {
        self.requeue_items(RequeuePolicy::unclaim(), items, "").await
    }

    /// Retries failed items: back of the line, attempt counted, parked
    /// in the failed sublist once the count exceeds the configured
    /// limit.
    pub async fn requeue_busy(&mut self, items: &[Item]) -> Result<usize, QueueError> {
        let policy = RequeuePolicy::busy(self.config.requeue_limit);
        self.requeue_items(policy, items, "").await
    }

    /// Like [`requeue_busy`](Self::requeue_busy), recording `error` as
    /// the item's most recent error annotation.
    pub async fn requeue_busy_error(
        &mut self,
        error: &str,
        items: &[Item],
    ) -> Result<usize, QueueError> {
        let policy = RequeuePolicy::busy(self.config.requeue_limit);
        self.requeue_items(policy, items, error).await
    }

    /// Puts parked items back into circulation.
    ///
    /// The attempt counter keeps counting: a retried item resumes at
    /// its old count plus one, it does not start over.
    pub async fn requeue_failed_items(&mut self, items: &[Item]) -> Result<usize, QueueError> {
        self.requeue_items(RequeuePolicy::retry_failed(), items, "")
            .await
    }

    /// Runs the requeue script once per item and counts the moves.
    ///
    /// Per-item failures are logged and skipped rather than raised;
    /// an item the script no longer finds in its source sublist simply
    /// does not count.
    pub(crate) async fn requeue_items(
        &mut self,
        policy: RequeuePolicy,
        items: &[Item],
        error: &str,
    ) -> Result<usize, QueueError> {
        let mut moved = 0;
        for item in items {
            match self.run_requeue_script(policy, item.key.as_ref(), error).await {
                Ok(true) => moved += 1,
                Ok(false) => {
                    tracing::warn!(
                        item = %item.key,
                        source = %policy.source,
                        "item was not in the source sublist; nothing requeued"
                    );
                }
                Err(err) => {
                    tracing::error!(item = %item.key, error = %err, "requeue script failed; skipping item");
                }
            }
        }
        Ok(moved)
    }

    pub(crate) async fn run_requeue_script(
        &mut self,
        policy: RequeuePolicy,
        item_key: &str,
        error: &str,
    ) -> Result<bool, redis::RedisError> {
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .requeue_script
            .key(self.keys.sublist(policy.source))
            .key(self.keys.sublist(Sublist::Unprocessed))
            .key(self.keys.sublist(Sublist::Failed))
            .key(keys::meta_key(item_key))
            .arg(item_key)
            .arg(policy.limit)
            .arg(policy.place.as_arg())
            .arg(error)
            .arg(i64::from(policy.increment))
            .arg(now_epoch())
            .invoke_async(&mut conn)
            .await?;
        let moved = moved > 0;
        if moved && self.config.warn_on_requeue {
            tracing::warn!(item = item_key, source = %policy.source, "item requeued");
        }
        Ok(moved)
    }

    // Compatibility aliases kept for callers of the older single-item
    // surface.  Forwarding only; the plural operations are canonical.

    /// Claims a single item, blocking up to the configured wait.
    pub async fn claim_item(&mut self) -> Result<Option<Item>, QueueError> {
        Ok(self.claim_items(1).await?.pop())
    }

    /// Claims a single item without blocking.
    pub async fn claim_item_nonblocking(&mut self) -> Result<Option<Item>, QueueError> {
        Ok(self.claim_items_nonblocking(1).await?.pop())
    }

    /// Acknowledges a single item.
    pub async fn mark_item_as_done(&mut self, item: Item) -> Result<AckOutcome, QueueError> {
        self.mark_items_as_processed(vec![item]).await
    }

    /// Acknowledges a batch of items.
    pub async fn mark_items_as_done(&mut self, items: Vec<Item>) -> Result<AckOutcome, QueueError> {
        self.mark_items_as_processed(items).await
    }

    /// Retries a single failed item.
    pub async fn requeue_busy_item(&mut self, item: &Item) -> Result<usize, QueueError> {
        self.requeue_busy(std::slice::from_ref(item)).await
    }

    /// Returns a single unstarted item.
    pub async fn unclaim_item(&mut self, item: &Item) -> Result<usize, QueueError> {
        self.unclaim(std::slice::from_ref(item)).await
    }
}

impl std::fmt::Debug for ReliableQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableQueue")
            .field("config", &self.config)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}
