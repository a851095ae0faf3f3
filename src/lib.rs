//! # Reliable FIFO queueing on Redis.
//!
//! A work queue where losing items is not an option.  Producers push
//! opaque byte payloads; any number of competing consumers claim them
//! and acknowledge once the work is done.  Every item is either
//! processed, retried up to a configured limit, or parked in a failure
//! area for an operator to look at.  That holds even when a consumer
//! crashes halfway through.
//!
//! ## How it works
//!
//! A queue named `Q` is four Redis lists plus two records per live
//! item:
//!
//! - `Q_unprocessed` holds the keys of items waiting for a consumer.
//!   Producers push onto the head; consumers pop from the tail, so the
//!   tail is always the oldest work.
//! - `Q_working` holds the keys currently claimed by some consumer.
//! - `Q_failed` holds the keys that ran out of retries.
//! - `Q_processed` exists for symmetry and is unused by the core
//!   paths.
//! - `item-<key>` is the payload (arbitrary bytes), `meta-<key>` is a
//!   hash tracking attempt counts, timestamps, and the last error.
//!
//! Claiming is a single server-side `RPOPLPUSH` (or `BRPOPLPUSH` when
//! waiting), which is what makes the queue reliable: an item is never
//! "in flight" on the network; it moves atomically from one list to
//! the other, and a consumer that dies simply leaves it sitting in
//! `Q_working`.  [`ReliableQueue::handle_expired_items`] scans that
//! list and rescues anything older than the configured expiry.
//!
//! Requeueing is where policy lives, and it runs as one Lua script so
//! the remove-count-decide-push sequence cannot interleave with other
//! consumers.  The script bumps the attempt counter, and once the
//! count exceeds `requeue_limit` the item is diverted to `Q_failed`
//! instead of retried.  From there the failure-area operations let an
//! operator retry the item or clean it up.
//!
//! ## Handles and concurrency
//!
//! A [`ReliableQueue`] is one logical connection and is meant to be
//! used from one task at a time (every method takes `&mut self`).
//! Parallelism comes from opening more handles, in the same process
//! or on other machines.  There is no client-side coordination at all;
//! Redis's atomic primitives are the only synchronization.
//!
//! Within one producer, enqueue order is claim order.  Across
//! producers, items interleave in server arrival order.  Bulk claims
//! return items oldest-first.
//!
//! ## What this crate does not do
//!
//! Payloads are opaque `Vec<u8>`; serialize however you like.  There
//! are no priority tiers and no ordering across queues.  Durability is
//! whatever the Redis server is configured to provide.

mod config;
mod error;
mod inspect;
mod item;
mod keys;
mod maintenance;
mod queue;
mod script;

pub use self::config::QueueConfig;
pub use self::error::QueueError;
pub use self::inspect::{Direction, QueueStats};
pub use self::item::{Item, ItemKey, ItemMeta};
pub use self::keys::Sublist;
pub use self::maintenance::{CallbackResult, ExpiryAction, FailedAction, RemoveFailedOptions};
pub use self::queue::{AckOutcome, ReliableQueue};
