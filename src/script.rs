//! The server-side requeue script.
//!
//! Moving an item out of a sublist, deciding between retry and park,
//! and updating its metadata must happen without interleaving against
//! other consumers, so all of it runs as one Lua script on the server.
//! `redis::Script` invokes it by SHA and transparently re-uploads the
//! source when the server answers `NOSCRIPT`.
//!
//! Every public requeue operation is this script run with a different
//! [`RequeuePolicy`].  The policy fixes the source sublist and the end
//! of the unprocessed list the item lands on.  It also decides whether
//! the attempt counter moves and which limit (if any) diverts the item
//! to the failed sublist.

use crate::keys::Sublist;

/// KEYS: [1] = source list, [2] = destination on success,
///       [3] = destination on park, [4] = the item's metadata hash
/// ARGV: [1] = item key, [2] = signed park limit (negative disables),
///       [3] = placement (0 = head, 1 = tail), [4] = error annotation,
///       [5] = whether to bump process_count, [6] = current epoch time
const REQUEUE_LUA: &str = r#"
local removed = redis.call('lrem', KEYS[1], 1, ARGV[1])
if removed == 0 then
    return 0
end
if ARGV[5] == '1' then
    redis.call('hincrby', KEYS[4], 'process_count', 1)
end
local limit = tonumber(ARGV[2])
local count = tonumber(redis.call('hget', KEYS[4], 'process_count') or '0')
if limit >= 0 and count > limit then
    redis.call('hincrby', KEYS[4], 'bail_count', 1)
    redis.call('hset', KEYS[4], 'last_error', ARGV[4])
    redis.call('lpush', KEYS[3], ARGV[1])
    return 1
end
redis.call('hset', KEYS[4], 'time_enqueued', ARGV[6])
if ARGV[4] ~= '' then
    redis.call('hset', KEYS[4], 'last_error', ARGV[4])
end
if ARGV[3] == '1' then
    redis.call('rpush', KEYS[2], ARGV[1])
else
    redis.call('lpush', KEYS[2], ARGV[1])
end
return 1
"#;

pub(crate) fn requeue_script() -> redis::Script {
    redis::Script::new(REQUEUE_LUA)
}

/// Which end of the unprocessed list a requeued item lands on.
///
/// Consumers pop from the tail, so `Tail` puts an item next in line
/// while `Head` sends it to the back of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Place {
    Head,
    Tail,
}

impl Place {
    pub(crate) fn as_arg(self) -> i64 {
        match self {
            Place::Head => 0,
            Place::Tail => 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RequeuePolicy {
    pub source: Sublist,
    pub place: Place,
    pub increment: bool,
    /// Park threshold handed to the script.  Negative disables the
    /// park check entirely, which the from-failed and unclaim paths
    /// rely on: their items would otherwise bounce straight back.
    pub limit: i64,
}

impl RequeuePolicy {
    /// A worker hands back an item it never started: next in line
    /// again, attempt counter untouched, never parked.
    pub(crate) fn unclaim() -> Self {
        Self {
            source: Sublist::Working,
            place: Place::Tail,
            increment: false,
            limit: -1,
        }
    }

    /// Retry after a failure: back of the line, counted as an attempt,
    /// parked once the count exceeds the limit.
    pub(crate) fn busy(limit: u64) -> Self {
        Self {
            source: Sublist::Working,
            place: Place::Head,
            increment: true,
            limit: limit as i64,
        }
    }

    /// Operator retry of a parked item: counted as an attempt so the
    /// item resumes where it left off, but exempt from the park check.
    pub(crate) fn retry_failed() -> Self {
        Self {
            source: Sublist::Failed,
            place: Place::Tail,
            increment: true,
            limit: -1,
        }
    }

    /// Bulk drain of the failed sublist back into circulation; counts
    /// are left alone.
    pub(crate) fn resurrect_failed() -> Self {
        Self {
            source: Sublist::Failed,
            place: Place::Head,
            increment: false,
            limit: -1,
        }
    }
}
