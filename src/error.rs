#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum QueueError {
    #[error("failed to connect to redis at {addr}: {source}")]
    Connection {
        addr: String,
        #[source]
        source: redis::RedisError,
    },
    #[error("redis command failed while {op}: {source}")]
    Command {
        op: &'static str,
        #[source]
        source: redis::RedisError,
    },
    /// A freshly minted item key was already present on the server.
    ///
    /// Item keys carry 128 random bits, so this points at state
    /// corruption (or a catastrophically broken random source) rather
    /// than bad luck.  The colliding payload is left untouched.
    #[error("a payload is already stored under item key {item_key}; refusing to overwrite")]
    KeyCollision { item_key: String },
    /// The scratch list used to snapshot the failed sublist already
    /// existed.  Scratch names are random per run, so an existing key
    /// means a previous batch run died mid-way and needs operator
    /// attention before its leftovers are clobbered.
    #[error("scratch list {temp_key} already exists; a previous failed-item run may have died")]
    ScratchCollision { temp_key: String },
    /// An item key was listed in a sublist but its payload record is
    /// gone.  Outside of bulk paths (which skip and warn) this means
    /// the invariant between sublists and records has been broken.
    #[error("item {item_key} is listed but has no stored payload")]
    MissingPayload { item_key: String },
    #[error("enqueue requires at least one payload")]
    NothingToEnqueue,
    #[error("cannot claim {count} items; the count must be at least 1")]
    BadClaimCount { count: usize },
    #[error("failed-item removal needs a minimum age or a minimum failure count")]
    NoRemovalCriteria,
}
