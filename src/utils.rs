use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use prost::Message;

/// The default window after which a `RedundantErrorFilter` forgets what it has seen.
pub const DEFAULT_REDUNDANT_ERROR_WINDOW: Duration = Duration::from_secs(60);

/// Encode the given model into a bytes vec.
pub fn encode_model<M: Message>(model: &M) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(model.encoded_len());
    model.encode(&mut buf).context("error serializing data model")?;
    Ok(buf)
}

/// Decode an object from the given buffer.
pub fn decode_model<M: Message + Default>(data: &[u8]) -> Result<M> {
    M::decode(data).context("error decoding data model")
}

/// The current wall clock time as milliseconds since the unix epoch.
pub fn now_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// A filter used to log each distinct error message only once per window.
pub struct RedundantErrorFilter {
    window: Duration,
    state: Mutex<FilterState>,
}

struct FilterState {
    window_start: Instant,
    seen: HashSet<u64>,
}

impl RedundantErrorFilter {
    /// Create a new instance which forgets all seen messages every `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(FilterState {
                window_start: Instant::now(),
                seen: HashSet::new(),
            }),
        }
    }

    /// Check if the given message has already been seen in the current window, recording it
    /// if not.
    pub fn is_redundant(&self, message: &str) -> bool {
        let mut hasher = DefaultHasher::new();
        message.hash(&mut hasher);
        let hash = hasher.finish();

        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.window_start.elapsed() >= self.window {
            state.window_start = Instant::now();
            state.seen.clear();
        }
        !state.seen.insert(hash)
    }
}

impl Default for RedundantErrorFilter {
    fn default() -> Self {
        Self::new(DEFAULT_REDUNDANT_ERROR_WINDOW)
    }
}
