use std::collections::{HashMap, VecDeque};

use crate::statement::RawStatement;

/// A prepared statement at rest in the cache, together with how many bytes of
/// its key text the preparation consumed (the rest is the batch tail).
pub(crate) struct CachedStatement {
    pub(crate) stmt: RawStatement,
    pub(crate) tail_offset: usize,
}

/// Per-connection cache of prepared statements, keyed by the exact SQL text
/// that produced them.
///
/// Trailing whitespace is significant: a byte-different text is a miss by
/// design, which callers exploit to force a fresh preparation. Eviction is
/// least-recently-used. A capacity of zero disables caching entirely.
///
/// At most one instance per text is held here; a checkout removes the entry,
/// so a second cursor running the same SQL concurrently prepares a distinct
/// instance rather than sharing one.
pub(crate) struct StatementCache {
    capacity: usize,
    entries: HashMap<String, CachedStatement>,
    /// Recency queue, most recently used at the back.
    recency: VecDeque<String>,
}

impl StatementCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            recency: VecDeque::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Take the cached statement for `sql` out of the cache, if present.
    pub(crate) fn checkout(&mut self, sql: &str) -> Option<CachedStatement> {
        let entry = self.entries.remove(sql)?;
        self.recency.retain(|key| key != sql);
        Some(entry)
    }

    /// Return a statement to the cache after use.
    ///
    /// The statement is reset and its bindings cleared so the next checkout
    /// starts from a clean slate. With caching disabled the statement is
    /// finalized instead.
    pub(crate) fn checkin(&mut self, sql: String, entry: CachedStatement) {
        if self.capacity == 0 {
            drop(entry);
            return;
        }
        entry.stmt.reset();
        entry.stmt.clear_bindings();
        if let Some(previous) = self.entries.insert(sql.clone(), entry) {
            // Two instances of the same text were live; keep the newer one.
            drop(previous);
            self.recency.retain(|key| key != &sql);
        }
        self.recency.push_back(sql);
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.recency.pop_front() else {
                break;
            };
            if let Some(evicted) = self.entries.remove(&oldest) {
                tracing::trace!(sql = %oldest, "evicting least-recently-used statement");
                drop(evicted);
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }
}
