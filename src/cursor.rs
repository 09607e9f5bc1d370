use std::sync::Arc;

use crate::cache::CachedStatement;
use crate::connection::ConnInner;
use crate::error::{Error, Result};
use crate::params::Params;
use crate::statement::RawStatement;
use crate::value::Value;

/// Execution lifecycle of one cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Nothing executed yet, or reset.
    Idle,
    /// Mid-batch with no row buffered.
    Executing,
    /// A row is buffered and more may follow.
    RowsPending,
    /// The batch (and any binding-set iterator) ran to the end.
    Complete,
}

/// Remaining bindings for the batch currently running.
enum Bindings {
    None,
    /// Positional values, consumed left to right across every statement of
    /// the batch.
    Positional { values: Vec<Value>, consumed: usize },
    Named(std::collections::HashMap<String, Value>),
}

impl Bindings {
    fn from_params(params: &Params) -> Self {
        match params {
            Params::None => Self::None,
            Params::Positional(values) => Self::Positional {
                values: values.clone(),
                consumed: 0,
            },
            Params::Named(map) => Self::Named(map.clone()),
        }
    }

    fn leftover(&self) -> usize {
        match self {
            Self::Positional { values, consumed } => values.len() - consumed,
            Self::None | Self::Named(_) => 0,
        }
    }
}

struct ActiveStatement {
    stmt: RawStatement,
    /// Exact text keying this statement in the cache: the full remaining
    /// batch text at preparation time.
    cache_key: String,
    /// Bytes of `cache_key` the preparation consumed; the rest is the tail.
    tail_offset: usize,
}

type BindingSets = Box<dyn Iterator<Item = Result<Params>> + Send>;

/// Executes SQL on one connection and iterates result rows.
///
/// A cursor runs one execution at a time: multi-statement text is prepared
/// and run strictly in source order, and rows are pulled with [`next_row`].
/// Starting a new execution while the previous one still has unread rows or
/// unexecuted statements is refused; [`reset`] force-abandons.
///
/// [`next_row`]: Cursor::next_row
/// [`reset`]: Cursor::reset
pub struct Cursor {
    conn: Arc<ConnInner>,
    state: State,
    active: Option<ActiveStatement>,
    /// Batch text not yet prepared.
    pending_sql: String,
    /// Full batch text, re-run per binding set under `execute_many`.
    full_sql: String,
    bindings: Bindings,
    /// The current binding set as supplied, for exec tracing.
    trace_params: Params,
    sets: Option<BindingSets>,
    exec_trace: Option<crate::params::ExecTraceHandler>,
    row_trace: Option<crate::params::RowTraceHandler>,
    columns: Vec<(String, Option<String>)>,
    current_row: Option<Vec<Value>>,
    exhaustion_reported: bool,
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Cursor {
    pub(crate) fn new(conn: Arc<ConnInner>) -> Self {
        Self {
            conn,
            state: State::Idle,
            active: None,
            pending_sql: String::new(),
            full_sql: String::new(),
            bindings: Bindings::None,
            trace_params: Params::None,
            sets: None,
            exec_trace: None,
            row_trace: None,
            columns: Vec::new(),
            current_row: None,
            exhaustion_reported: false,
        }
    }

    /// Run `sql`, binding `params`, and position on the first row.
    ///
    /// Returns `&mut Self` so a single-shot query reads as
    /// `cursor.execute(...)?.fetch_all()?`.
    pub fn execute(&mut self, sql: &str, params: impl Into<Params>) -> Result<&mut Self> {
        let conn = Arc::clone(&self.conn);
        let guard = conn.enter()?;
        self.check_restartable()?;
        self.begin(sql, params.into(), None);
        let outcome = self.advance();
        drop(guard);
        outcome?;
        Ok(self)
    }

    /// Run `sql` once per binding set, re-using the prepared statements.
    ///
    /// The iterator is consumed lazily: each set's statements must run to the
    /// end (all rows read) before the next set is fetched. An error from the
    /// iterator propagates; sets already executed stay executed. An empty
    /// iterator prepares and executes nothing.
    pub fn execute_many<I>(&mut self, sql: &str, sets: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = Result<Params>>,
        I::IntoIter: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let guard = conn.enter()?;
        self.check_restartable()?;
        let mut sets = sets.into_iter();
        // First set before any preparation: an empty sequence never touches
        // the text, even when it would not parse.
        match sets.next() {
            None => {
                self.begin("", Params::None, None);
                self.state = State::Complete;
                drop(guard);
                return Ok(self);
            }
            Some(Err(err)) => {
                drop(guard);
                return Err(err);
            }
            Some(Ok(params)) => {
                self.begin(sql, params, Some(Box::new(sets)));
            }
        }
        let outcome = self.advance();
        drop(guard);
        outcome?;
        Ok(self)
    }

    /// Fetch the next row.
    ///
    /// `Ok(Some(row))` per row, then `Ok(None)` exactly once at exhaustion;
    /// afterwards the cursor reports completion as an error until the next
    /// `execute`.
    pub fn next_row(&mut self) -> Result<Option<Vec<Value>>> {
        let conn = Arc::clone(&self.conn);
        let guard = conn.enter()?;
        let result = self.next_row_locked();
        drop(guard);
        result
    }

    fn next_row_locked(&mut self) -> Result<Option<Vec<Value>>> {
        match self.state {
            State::Idle => Err(Error::usage("cursor has not executed a statement")),
            State::Executing => {
                self.advance()?;
                if self.state == State::Complete {
                    self.exhaustion_reported = true;
                    Ok(None)
                } else {
                    self.next_row_locked()
                }
            }
            State::RowsPending => {
                // Deliver the buffered row before stepping again: an error
                // raised producing the next row must not swallow this one, it
                // surfaces on the following call instead.
                let row = self.current_row.take();
                self.state = State::Executing;
                Ok(row)
            }
            State::Complete => {
                if self.exhaustion_reported {
                    Err(Error::CursorComplete)
                } else {
                    self.exhaustion_reported = true;
                    Ok(None)
                }
            }
        }
    }

    /// Iterator over the remaining rows.
    pub fn rows(&mut self) -> Rows<'_> {
        Rows { cursor: self }
    }

    /// Collect every remaining row.
    pub fn fetch_all(&mut self) -> Result<Vec<Vec<Value>>> {
        let mut out = Vec::new();
        while let Some(row) = self.next_row()? {
            out.push(row);
        }
        Ok(out)
    }

    /// First remaining row, if any; discards the rest of the execution.
    pub fn fetch_optional(&mut self) -> Result<Option<Vec<Value>>> {
        let first = self.next_row()?;
        if first.is_some() {
            self.reset();
        }
        Ok(first)
    }

    /// Number of result columns of the most recently prepared statement.
    /// Valid only while an execution is in flight.
    pub fn column_count(&self) -> Result<usize> {
        self.check_metadata()?;
        Ok(self.columns.len())
    }

    pub fn column_names(&self) -> Result<Vec<String>> {
        self.check_metadata()?;
        Ok(self.columns.iter().map(|(name, _)| name.clone()).collect())
    }

    /// Column names paired with declared types (None for expressions).
    pub fn description(&self) -> Result<&[(String, Option<String>)]> {
        self.check_metadata()?;
        Ok(&self.columns)
    }

    /// Exec trace for this cursor only, overriding the connection's.
    pub fn set_exec_trace(&mut self, trace: Option<crate::params::ExecTraceHandler>) {
        self.exec_trace = trace;
    }

    /// Row trace for this cursor only, overriding the connection's.
    pub fn set_row_trace(&mut self, trace: Option<crate::params::RowTraceHandler>) {
        self.row_trace = trace;
    }

    /// Abandon the current execution, discarding unread rows and unexecuted
    /// statements. Never fails; safe on an already-idle cursor.
    pub fn reset(&mut self) {
        self.abandon();
        self.pending_sql.clear();
        self.full_sql.clear();
        self.bindings = Bindings::None;
        self.trace_params = Params::None;
        self.sets = None;
        self.columns.clear();
        self.current_row = None;
        self.state = State::Idle;
        self.exhaustion_reported = false;
    }

    fn check_restartable(&self) -> Result<()> {
        match self.state {
            State::Idle | State::Complete => Ok(()),
            State::Executing | State::RowsPending => Err(Error::IncompleteExecution),
        }
    }

    fn check_metadata(&self) -> Result<()> {
        match self.state {
            State::Executing | State::RowsPending => Ok(()),
            State::Idle => Err(Error::usage("cursor has not executed a statement")),
            State::Complete => Err(Error::CursorComplete),
        }
    }

    fn begin(&mut self, sql: &str, params: Params, sets: Option<BindingSets>) {
        self.release_active();
        self.pending_sql = sql.to_owned();
        self.full_sql = sql.to_owned();
        self.bindings = Bindings::from_params(&params);
        self.trace_params = params;
        self.sets = sets;
        self.columns.clear();
        self.current_row = None;
        self.state = State::Executing;
        self.exhaustion_reported = false;
    }

    /// Release the active statement, taking the affinity guard first. When
    /// another thread is inside the engine the statement cannot be finalized
    /// here; it is parked on the connection and finalized at the next guarded
    /// entry.
    fn abandon(&mut self) {
        let conn = Arc::clone(&self.conn);
        match conn.guard_only() {
            Ok(guard) => {
                self.release_active();
                drop(guard);
            }
            Err(_) => {
                if let Some(active) = self.active.take() {
                    self.conn.orphans.lock().unwrap().push(active.stmt);
                    self.conn.statement_finished();
                }
            }
        }
    }

    /// Return the active statement to the cache (or just finalize it when the
    /// connection is gone).
    fn release_active(&mut self) {
        if let Some(active) = self.active.take() {
            if !self.conn.is_closed() {
                self.conn.cache.lock().unwrap().checkin(
                    active.cache_key,
                    CachedStatement {
                        stmt: active.stmt,
                        tail_offset: active.tail_offset,
                    },
                );
            }
            self.conn.statement_finished();
        }
    }

    /// Drive execution until a row is buffered or the batch completes.
    ///
    /// Caller holds the connection guard. On error the active statement is
    /// discarded and the cursor lands in `Complete`.
    fn advance(&mut self) -> Result<()> {
        let db = self.conn.db()?;
        loop {
            if self.active.is_none() && !self.prepare_next(db)? {
                self.state = State::Complete;
                return Ok(());
            }
            let rc = {
                let active = self
                    .active
                    .as_ref()
                    .ok_or_else(|| Error::usage("no statement to step"))?;
                active.stmt.step()
            };
            // A callback may have failed without aborting the statement; its
            // error wins over whatever the step reported.
            if let Some(err) = self.conn.take_pending() {
                self.fail();
                return Err(err);
            }
            match rc {
                libsqlite3_sys::SQLITE_ROW => {
                    let row = match self.materialize_row() {
                        Ok(row) => row,
                        Err(err) => {
                            self.fail();
                            return Err(err);
                        }
                    };
                    if let Some(row) = row {
                        self.current_row = Some(row);
                        self.state = State::RowsPending;
                        return Ok(());
                    }
                    // Row suppressed by the row trace; keep stepping.
                }
                libsqlite3_sys::SQLITE_DONE => {
                    self.finish_statement();
                }
                code => {
                    let err = unsafe { Error::from_handle(db, code) };
                    self.fail();
                    return Err(err);
                }
            }
        }
    }

    /// Prepare and bind the next statement of the batch, fetching the next
    /// binding set when the text is exhausted. Returns false when there is
    /// nothing left to run.
    fn prepare_next(&mut self, db: *mut libsqlite3_sys::sqlite3) -> Result<bool> {
        loop {
            if self.pending_sql.trim().is_empty() {
                if let Some(err) = self.check_leftover_bindings() {
                    self.state = State::Complete;
                    return Err(err);
                }
                let Some(sets) = self.sets.as_mut() else {
                    return Ok(false);
                };
                match sets.next() {
                    None => {
                        self.sets = None;
                        return Ok(false);
                    }
                    Some(Err(err)) => {
                        self.state = State::Complete;
                        self.sets = None;
                        return Err(err);
                    }
                    Some(Ok(params)) => {
                        self.pending_sql = self.full_sql.clone();
                        self.bindings = Bindings::from_params(&params);
                        self.trace_params = params;
                        continue;
                    }
                }
            }

            let cache_key = self.pending_sql.clone();
            let cached = self.conn.cache.lock().unwrap().checkout(&cache_key);
            let (stmt, tail_offset) = match cached {
                Some(entry) => (Some(entry.stmt), entry.tail_offset),
                None => match unsafe { RawStatement::prepare(db, &cache_key) } {
                    Ok(prepared) => prepared,
                    Err(err) => {
                        self.state = State::Complete;
                        // An authorizer may have failed during preparation;
                        // its error outranks the engine's code.
                        return Err(self.conn.take_pending().unwrap_or(err));
                    }
                },
            };
            let Some(stmt) = stmt else {
                // Whitespace or comments only.
                self.pending_sql = cache_key[tail_offset..].to_owned();
                continue;
            };

            let tail_is_empty =
                cache_key[tail_offset..].trim().is_empty() && self.sets.is_none();
            if let Err(err) = self.bind_statement(db, &stmt, tail_is_empty) {
                self.state = State::Complete;
                self.conn.cache.lock().unwrap().checkin(
                    cache_key,
                    CachedStatement { stmt, tail_offset },
                );
                return Err(err);
            }

            self.columns = capture_columns(&stmt);

            let fragment = cache_key[..tail_offset].to_owned();
            match self.run_exec_trace(&fragment) {
                Ok(true) => {}
                Ok(false) => {
                    self.state = State::Complete;
                    self.conn.cache.lock().unwrap().checkin(
                        cache_key,
                        CachedStatement { stmt, tail_offset },
                    );
                    return Err(Error::ExecTraceAbort);
                }
                Err(err) => {
                    self.state = State::Complete;
                    self.conn.cache.lock().unwrap().checkin(
                        cache_key,
                        CachedStatement { stmt, tail_offset },
                    );
                    return Err(err);
                }
            }

            tracing::trace!(sql = %fragment.trim(), "executing statement");
            self.conn.statement_begun();
            self.active = Some(ActiveStatement {
                stmt,
                cache_key,
                tail_offset,
            });
            return Ok(true);
        }
    }

    /// Bind the current binding set to `stmt`. Mismatches are reported before
    /// the statement runs.
    fn bind_statement(
        &mut self,
        db: *mut libsqlite3_sys::sqlite3,
        stmt: &RawStatement,
        last_statement: bool,
    ) -> Result<()> {
        let count = stmt.bind_parameter_count();
        match &mut self.bindings {
            Bindings::None => {
                if count > 0 {
                    return Err(Error::BindingsMismatch {
                        expected: count,
                        supplied: 0,
                    });
                }
            }
            Bindings::Positional { values, consumed } => {
                let remaining = values.len() - *consumed;
                if remaining < count {
                    return Err(Error::BindingsMismatch {
                        expected: count,
                        supplied: remaining,
                    });
                }
                if last_statement && remaining > count {
                    return Err(Error::BindingsMismatch {
                        expected: count,
                        supplied: remaining,
                    });
                }
                for index in 1..=count {
                    stmt.bind_value(db, index, &values[*consumed])?;
                    *consumed += 1;
                }
            }
            Bindings::Named(map) => {
                for index in 1..=count {
                    let Some(name) = stmt.bind_parameter_name(index) else {
                        return Err(Error::BindingsType);
                    };
                    let bare = name.trim_start_matches([':', '@', '$']);
                    match map.get(bare) {
                        Some(value) => stmt.bind_value(db, index, value)?,
                        // A name missing from the map binds NULL.
                        None => stmt.bind_value(db, index, &Value::Null)?,
                    }
                }
            }
        }
        Ok(())
    }

    fn check_leftover_bindings(&self) -> Option<Error> {
        let leftover = self.bindings.leftover();
        if leftover > 0 {
            if let Bindings::Positional { values, consumed } = &self.bindings {
                return Some(Error::BindingsMismatch {
                    expected: *consumed,
                    supplied: values.len(),
                });
            }
        }
        None
    }

    /// Read the current row out of the active statement and run it through
    /// the row trace. `None` means the trace suppressed it.
    fn materialize_row(&mut self) -> Result<Option<Vec<Value>>> {
        let (row, refresh) = {
            let active = self
                .active
                .as_ref()
                .ok_or_else(|| Error::usage("no statement to read"))?;
            // A schema change re-prepares the statement at step time and can
            // change its shape; trust the statement, not the snapshot.
            let count = active.stmt.column_count();
            let mut row = Vec::with_capacity(count);
            for index in 0..count {
                row.push(active.stmt.column_value(index)?);
            }
            (row, count != self.columns.len())
        };
        if refresh {
            if let Some(active) = &self.active {
                self.columns = capture_columns(&active.stmt);
            }
        }
        self.run_row_trace(row)
    }

    /// Current statement finished; return it to the cache and move the text
    /// window past it.
    fn finish_statement(&mut self) {
        if let Some(active) = &self.active {
            self.pending_sql = active.cache_key[active.tail_offset..].to_owned();
        }
        self.release_active();
    }

    fn fail(&mut self) {
        self.release_active();
        self.state = State::Complete;
    }

    fn run_exec_trace(&mut self, sql: &str) -> Result<bool> {
        if let Some(handler) = self.exec_trace.as_mut() {
            return handler(sql, &self.trace_params);
        }
        let taken = self.conn.traces.lock().unwrap().exec.take();
        let Some(mut handler) = taken else {
            return Ok(true);
        };
        let result = handler(sql, &self.trace_params);
        let mut slot = self.conn.traces.lock().unwrap();
        if slot.exec.is_none() {
            slot.exec = Some(handler);
        }
        result
    }

    fn run_row_trace(&mut self, row: Vec<Value>) -> Result<Option<Vec<Value>>> {
        if let Some(handler) = self.row_trace.as_mut() {
            return handler(row);
        }
        let taken = self.conn.traces.lock().unwrap().row.take();
        let Some(mut handler) = taken else {
            return Ok(Some(row));
        };
        let result = handler(row);
        let mut slot = self.conn.traces.lock().unwrap();
        if slot.row.is_none() {
            slot.row = Some(handler);
        }
        result
    }
}

fn capture_columns(stmt: &RawStatement) -> Vec<(String, Option<String>)> {
    (0..stmt.column_count())
        .map(|i| (stmt.column_name(i).unwrap_or_default(), stmt.column_decltype(i)))
        .collect()
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.abandon();
    }
}

/// Borrowing row iterator, created by [`Cursor::rows`].
pub struct Rows<'a> {
    cursor: &'a mut Cursor,
}

impl Iterator for Rows<'_> {
    type Item = Result<Vec<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.cursor.next_row() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}
