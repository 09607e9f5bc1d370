use libsqlite3_sys as ffi;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::bridge::{self, AuthAction, Authorization, HookSlots, UpdateAction};
use crate::cache::StatementCache;
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::guard::{AffinityGuard, AffinityTag};
use crate::params::{ExecTraceHandler, RowTraceHandler};
use crate::registry;
use crate::statement::RawStatement;
use crate::value::Value;
use crate::vtab::{self, VTabModule};

pub(crate) const DEFAULT_STATEMENT_CACHE_SIZE: usize = 100;

/// Options for opening a database.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    flags: c_int,
    vfs: Option<String>,
    statement_cache_size: usize,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            flags: ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE,
            vfs: None,
            statement_cache_size: DEFAULT_STATEMENT_CACHE_SIZE,
        }
    }
}

impl OpenOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw engine open flags, replacing the read-write/create default.
    #[must_use]
    pub const fn flags(mut self, flags: c_int) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub const fn read_only(mut self) -> Self {
        self.flags = ffi::SQLITE_OPEN_READONLY;
        self
    }

    #[must_use]
    pub fn vfs(mut self, name: impl Into<String>) -> Self {
        self.vfs = Some(name.into());
        self
    }

    /// Capacity of the per-connection statement cache. Zero disables caching.
    #[must_use]
    pub const fn statement_cache_size(mut self, size: usize) -> Self {
        self.statement_cache_size = size;
        self
    }
}

/// Engine limit categories settable per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Length,
    SqlLength,
    Columns,
    ExprDepth,
    CompoundSelect,
    VdbeOp,
    FunctionArg,
    Attached,
    LikePatternLength,
    VariableNumber,
    TriggerDepth,
}

impl Limit {
    const fn code(self) -> c_int {
        match self {
            Self::Length => ffi::SQLITE_LIMIT_LENGTH,
            Self::SqlLength => ffi::SQLITE_LIMIT_SQL_LENGTH,
            Self::Columns => ffi::SQLITE_LIMIT_COLUMN,
            Self::ExprDepth => ffi::SQLITE_LIMIT_EXPR_DEPTH,
            Self::CompoundSelect => ffi::SQLITE_LIMIT_COMPOUND_SELECT,
            Self::VdbeOp => ffi::SQLITE_LIMIT_VDBE_OP,
            Self::FunctionArg => ffi::SQLITE_LIMIT_FUNCTION_ARG,
            Self::Attached => ffi::SQLITE_LIMIT_ATTACHED,
            Self::LikePatternLength => ffi::SQLITE_LIMIT_LIKE_PATTERN_LENGTH,
            Self::VariableNumber => ffi::SQLITE_LIMIT_VARIABLE_NUMBER,
            Self::TriggerDepth => ffi::SQLITE_LIMIT_TRIGGER_DEPTH,
        }
    }
}

/// Connection-internal state shared with cursors and blob channels.
///
/// Cursors and blobs hold the `Arc`; registered callbacks hold only a `Weak`
/// back-reference so a connection that captured itself inside a callable does
/// not keep itself alive.
pub(crate) struct ConnInner {
    db: *mut ffi::sqlite3,
    closed: AtomicBool,
    tag: AffinityTag,
    /// First host error captured inside a native callback frame; drained when
    /// control returns to the host boundary.
    pending: Mutex<Option<Error>>,
    /// Error from a rollback hook, surfaced on the next call instead (the
    /// engine forbids reporting errors from that hook).
    deferred: Mutex<Option<Error>>,
    pub(crate) cache: Mutex<StatementCache>,
    pub(crate) hooks: Mutex<HookSlots>,
    pub(crate) traces: Mutex<TraceSlots>,
    /// Statements abandoned while another thread held the guard; finalizing
    /// needs the guard, so they wait here until the next guarded entry.
    pub(crate) orphans: Mutex<Vec<RawStatement>>,
    active_statements: AtomicUsize,
    load_extension_enabled: AtomicBool,
}

unsafe impl Send for ConnInner {}
unsafe impl Sync for ConnInner {}

#[derive(Default)]
pub(crate) struct TraceSlots {
    pub(crate) exec: Option<ExecTraceHandler>,
    pub(crate) row: Option<RowTraceHandler>,
}

impl ConnInner {
    /// Affinity guard without the closed/deferred checks, for teardown paths
    /// that must run even when the connection is in a failed state.
    pub(crate) fn guard_only(&self) -> Result<AffinityGuard<'_>> {
        self.tag.enter()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Raw handle, valid while the connection is open.
    pub(crate) fn db(&self) -> Result<*mut ffi::sqlite3> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::usage("connection is closed"))
        } else {
            Ok(self.db)
        }
    }

    /// Enter a native operation on this connection: take the thread-affinity
    /// guard, reject use after close, and surface any deferred error.
    pub(crate) fn enter(&self) -> Result<AffinityGuard<'_>> {
        let guard = self.tag.enter()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::usage("connection is closed"));
        }
        self.orphans.lock().unwrap().clear();
        if let Some(err) = self.take_deferred() {
            return Err(err);
        }
        Ok(guard)
    }

    /// Record a host error raised inside a native callback frame. Only the
    /// first error is kept until the host boundary drains it.
    pub(crate) fn set_pending(&self, err: Error) {
        let mut slot = self.pending.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        } else {
            tracing::debug!(dropped = %err, "callback error dropped, another is already pending");
        }
    }

    pub(crate) fn take_pending(&self) -> Option<Error> {
        self.pending.lock().unwrap().take()
    }

    pub(crate) fn set_deferred(&self, err: Error) {
        let mut slot = self.deferred.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub(crate) fn take_deferred(&self) -> Option<Error> {
        self.deferred.lock().unwrap().take()
    }

    pub(crate) fn statement_begun(&self) {
        self.active_statements.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn statement_finished(&self) {
        self.active_statements.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn has_active_statements(&self) -> bool {
        self.active_statements.load(Ordering::Acquire) > 0
    }

    /// Registration changes to functions, collations and modules are refused
    /// while a statement is mid-execution.
    pub(crate) fn check_no_active_statements(&self) -> Result<()> {
        if self.has_active_statements() {
            Err(Error::Busy(
                "cannot change registrations while a statement is executing".into(),
            ))
        } else {
            Ok(())
        }
    }

    fn do_close(&self, force: bool) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        if !force && self.has_active_statements() {
            return Err(Error::IncompleteExecution);
        }
        self.cache.lock().unwrap().clear();
        self.orphans.lock().unwrap().clear();
        unsafe {
            // Hooks must be unregistered before close: the engine rolls back
            // any open transaction during close and would otherwise call into
            // host closures that are about to be dropped.
            ffi::sqlite3_busy_handler(self.db, None, std::ptr::null_mut());
            ffi::sqlite3_progress_handler(self.db, 0, None, std::ptr::null_mut());
            ffi::sqlite3_commit_hook(self.db, None, std::ptr::null_mut());
            ffi::sqlite3_rollback_hook(self.db, None, std::ptr::null_mut());
            ffi::sqlite3_update_hook(self.db, None, std::ptr::null_mut());
            ffi::sqlite3_set_authorizer(self.db, None, std::ptr::null_mut());
        }
        let rc = unsafe { ffi::sqlite3_close_v2(self.db) };
        self.closed.store(true, Ordering::Release);
        *self.hooks.lock().unwrap() = HookSlots::default();
        *self.traces.lock().unwrap() = TraceSlots::default();
        if rc == ffi::SQLITE_OK {
            self.take_deferred().map_or(Ok(()), Err)
        } else {
            Err(Error::from_code(rc))
        }
    }
}

impl Drop for ConnInner {
    fn drop(&mut self) {
        let _ = self.do_close(true);
    }
}

/// One open database.
///
/// A connection owns its statement cache and callback registrations; it may
/// move between threads, but only one thread at a time may be inside the
/// engine on its behalf. [`Connection::interrupt`] is the single exception.
pub struct Connection {
    pub(crate) inner: Arc<ConnInner>,
}

impl Connection {
    /// Open (creating if absent) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, OpenOptions::default())
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::open_with(":memory:", OpenOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: OpenOptions) -> Result<Self> {
        let path = path.as_ref();
        let path = path
            .to_str()
            .ok_or_else(|| Error::Decode("database path is not valid UTF-8".into()))?;
        let path = CString::new(path)
            .map_err(|_| Error::Decode("database path contains a NUL byte".into()))?;
        let vfs = match &options.vfs {
            Some(name) => Some(
                CString::new(name.as_str())
                    .map_err(|_| Error::Decode("vfs name contains a NUL byte".into()))?,
            ),
            None => None,
        };
        let vfs_ptr = vfs.as_ref().map_or(std::ptr::null(), |name| name.as_ptr());

        let mut db: *mut ffi::sqlite3 = std::ptr::null_mut();
        let rc = unsafe { ffi::sqlite3_open_v2(path.as_ptr(), &mut db, options.flags, vfs_ptr) };
        if rc != ffi::SQLITE_OK {
            let err = if db.is_null() {
                Error::from_code(rc)
            } else {
                let err = unsafe { Error::from_handle(db, rc) };
                unsafe {
                    ffi::sqlite3_close_v2(db);
                }
                err
            };
            return Err(err);
        }
        unsafe {
            ffi::sqlite3_extended_result_codes(db, 1);
        }

        let connection = Self {
            inner: Arc::new(ConnInner {
                db,
                closed: AtomicBool::new(false),
                tag: AffinityTag::new(),
                pending: Mutex::new(None),
                deferred: Mutex::new(None),
                cache: Mutex::new(StatementCache::new(options.statement_cache_size)),
                hooks: Mutex::new(HookSlots::default()),
                traces: Mutex::new(TraceSlots::default()),
                orphans: Mutex::new(Vec::new()),
                active_statements: AtomicUsize::new(0),
                load_extension_enabled: AtomicBool::new(false),
            }),
        };
        tracing::debug!(cache = options.statement_cache_size, "opened database");

        if let Err(err) = registry::run_connection_hooks(&connection) {
            let _ = connection.inner.do_close(true);
            return Err(err);
        }
        Ok(connection)
    }

    /// Obtain a cursor for executing SQL on this connection.
    #[must_use]
    pub fn cursor(&self) -> Cursor {
        Cursor::new(Arc::clone(&self.inner))
    }

    /// Close the connection. Fails with an incomplete-execution condition if
    /// a cursor still has unread rows; idempotent once closed.
    pub fn close(&self) -> Result<()> {
        let _guard = self.inner.tag.enter()?;
        self.inner.do_close(false)
    }

    /// Close regardless of unfinished cursors; those cursors error on reuse.
    pub fn close_force(&self) -> Result<()> {
        let _guard = self.inner.tag.enter()?;
        self.inner.do_close(true)
    }

    /// Abort the statement currently executing on this connection.
    ///
    /// Unlike every other method this may be called from any thread, including
    /// from inside a callback running on this very connection.
    pub fn interrupt(&self) {
        if !self.inner.closed.load(Ordering::Acquire) {
            unsafe {
                ffi::sqlite3_interrupt(self.inner.db);
            }
        }
    }

    /// Rows changed by the most recent statement.
    pub fn changes(&self) -> Result<i64> {
        let _guard = self.inner.enter()?;
        let db = self.inner.db()?;
        Ok(i64::from(unsafe { ffi::sqlite3_changes(db) }))
    }

    /// Total rows changed since the connection was opened.
    pub fn total_changes(&self) -> Result<i64> {
        let _guard = self.inner.enter()?;
        let db = self.inner.db()?;
        Ok(i64::from(unsafe { ffi::sqlite3_total_changes(db) }))
    }

    pub fn last_insert_rowid(&self) -> Result<i64> {
        let _guard = self.inner.enter()?;
        let db = self.inner.db()?;
        Ok(unsafe { ffi::sqlite3_last_insert_rowid(db) })
    }

    /// Whether the connection is in autocommit mode (no open transaction).
    pub fn is_autocommit(&self) -> Result<bool> {
        let _guard = self.inner.enter()?;
        let db = self.inner.db()?;
        Ok(unsafe { ffi::sqlite3_get_autocommit(db) } != 0)
    }

    /// Number of statements currently at rest in the cache.
    pub fn cached_statement_count(&self) -> usize {
        self.inner.cache.lock().unwrap().len()
    }

    /// Set an engine limit; returns the prior value.
    pub fn limit(&self, limit: Limit, new_value: i32) -> Result<i32> {
        let _guard = self.inner.enter()?;
        let db = self.inner.db()?;
        Ok(unsafe { ffi::sqlite3_limit(db, limit.code(), new_value) })
    }

    /// Gate for the extension loader; off by default.
    pub fn enable_load_extension(&self, enable: bool) -> Result<()> {
        let _guard = self.inner.enter()?;
        let db = self.inner.db()?;
        let rc = unsafe { ffi::sqlite3_enable_load_extension(db, c_int::from(enable)) };
        if rc != ffi::SQLITE_OK {
            return Err(Error::ExtensionLoading(
                "engine refused to toggle extension loading".into(),
            ));
        }
        self.inner
            .load_extension_enabled
            .store(enable, Ordering::Release);
        Ok(())
    }

    /// Load a loadable extension; honours the enable gate.
    pub fn load_extension(&self, path: &str, entry_point: Option<&str>) -> Result<()> {
        let _guard = self.inner.enter()?;
        let db = self.inner.db()?;
        if !self.inner.load_extension_enabled.load(Ordering::Acquire) {
            return Err(Error::ExtensionLoading(
                "extension loading is not enabled on this connection".into(),
            ));
        }
        let path = CString::new(path)
            .map_err(|_| Error::Decode("extension path contains a NUL byte".into()))?;
        let entry = match entry_point {
            Some(name) => Some(
                CString::new(name)
                    .map_err(|_| Error::Decode("entry point contains a NUL byte".into()))?,
            ),
            None => None,
        };
        let mut errmsg: *mut c_char = std::ptr::null_mut();
        let rc = unsafe {
            ffi::sqlite3_load_extension(
                db,
                path.as_ptr(),
                entry.as_ref().map_or(std::ptr::null(), |e| e.as_ptr()),
                &mut errmsg,
            )
        };
        if rc == ffi::SQLITE_OK {
            Ok(())
        } else {
            let message = if errmsg.is_null() {
                "extension loading failed".to_string()
            } else {
                let message = unsafe { CStr::from_ptr(errmsg) }
                    .to_string_lossy()
                    .into_owned();
                unsafe {
                    ffi::sqlite3_free(errmsg.cast());
                }
                message
            };
            Err(Error::ExtensionLoading(message))
        }
    }

    /// Register a scalar SQL function. `n_args` of `None` accepts any arity.
    /// Replaces an existing registration of the same name and arity.
    pub fn create_scalar_function<F>(
        &self,
        name: &str,
        n_args: Option<u8>,
        deterministic: bool,
        func: F,
    ) -> Result<()>
    where
        F: FnMut(&[Value]) -> Result<Value> + Send + 'static,
    {
        let _guard = self.inner.enter()?;
        bridge::create_scalar_function(&self.inner, name, n_args, deterministic, func)
    }

    /// Remove a scalar or aggregate function registration.
    pub fn remove_function(&self, name: &str, n_args: Option<u8>) -> Result<()> {
        let _guard = self.inner.enter()?;
        bridge::remove_function(&self.inner, name, n_args)
    }

    /// Register an aggregate SQL function built from an [`Aggregate`]
    /// implementation (state initializer, step, final).
    ///
    /// [`Aggregate`]: crate::bridge::Aggregate
    pub fn create_aggregate_function<A>(
        &self,
        name: &str,
        n_args: Option<u8>,
        aggregate: A,
    ) -> Result<()>
    where
        A: crate::bridge::Aggregate,
    {
        let _guard = self.inner.enter()?;
        bridge::create_aggregate_function(&self.inner, name, n_args, aggregate)
    }

    /// Register a collation. The comparison receives the two text values.
    pub fn create_collation<F>(&self, name: &str, compare: F) -> Result<()>
    where
        F: FnMut(&str, &str) -> std::cmp::Ordering + Send + 'static,
    {
        let _guard = self.inner.enter()?;
        bridge::create_collation(&self.inner, name, compare)
    }

    /// Install or clear the authorizer invoked during statement preparation.
    pub fn set_authorizer<F>(&self, authorizer: Option<F>) -> Result<()>
    where
        F: FnMut(&AuthAction<'_>) -> Result<Authorization> + Send + 'static,
    {
        let _guard = self.inner.enter()?;
        bridge::set_authorizer(&self.inner, authorizer)
    }

    /// Install or clear the busy handler. The handler receives the number of
    /// prior invocations for the contested lock; returning `Ok(false)` stops
    /// retrying and surfaces the busy error.
    pub fn set_busy_handler<F>(&self, handler: Option<F>) -> Result<()>
    where
        F: FnMut(i32) -> Result<bool> + Send + 'static,
    {
        let _guard = self.inner.enter()?;
        bridge::set_busy_handler(&self.inner, handler)
    }

    /// Keep retrying a contested lock for up to `ms` milliseconds. Replaces
    /// any installed busy handler.
    pub fn set_busy_timeout(&self, ms: i32) -> Result<()> {
        let _guard = self.inner.enter()?;
        let db = self.inner.db()?;
        let rc = unsafe { ffi::sqlite3_busy_timeout(db, ms) };
        self.inner.hooks.lock().unwrap().busy = None;
        if rc == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(unsafe { Error::from_handle(db, rc) })
        }
    }

    /// Install or clear a progress handler invoked about every `steps` virtual
    /// machine operations; returning `Ok(true)` interrupts the operation.
    pub fn set_progress_handler<F>(&self, steps: i32, handler: Option<F>) -> Result<()>
    where
        F: FnMut() -> Result<bool> + Send + 'static,
    {
        let _guard = self.inner.enter()?;
        bridge::set_progress_handler(&self.inner, steps, handler)
    }

    /// Install or clear the commit hook; returning `Ok(true)` converts the
    /// commit into a rollback.
    pub fn set_commit_hook<F>(&self, hook: Option<F>) -> Result<()>
    where
        F: FnMut() -> Result<bool> + Send + 'static,
    {
        let _guard = self.inner.enter()?;
        bridge::set_commit_hook(&self.inner, hook)
    }

    /// Install or clear the rollback hook. An error raised here is surfaced
    /// from the next call on the connection.
    pub fn set_rollback_hook<F>(&self, hook: Option<F>) -> Result<()>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let _guard = self.inner.enter()?;
        bridge::set_rollback_hook(&self.inner, hook)
    }

    /// Install or clear the update hook, invoked after every row insert,
    /// update or delete.
    pub fn set_update_hook<F>(&self, hook: Option<F>) -> Result<()>
    where
        F: FnMut(UpdateAction, &str, &str, i64) -> Result<()> + Send + 'static,
    {
        let _guard = self.inner.enter()?;
        bridge::set_update_hook(&self.inner, hook)
    }

    /// Connection-wide exec trace, used by cursors without their own.
    pub fn set_exec_trace(&self, trace: Option<ExecTraceHandler>) -> Result<()> {
        let _guard = self.inner.enter()?;
        self.inner.traces.lock().unwrap().exec = trace;
        Ok(())
    }

    /// Connection-wide row trace, used by cursors without their own.
    pub fn set_row_trace(&self, trace: Option<RowTraceHandler>) -> Result<()> {
        let _guard = self.inner.enter()?;
        self.inner.traces.lock().unwrap().row = trace;
        Ok(())
    }

    /// Register a virtual-table module under `name`.
    pub fn register_module<M>(&self, name: &str, module: M) -> Result<()>
    where
        M: VTabModule,
    {
        let _guard = self.inner.enter()?;
        vtab::register_module(&self.inner, name, module)
    }

    /// Open a blob channel over one cell.
    pub fn blob_open(
        &self,
        database: &str,
        table: &str,
        column: &str,
        rowid: i64,
        writable: bool,
    ) -> Result<crate::blob::BlobChannel> {
        let _guard = self.inner.enter()?;
        crate::blob::BlobChannel::open(&self.inner, database, table, column, rowid, writable)
    }
}

/// True when `sql` forms one or more complete SQL statements.
#[must_use]
pub fn is_complete(sql: &str) -> bool {
    let Ok(sql) = CString::new(sql) else {
        return false;
    };
    unsafe { ffi::sqlite3_complete(sql.as_ptr()) != 0 }
}
