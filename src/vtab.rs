//! Virtual-table protocol adapter.
//!
//! Host types implement [`VTabModule`], [`VTab`] and [`VTabCursor`]; this
//! module owns the `#[repr(C)]` wrappers the engine sees and the trampolines
//! that translate between the two worlds. Errors raised by host code are
//! copied into the table's engine-owned message slot and into the
//! connection's pending-error slot, so the surfaced error keeps its type.

use libsqlite3_sys as ffi;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use crate::bridge::{destroy_boxed, set_pending, set_result, values_from_argv};
use crate::connection::ConnInner;
use crate::error::{Error, Result};
use crate::value::Value;

/// Factory for tables of one module. `create` backs `CREATE VIRTUAL TABLE`;
/// `connect` backs re-attachment to existing shadow state and defaults to
/// `create` for modules without persistent state.
///
/// `args` are the raw declaration arguments: module name, database name,
/// table name, then everything between the parentheses.
pub trait VTabModule: Send + 'static {
    type Table: VTab;

    /// Returns the `CREATE TABLE` shape declaring the columns, and the table.
    fn create(&self, args: &[String]) -> Result<(String, Self::Table)>;

    fn connect(&self, args: &[String]) -> Result<(String, Self::Table)> {
        self.create(args)
    }
}

/// One virtual table instance.
pub trait VTab: Send + 'static {
    type Cursor: VTabCursor;

    /// Choose a query plan for the constraints the planner offers.
    fn best_index(&mut self, info: &mut IndexInfo) -> Result<()>;

    fn open(&mut self) -> Result<Self::Cursor>;

    /// Apply a row change. For an insert with no explicit rowid, return the
    /// rowid assigned. The default refuses, making the table read-only.
    fn update(&mut self, _change: Change) -> Result<Option<i64>> {
        Err(Error::usage("virtual table is read-only"))
    }

    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        Ok(())
    }

    fn rename(&mut self, _new_name: &str) -> Result<()> {
        Ok(())
    }

    /// Release the in-memory instance (connection close, schema reload),
    /// leaving persistent state alone.
    fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }

    /// Tear down persistent state when the table is dropped.
    fn destroy(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Scan state over one virtual table.
pub trait VTabCursor: Send + 'static {
    /// Start (or restart) a scan using the plan chosen by `best_index`.
    fn filter(&mut self, index_num: i32, index_str: Option<&str>, args: &[Value]) -> Result<()>;

    fn eof(&self) -> bool;

    fn column(&self, index: usize) -> Result<Value>;

    fn rowid(&self) -> Result<i64>;

    fn next(&mut self) -> Result<()>;
}

/// A row change submitted to [`VTab::update`].
#[derive(Debug)]
pub enum Change {
    Delete {
        rowid: i64,
    },
    Insert {
        /// None when the engine wants the table to assign the rowid.
        rowid: Option<i64>,
        values: Vec<Value>,
    },
    Update {
        rowid: i64,
        /// Set when the statement also changes the rowid.
        new_rowid: Option<i64>,
        values: Vec<Value>,
    },
}

/// Comparison operator of one planner constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintOp {
    Eq,
    Gt,
    Le,
    Lt,
    Ge,
    Match,
    Like,
    Glob,
    Regexp,
    Other(u8),
}

impl ConstraintOp {
    fn from_raw(op: u8) -> Self {
        match i32::from(op) {
            ffi::SQLITE_INDEX_CONSTRAINT_EQ => Self::Eq,
            ffi::SQLITE_INDEX_CONSTRAINT_GT => Self::Gt,
            ffi::SQLITE_INDEX_CONSTRAINT_LE => Self::Le,
            ffi::SQLITE_INDEX_CONSTRAINT_LT => Self::Lt,
            ffi::SQLITE_INDEX_CONSTRAINT_GE => Self::Ge,
            ffi::SQLITE_INDEX_CONSTRAINT_MATCH => Self::Match,
            ffi::SQLITE_INDEX_CONSTRAINT_LIKE => Self::Like,
            ffi::SQLITE_INDEX_CONSTRAINT_GLOB => Self::Glob,
            ffi::SQLITE_INDEX_CONSTRAINT_REGEXP => Self::Regexp,
            _ => Self::Other(op),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Constraint {
    pub column: i32,
    pub op: ConstraintOp,
    pub usable: bool,
}

/// Safe view over the engine's query-plan negotiation block.
pub struct IndexInfo {
    raw: *mut ffi::sqlite3_index_info,
}

impl IndexInfo {
    pub fn constraint_count(&self) -> usize {
        usize::try_from(unsafe { (*self.raw).nConstraint }).unwrap_or(0)
    }

    pub fn constraint(&self, index: usize) -> Constraint {
        assert!(index < self.constraint_count(), "constraint index out of range");
        let raw = unsafe { &*(*self.raw).aConstraint.add(index) };
        Constraint {
            column: raw.iColumn,
            op: ConstraintOp::from_raw(raw.op),
            usable: raw.usable != 0,
        }
    }

    pub fn order_by_count(&self) -> usize {
        usize::try_from(unsafe { (*self.raw).nOrderBy }).unwrap_or(0)
    }

    /// Column and descending flag of one ORDER BY term.
    pub fn order_by(&self, index: usize) -> (i32, bool) {
        assert!(index < self.order_by_count(), "order-by index out of range");
        let raw = unsafe { &*(*self.raw).aOrderBy.add(index) };
        (raw.iColumn, raw.desc != 0)
    }

    /// Request constraint `index`'s value as filter argument `argv_index`
    /// (1-based); `omit` promises the table enforces it fully.
    pub fn set_constraint_usage(&mut self, index: usize, argv_index: Option<i32>, omit: bool) {
        assert!(index < self.constraint_count(), "constraint index out of range");
        let usage = unsafe { &mut *(*self.raw).aConstraintUsage.add(index) };
        usage.argvIndex = argv_index.unwrap_or(0);
        usage.omit = u8::from(omit);
    }

    pub fn set_index_num(&mut self, index_num: i32) {
        unsafe {
            (*self.raw).idxNum = index_num;
        }
    }

    /// Plan string passed through to `filter`.
    pub fn set_index_str(&mut self, index_str: &str) {
        let copy = engine_string(index_str);
        unsafe {
            if (*self.raw).needToFreeIdxStr != 0 {
                ffi::sqlite3_free((*self.raw).idxStr.cast());
            }
            (*self.raw).idxStr = copy;
            (*self.raw).needToFreeIdxStr = c_int::from(!copy.is_null());
        }
    }

    pub fn set_order_by_consumed(&mut self, consumed: bool) {
        unsafe {
            (*self.raw).orderByConsumed = c_int::from(consumed);
        }
    }

    pub fn set_estimated_cost(&mut self, cost: f64) {
        unsafe {
            (*self.raw).estimatedCost = cost;
        }
    }

    pub fn set_estimated_rows(&mut self, rows: i64) {
        unsafe {
            (*self.raw).estimatedRows = rows;
        }
    }
}

// ---------------------------------------------------------------------------
// Engine-facing wrappers
// ---------------------------------------------------------------------------

struct ModuleCtx<M> {
    conn: Weak<ConnInner>,
    module: M,
}

#[repr(C)]
struct VTabWrapper<T> {
    /// Must stay first: the engine addresses this prefix.
    base: ffi::sqlite3_vtab,
    conn: Weak<ConnInner>,
    table: T,
}

#[repr(C)]
struct CursorWrapper<T: VTab> {
    /// Must stay first.
    base: ffi::sqlite3_vtab_cursor,
    cursor: T::Cursor,
}

/// Copy `s` into engine-owned memory (the engine frees it).
fn engine_string(s: &str) -> *mut c_char {
    let Ok(c) = CString::new(s) else {
        return std::ptr::null_mut();
    };
    unsafe { ffi::sqlite3_mprintf(c"%s".as_ptr(), c.as_ptr()) }
}

/// Report a host failure through a table: engine message slot, pending slot,
/// and the error's own result code.
unsafe fn table_error<T>(vtab: *mut ffi::sqlite3_vtab, err: Error) -> c_int
where
    T: VTab,
{
    let wrapper = vtab.cast::<VTabWrapper<T>>();
    let code = err.primary_code();
    unsafe {
        if !(*vtab).zErrMsg.is_null() {
            ffi::sqlite3_free((*vtab).zErrMsg.cast());
        }
        (*vtab).zErrMsg = engine_string(&err.to_string());
        set_pending(&(*wrapper).conn, err);
    }
    code
}

unsafe fn cursor_table_error<T>(cursor: *mut ffi::sqlite3_vtab_cursor, err: Error) -> c_int
where
    T: VTab,
{
    unsafe { table_error::<T>((*cursor).pVtab, err) }
}

fn panic_error(what: &str) -> Error {
    Error::usage(format!("panic in virtual table {what}"))
}

unsafe extern "C" fn x_create<M: VTabModule>(
    db: *mut ffi::sqlite3,
    aux: *mut c_void,
    argc: c_int,
    argv: *const *const c_char,
    pp_vtab: *mut *mut ffi::sqlite3_vtab,
    err_out: *mut *mut c_char,
) -> c_int {
    unsafe { instantiate::<M>(db, aux, argc, argv, pp_vtab, err_out, false) }
}

unsafe extern "C" fn x_connect<M: VTabModule>(
    db: *mut ffi::sqlite3,
    aux: *mut c_void,
    argc: c_int,
    argv: *const *const c_char,
    pp_vtab: *mut *mut ffi::sqlite3_vtab,
    err_out: *mut *mut c_char,
) -> c_int {
    unsafe { instantiate::<M>(db, aux, argc, argv, pp_vtab, err_out, true) }
}

unsafe fn instantiate<M: VTabModule>(
    db: *mut ffi::sqlite3,
    aux: *mut c_void,
    argc: c_int,
    argv: *const *const c_char,
    pp_vtab: *mut *mut ffi::sqlite3_vtab,
    err_out: *mut *mut c_char,
    reconnect: bool,
) -> c_int {
    let ctx = aux.cast::<ModuleCtx<M>>();
    let conn = unsafe { &(*ctx).conn };
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let mut args = Vec::with_capacity(usize::try_from(argc).unwrap_or(0));
        for i in 0..usize::try_from(argc).unwrap_or(0) {
            let arg = unsafe { *argv.add(i) };
            if arg.is_null() {
                args.push(String::new());
            } else {
                let arg = unsafe { CStr::from_ptr(arg) }
                    .to_str()
                    .map_err(|e| Error::Decode(format!("table argument is not UTF-8: {e}")))?;
                args.push(arg.to_owned());
            }
        }
        let (schema, table) = if reconnect {
            unsafe { (*ctx).module.connect(&args) }?
        } else {
            unsafe { (*ctx).module.create(&args) }?
        };
        let c_schema = CString::new(schema)
            .map_err(|_| Error::usage("table declaration contains a NUL byte"))?;
        let rc = unsafe { ffi::sqlite3_declare_vtab(db, c_schema.as_ptr()) };
        if rc != ffi::SQLITE_OK {
            return Err(unsafe { Error::from_handle(db, rc) });
        }
        Ok(table)
    }));
    let result = match outcome {
        Ok(result) => result,
        Err(_) => Err(panic_error("create")),
    };
    match result {
        Ok(table) => {
            let wrapper = Box::new(VTabWrapper {
                base: unsafe { std::mem::zeroed::<ffi::sqlite3_vtab>() },
                conn: conn.clone(),
                table,
            });
            unsafe {
                *pp_vtab = Box::into_raw(wrapper).cast();
            }
            ffi::SQLITE_OK
        }
        Err(err) => {
            let code = err.primary_code();
            unsafe {
                *err_out = engine_string(&err.to_string());
            }
            set_pending(conn, err);
            code
        }
    }
}

unsafe extern "C" fn x_best_index<T: VTab>(
    vtab: *mut ffi::sqlite3_vtab,
    info: *mut ffi::sqlite3_index_info,
) -> c_int {
    let wrapper = vtab.cast::<VTabWrapper<T>>();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let mut info = IndexInfo { raw: info };
        unsafe { (*wrapper).table.best_index(&mut info) }
    }));
    match outcome {
        Ok(Ok(())) => ffi::SQLITE_OK,
        Ok(Err(err)) => unsafe { table_error::<T>(vtab, err) },
        Err(_) => unsafe { table_error::<T>(vtab, panic_error("best_index")) },
    }
}

unsafe extern "C" fn x_disconnect<T: VTab>(vtab: *mut ffi::sqlite3_vtab) -> c_int {
    let mut wrapper = unsafe { Box::from_raw(vtab.cast::<VTabWrapper<T>>()) };
    // Detach failures are absorbed like destroy; the instance is freed
    // regardless.
    match catch_unwind(AssertUnwindSafe(|| wrapper.table.disconnect())) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(error = %err, "virtual table disconnect failed"),
        Err(_) => tracing::warn!("virtual table disconnect panicked"),
    }
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_destroy<T: VTab>(vtab: *mut ffi::sqlite3_vtab) -> c_int {
    let mut wrapper = unsafe { Box::from_raw(vtab.cast::<VTabWrapper<T>>()) };
    // Teardown failures are absorbed: the drop proceeds and the table is
    // freed regardless.
    match catch_unwind(AssertUnwindSafe(|| wrapper.table.destroy())) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(error = %err, "virtual table destroy failed"),
        Err(_) => tracing::warn!("virtual table destroy panicked"),
    }
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_open<T: VTab>(
    vtab: *mut ffi::sqlite3_vtab,
    pp_cursor: *mut *mut ffi::sqlite3_vtab_cursor,
) -> c_int {
    let wrapper = vtab.cast::<VTabWrapper<T>>();
    let outcome = catch_unwind(AssertUnwindSafe(|| unsafe { (*wrapper).table.open() }));
    match outcome {
        Ok(Ok(cursor)) => {
            let cursor = Box::new(CursorWrapper::<T> {
                base: unsafe { std::mem::zeroed::<ffi::sqlite3_vtab_cursor>() },
                cursor,
            });
            unsafe {
                *pp_cursor = Box::into_raw(cursor).cast();
            }
            ffi::SQLITE_OK
        }
        Ok(Err(err)) => unsafe { table_error::<T>(vtab, err) },
        Err(_) => unsafe { table_error::<T>(vtab, panic_error("open")) },
    }
}

unsafe extern "C" fn x_close<T: VTab>(cursor: *mut ffi::sqlite3_vtab_cursor) -> c_int {
    drop(unsafe { Box::from_raw(cursor.cast::<CursorWrapper<T>>()) });
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_filter<T: VTab>(
    cursor: *mut ffi::sqlite3_vtab_cursor,
    index_num: c_int,
    index_str: *const c_char,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) -> c_int {
    let wrapper = cursor.cast::<CursorWrapper<T>>();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let args = unsafe { values_from_argv(argc, argv) }?;
        let index_str = if index_str.is_null() {
            None
        } else {
            unsafe { CStr::from_ptr(index_str) }.to_str().ok()
        };
        unsafe { (*wrapper).cursor.filter(index_num, index_str, &args) }
    }));
    match outcome {
        Ok(Ok(())) => ffi::SQLITE_OK,
        Ok(Err(err)) => unsafe { cursor_table_error::<T>(cursor, err) },
        Err(_) => unsafe { cursor_table_error::<T>(cursor, panic_error("filter")) },
    }
}

unsafe extern "C" fn x_next<T: VTab>(cursor: *mut ffi::sqlite3_vtab_cursor) -> c_int {
    let wrapper = cursor.cast::<CursorWrapper<T>>();
    let outcome = catch_unwind(AssertUnwindSafe(|| unsafe { (*wrapper).cursor.next() }));
    match outcome {
        Ok(Ok(())) => ffi::SQLITE_OK,
        Ok(Err(err)) => unsafe { cursor_table_error::<T>(cursor, err) },
        Err(_) => unsafe { cursor_table_error::<T>(cursor, panic_error("next")) },
    }
}

unsafe extern "C" fn x_eof<T: VTab>(cursor: *mut ffi::sqlite3_vtab_cursor) -> c_int {
    let wrapper = cursor.cast::<CursorWrapper<T>>();
    let outcome = catch_unwind(AssertUnwindSafe(|| unsafe { (*wrapper).cursor.eof() }));
    // A panic here cannot be reported; claim exhaustion to stop the scan.
    c_int::from(outcome.unwrap_or(true))
}

unsafe extern "C" fn x_column<T: VTab>(
    cursor: *mut ffi::sqlite3_vtab_cursor,
    ctx: *mut ffi::sqlite3_context,
    index: c_int,
) -> c_int {
    let wrapper = cursor.cast::<CursorWrapper<T>>();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let index = usize::try_from(index)
            .map_err(|_| Error::usage("negative column index from the engine"))?;
        unsafe { (*wrapper).cursor.column(index) }
    }));
    match outcome {
        Ok(Ok(value)) => {
            unsafe { set_result(ctx, &value) };
            ffi::SQLITE_OK
        }
        Ok(Err(err)) => unsafe { cursor_table_error::<T>(cursor, err) },
        Err(_) => unsafe { cursor_table_error::<T>(cursor, panic_error("column")) },
    }
}

unsafe extern "C" fn x_rowid<T: VTab>(
    cursor: *mut ffi::sqlite3_vtab_cursor,
    rowid_out: *mut ffi::sqlite3_int64,
) -> c_int {
    let wrapper = cursor.cast::<CursorWrapper<T>>();
    let outcome = catch_unwind(AssertUnwindSafe(|| unsafe { (*wrapper).cursor.rowid() }));
    match outcome {
        Ok(Ok(rowid)) => {
            unsafe {
                *rowid_out = rowid;
            }
            ffi::SQLITE_OK
        }
        Ok(Err(err)) => unsafe { cursor_table_error::<T>(cursor, err) },
        Err(_) => unsafe { cursor_table_error::<T>(cursor, panic_error("rowid")) },
    }
}

unsafe extern "C" fn x_update<T: VTab>(
    vtab: *mut ffi::sqlite3_vtab,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
    rowid_out: *mut ffi::sqlite3_int64,
) -> c_int {
    let wrapper = vtab.cast::<VTabWrapper<T>>();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let args = unsafe { values_from_argv(argc, argv) }?;
        let change = decode_change(&args)?;
        unsafe { (*wrapper).table.update(change) }
    }));
    match outcome {
        Ok(Ok(assigned)) => {
            if let Some(rowid) = assigned {
                unsafe {
                    *rowid_out = rowid;
                }
            }
            ffi::SQLITE_OK
        }
        Ok(Err(err)) => unsafe { table_error::<T>(vtab, err) },
        Err(_) => unsafe { table_error::<T>(vtab, panic_error("update")) },
    }
}

/// Decode the engine's change vector: a lone rowid deletes; a NULL first
/// entry inserts; otherwise it is an update of the row named first.
fn decode_change(args: &[Value]) -> Result<Change> {
    let rowid_of = |value: &Value| -> Result<Option<i64>> {
        match value {
            Value::Null => Ok(None),
            Value::Integer(i) => Ok(Some(*i)),
            other => Err(Error::Type(format!(
                "engine passed {} where a rowid was expected",
                other.type_name()
            ))),
        }
    };
    match args {
        [] => Err(Error::usage("empty change vector from the engine")),
        [only] => {
            let rowid = rowid_of(only)?
                .ok_or_else(|| Error::usage("delete change without a rowid"))?;
            Ok(Change::Delete { rowid })
        }
        [Value::Null, new_rowid, values @ ..] => Ok(Change::Insert {
            rowid: rowid_of(new_rowid)?,
            values: values.to_vec(),
        }),
        [old_rowid, new_rowid, values @ ..] => {
            let rowid = rowid_of(old_rowid)?
                .ok_or_else(|| Error::usage("update change without a rowid"))?;
            let new_rowid = rowid_of(new_rowid)?.filter(|new| *new != rowid);
            Ok(Change::Update {
                rowid,
                new_rowid,
                values: values.to_vec(),
            })
        }
    }
}

unsafe extern "C" fn x_begin<T: VTab>(vtab: *mut ffi::sqlite3_vtab) -> c_int {
    unsafe { transaction_op::<T>(vtab, "begin", VTab::begin) }
}

unsafe extern "C" fn x_sync<T: VTab>(vtab: *mut ffi::sqlite3_vtab) -> c_int {
    unsafe { transaction_op::<T>(vtab, "sync", VTab::sync) }
}

unsafe extern "C" fn x_commit<T: VTab>(vtab: *mut ffi::sqlite3_vtab) -> c_int {
    unsafe { transaction_op::<T>(vtab, "commit", VTab::commit) }
}

unsafe extern "C" fn x_rollback<T: VTab>(vtab: *mut ffi::sqlite3_vtab) -> c_int {
    unsafe { transaction_op::<T>(vtab, "rollback", VTab::rollback) }
}

unsafe fn transaction_op<T: VTab>(
    vtab: *mut ffi::sqlite3_vtab,
    what: &str,
    op: fn(&mut T) -> Result<()>,
) -> c_int {
    let wrapper = vtab.cast::<VTabWrapper<T>>();
    let outcome = catch_unwind(AssertUnwindSafe(|| op(unsafe { &mut (*wrapper).table })));
    match outcome {
        Ok(Ok(())) => ffi::SQLITE_OK,
        Ok(Err(err)) => unsafe { table_error::<T>(vtab, err) },
        Err(_) => unsafe { table_error::<T>(vtab, panic_error(what)) },
    }
}

unsafe extern "C" fn x_rename<T: VTab>(
    vtab: *mut ffi::sqlite3_vtab,
    new_name: *const c_char,
) -> c_int {
    let wrapper = vtab.cast::<VTabWrapper<T>>();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let new_name = unsafe { CStr::from_ptr(new_name) }
            .to_str()
            .map_err(|e| Error::Decode(format!("new table name is not UTF-8: {e}")))?;
        unsafe { (*wrapper).table.rename(new_name) }
    }));
    match outcome {
        Ok(Ok(())) => ffi::SQLITE_OK,
        Ok(Err(err)) => unsafe { table_error::<T>(vtab, err) },
        Err(_) => unsafe { table_error::<T>(vtab, panic_error("rename")) },
    }
}

fn module_vtable<M: VTabModule>() -> ffi::sqlite3_module {
    let mut def: ffi::sqlite3_module = unsafe { std::mem::zeroed() };
    def.iVersion = 1;
    def.xCreate = Some(x_create::<M>);
    def.xConnect = Some(x_connect::<M>);
    def.xBestIndex = Some(x_best_index::<M::Table>);
    def.xDisconnect = Some(x_disconnect::<M::Table>);
    def.xDestroy = Some(x_destroy::<M::Table>);
    def.xOpen = Some(x_open::<M::Table>);
    def.xClose = Some(x_close::<M::Table>);
    def.xFilter = Some(x_filter::<M::Table>);
    def.xNext = Some(x_next::<M::Table>);
    def.xEof = Some(x_eof::<M::Table>);
    def.xColumn = Some(x_column::<M::Table>);
    def.xRowid = Some(x_rowid::<M::Table>);
    def.xUpdate = Some(x_update::<M::Table>);
    def.xBegin = Some(x_begin::<M::Table>);
    def.xSync = Some(x_sync::<M::Table>);
    def.xCommit = Some(x_commit::<M::Table>);
    def.xRollback = Some(x_rollback::<M::Table>);
    def.xRename = Some(x_rename::<M::Table>);
    def
}

pub(crate) fn register_module<M: VTabModule>(
    inner: &Arc<ConnInner>,
    name: &str,
    module: M,
) -> Result<()> {
    inner.check_no_active_statements()?;
    let db = inner.db()?;
    let c_name =
        CString::new(name).map_err(|_| Error::usage("module name contains a NUL byte"))?;
    let vtable = Box::new(module_vtable::<M>());
    let ctx = Box::new(ModuleCtx {
        conn: Arc::downgrade(inner),
        module,
    });
    let rc = unsafe {
        ffi::sqlite3_create_module_v2(
            db,
            c_name.as_ptr(),
            vtable.as_ref(),
            Box::into_raw(ctx).cast(),
            Some(destroy_boxed::<ModuleCtx<M>>),
        )
    };
    if rc == ffi::SQLITE_OK {
        inner.hooks.lock().unwrap().modules.push(vtable);
        tracing::debug!(name, "registered virtual-table module");
        Ok(())
    } else {
        Err(unsafe { Error::from_handle(db, rc) })
    }
}
