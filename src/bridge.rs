//! Crossing points between the engine and host closures.
//!
//! Every `extern "C"` trampoline here follows the same discipline: decode the
//! native arguments, call the host closure behind a panic barrier, and convert
//! any failure into the connection's pending-error slot plus the engine's
//! error sentinel. The engine never sees a Rust panic.

use libsqlite3_sys as ffi;
use std::any::Any;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use crate::connection::ConnInner;
use crate::error::{Error, Result};
use crate::value::Value;

/// Owned contexts for callbacks the engine borrows but does not own.
///
/// Function and collation contexts are handed to the engine together with a
/// destructor; these hook contexts are not, so the slot keeps each context
/// alive until it is replaced or the connection closes.
#[derive(Default)]
pub(crate) struct HookSlots {
    pub(crate) busy: Option<Box<dyn Any + Send>>,
    pub(crate) progress: Option<Box<dyn Any + Send>>,
    pub(crate) commit: Option<Box<dyn Any + Send>>,
    pub(crate) rollback: Option<Box<dyn Any + Send>>,
    pub(crate) update: Option<Box<dyn Any + Send>>,
    pub(crate) authorizer: Option<Box<dyn Any + Send>>,
    /// Module vtables handed to the engine by pointer; they must stay put
    /// until the connection closes.
    pub(crate) modules: Vec<Box<ffi::sqlite3_module>>,
}

/// Verdict of an authorizer callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    Allow,
    Deny,
    /// Permit the statement but have the contested column read as NULL.
    Ignore,
}

/// One action submitted to the authorizer during statement preparation.
#[derive(Debug)]
pub struct AuthAction<'a> {
    /// Raw action code (`SQLITE_INSERT`, `SQLITE_READ`, ...).
    pub code: c_int,
    pub arg1: Option<&'a str>,
    pub arg2: Option<&'a str>,
    pub database: Option<&'a str>,
    pub trigger_or_view: Option<&'a str>,
}

/// Kind of row change reported to the update hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateAction {
    Insert,
    Update,
    Delete,
}

/// A user-defined aggregate: fresh state per invocation, stepped once per
/// row, finalized once. `finalize` receives `None` when no row was stepped.
pub trait Aggregate: Send + 'static {
    type State: Send;

    fn init(&self) -> Self::State;
    fn step(&self, state: &mut Self::State, args: &[Value]) -> Result<()>;
    fn finalize(&self, state: Option<Self::State>) -> Result<Value>;
}

pub(crate) unsafe extern "C" fn destroy_boxed<T>(p: *mut c_void) {
    if !p.is_null() {
        drop(unsafe { Box::from_raw(p.cast::<T>()) });
    }
}

/// Decode the argument vector of a function or filter invocation.
pub(crate) unsafe fn values_from_argv(
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) -> Result<Vec<Value>> {
    let count = usize::try_from(argc).unwrap_or(0);
    let mut values = Vec::with_capacity(count);
    for i in 0..count {
        let arg = unsafe { *argv.add(i) };
        values.push(unsafe { value_from_raw(arg) }?);
    }
    Ok(values)
}

unsafe fn value_from_raw(arg: *mut ffi::sqlite3_value) -> Result<Value> {
    match unsafe { ffi::sqlite3_value_type(arg) } {
        ffi::SQLITE_NULL => Ok(Value::Null),
        ffi::SQLITE_INTEGER => Ok(Value::Integer(unsafe { ffi::sqlite3_value_int64(arg) })),
        ffi::SQLITE_FLOAT => Ok(Value::Real(unsafe { ffi::sqlite3_value_double(arg) })),
        ffi::SQLITE_TEXT => {
            let ptr = unsafe { ffi::sqlite3_value_text(arg) };
            let len = usize::try_from(unsafe { ffi::sqlite3_value_bytes(arg) }).unwrap_or(0);
            if ptr.is_null() {
                return Ok(Value::Text(String::new()));
            }
            let bytes = unsafe { std::slice::from_raw_parts(ptr.cast::<u8>(), len) };
            let text = std::str::from_utf8(bytes)
                .map_err(|e| Error::Decode(format!("engine passed invalid UTF-8 text: {e}")))?;
            Ok(Value::Text(text.to_owned()))
        }
        ffi::SQLITE_BLOB => {
            let ptr = unsafe { ffi::sqlite3_value_blob(arg) };
            let len = usize::try_from(unsafe { ffi::sqlite3_value_bytes(arg) }).unwrap_or(0);
            if ptr.is_null() || len == 0 {
                return Ok(Value::Blob(Vec::new()));
            }
            let bytes = unsafe { std::slice::from_raw_parts(ptr.cast::<u8>(), len) };
            Ok(Value::Blob(bytes.to_vec()))
        }
        other => Err(Error::Type(format!(
            "engine passed unknown argument type {other}"
        ))),
    }
}

/// Hand `value` back to the engine as a function or column result.
pub(crate) unsafe fn set_result(ctx: *mut ffi::sqlite3_context, value: &Value) {
    match value {
        Value::Null => unsafe { ffi::sqlite3_result_null(ctx) },
        Value::Integer(i) => unsafe { ffi::sqlite3_result_int64(ctx, *i) },
        Value::Real(f) => unsafe { ffi::sqlite3_result_double(ctx, *f) },
        Value::Text(s) => match c_int::try_from(s.len()) {
            Ok(len) => unsafe {
                ffi::sqlite3_result_text(
                    ctx,
                    s.as_ptr().cast::<c_char>(),
                    len,
                    ffi::SQLITE_TRANSIENT(),
                );
            },
            Err(_) => unsafe { ffi::sqlite3_result_error_toobig(ctx) },
        },
        Value::Blob(b) => match c_int::try_from(b.len()) {
            Ok(len) => unsafe {
                ffi::sqlite3_result_blob(ctx, b.as_ptr().cast(), len, ffi::SQLITE_TRANSIENT());
            },
            Err(_) => unsafe { ffi::sqlite3_result_error_toobig(ctx) },
        },
        Value::ZeroBlob(n) => unsafe { ffi::sqlite3_result_zeroblob(ctx, *n) },
    }
}

/// Record `err` in the pending slot and signal the engine to abort the
/// surrounding statement.
unsafe fn report_error(ctx: *mut ffi::sqlite3_context, conn: &Weak<ConnInner>, err: Error) {
    let code = err.primary_code();
    let message = err.to_string();
    if let Some(conn) = conn.upgrade() {
        conn.set_pending(err);
    }
    if let Ok(message) = CString::new(message) {
        unsafe {
            ffi::sqlite3_result_error(ctx, message.as_ptr(), -1);
        }
    }
    unsafe {
        ffi::sqlite3_result_error_code(ctx, code);
    }
}

pub(crate) fn set_pending(conn: &Weak<ConnInner>, err: Error) {
    if let Some(conn) = conn.upgrade() {
        conn.set_pending(err);
    }
}

fn panic_error(what: &str) -> Error {
    Error::usage(format!("panic in {what}"))
}

fn function_flags(deterministic: bool) -> c_int {
    if deterministic {
        ffi::SQLITE_UTF8 | ffi::SQLITE_DETERMINISTIC
    } else {
        ffi::SQLITE_UTF8
    }
}

fn arity(n_args: Option<u8>) -> c_int {
    n_args.map_or(-1, c_int::from)
}

unsafe fn str_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        None
    } else {
        unsafe { CStr::from_ptr(ptr) }.to_str().ok()
    }
}

// ---------------------------------------------------------------------------
// Scalar functions
// ---------------------------------------------------------------------------

struct ScalarCtx<F> {
    conn: Weak<ConnInner>,
    func: RefCell<F>,
}

unsafe extern "C" fn scalar_trampoline<F>(
    ctx: *mut ffi::sqlite3_context,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) where
    F: FnMut(&[Value]) -> Result<Value> + Send + 'static,
{
    let user = unsafe { ffi::sqlite3_user_data(ctx) }.cast::<ScalarCtx<F>>();
    let conn = unsafe { &(*user).conn };
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let args = unsafe { values_from_argv(argc, argv) }?;
        let Ok(mut func) = (unsafe { (*user).func.try_borrow_mut() }) else {
            return Err(Error::usage("recursive invocation of a scalar function"));
        };
        func(&args)
    }));
    match outcome {
        Ok(Ok(value)) => unsafe { set_result(ctx, &value) },
        Ok(Err(err)) => unsafe { report_error(ctx, conn, err) },
        Err(_) => unsafe { report_error(ctx, conn, panic_error("scalar function")) },
    }
}

pub(crate) fn create_scalar_function<F>(
    inner: &Arc<ConnInner>,
    name: &str,
    n_args: Option<u8>,
    deterministic: bool,
    func: F,
) -> Result<()>
where
    F: FnMut(&[Value]) -> Result<Value> + Send + 'static,
{
    inner.check_no_active_statements()?;
    let db = inner.db()?;
    let c_name =
        CString::new(name).map_err(|_| Error::usage("function name contains a NUL byte"))?;
    let ctx = Box::new(ScalarCtx {
        conn: Arc::downgrade(inner),
        func: RefCell::new(func),
    });
    let rc = unsafe {
        ffi::sqlite3_create_function_v2(
            db,
            c_name.as_ptr(),
            arity(n_args),
            function_flags(deterministic),
            Box::into_raw(ctx).cast(),
            Some(scalar_trampoline::<F>),
            None,
            None,
            Some(destroy_boxed::<ScalarCtx<F>>),
        )
    };
    if rc == ffi::SQLITE_OK {
        tracing::debug!(name, "registered scalar function");
        Ok(())
    } else {
        // The engine invokes the destructor itself when registration fails.
        Err(unsafe { Error::from_handle(db, rc) })
    }
}

pub(crate) fn remove_function(inner: &Arc<ConnInner>, name: &str, n_args: Option<u8>) -> Result<()> {
    inner.check_no_active_statements()?;
    let db = inner.db()?;
    let c_name =
        CString::new(name).map_err(|_| Error::usage("function name contains a NUL byte"))?;
    let rc = unsafe {
        ffi::sqlite3_create_function_v2(
            db,
            c_name.as_ptr(),
            arity(n_args),
            ffi::SQLITE_UTF8,
            std::ptr::null_mut(),
            None,
            None,
            None,
            None,
        )
    };
    if rc == ffi::SQLITE_OK {
        Ok(())
    } else {
        Err(unsafe { Error::from_handle(db, rc) })
    }
}

// ---------------------------------------------------------------------------
// Aggregate functions
// ---------------------------------------------------------------------------

struct AggregateCtx<A> {
    conn: Weak<ConnInner>,
    aggregate: A,
}

/// Per-invocation state lives in the engine's aggregate context as a single
/// raw pointer, boxed on the first step and reclaimed in the final callback.
unsafe fn aggregate_state_slot<A: Aggregate>(
    ctx: *mut ffi::sqlite3_context,
) -> *mut *mut A::State {
    let size = c_int::try_from(std::mem::size_of::<*mut A::State>()).unwrap_or(c_int::MAX);
    unsafe { ffi::sqlite3_aggregate_context(ctx, size) }.cast::<*mut A::State>()
}

unsafe extern "C" fn aggregate_step_trampoline<A: Aggregate>(
    ctx: *mut ffi::sqlite3_context,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) {
    let user = unsafe { ffi::sqlite3_user_data(ctx) }.cast::<AggregateCtx<A>>();
    let conn = unsafe { &(*user).conn };
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let slot = unsafe { aggregate_state_slot::<A>(ctx) };
        if slot.is_null() {
            return Err(Error::usage("out of memory allocating aggregate state"));
        }
        if unsafe { *slot }.is_null() {
            let state = Box::new(unsafe { (*user).aggregate.init() });
            unsafe {
                *slot = Box::into_raw(state);
            }
        }
        let args = unsafe { values_from_argv(argc, argv) }?;
        let state = unsafe { &mut **slot };
        unsafe { (*user).aggregate.step(state, &args) }
    }));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => unsafe { report_error(ctx, conn, err) },
        Err(_) => unsafe { report_error(ctx, conn, panic_error("aggregate step")) },
    }
}

unsafe extern "C" fn aggregate_final_trampoline<A: Aggregate>(ctx: *mut ffi::sqlite3_context) {
    let user = unsafe { ffi::sqlite3_user_data(ctx) }.cast::<AggregateCtx<A>>();
    let conn = unsafe { &(*user).conn };
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        // Size zero: look up the context without allocating. Null means no
        // row was ever stepped.
        let slot = unsafe { ffi::sqlite3_aggregate_context(ctx, 0) }.cast::<*mut A::State>();
        let state = if slot.is_null() || unsafe { *slot }.is_null() {
            None
        } else {
            let state = unsafe { Box::from_raw(*slot) };
            unsafe {
                *slot = std::ptr::null_mut();
            }
            Some(*state)
        };
        unsafe { (*user).aggregate.finalize(state) }
    }));
    match outcome {
        Ok(Ok(value)) => unsafe { set_result(ctx, &value) },
        Ok(Err(err)) => unsafe { report_error(ctx, conn, err) },
        Err(_) => unsafe { report_error(ctx, conn, panic_error("aggregate final")) },
    }
}

pub(crate) fn create_aggregate_function<A>(
    inner: &Arc<ConnInner>,
    name: &str,
    n_args: Option<u8>,
    aggregate: A,
) -> Result<()>
where
    A: Aggregate,
{
    inner.check_no_active_statements()?;
    let db = inner.db()?;
    let c_name =
        CString::new(name).map_err(|_| Error::usage("function name contains a NUL byte"))?;
    let ctx = Box::new(AggregateCtx {
        conn: Arc::downgrade(inner),
        aggregate,
    });
    let rc = unsafe {
        ffi::sqlite3_create_function_v2(
            db,
            c_name.as_ptr(),
            arity(n_args),
            ffi::SQLITE_UTF8,
            Box::into_raw(ctx).cast(),
            None,
            Some(aggregate_step_trampoline::<A>),
            Some(aggregate_final_trampoline::<A>),
            Some(destroy_boxed::<AggregateCtx<A>>),
        )
    };
    if rc == ffi::SQLITE_OK {
        tracing::debug!(name, "registered aggregate function");
        Ok(())
    } else {
        Err(unsafe { Error::from_handle(db, rc) })
    }
}

// ---------------------------------------------------------------------------
// Collations
// ---------------------------------------------------------------------------

struct CollationCtx<F> {
    conn: Weak<ConnInner>,
    func: RefCell<F>,
}

unsafe extern "C" fn collation_trampoline<F>(
    user: *mut c_void,
    left_len: c_int,
    left: *const c_void,
    right_len: c_int,
    right: *const c_void,
) -> c_int
where
    F: FnMut(&str, &str) -> Ordering + Send + 'static,
{
    let user = user.cast::<CollationCtx<F>>();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let left = unsafe {
            std::slice::from_raw_parts(left.cast::<u8>(), usize::try_from(left_len).unwrap_or(0))
        };
        let right = unsafe {
            std::slice::from_raw_parts(
                right.cast::<u8>(),
                usize::try_from(right_len).unwrap_or(0),
            )
        };
        let (Ok(left), Ok(right)) = (std::str::from_utf8(left), std::str::from_utf8(right))
        else {
            // A comparison cannot fail; order undecodable keys bytewise.
            return left.cmp(right);
        };
        let Ok(mut func) = (unsafe { (*user).func.try_borrow_mut() }) else {
            return left.cmp(right);
        };
        func(left, right)
    }));
    match outcome {
        Ok(Ordering::Less) => -1,
        Ok(Ordering::Equal) => 0,
        Ok(Ordering::Greater) => 1,
        Err(_) => {
            unsafe {
                set_pending(&(*user).conn, panic_error("collation"));
            }
            0
        }
    }
}

pub(crate) fn create_collation<F>(inner: &Arc<ConnInner>, name: &str, compare: F) -> Result<()>
where
    F: FnMut(&str, &str) -> Ordering + Send + 'static,
{
    inner.check_no_active_statements()?;
    let db = inner.db()?;
    let c_name =
        CString::new(name).map_err(|_| Error::usage("collation name contains a NUL byte"))?;
    let ctx = Box::new(CollationCtx {
        conn: Arc::downgrade(inner),
        func: RefCell::new(compare),
    });
    let rc = unsafe {
        ffi::sqlite3_create_collation_v2(
            db,
            c_name.as_ptr(),
            ffi::SQLITE_UTF8,
            Box::into_raw(ctx).cast(),
            Some(collation_trampoline::<F>),
            Some(destroy_boxed::<CollationCtx<F>>),
        )
    };
    if rc == ffi::SQLITE_OK {
        tracing::debug!(name, "registered collation");
        Ok(())
    } else {
        Err(unsafe { Error::from_handle(db, rc) })
    }
}

// ---------------------------------------------------------------------------
// Authorizer
// ---------------------------------------------------------------------------

struct AuthorizerCtx<F> {
    conn: Weak<ConnInner>,
    func: RefCell<F>,
}

unsafe extern "C" fn authorizer_trampoline<F>(
    user: *mut c_void,
    code: c_int,
    arg1: *const c_char,
    arg2: *const c_char,
    database: *const c_char,
    trigger_or_view: *const c_char,
) -> c_int
where
    F: FnMut(&AuthAction<'_>) -> Result<Authorization> + Send + 'static,
{
    let user = user.cast::<AuthorizerCtx<F>>();
    let conn = unsafe { &(*user).conn };
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let action = AuthAction {
            code,
            arg1: unsafe { str_arg(arg1) },
            arg2: unsafe { str_arg(arg2) },
            database: unsafe { str_arg(database) },
            trigger_or_view: unsafe { str_arg(trigger_or_view) },
        };
        let Ok(mut func) = (unsafe { (*user).func.try_borrow_mut() }) else {
            return Err(Error::usage("recursive invocation of the authorizer"));
        };
        func(&action)
    }));
    match outcome {
        Ok(Ok(Authorization::Allow)) => ffi::SQLITE_OK,
        Ok(Ok(Authorization::Deny)) => ffi::SQLITE_DENY,
        Ok(Ok(Authorization::Ignore)) => ffi::SQLITE_IGNORE,
        Ok(Err(err)) => {
            set_pending(conn, err);
            ffi::SQLITE_DENY
        }
        Err(_) => {
            set_pending(conn, panic_error("authorizer"));
            ffi::SQLITE_DENY
        }
    }
}

pub(crate) fn set_authorizer<F>(inner: &Arc<ConnInner>, authorizer: Option<F>) -> Result<()>
where
    F: FnMut(&AuthAction<'_>) -> Result<Authorization> + Send + 'static,
{
    let db = inner.db()?;
    let Some(func) = authorizer else {
        let rc = unsafe { ffi::sqlite3_set_authorizer(db, None, std::ptr::null_mut()) };
        inner.hooks.lock().unwrap().authorizer = None;
        return if rc == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(unsafe { Error::from_handle(db, rc) })
        };
    };
    let ctx = Box::new(AuthorizerCtx {
        conn: Arc::downgrade(inner),
        func: RefCell::new(func),
    });
    let ptr = std::ptr::from_ref(ctx.as_ref()).cast_mut().cast::<c_void>();
    let rc = unsafe { ffi::sqlite3_set_authorizer(db, Some(authorizer_trampoline::<F>), ptr) };
    if rc == ffi::SQLITE_OK {
        inner.hooks.lock().unwrap().authorizer = Some(ctx);
        Ok(())
    } else {
        Err(unsafe { Error::from_handle(db, rc) })
    }
}

// ---------------------------------------------------------------------------
// Busy and progress handlers
// ---------------------------------------------------------------------------

struct BusyCtx<F> {
    conn: Weak<ConnInner>,
    func: RefCell<F>,
}

unsafe extern "C" fn busy_trampoline<F>(user: *mut c_void, prior_calls: c_int) -> c_int
where
    F: FnMut(i32) -> Result<bool> + Send + 'static,
{
    let user = user.cast::<BusyCtx<F>>();
    let conn = unsafe { &(*user).conn };
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let Ok(mut func) = (unsafe { (*user).func.try_borrow_mut() }) else {
            return Err(Error::usage("recursive invocation of the busy handler"));
        };
        func(prior_calls)
    }));
    match outcome {
        Ok(Ok(true)) => 1,
        Ok(Ok(false)) => 0,
        Ok(Err(err)) => {
            set_pending(conn, err);
            0
        }
        Err(_) => {
            set_pending(conn, panic_error("busy handler"));
            0
        }
    }
}

pub(crate) fn set_busy_handler<F>(inner: &Arc<ConnInner>, handler: Option<F>) -> Result<()>
where
    F: FnMut(i32) -> Result<bool> + Send + 'static,
{
    let db = inner.db()?;
    let Some(func) = handler else {
        let rc = unsafe { ffi::sqlite3_busy_handler(db, None, std::ptr::null_mut()) };
        inner.hooks.lock().unwrap().busy = None;
        return if rc == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(unsafe { Error::from_handle(db, rc) })
        };
    };
    let ctx = Box::new(BusyCtx {
        conn: Arc::downgrade(inner),
        func: RefCell::new(func),
    });
    let ptr = std::ptr::from_ref(ctx.as_ref()).cast_mut().cast::<c_void>();
    let rc = unsafe { ffi::sqlite3_busy_handler(db, Some(busy_trampoline::<F>), ptr) };
    if rc == ffi::SQLITE_OK {
        inner.hooks.lock().unwrap().busy = Some(ctx);
        Ok(())
    } else {
        Err(unsafe { Error::from_handle(db, rc) })
    }
}

struct ProgressCtx<F> {
    conn: Weak<ConnInner>,
    func: RefCell<F>,
}

unsafe extern "C" fn progress_trampoline<F>(user: *mut c_void) -> c_int
where
    F: FnMut() -> Result<bool> + Send + 'static,
{
    let user = user.cast::<ProgressCtx<F>>();
    let conn = unsafe { &(*user).conn };
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let Ok(mut func) = (unsafe { (*user).func.try_borrow_mut() }) else {
            return Err(Error::usage("recursive invocation of the progress handler"));
        };
        func()
    }));
    match outcome {
        Ok(Ok(false)) => 0,
        Ok(Ok(true)) => 1,
        Ok(Err(err)) => {
            set_pending(conn, err);
            1
        }
        Err(_) => {
            set_pending(conn, panic_error("progress handler"));
            1
        }
    }
}

pub(crate) fn set_progress_handler<F>(
    inner: &Arc<ConnInner>,
    steps: i32,
    handler: Option<F>,
) -> Result<()>
where
    F: FnMut() -> Result<bool> + Send + 'static,
{
    let db = inner.db()?;
    let Some(func) = handler else {
        unsafe {
            ffi::sqlite3_progress_handler(db, 0, None, std::ptr::null_mut());
        }
        inner.hooks.lock().unwrap().progress = None;
        return Ok(());
    };
    let ctx = Box::new(ProgressCtx {
        conn: Arc::downgrade(inner),
        func: RefCell::new(func),
    });
    let ptr = std::ptr::from_ref(ctx.as_ref()).cast_mut().cast::<c_void>();
    unsafe {
        ffi::sqlite3_progress_handler(db, steps, Some(progress_trampoline::<F>), ptr);
    }
    inner.hooks.lock().unwrap().progress = Some(ctx);
    Ok(())
}

// ---------------------------------------------------------------------------
// Transaction and row-change hooks
// ---------------------------------------------------------------------------

struct CommitCtx<F> {
    conn: Weak<ConnInner>,
    func: RefCell<F>,
}

unsafe extern "C" fn commit_trampoline<F>(user: *mut c_void) -> c_int
where
    F: FnMut() -> Result<bool> + Send + 'static,
{
    let user = user.cast::<CommitCtx<F>>();
    let conn = unsafe { &(*user).conn };
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let Ok(mut func) = (unsafe { (*user).func.try_borrow_mut() }) else {
            return Err(Error::usage("recursive invocation of the commit hook"));
        };
        func()
    }));
    match outcome {
        Ok(Ok(false)) => 0,
        Ok(Ok(true)) => 1,
        Ok(Err(err)) => {
            set_pending(conn, err);
            1
        }
        Err(_) => {
            set_pending(conn, panic_error("commit hook"));
            1
        }
    }
}

pub(crate) fn set_commit_hook<F>(inner: &Arc<ConnInner>, hook: Option<F>) -> Result<()>
where
    F: FnMut() -> Result<bool> + Send + 'static,
{
    let db = inner.db()?;
    let Some(func) = hook else {
        unsafe {
            ffi::sqlite3_commit_hook(db, None, std::ptr::null_mut());
        }
        inner.hooks.lock().unwrap().commit = None;
        return Ok(());
    };
    let ctx = Box::new(CommitCtx {
        conn: Arc::downgrade(inner),
        func: RefCell::new(func),
    });
    let ptr = std::ptr::from_ref(ctx.as_ref()).cast_mut().cast::<c_void>();
    unsafe {
        ffi::sqlite3_commit_hook(db, Some(commit_trampoline::<F>), ptr);
    }
    inner.hooks.lock().unwrap().commit = Some(ctx);
    Ok(())
}

struct RollbackCtx<F> {
    conn: Weak<ConnInner>,
    func: RefCell<F>,
}

unsafe extern "C" fn rollback_trampoline<F>(user: *mut c_void)
where
    F: FnMut() -> Result<()> + Send + 'static,
{
    let user = user.cast::<RollbackCtx<F>>();
    let conn = unsafe { &(*user).conn };
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let Ok(mut func) = (unsafe { (*user).func.try_borrow_mut() }) else {
            return Err(Error::usage("recursive invocation of the rollback hook"));
        };
        func()
    }));
    // The engine forbids raising an error from this hook; hold the failure
    // until the next call on the connection.
    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err),
        Err(_) => Some(panic_error("rollback hook")),
    };
    if let (Some(err), Some(conn)) = (failure, conn.upgrade()) {
        conn.set_deferred(err);
    }
}

pub(crate) fn set_rollback_hook<F>(inner: &Arc<ConnInner>, hook: Option<F>) -> Result<()>
where
    F: FnMut() -> Result<()> + Send + 'static,
{
    let db = inner.db()?;
    let Some(func) = hook else {
        unsafe {
            ffi::sqlite3_rollback_hook(db, None, std::ptr::null_mut());
        }
        inner.hooks.lock().unwrap().rollback = None;
        return Ok(());
    };
    let ctx = Box::new(RollbackCtx {
        conn: Arc::downgrade(inner),
        func: RefCell::new(func),
    });
    let ptr = std::ptr::from_ref(ctx.as_ref()).cast_mut().cast::<c_void>();
    unsafe {
        ffi::sqlite3_rollback_hook(db, Some(rollback_trampoline::<F>), ptr);
    }
    inner.hooks.lock().unwrap().rollback = Some(ctx);
    Ok(())
}

struct UpdateCtx<F> {
    conn: Weak<ConnInner>,
    func: RefCell<F>,
}

unsafe extern "C" fn update_trampoline<F>(
    user: *mut c_void,
    op: c_int,
    database: *const c_char,
    table: *const c_char,
    rowid: i64,
) where
    F: FnMut(UpdateAction, &str, &str, i64) -> Result<()> + Send + 'static,
{
    let user = user.cast::<UpdateCtx<F>>();
    let conn = unsafe { &(*user).conn };
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let action = match op {
            ffi::SQLITE_INSERT => UpdateAction::Insert,
            ffi::SQLITE_DELETE => UpdateAction::Delete,
            _ => UpdateAction::Update,
        };
        let database = unsafe { str_arg(database) }.unwrap_or("");
        let table = unsafe { str_arg(table) }.unwrap_or("");
        let Ok(mut func) = (unsafe { (*user).func.try_borrow_mut() }) else {
            return Err(Error::usage("recursive invocation of the update hook"));
        };
        func(action, database, table, rowid)
    }));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => set_pending(conn, err),
        Err(_) => set_pending(conn, panic_error("update hook")),
    }
}

pub(crate) fn set_update_hook<F>(inner: &Arc<ConnInner>, hook: Option<F>) -> Result<()>
where
    F: FnMut(UpdateAction, &str, &str, i64) -> Result<()> + Send + 'static,
{
    let db = inner.db()?;
    let Some(func) = hook else {
        unsafe {
            ffi::sqlite3_update_hook(db, None, std::ptr::null_mut());
        }
        inner.hooks.lock().unwrap().update = None;
        return Ok(());
    };
    let ctx = Box::new(UpdateCtx {
        conn: Arc::downgrade(inner),
        func: RefCell::new(func),
    });
    let ptr = std::ptr::from_ref(ctx.as_ref()).cast_mut().cast::<c_void>();
    unsafe {
        ffi::sqlite3_update_hook(db, Some(update_trampoline::<F>), ptr);
    }
    inner.hooks.lock().unwrap().update = Some(ctx);
    Ok(())
}
