//! Process-wide state: connection hooks run at open, and the shared-cache
//! passthrough.

use libsqlite3_sys as ffi;
use std::sync::{Arc, LazyLock, Mutex};

use crate::connection::Connection;
use crate::error::{Error, Result};

type ConnectionHook = Arc<dyn Fn(&Connection) -> Result<()> + Send + Sync>;

static CONNECTION_HOOKS: LazyLock<Mutex<Vec<ConnectionHook>>> =
    LazyLock::new(|| Mutex::new(Vec::new()));

/// Register a hook invoked with every connection subsequently opened, in
/// registration order, before the open returns. A failing hook aborts the
/// open with its error and the connection is closed.
pub fn add_connection_hook<F>(hook: F)
where
    F: Fn(&Connection) -> Result<()> + Send + Sync + 'static,
{
    CONNECTION_HOOKS.lock().unwrap().push(Arc::new(hook));
}

/// Remove every registered connection hook.
pub fn clear_connection_hooks() {
    CONNECTION_HOOKS.lock().unwrap().clear();
}

pub(crate) fn run_connection_hooks(connection: &Connection) -> Result<()> {
    // Snapshot under the lock, run outside it: a hook may itself open a
    // connection.
    let hooks: Vec<ConnectionHook> = CONNECTION_HOOKS.lock().unwrap().clone();
    for hook in hooks {
        hook(connection)?;
    }
    Ok(())
}

/// Toggle shared-cache mode for connections opened afterwards.
pub fn enable_shared_cache(enable: bool) -> Result<()> {
    let rc = unsafe { ffi::sqlite3_enable_shared_cache(i32::from(enable)) };
    if rc == ffi::SQLITE_OK {
        Ok(())
    } else {
        Err(Error::from_code(rc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // The hook list is process-wide; serialize the tests that touch it.
    static HOOK_TESTS: Mutex<()> = Mutex::new(());

    #[test]
    fn hooks_run_in_registration_order_and_clear() {
        let _serial = HOOK_TESTS.lock().unwrap();
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        clear_connection_hooks();
        add_connection_hook(|_| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        add_connection_hook(|_| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let conn = Connection::open_in_memory().unwrap();
        drop(conn);
        assert_eq!(CALLS.load(Ordering::SeqCst), 2);

        clear_connection_hooks();
        let conn = Connection::open_in_memory().unwrap();
        drop(conn);
        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failing_hook_aborts_the_open() {
        let _serial = HOOK_TESTS.lock().unwrap();
        clear_connection_hooks();
        add_connection_hook(|_| Err(Error::usage("rejected by policy")));
        let result = Connection::open_in_memory();
        clear_connection_hooks();
        assert!(matches!(result, Err(Error::Usage(_))));
    }
}
