// Execution engine: batches, bindings, tracing, the statement cache.

use sqlbridge::{Connection, Error, OpenOptions, Params, Value, is_complete};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn conn() -> Connection {
    Connection::open_in_memory().unwrap()
}

#[test]
fn single_statement_roundtrip() {
    let conn = conn();
    let mut cursor = conn.cursor();
    let rows = cursor
        .execute("SELECT 1, 'two', 3.5, x'00ff', NULL", ())
        .unwrap()
        .fetch_all()
        .unwrap();
    assert_eq!(
        rows,
        vec![vec![
            Value::Integer(1),
            Value::Text("two".into()),
            Value::Real(3.5),
            Value::Blob(vec![0x00, 0xff]),
            Value::Null,
        ]]
    );
}

#[test]
fn embedded_nul_bytes_roundtrip() {
    let conn = conn();
    let mut cursor = conn.cursor();
    cursor
        .execute("CREATE TABLE t(a TEXT, b BLOB)", ())
        .unwrap();
    cursor
        .execute(
            "INSERT INTO t VALUES(?, ?)",
            [
                Value::Text("ab\0cd".into()),
                Value::Blob(vec![1, 0, 2, 0, 3]),
            ],
        )
        .unwrap();
    let rows = cursor
        .execute("SELECT a, b FROM t", ())
        .unwrap()
        .fetch_all()
        .unwrap();
    assert_eq!(
        rows,
        vec![vec![
            Value::Text("ab\0cd".into()),
            Value::Blob(vec![1, 0, 2, 0, 3]),
        ]]
    );
}

#[test]
fn invalid_utf8_text_cell_fails_decode() {
    let conn = conn();
    let err = conn
        .cursor()
        .execute("SELECT CAST(x'ff51' AS TEXT)", ())
        .unwrap_err();
    assert!(matches!(err, Error::Decode(_)));
}

#[test]
fn multi_statement_batch_runs_in_order_and_chains_rows() {
    let conn = conn();
    let mut cursor = conn.cursor();
    let rows = cursor
        .execute(
            "CREATE TABLE t(x); INSERT INTO t VALUES(10); SELECT x FROM t; SELECT x + 1 FROM t",
            (),
        )
        .unwrap()
        .fetch_all()
        .unwrap();
    assert_eq!(rows, vec![vec![Value::Integer(10)], vec![Value::Integer(11)]]);
}

#[test]
fn positional_values_are_consumed_across_the_batch() {
    let conn = conn();
    let mut cursor = conn.cursor();
    let rows = cursor
        .execute("SELECT ?; SELECT ?, ?", Params::positional([1i64, 2, 3]))
        .unwrap()
        .fetch_all()
        .unwrap();
    assert_eq!(
        rows,
        vec![
            vec![Value::Integer(1)],
            vec![Value::Integer(2), Value::Integer(3)],
        ]
    );
}

#[test]
fn too_few_bindings_fail_before_the_statement_runs() {
    let conn = conn();
    let mut cursor = conn.cursor();
    cursor.execute("CREATE TABLE t(x)", ()).unwrap();
    // First statement runs; the second fails during binding and must not.
    let err = cursor
        .execute(
            "INSERT INTO t VALUES(1); INSERT INTO t VALUES(?)",
            (),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        Error::BindingsMismatch {
            expected: 1,
            supplied: 0
        }
    ));
    let rows = cursor
        .execute("SELECT count(*) FROM t", ())
        .unwrap()
        .fetch_all()
        .unwrap();
    // The statement before the mismatch stays applied.
    assert_eq!(rows, vec![vec![Value::Integer(1)]]);
}

#[test]
fn leftover_positional_values_are_a_mismatch() {
    let conn = conn();
    let mut cursor = conn.cursor();
    let err = cursor
        .execute("SELECT ?", Params::positional([1i64, 2]))
        .unwrap_err();
    assert!(matches!(err, Error::BindingsMismatch { .. }));
}

#[test]
fn named_bindings_missing_key_binds_null() {
    let conn = conn();
    let mut cursor = conn.cursor();
    let rows = cursor
        .execute("SELECT :a, :b", Params::named([("a", 7i64)]))
        .unwrap()
        .fetch_all()
        .unwrap();
    assert_eq!(rows, vec![vec![Value::Integer(7), Value::Null]]);
}

#[test]
fn named_map_against_positional_placeholders_is_a_type_error() {
    let conn = conn();
    let mut cursor = conn.cursor();
    let err = cursor
        .execute("SELECT ?", Params::named([("a", 1i64)]))
        .unwrap_err();
    assert!(matches!(err, Error::BindingsType));
}

#[test]
fn next_row_reports_exhaustion_once_then_completion() {
    let conn = conn();
    let mut cursor = conn.cursor();
    cursor.execute("SELECT 1", ()).unwrap();
    assert_eq!(cursor.next_row().unwrap(), Some(vec![Value::Integer(1)]));
    assert_eq!(cursor.next_row().unwrap(), None);
    assert!(matches!(cursor.next_row(), Err(Error::CursorComplete)));
    assert!(matches!(cursor.next_row(), Err(Error::CursorComplete)));
    // Restartable via a fresh execute.
    assert_eq!(
        cursor.execute("SELECT 2", ()).unwrap().fetch_all().unwrap(),
        vec![vec![Value::Integer(2)]]
    );
}

#[test]
fn column_metadata_is_valid_only_mid_execution() {
    let conn = conn();
    let mut cursor = conn.cursor();
    assert!(cursor.column_names().is_err());
    cursor
        .execute("CREATE TABLE t(a INTEGER, b TEXT); INSERT INTO t VALUES(1, 'x')", ())
        .unwrap();
    cursor.execute("SELECT a, b FROM t", ()).unwrap();
    assert_eq!(cursor.column_names().unwrap(), vec!["a", "b"]);
    assert_eq!(cursor.column_count().unwrap(), 2);
    let description = cursor.description().unwrap().to_vec();
    assert_eq!(description[0].1.as_deref(), Some("INTEGER"));
    cursor.fetch_all().unwrap();
    assert!(matches!(cursor.column_names(), Err(Error::CursorComplete)));
}

#[test]
fn execute_while_rows_pending_is_incomplete_execution() {
    let conn = conn();
    let mut cursor = conn.cursor();
    cursor
        .execute("SELECT 1 UNION ALL SELECT 2", ())
        .unwrap();
    let err = cursor.execute("SELECT 3", ()).unwrap_err();
    assert!(matches!(err, Error::IncompleteExecution));
    // reset() force-abandons.
    cursor.reset();
    assert_eq!(
        cursor.execute("SELECT 3", ()).unwrap().fetch_all().unwrap(),
        vec![vec![Value::Integer(3)]]
    );
}

#[test]
fn execute_many_rebinds_per_set() {
    let conn = conn();
    let mut cursor = conn.cursor();
    cursor.execute("CREATE TABLE t(x)", ()).unwrap();
    cursor
        .execute_many(
            "INSERT INTO t VALUES(?)",
            (1i64..=4).map(|i| Ok(Params::positional([i]))),
        )
        .unwrap();
    let rows = cursor
        .execute("SELECT sum(x) FROM t", ())
        .unwrap()
        .fetch_all()
        .unwrap();
    assert_eq!(rows, vec![vec![Value::Integer(10)]]);
}

#[test]
fn execute_many_chains_rows_across_sets() {
    let conn = conn();
    let mut cursor = conn.cursor();
    cursor
        .execute_many(
            "SELECT ?",
            vec![Ok(Params::positional([1i64])), Ok(Params::positional([2i64]))].into_iter(),
        )
        .unwrap();
    assert_eq!(cursor.next_row().unwrap(), Some(vec![Value::Integer(1)]));
    assert_eq!(cursor.next_row().unwrap(), Some(vec![Value::Integer(2)]));
    assert_eq!(cursor.next_row().unwrap(), None);
}

#[test]
fn execute_many_empty_sequence_never_prepares() {
    let conn = conn();
    let mut cursor = conn.cursor();
    // Invalid SQL, but an empty sequence means it is never even parsed.
    cursor
        .execute_many("this is not sql", std::iter::empty::<sqlbridge::Result<Params>>())
        .unwrap();
    assert_eq!(cursor.next_row().unwrap(), None);
}

#[test]
fn execute_many_iterator_error_propagates_after_prior_sets_applied() {
    let conn = conn();
    let mut cursor = conn.cursor();
    cursor.execute("CREATE TABLE t(x)", ()).unwrap();
    let sets = vec![
        Ok(Params::positional([1i64])),
        Err(Error::Usage("bad element".into())),
        Ok(Params::positional([3i64])),
    ];
    let err = cursor
        .execute_many("INSERT INTO t VALUES(?)", sets.into_iter())
        .unwrap_err();
    assert!(matches!(err, Error::Usage(_)));
    let rows = cursor
        .execute("SELECT count(*) FROM t", ())
        .unwrap()
        .fetch_all()
        .unwrap();
    assert_eq!(rows, vec![vec![Value::Integer(1)]]);
}

#[test]
fn exec_trace_abort_leaves_prior_statements_applied() {
    let conn = conn();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    conn.set_exec_trace(Some(Box::new(move |sql, _params| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(!sql.contains("INSERT"))
    })))
    .unwrap();
    let mut cursor = conn.cursor();
    let err = cursor
        .execute("CREATE TABLE t(x); INSERT INTO t VALUES(1)", ())
        .unwrap_err();
    assert!(matches!(err, Error::ExecTraceAbort));
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    conn.set_exec_trace(None).unwrap();
    let rows = conn
        .cursor()
        .execute("SELECT count(*) FROM t", ())
        .unwrap()
        .fetch_all()
        .unwrap();
    assert_eq!(rows, vec![vec![Value::Integer(0)]]);
}

#[test]
fn row_trace_can_suppress_and_replace_rows() {
    let conn = conn();
    conn.set_row_trace(Some(Box::new(|row| {
        match row.first() {
            Some(Value::Integer(x)) if *x % 2 == 0 => Ok(None),
            Some(Value::Integer(x)) => Ok(Some(vec![Value::Integer(x * 100)])),
            _ => Ok(Some(row)),
        }
    })))
    .unwrap();
    let mut cursor = conn.cursor();
    let rows = cursor
        .execute("SELECT 1 UNION ALL SELECT 2 UNION ALL SELECT 3", ())
        .unwrap()
        .fetch_all()
        .unwrap();
    assert_eq!(rows, vec![vec![Value::Integer(100)], vec![Value::Integer(300)]]);
}

#[test]
fn cursor_exec_trace_overrides_the_connection_default() {
    let conn = conn();
    conn.set_exec_trace(Some(Box::new(|_, _| Ok(false)))).unwrap();
    let mut cursor = conn.cursor();
    cursor.set_exec_trace(Some(Box::new(|_, _| Ok(true))));
    assert!(cursor.execute("SELECT 1", ()).is_ok());
    cursor.fetch_all().unwrap();
}

#[test]
fn statement_cache_reuses_and_evicts() {
    let conn = Connection::open_with(":memory:", OpenOptions::new().statement_cache_size(2))
        .unwrap();
    let mut cursor = conn.cursor();
    cursor.execute("SELECT 1", ()).unwrap().fetch_all().unwrap();
    assert_eq!(conn.cached_statement_count(), 1);
    cursor.execute("SELECT 2", ()).unwrap().fetch_all().unwrap();
    assert_eq!(conn.cached_statement_count(), 2);
    cursor.execute("SELECT 3", ()).unwrap().fetch_all().unwrap();
    assert_eq!(conn.cached_statement_count(), 2);
}

#[test]
fn cache_keys_are_exact_text() {
    let conn = conn();
    let mut cursor = conn.cursor();
    cursor.execute("SELECT 1", ()).unwrap().fetch_all().unwrap();
    // Trailing whitespace is a different key, forcing a fresh preparation.
    cursor.execute("SELECT 1 ", ()).unwrap().fetch_all().unwrap();
    assert_eq!(conn.cached_statement_count(), 2);
}

#[test]
fn zero_capacity_disables_the_cache() {
    let conn = Connection::open_with(":memory:", OpenOptions::new().statement_cache_size(0))
        .unwrap();
    let mut cursor = conn.cursor();
    cursor.execute("SELECT 1", ()).unwrap().fetch_all().unwrap();
    cursor.execute("SELECT 1", ()).unwrap().fetch_all().unwrap();
    assert_eq!(conn.cached_statement_count(), 0);
}

#[test]
fn cached_statement_survives_schema_change() {
    let conn = conn();
    let mut cursor = conn.cursor();
    cursor
        .execute("CREATE TABLE t(a); INSERT INTO t VALUES(1)", ())
        .unwrap();
    let rows = cursor
        .execute("SELECT * FROM t", ())
        .unwrap()
        .fetch_all()
        .unwrap();
    assert_eq!(rows, vec![vec![Value::Integer(1)]]);
    cursor
        .execute("ALTER TABLE t ADD COLUMN b DEFAULT 9", ())
        .unwrap();
    // Same text, now against the new shape; re-preparation is transparent.
    let rows = cursor
        .execute("SELECT * FROM t", ())
        .unwrap()
        .fetch_all()
        .unwrap();
    assert_eq!(rows, vec![vec![Value::Integer(1), Value::Integer(9)]]);
}

#[test]
fn changes_and_last_insert_rowid() {
    let conn = conn();
    let mut cursor = conn.cursor();
    cursor
        .execute("CREATE TABLE t(x); INSERT INTO t VALUES(1); INSERT INTO t VALUES(2)", ())
        .unwrap();
    assert_eq!(conn.changes().unwrap(), 1);
    assert_eq!(conn.last_insert_rowid().unwrap(), 2);
    cursor.execute("UPDATE t SET x = x + 1", ()).unwrap();
    assert_eq!(conn.changes().unwrap(), 2);
    assert!(conn.total_changes().unwrap() >= 4);
}

#[test]
fn close_with_pending_rows_refused_unless_forced() {
    let conn = conn();
    let mut cursor = conn.cursor();
    cursor.execute("SELECT 1 UNION ALL SELECT 2", ()).unwrap();
    assert!(matches!(conn.close(), Err(Error::IncompleteExecution)));
    conn.close_force().unwrap();
    assert!(matches!(cursor.next_row(), Err(Error::Usage(_))));
    // Idempotent.
    conn.close_force().unwrap();
}

#[test]
fn use_after_close_fails_fast() {
    let conn = conn();
    conn.close().unwrap();
    assert!(matches!(conn.changes(), Err(Error::Usage(_))));
    assert!(matches!(
        conn.cursor().execute("SELECT 1", ()),
        Err(Error::Usage(_))
    ));
}

#[test]
fn is_complete_recognizes_statement_boundaries() {
    assert!(is_complete("SELECT 1;"));
    assert!(!is_complete("SELECT 1, "));
}

#[test]
fn rows_iterator_yields_each_row() {
    let conn = conn();
    let mut cursor = conn.cursor();
    cursor
        .execute("SELECT 1 UNION ALL SELECT 2", ())
        .unwrap();
    let collected: Result<Vec<_>, _> = cursor.rows().collect();
    assert_eq!(
        collected.unwrap(),
        vec![vec![Value::Integer(1)], vec![Value::Integer(2)]]
    );
}

#[test]
fn on_disk_database_persists_between_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.db");
    {
        let conn = Connection::open(&path).unwrap();
        conn.cursor()
            .execute("CREATE TABLE t(x); INSERT INTO t VALUES(42)", ())
            .unwrap();
        conn.close().unwrap();
    }
    let conn = Connection::open(&path).unwrap();
    let rows = conn
        .cursor()
        .execute("SELECT x FROM t", ())
        .unwrap()
        .fetch_all()
        .unwrap();
    assert_eq!(rows, vec![vec![Value::Integer(42)]]);
}
