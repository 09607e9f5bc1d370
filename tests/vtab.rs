// Virtual-table protocol: module lifecycle, scans, row changes.

use sqlbridge::vtab::{Change, IndexInfo, VTab, VTabCursor, VTabModule};
use sqlbridge::{Connection, Error, Result, Value};
use std::sync::{Arc, Mutex};

type SharedRows = Arc<Mutex<Vec<(i64, String)>>>;

/// A writable single-column table over a shared in-memory vector.
struct WordsModule {
    rows: SharedRows,
}

struct WordsTable {
    rows: SharedRows,
}

struct WordsCursor {
    snapshot: Vec<(i64, String)>,
    pos: usize,
}

impl VTabModule for WordsModule {
    type Table = WordsTable;

    fn create(&self, _args: &[String]) -> Result<(String, Self::Table)> {
        Ok((
            "CREATE TABLE x(word TEXT)".to_owned(),
            WordsTable {
                rows: Arc::clone(&self.rows),
            },
        ))
    }
}

impl VTab for WordsTable {
    type Cursor = WordsCursor;

    fn best_index(&mut self, info: &mut IndexInfo) -> Result<()> {
        info.set_estimated_cost(1000.0);
        Ok(())
    }

    fn open(&mut self) -> Result<Self::Cursor> {
        Ok(WordsCursor {
            snapshot: self.rows.lock().unwrap().clone(),
            pos: 0,
        })
    }

    fn update(&mut self, change: Change) -> Result<Option<i64>> {
        let mut rows = self.rows.lock().unwrap();
        match change {
            Change::Delete { rowid } => {
                rows.retain(|(id, _)| *id != rowid);
                Ok(None)
            }
            Change::Insert { rowid, values } => {
                let word = values[0].as_text()?.to_owned();
                let id = rowid
                    .unwrap_or_else(|| rows.iter().map(|(id, _)| *id).max().unwrap_or(0) + 1);
                rows.push((id, word));
                Ok(Some(id))
            }
            Change::Update {
                rowid,
                new_rowid,
                values,
            } => {
                let word = values[0].as_text()?.to_owned();
                for row in rows.iter_mut() {
                    if row.0 == rowid {
                        row.0 = new_rowid.unwrap_or(rowid);
                        row.1 = word;
                        break;
                    }
                }
                Ok(None)
            }
        }
    }
}

impl VTabCursor for WordsCursor {
    fn filter(&mut self, _index_num: i32, _index_str: Option<&str>, _args: &[Value]) -> Result<()> {
        self.pos = 0;
        Ok(())
    }

    fn eof(&self) -> bool {
        self.pos >= self.snapshot.len()
    }

    fn column(&self, index: usize) -> Result<Value> {
        if index != 0 {
            return Err(Error::Usage("column index out of range".into()));
        }
        Ok(Value::Text(self.snapshot[self.pos].1.clone()))
    }

    fn rowid(&self) -> Result<i64> {
        Ok(self.snapshot[self.pos].0)
    }

    fn next(&mut self) -> Result<()> {
        self.pos += 1;
        Ok(())
    }
}

/// Same shape, but creation always fails.
struct RefusingModule;

impl VTabModule for RefusingModule {
    type Table = WordsTable;

    fn create(&self, _args: &[String]) -> Result<(String, Self::Table)> {
        Err(Error::Usage("table creation refused".into()))
    }
}

/// Read-only table: no `update` override.
struct FixedModule;

struct FixedTable;

impl VTabModule for FixedModule {
    type Table = FixedTable;

    fn create(&self, _args: &[String]) -> Result<(String, Self::Table)> {
        Ok(("CREATE TABLE x(n INTEGER)".to_owned(), FixedTable))
    }
}

impl VTab for FixedTable {
    type Cursor = FixedCursor;

    fn best_index(&mut self, _info: &mut IndexInfo) -> Result<()> {
        Ok(())
    }

    fn open(&mut self) -> Result<Self::Cursor> {
        Ok(FixedCursor { pos: 0 })
    }
}

struct FixedCursor {
    pos: i64,
}

impl VTabCursor for FixedCursor {
    fn filter(&mut self, _index_num: i32, _index_str: Option<&str>, _args: &[Value]) -> Result<()> {
        self.pos = 0;
        Ok(())
    }

    fn eof(&self) -> bool {
        self.pos >= 3
    }

    fn column(&self, _index: usize) -> Result<Value> {
        Ok(Value::Integer(self.pos * 10))
    }

    fn rowid(&self) -> Result<i64> {
        Ok(self.pos)
    }

    fn next(&mut self) -> Result<()> {
        self.pos += 1;
        Ok(())
    }
}

fn shared(words: &[&str]) -> SharedRows {
    Arc::new(Mutex::new(
        words
            .iter()
            .enumerate()
            .map(|(i, w)| (i64::try_from(i).unwrap() + 1, (*w).to_owned()))
            .collect(),
    ))
}

#[test]
fn scan_sees_the_backing_rows() {
    let conn = Connection::open_in_memory().unwrap();
    conn.register_module("words", WordsModule { rows: shared(&["hello", "world"]) })
        .unwrap();
    let mut cursor = conn.cursor();
    cursor
        .execute("CREATE VIRTUAL TABLE vt USING words", ())
        .unwrap();
    let rows = cursor
        .execute("SELECT word FROM vt ORDER BY rowid", ())
        .unwrap()
        .fetch_all()
        .unwrap();
    assert_eq!(
        rows,
        vec![
            vec![Value::Text("hello".into())],
            vec![Value::Text("world".into())],
        ]
    );
}

#[test]
fn failing_create_propagates_and_creates_nothing() {
    let conn = Connection::open_in_memory().unwrap();
    conn.register_module("refusing", RefusingModule).unwrap();
    let err = conn
        .cursor()
        .execute("CREATE VIRTUAL TABLE vt USING refusing", ())
        .unwrap_err();
    match err {
        Error::Usage(message) => assert_eq!(message, "table creation refused"),
        other => panic!("expected the host error back, got {other:?}"),
    }
    let rows = conn
        .cursor()
        .execute("SELECT count(*) FROM sqlite_master WHERE name = 'vt'", ())
        .unwrap()
        .fetch_all()
        .unwrap();
    assert_eq!(rows, vec![vec![Value::Integer(0)]]);
}

#[test]
fn insert_update_delete_flow_through_update() {
    let conn = Connection::open_in_memory().unwrap();
    let rows = shared(&[]);
    conn.register_module("words", WordsModule { rows: Arc::clone(&rows) })
        .unwrap();
    let mut cursor = conn.cursor();
    cursor
        .execute("CREATE VIRTUAL TABLE vt USING words", ())
        .unwrap();

    cursor
        .execute("INSERT INTO vt(word) VALUES('alpha')", ())
        .unwrap();
    // The table assigned the rowid and reported it back.
    assert_eq!(conn.last_insert_rowid().unwrap(), 1);
    cursor
        .execute("INSERT INTO vt(rowid, word) VALUES(7, 'beta')", ())
        .unwrap();

    cursor
        .execute("UPDATE vt SET word = 'ALPHA' WHERE rowid = 1", ())
        .unwrap();
    cursor.execute("DELETE FROM vt WHERE rowid = 7", ()).unwrap();

    let state = rows.lock().unwrap().clone();
    assert_eq!(state, vec![(1, "ALPHA".to_owned())]);
}

#[test]
fn tables_without_update_are_read_only() {
    let conn = Connection::open_in_memory().unwrap();
    conn.register_module("fixed", FixedModule).unwrap();
    let mut cursor = conn.cursor();
    cursor
        .execute("CREATE VIRTUAL TABLE vt USING fixed", ())
        .unwrap();
    let rows = cursor
        .execute("SELECT n FROM vt", ())
        .unwrap()
        .fetch_all()
        .unwrap();
    assert_eq!(rows.len(), 3);
    let err = cursor
        .execute("INSERT INTO vt(n) VALUES(1)", ())
        .unwrap_err();
    assert!(matches!(err, Error::Usage(_)));
}

/// Destroy errors are absorbed; dropping the table succeeds anyway.
struct FragileModule;

struct FragileTable;

impl VTabModule for FragileModule {
    type Table = FragileTable;

    fn create(&self, _args: &[String]) -> Result<(String, Self::Table)> {
        Ok(("CREATE TABLE x(n INTEGER)".to_owned(), FragileTable))
    }
}

impl VTab for FragileTable {
    type Cursor = FixedCursor;

    fn best_index(&mut self, _info: &mut IndexInfo) -> Result<()> {
        Ok(())
    }

    fn open(&mut self) -> Result<Self::Cursor> {
        Ok(FixedCursor { pos: 0 })
    }

    fn destroy(&mut self) -> Result<()> {
        Err(Error::Usage("refusing to be dropped".into()))
    }
}

#[test]
fn destroy_errors_are_absorbed() {
    let conn = Connection::open_in_memory().unwrap();
    conn.register_module("fragile", FragileModule).unwrap();
    let mut cursor = conn.cursor();
    cursor
        .execute("CREATE VIRTUAL TABLE vt USING fragile", ())
        .unwrap();
    cursor.execute("DROP TABLE vt", ()).unwrap();
    let rows = cursor
        .execute("SELECT count(*) FROM sqlite_master WHERE name = 'vt'", ())
        .unwrap()
        .fetch_all()
        .unwrap();
    assert_eq!(rows, vec![vec![Value::Integer(0)]]);
}

/// Disconnect errors are absorbed; the connection closes anyway.
struct ClingyModule;

struct ClingyTable;

impl VTabModule for ClingyModule {
    type Table = ClingyTable;

    fn create(&self, _args: &[String]) -> Result<(String, Self::Table)> {
        Ok(("CREATE TABLE x(n INTEGER)".to_owned(), ClingyTable))
    }
}

impl VTab for ClingyTable {
    type Cursor = FixedCursor;

    fn best_index(&mut self, _info: &mut IndexInfo) -> Result<()> {
        Ok(())
    }

    fn open(&mut self) -> Result<Self::Cursor> {
        Ok(FixedCursor { pos: 0 })
    }

    fn disconnect(&mut self) -> Result<()> {
        Err(Error::Usage("refusing to detach".into()))
    }
}

#[test]
fn disconnect_errors_are_absorbed_at_close() {
    let conn = Connection::open_in_memory().unwrap();
    conn.register_module("clingy", ClingyModule).unwrap();
    let mut cursor = conn.cursor();
    cursor
        .execute("CREATE VIRTUAL TABLE vt USING clingy", ())
        .unwrap();
    let rows = cursor
        .execute("SELECT n FROM vt", ())
        .unwrap()
        .fetch_all()
        .unwrap();
    assert_eq!(rows.len(), 3);
    drop(cursor);
    // The table detaches during close; its refusal is not the caller's
    // problem.
    conn.close().unwrap();
}

#[test]
fn module_registration_refused_mid_statement() {
    let conn = Connection::open_in_memory().unwrap();
    let mut cursor = conn.cursor();
    cursor.execute("SELECT 1 UNION ALL SELECT 2", ()).unwrap();
    let err = conn
        .register_module("late", FixedModule)
        .unwrap_err();
    assert!(matches!(err, Error::Busy(_)));
    cursor.fetch_all().unwrap();
}
