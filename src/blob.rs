use libsqlite3_sys as ffi;
use std::ffi::CString;
use std::io::SeekFrom;
use std::os::raw::c_int;
use std::sync::Arc;

use crate::connection::ConnInner;
use crate::error::{Error, Result};

/// Incremental I/O over a single blob cell.
///
/// The channel keeps its own read/write position; the cell's size is fixed at
/// open time (write a zero-filled placeholder first to size it). A channel is
/// invalidated when its row is deleted or the cell is rewritten; operations
/// then fail until [`reopen`] points it at another row.
///
/// [`reopen`]: BlobChannel::reopen
pub struct BlobChannel {
    conn: Arc<ConnInner>,
    blob: *mut ffi::sqlite3_blob,
    pos: usize,
    closed: bool,
}

unsafe impl Send for BlobChannel {}

impl BlobChannel {
    pub(crate) fn open(
        inner: &Arc<ConnInner>,
        database: &str,
        table: &str,
        column: &str,
        rowid: i64,
        writable: bool,
    ) -> Result<Self> {
        let db = inner.db()?;
        let database =
            CString::new(database).map_err(|_| Error::usage("database name contains a NUL byte"))?;
        let table =
            CString::new(table).map_err(|_| Error::usage("table name contains a NUL byte"))?;
        let column =
            CString::new(column).map_err(|_| Error::usage("column name contains a NUL byte"))?;
        let mut blob: *mut ffi::sqlite3_blob = std::ptr::null_mut();
        let rc = unsafe {
            ffi::sqlite3_blob_open(
                db,
                database.as_ptr(),
                table.as_ptr(),
                column.as_ptr(),
                rowid,
                c_int::from(writable),
                &mut blob,
            )
        };
        if rc != ffi::SQLITE_OK {
            // A failed open can still hand back a handle to dispose of.
            if !blob.is_null() {
                unsafe {
                    ffi::sqlite3_blob_close(blob);
                }
            }
            return Err(unsafe { Error::from_handle(db, rc) });
        }
        Ok(Self {
            conn: Arc::clone(inner),
            blob,
            pos: 0,
            closed: false,
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::usage("blob channel is closed"))
        } else {
            Ok(())
        }
    }

    /// Size of the cell in bytes, fixed for the life of the handle.
    pub fn len(&self) -> Result<usize> {
        let conn = Arc::clone(&self.conn);
        let _guard = conn.enter()?;
        self.check_open()?;
        Ok(usize::try_from(unsafe { ffi::sqlite3_blob_bytes(self.blob) }).unwrap_or(0))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Current read/write position.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    /// Move the read/write position; past-the-end positions are refused.
    pub fn set_position(&mut self, pos: usize) -> Result<()> {
        if pos > self.len()? {
            return Err(Error::usage("position past the end of the blob"));
        }
        self.pos = pos;
        Ok(())
    }

    /// Move the position relative to the start, the current position or the
    /// end. Out-of-range targets are refused, never clamped. Returns the new
    /// position.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<usize> {
        let end = i64::try_from(self.len()?)
            .map_err(|_| Error::overflow("blob length exceeds the engine's limit"))?;
        let current = i64::try_from(self.pos)
            .map_err(|_| Error::overflow("blob position exceeds the engine's limit"))?;
        let target = match pos {
            SeekFrom::Start(n) => i64::try_from(n).ok(),
            SeekFrom::Current(n) => current.checked_add(n),
            SeekFrom::End(n) => end.checked_add(n),
        };
        let target = target
            .filter(|t| (0..=end).contains(t))
            .ok_or_else(|| Error::usage("seek target outside the blob"))?;
        self.pos = usize::try_from(target)
            .map_err(|_| Error::usage("seek target outside the blob"))?;
        Ok(self.pos)
    }

    /// Read up to `buf.len()` bytes at the current position, advancing it.
    /// Returns the number of bytes read; zero at the end.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let conn = Arc::clone(&self.conn);
        let _guard = conn.enter()?;
        self.check_open()?;
        let size = usize::try_from(unsafe { ffi::sqlite3_blob_bytes(self.blob) }).unwrap_or(0);
        let available = size.saturating_sub(self.pos);
        let want = buf.len().min(available);
        if want == 0 {
            return Ok(0);
        }
        let len = c_int::try_from(want)
            .map_err(|_| Error::overflow("read length exceeds the engine's limit"))?;
        let offset = c_int::try_from(self.pos)
            .map_err(|_| Error::overflow("blob position exceeds the engine's limit"))?;
        let rc = unsafe { ffi::sqlite3_blob_read(self.blob, buf.as_mut_ptr().cast(), len, offset) };
        if rc != ffi::SQLITE_OK {
            return Err(self.handle_error(rc));
        }
        self.pos += want;
        Ok(want)
    }

    /// Read from the current position to the end.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let remaining = self.len()?.saturating_sub(self.pos);
        let mut buf = vec![0u8; remaining];
        let got = self.read(&mut buf)?;
        buf.truncate(got);
        Ok(buf)
    }

    /// Write `data` at the current position, advancing it. The cell cannot
    /// grow; writes past the end are refused before touching it.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let _guard = conn.enter()?;
        self.check_open()?;
        let size = usize::try_from(unsafe { ffi::sqlite3_blob_bytes(self.blob) }).unwrap_or(0);
        if self.pos + data.len() > size {
            return Err(Error::usage("write extends past the end of the blob"));
        }
        if data.is_empty() {
            return Ok(());
        }
        let len = c_int::try_from(data.len())
            .map_err(|_| Error::overflow("write length exceeds the engine's limit"))?;
        let offset = c_int::try_from(self.pos)
            .map_err(|_| Error::overflow("blob position exceeds the engine's limit"))?;
        let rc = unsafe { ffi::sqlite3_blob_write(self.blob, data.as_ptr().cast(), len, offset) };
        if rc != ffi::SQLITE_OK {
            return Err(self.handle_error(rc));
        }
        self.pos += data.len();
        Ok(())
    }

    /// Point the handle at the same column of another row, resetting the
    /// position. Cheaper than closing and reopening.
    pub fn reopen(&mut self, rowid: i64) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let _guard = conn.enter()?;
        self.check_open()?;
        let rc = unsafe { ffi::sqlite3_blob_reopen(self.blob, rowid) };
        if rc != ffi::SQLITE_OK {
            return Err(self.handle_error(rc));
        }
        self.pos = 0;
        Ok(())
    }

    /// Close the channel. An error committing the final write is reported
    /// here exactly once; a second close is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let conn = Arc::clone(&self.conn);
        let guard = conn.guard_only()?;
        self.closed = true;
        let rc = unsafe { ffi::sqlite3_blob_close(self.blob) };
        self.blob = std::ptr::null_mut();
        drop(guard);
        if rc == ffi::SQLITE_OK || self.conn.is_closed() {
            Ok(())
        } else {
            Err(Error::from_code(rc))
        }
    }

    fn handle_error(&self, rc: c_int) -> Error {
        match self.conn.db() {
            Ok(db) => unsafe { Error::from_handle(db, rc) },
            Err(_) => Error::from_code(rc),
        }
    }
}

impl Drop for BlobChannel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
