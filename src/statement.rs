use libsqlite3_sys as ffi;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int};

use crate::error::{Error, Result};
use crate::value::Value;

/// Owner of one prepared `sqlite3_stmt`.
///
/// Finalizes the handle on drop. All binding is by index and length-prefixed;
/// text and blob cells with embedded zero bytes round-trip exactly.
pub(crate) struct RawStatement {
    stmt: *mut ffi::sqlite3_stmt,
}

unsafe impl Send for RawStatement {}

impl RawStatement {
    /// Prepare the first statement of `sql` against `db`.
    ///
    /// Returns the prepared statement (None when the text is empty or only
    /// whitespace/comments) and the number of bytes of `sql` consumed.
    ///
    /// # Safety
    ///
    /// `db` must be a valid open database handle.
    pub(crate) unsafe fn prepare(db: *mut ffi::sqlite3, sql: &str) -> Result<(Option<Self>, usize)> {
        let mut stmt: *mut ffi::sqlite3_stmt = std::ptr::null_mut();
        let mut tail: *const c_char = std::ptr::null();
        let len = c_int::try_from(sql.len())
            .map_err(|_| Error::overflow("SQL text exceeds the engine's length limit"))?;
        let rc = unsafe {
            ffi::sqlite3_prepare_v2(
                db,
                sql.as_ptr().cast::<c_char>(),
                len,
                &mut stmt,
                &mut tail,
            )
        };
        if rc != ffi::SQLITE_OK {
            return Err(unsafe { Error::from_handle(db, rc) });
        }
        let consumed = if tail.is_null() {
            sql.len()
        } else {
            usize::try_from(unsafe { tail.offset_from(sql.as_ptr().cast::<c_char>()) })
                .unwrap_or(sql.len())
        };
        if stmt.is_null() {
            Ok((None, consumed))
        } else {
            Ok((Some(Self { stmt }), consumed))
        }
    }

    pub(crate) fn as_ptr(&self) -> *mut ffi::sqlite3_stmt {
        self.stmt
    }

    pub(crate) fn step(&self) -> c_int {
        unsafe { ffi::sqlite3_step(self.stmt) }
    }

    pub(crate) fn reset(&self) {
        unsafe {
            ffi::sqlite3_reset(self.stmt);
        }
    }

    pub(crate) fn clear_bindings(&self) {
        unsafe {
            ffi::sqlite3_clear_bindings(self.stmt);
        }
    }

    pub(crate) fn bind_parameter_count(&self) -> usize {
        usize::try_from(unsafe { ffi::sqlite3_bind_parameter_count(self.stmt) }).unwrap_or(0)
    }

    /// Name of the 1-based parameter `index`, None for positional `?` forms.
    pub(crate) fn bind_parameter_name(&self, index: usize) -> Option<String> {
        let index = c_int::try_from(index).ok()?;
        let name = unsafe { ffi::sqlite3_bind_parameter_name(self.stmt, index) };
        if name.is_null() {
            None
        } else {
            Some(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
        }
    }

    /// Bind `value` at the 1-based parameter `index`.
    pub(crate) fn bind_value(&self, db: *mut ffi::sqlite3, index: usize, value: &Value) -> Result<()> {
        let idx = c_int::try_from(index)
            .map_err(|_| Error::overflow("binding index exceeds the engine's limit"))?;
        let rc = match value {
            Value::Null => unsafe { ffi::sqlite3_bind_null(self.stmt, idx) },
            Value::Integer(i) => unsafe { ffi::sqlite3_bind_int64(self.stmt, idx, *i) },
            Value::Real(f) => unsafe { ffi::sqlite3_bind_double(self.stmt, idx, *f) },
            Value::Text(s) => {
                let len = c_int::try_from(s.len())
                    .map_err(|_| Error::overflow("text value exceeds the engine's length limit"))?;
                unsafe {
                    ffi::sqlite3_bind_text(
                        self.stmt,
                        idx,
                        s.as_ptr().cast::<c_char>(),
                        len,
                        ffi::SQLITE_TRANSIENT(),
                    )
                }
            }
            Value::Blob(b) => {
                let len = c_int::try_from(b.len())
                    .map_err(|_| Error::overflow("blob value exceeds the engine's length limit"))?;
                unsafe {
                    ffi::sqlite3_bind_blob(
                        self.stmt,
                        idx,
                        b.as_ptr().cast(),
                        len,
                        ffi::SQLITE_TRANSIENT(),
                    )
                }
            }
            Value::ZeroBlob(n) => unsafe { ffi::sqlite3_bind_zeroblob(self.stmt, idx, *n) },
        };
        if rc == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(unsafe { Error::from_handle(db, rc) })
        }
    }

    pub(crate) fn column_count(&self) -> usize {
        usize::try_from(unsafe { ffi::sqlite3_column_count(self.stmt) }).unwrap_or(0)
    }

    pub(crate) fn column_name(&self, index: usize) -> Option<String> {
        let index = c_int::try_from(index).ok()?;
        let name = unsafe { ffi::sqlite3_column_name(self.stmt, index) };
        if name.is_null() {
            None
        } else {
            Some(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
        }
    }

    /// Declared type of the column, None for expressions.
    pub(crate) fn column_decltype(&self, index: usize) -> Option<String> {
        let index = c_int::try_from(index).ok()?;
        let decl = unsafe { ffi::sqlite3_column_decltype(self.stmt, index) };
        if decl.is_null() {
            None
        } else {
            Some(unsafe { CStr::from_ptr(decl) }.to_string_lossy().into_owned())
        }
    }

    /// Read back the cell in column `index` of the current row; the exact
    /// inverse of binding.
    pub(crate) fn column_value(&self, index: usize) -> Result<Value> {
        let idx = c_int::try_from(index)
            .map_err(|_| Error::usage("column index out of range"))?;
        let kind = unsafe { ffi::sqlite3_column_type(self.stmt, idx) };
        match kind {
            ffi::SQLITE_NULL => Ok(Value::Null),
            ffi::SQLITE_INTEGER => Ok(Value::Integer(unsafe {
                ffi::sqlite3_column_int64(self.stmt, idx)
            })),
            ffi::SQLITE_FLOAT => Ok(Value::Real(unsafe {
                ffi::sqlite3_column_double(self.stmt, idx)
            })),
            ffi::SQLITE_TEXT => {
                let ptr = unsafe { ffi::sqlite3_column_text(self.stmt, idx) };
                let len =
                    usize::try_from(unsafe { ffi::sqlite3_column_bytes(self.stmt, idx) })
                        .unwrap_or(0);
                if ptr.is_null() {
                    return Ok(Value::Text(String::new()));
                }
                let bytes = unsafe { std::slice::from_raw_parts(ptr.cast::<u8>(), len) };
                let text = std::str::from_utf8(bytes)
                    .map_err(|e| Error::Decode(format!("engine returned invalid UTF-8 text: {e}")))?;
                Ok(Value::Text(text.to_owned()))
            }
            ffi::SQLITE_BLOB => {
                let ptr = unsafe { ffi::sqlite3_column_blob(self.stmt, idx) };
                let len =
                    usize::try_from(unsafe { ffi::sqlite3_column_bytes(self.stmt, idx) })
                        .unwrap_or(0);
                if ptr.is_null() || len == 0 {
                    return Ok(Value::Blob(Vec::new()));
                }
                let bytes = unsafe { std::slice::from_raw_parts(ptr.cast::<u8>(), len) };
                Ok(Value::Blob(bytes.to_vec()))
            }
            other => Err(Error::Type(format!("engine returned unknown cell type {other}"))),
        }
    }
}

impl Drop for RawStatement {
    fn drop(&mut self) {
        if !self.stmt.is_null() {
            unsafe {
                ffi::sqlite3_finalize(self.stmt);
            }
            self.stmt = std::ptr::null_mut();
        }
    }
}
