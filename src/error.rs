use libsqlite3_sys as ffi;
use std::ffi::CStr;
use thiserror::Error;

/// Driver error taxonomy.
///
/// Every variant can report the engine's primary and extended result codes
/// through [`Error::primary_code`] and [`Error::extended_code`], including the
/// variants that originate on the host side of the bridge.
#[derive(Error, Debug)]
pub enum Error {
    #[error("API misuse: {0}")]
    Usage(String),
    #[error("incorrect number of bindings: statement uses {expected} and there are {supplied} supplied")]
    BindingsMismatch { expected: usize, supplied: usize },
    #[error("bindings are named but one or more parameters are positional")]
    BindingsType,
    #[error("cannot start a new execution with unread result rows pending")]
    IncompleteExecution,
    #[error("resource is busy: {0}")]
    Busy(String),
    #[error("operation was interrupted")]
    Interrupted,
    #[error("value out of range: {0}")]
    Overflow(String),
    #[error("invalid text encoding: {0}")]
    Decode(String),
    #[error("unsupported or mismatched value type: {0}")]
    Type(String),
    #[error("authorization denied{}", action.as_deref().map(|a| format!(" for {a}")).unwrap_or_default())]
    AuthorizationDenied { action: Option<String> },
    #[error("extension loading failed: {0}")]
    ExtensionLoading(String),
    #[error("object is being used concurrently from another thread")]
    ThreadingViolation,
    #[error("execution aborted by exec trace")]
    ExecTraceAbort,
    #[error("cursor execution is complete")]
    CursorComplete,
    #[error("SQL engine error {code}: {message}")]
    Sqlite {
        code: i32,
        extended: i32,
        message: String,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Primary engine result code associated with this error.
    #[must_use]
    pub fn primary_code(&self) -> i32 {
        match self {
            Self::Usage(_) | Self::CursorComplete => ffi::SQLITE_MISUSE,
            Self::BindingsMismatch { .. } | Self::BindingsType => ffi::SQLITE_RANGE,
            Self::IncompleteExecution | Self::ThreadingViolation => ffi::SQLITE_MISUSE,
            Self::Busy(_) => ffi::SQLITE_BUSY,
            Self::Interrupted => ffi::SQLITE_INTERRUPT,
            Self::Overflow(_) => ffi::SQLITE_TOOBIG,
            Self::Decode(_) | Self::Type(_) => ffi::SQLITE_MISMATCH,
            Self::AuthorizationDenied { .. } => ffi::SQLITE_AUTH,
            Self::ExtensionLoading(_) | Self::ExecTraceAbort => ffi::SQLITE_ABORT,
            Self::Sqlite { code, .. } => *code,
        }
    }

    /// Extended engine result code; equals the primary code when the engine
    /// did not report anything finer grained.
    #[must_use]
    pub fn extended_code(&self) -> i32 {
        match self {
            Self::Sqlite { extended, .. } => *extended,
            other => other.primary_code(),
        }
    }

    pub(crate) fn overflow(what: impl Into<String>) -> Self {
        Self::Overflow(what.into())
    }

    pub(crate) fn usage(what: impl Into<String>) -> Self {
        Self::Usage(what.into())
    }

    /// Build an engine-passthrough error from a bare result code, without a
    /// database handle to consult for a message.
    pub(crate) fn from_code(code: i32) -> Self {
        match code & 0xff {
            ffi::SQLITE_BUSY | ffi::SQLITE_LOCKED => {
                Self::Busy(code_message(code).to_string())
            }
            ffi::SQLITE_INTERRUPT => Self::Interrupted,
            ffi::SQLITE_AUTH => Self::AuthorizationDenied { action: None },
            _ => Self::Sqlite {
                code: code & 0xff,
                extended: code,
                message: code_message(code).to_string(),
            },
        }
    }

    /// Build an engine-passthrough error, pulling the message and extended
    /// code from the connection that produced it.
    ///
    /// # Safety
    ///
    /// `db` must be a valid open database handle.
    pub(crate) unsafe fn from_handle(db: *mut ffi::sqlite3, code: i32) -> Self {
        if db.is_null() {
            return Self::from_code(code);
        }
        let extended = unsafe { ffi::sqlite3_extended_errcode(db) };
        let extended = if extended == 0 { code } else { extended };
        let message = unsafe {
            let msg = ffi::sqlite3_errmsg(db);
            if msg.is_null() {
                code_message(code).to_string()
            } else {
                CStr::from_ptr(msg).to_string_lossy().into_owned()
            }
        };
        match code & 0xff {
            ffi::SQLITE_BUSY | ffi::SQLITE_LOCKED => Self::Busy(message),
            ffi::SQLITE_INTERRUPT => Self::Interrupted,
            ffi::SQLITE_AUTH => Self::AuthorizationDenied { action: None },
            primary => Self::Sqlite {
                code: primary,
                extended,
                message,
            },
        }
    }
}

fn code_message(code: i32) -> &'static str {
    unsafe {
        let msg = ffi::sqlite3_errstr(code);
        if msg.is_null() {
            "unknown error"
        } else {
            CStr::from_ptr(msg).to_str().unwrap_or("unknown error")
        }
    }
}
