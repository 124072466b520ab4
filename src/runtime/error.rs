/// Errors of a debuggee connection.
///
/// Transport failures and replies the adapter cannot interpret. Negative debugger
/// outcomes (rejected breakpoint, unknown subroutine, missing module) are part of the
/// regular results of [`super::RuntimeConnection`] operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("debuggee connection closed")]
    ConnectionClosed,
    #[error("unexpected debuggee reply to `{command}`: {reply:?}")]
    UnexpectedReply { command: String, reply: String },
}

impl Error {
    /// Return true if connection is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::IO(_) => true,
            Error::ConnectionClosed => true,
            Error::UnexpectedReply { .. } => false,
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "runtime", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "runtime", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
