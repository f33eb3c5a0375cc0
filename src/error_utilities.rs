use crate::error::Result;
use std::io;
use tracing::error;

/// Get the last os error, log with note and return the error
pub(crate) fn log_ret_last_os_err_with_note(note: &str) -> io::Error {
    let err = io::Error::last_os_error();
    if note.is_empty() {
        error!("OS error {:?}", err);
    } else {
        error!("OS error {:?}. Note: {}", err, note);
    }
    err
}

/// Get the last os error, log and return the error
pub(crate) fn log_ret_last_os_err() -> io::Error {
    log_ret_last_os_err_with_note("")
}

/// Get the last os error and just log it
pub(crate) fn log_last_os_err() {
    #[allow(clippy::pedantic)] // errors in `drop` are logged, not propagated
    let _ = log_ret_last_os_err_with_note("");
}

/// Logs an engine result and return it back
pub(crate) fn log_ret<T>(ret: Result<T>, note: &str) -> Result<T> {
    if let Err(ref err) = ret {
        if note.is_empty() {
            error!("{:?}", err);
        } else {
            error!("{:?}. Note: {}", err, note);
        }
    }
    ret
}

/// Logs a provider result that can not be propagated (teardown paths)
pub(crate) fn log_provider_err(ret: io::Result<()>, note: &str) {
    if let Err(err) = ret {
        error!("provider error {:?}. Note: {}", err, note);
    }
}
