//! Helper macros for logging (console printing).

/// Log TRACE message.
#[macro_export]
macro_rules! pf_trace {
    ($($fmt_arg:tt)*) => {
        log::trace!($($fmt_arg)*)
    };
}

/// Log DEBUG message.
#[macro_export]
macro_rules! pf_debug {
    ($($fmt_arg:tt)*) => {
        log::debug!($($fmt_arg)*)
    };
}

/// Log INFO message.
#[macro_export]
macro_rules! pf_info {
    ($($fmt_arg:tt)*) => {
        log::info!($($fmt_arg)*)
    };
}

/// Log WARN message.
#[macro_export]
macro_rules! pf_warn {
    ($($fmt_arg:tt)*) => {
        log::warn!($($fmt_arg)*)
    };
}

/// Log ERROR message.
#[macro_export]
macro_rules! pf_error {
    ($($fmt_arg:tt)*) => {
        log::error!($($fmt_arg)*)
    };
}

/// Log an error string to logger and then return a `ReplSetError` carrying
/// the given error code and the same string.
///
/// Example:
/// ```ignore
/// let e = logged_err!(ErrorCode::NodeNotFound; "member {} not found", id);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($code:expr; $fmt_str:literal) => {{
        pf_error!($fmt_str);
        Err(ReplSetError($code, $fmt_str.into()))
    }};

    ($code:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {{
        pf_error!($fmt_str, $($fmt_arg)*);
        Err(ReplSetError($code, format!($fmt_str, $($fmt_arg)*)))
    }};
}
