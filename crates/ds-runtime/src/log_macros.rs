/// Domain-aware logging macros.
///
/// Each macro injects a `domain` field so log filters and the plain-text
/// formatter can group events by subsystem: `sys`, `sched`, `ckpt`, `conf`,
/// `res`.
///
/// ```ignore
/// ds_info!(sys, batch_ms = 500, "streaming context started");
/// ds_warn!(sched, time = %t, error = %e, "output action failed");
/// ds_debug!(ckpt, path = %p.display(), "checkpoint written");
/// ```
///
/// The domain is a bare identifier, converted to a `&str` by the macro.

#[doc(hidden)]
macro_rules! ds_log {
    ($level:ident, $domain:ident, $($field:tt)*) => {
        tracing::$level!(domain = stringify!($domain), $($field)*)
    };
}

/// Log at ERROR level with an automatic `domain` field.
macro_rules! ds_error {
    ($domain:ident, $($rest:tt)*) => {
        ds_log!(error, $domain, $($rest)*)
    };
}

/// Log at WARN level with an automatic `domain` field.
macro_rules! ds_warn {
    ($domain:ident, $($rest:tt)*) => {
        ds_log!(warn, $domain, $($rest)*)
    };
}

/// Log at INFO level with an automatic `domain` field.
macro_rules! ds_info {
    ($domain:ident, $($rest:tt)*) => {
        ds_log!(info, $domain, $($rest)*)
    };
}

/// Log at DEBUG level with an automatic `domain` field.
macro_rules! ds_debug {
    ($domain:ident, $($rest:tt)*) => {
        ds_log!(debug, $domain, $($rest)*)
    };
}

/// Log at TRACE level with an automatic `domain` field.
#[allow(unused_macros)]
macro_rules! ds_trace {
    ($domain:ident, $($rest:tt)*) => {
        ds_log!(trace, $domain, $($rest)*)
    };
}
