//! Macros used across the runtime core.

/// Reports an unrecoverable runtime error and aborts the process.
///
/// Unwinding is not an option on the paths that use this macro (they run
/// under the unwinder, inside a scheduler switch, or hold raw table
/// state), so the failure is reported on stderr with its location and the
/// process is taken down hard.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        tracing::error!(target: "keel", "{}", message);
        eprintln!("{}:{}: fatal: {}", file!(), line!(), message);
        std::process::abort()
    }};
}
