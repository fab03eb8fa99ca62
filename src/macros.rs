// src/macros.rs

//
// Crate-internal logging.
//
// With the `logging` feature every level forwards to the matching `tracing`
// macro. Without it, errors still reach stderr and every other level
// compiles to nothing, so arguments used only for logging need a `_` prefix.
//
// Per-frame output belongs at trace level. Protocol anomalies are warnings.
//

#![allow(unused_macros)]

#[cfg(feature = "logging")]
mod imp {
    macro_rules! log_error {
        ($($arg:tt)*) => { tracing::error!($($arg)*) };
    }

    macro_rules! log_warn {
        ($($arg:tt)*) => { tracing::warn!($($arg)*) };
    }

    macro_rules! log_info {
        ($($arg:tt)*) => { tracing::info!($($arg)*) };
    }

    macro_rules! log_debug {
        ($($arg:tt)*) => { tracing::debug!($($arg)*) };
    }

    macro_rules! log_trace {
        ($($arg:tt)*) => { tracing::trace!($($arg)*) };
    }

    pub(crate) use {log_debug, log_error, log_info, log_trace, log_warn};
}

#[cfg(not(feature = "logging"))]
mod imp {
    macro_rules! log_error {
        ($($arg:tt)*) => { eprintln!("kvmux error: {}", format_args!($($arg)*)) };
    }

    macro_rules! log_warn {
        ($($arg:tt)*) => {};
    }

    macro_rules! log_info {
        ($($arg:tt)*) => {};
    }

    macro_rules! log_debug {
        ($($arg:tt)*) => {};
    }

    macro_rules! log_trace {
        ($($arg:tt)*) => {};
    }

    pub(crate) use {log_debug, log_error, log_info, log_trace, log_warn};
}

pub(crate) use imp::{log_debug, log_error, log_info, log_trace, log_warn};
