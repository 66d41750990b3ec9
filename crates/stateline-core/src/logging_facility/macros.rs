//! Canonical logging macros

/// Log the start of a public operation
///
/// ```
/// # use stateline_core::log_op_start;
/// log_op_start!("commit");
/// log_op_start!("persist", class = "Person");
/// ```
#[macro_export]
macro_rules! log_op_start {
    ($op:expr) => {
        tracing::info!(
            component = module_path!(),
            op = $op,
            event = stateline_core_types::schema::EVENT_START,
        );
    };
    ($op:expr, $($field:tt)*) => {
        tracing::info!(
            component = module_path!(),
            op = $op,
            event = stateline_core_types::schema::EVENT_START,
            $($field)*
        );
    };
}

/// Log the successful end of a public operation
///
/// ```
/// # use stateline_core::log_op_end;
/// log_op_end!("commit", duration_ms = 3);
/// ```
#[macro_export]
macro_rules! log_op_end {
    ($op:expr, duration_ms = $duration:expr) => {
        tracing::info!(
            component = module_path!(),
            op = $op,
            event = stateline_core_types::schema::EVENT_END,
            duration_ms = $duration,
        );
    };
    ($op:expr, duration_ms = $duration:expr, $($field:tt)*) => {
        tracing::info!(
            component = module_path!(),
            op = $op,
            event = stateline_core_types::schema::EVENT_END,
            duration_ms = $duration,
            $($field)*
        );
    };
}

/// Log the failed end of a public operation
///
/// The error is classified through [`SlError`](crate::errors::SlError).
///
/// ```
/// # use stateline_core::{log_op_error, errors::StatelineError};
/// let err = StatelineError::ObjectNotFound { identity: "Person#1".to_string() };
/// log_op_error!("find", &err, duration_ms = 1);
/// ```
#[macro_export]
macro_rules! log_op_error {
    ($op:expr, $err:expr, duration_ms = $duration:expr) => {{
        let sl_err: $crate::errors::SlError = ::core::clone::Clone::clone($err).into();
        tracing::error!(
            component = module_path!(),
            op = $op,
            event = stateline_core_types::schema::EVENT_END_ERROR,
            duration_ms = $duration,
            err_kind = ?sl_err.kind(),
            err_code = sl_err.code(),
        );
    }};
    ($op:expr, $err:expr, duration_ms = $duration:expr, $($field:tt)*) => {{
        let sl_err: $crate::errors::SlError = ::core::clone::Clone::clone($err).into();
        tracing::error!(
            component = module_path!(),
            op = $op,
            event = stateline_core_types::schema::EVENT_END_ERROR,
            duration_ms = $duration,
            err_kind = ?sl_err.kind(),
            err_code = sl_err.code(),
            $($field)*
        );
    }};
}
