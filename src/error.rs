// =============================================================================
// ERRORS - Shared failure taxonomy for every fallible RHI call
// =============================================================================
//
// Fallible operations return `RhiResult<T>`. Programmer errors (opening a pass
// while another one is open, drawing outside a render pass, ...) are not part
// of this taxonomy: they go through `check_precondition!` and are fatal when
// validation is enabled.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RhiError {
    /// Malformed descriptor, unresolvable binding slot, invalid format for the declared usage.
    #[error("Bad arguments: {0}")]
    BadArguments(String),

    /// The native API call failed (allocation failure, device removed, driver rejection).
    #[error("Platform call failed: {0}")]
    BadPlatformCall(String),

    /// Feature or usage requested beyond backend or hardware capability.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// The operation was cancelled before it could finish.
    #[error("Operation interrupted")]
    Interrupted,
}

pub type RhiResult<T> = std::result::Result<T, RhiError>;

impl RhiError {
    pub fn bad_arguments(msg: impl Into<String>) -> Self {
        Self::BadArguments(msg.into())
    }

    pub fn bad_platform_call(msg: impl Into<String>) -> Self {
        Self::BadPlatformCall(msg.into())
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }
}

/// Fatal check for programmer errors.
///
/// The first argument is the validation switch of the owning object; when it is
/// off the check compiles down to a branch on a constant-ish bool and nothing else.
macro_rules! check_precondition {
    ($validate:expr, $cond:expr, $($arg:tt)+) => {
        if $validate && !($cond) {
            panic!($($arg)+);
        }
    };
}

pub(crate) use check_precondition;
