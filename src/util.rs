use std::os::fd::{AsFd, AsRawFd};

use thiserror::Error;

/// Formats a string like "/proc/self/fd/3" for the given fd.  This can be used to work with kernel
/// APIs that don't directly accept file descriptors.
///
/// This call never fails.
pub(crate) fn proc_self_fd(fd: impl AsFd) -> String {
    format!("/proc/self/fd/{}", fd.as_fd().as_raw_fd())
}

/// The string is not a recognized boolean token.
#[derive(Debug, Error)]
#[error("not a boolean value: {0:?}")]
pub struct ParseBoolError(pub String);

/// Parse a boolean the way shell-ish configuration spells them: "1", "yes",
/// "y", "true", "t" and "on" are true; "0", "no", "n", "false", "f" and
/// "off" are false.  Matching is case-insensitive, but no whitespace is
/// stripped.
pub fn parse_boolean(s: &str) -> Result<bool, ParseBoolError> {
    const TRUTHY: [&str; 6] = ["1", "yes", "y", "true", "t", "on"];
    const FALSY: [&str; 6] = ["0", "no", "n", "false", "f", "off"];

    if TRUTHY.iter().any(|t| s.eq_ignore_ascii_case(t)) {
        Ok(true)
    } else if FALSY.iter().any(|t| s.eq_ignore_ascii_case(t)) {
        Ok(false)
    } else {
        Err(ParseBoolError(s.to_string()))
    }
}
