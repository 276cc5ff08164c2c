//! Probe output is arbitrary; Postgres `TEXT` is not. Anything a probe says goes through here
//! before it is persisted.

use std::borrow::Cow;

/// Removes NUL characters. Clean input is returned as-is, without allocating.
pub fn sanitize(input: &str) -> Cow<'_, str> {
    if input.contains('\0') {
        Cow::Owned(input.replace('\0', ""))
    } else {
        Cow::Borrowed(input)
    }
}

/// Like [sanitize], but for raw bytes: invalid UTF-8 sequences become U+FFFD.
pub fn sanitize_bytes(input: &[u8]) -> String {
    sanitize(&String::from_utf8_lossy(input)).into_owned()
}
