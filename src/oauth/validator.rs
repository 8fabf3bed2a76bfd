//! Character-class checks for request fields (RFC 6749 Appendix A).
//!
//! Every check fails on empty input.

use regex::Regex;
use std::sync::LazyLock;

static NCHAR: LazyLock<Regex> = LazyLock::new(|| compile(r"^[\-._A-Za-z0-9]+$"));
static NQCHAR: LazyLock<Regex> = LazyLock::new(|| compile(r"^[\x21\x23-\x5B\x5D-\x7E]+$"));
static NQSCHAR: LazyLock<Regex> = LazyLock::new(|| compile(r"^[\x20-\x21\x23-\x5B\x5D-\x7E]+$"));
static UCHAR: LazyLock<Regex> = LazyLock::new(|| {
    compile(r"^[\x09\x20-\x7E\x{80}-\x{D7FF}\x{E000}-\x{FFFD}\x{10000}-\x{10FFFF}]+$")
});
static URI: LazyLock<Regex> = LazyLock::new(|| compile(r"^[A-Za-z][A-Za-z0-9+.\-]+:"));
static VSCHAR: LazyLock<Regex> = LazyLock::new(|| compile(r"^[\x20-\x7E]+$"));

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static validator pattern")
}

/// Unreserved token characters, used for `grant_type`.
pub fn nchar(value: &str) -> bool {
    NCHAR.is_match(value)
}

/// Quote-safe characters without space.
pub fn nqchar(value: &str) -> bool {
    NQCHAR.is_match(value)
}

/// Quote-safe characters including space, used for `scope`.
pub fn nqschar(value: &str) -> bool {
    NQSCHAR.is_match(value)
}

/// Unicode without CR/LF, used for `username`, `password` and `requestId`.
pub fn uchar(value: &str) -> bool {
    UCHAR.is_match(value)
}

/// Absolute URI prefix, used for extension grant types.
pub fn uri(value: &str) -> bool {
    URI.is_match(value)
}

/// Printable ASCII, used for client credentials and refresh tokens.
pub fn vschar(value: &str) -> bool {
    VSCHAR.is_match(value)
}
