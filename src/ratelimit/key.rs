//! Rate limit key construction.

use std::fmt;
use std::net::IpAddr;

/// Delimiter the store uses between key segments.
const SEGMENT_DELIMITER: char = ':';
/// Stand-in for delimiters found inside a key value.
const DELIMITER_PLACEHOLDER: char = '_';

/// Namespace for keys derived from a caller's network address.
pub const IP_NAMESPACE: &str = "ip";

/// A key that uniquely identifies the entity being throttled.
///
/// The key is `<namespace>:<value>` where every delimiter inside the value
/// has been replaced, so a value can never forge extra segments. The same
/// input always yields the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    /// Create a key for `value` under `namespace`.
    pub fn new(namespace: &str, value: &str) -> Self {
        let value: String = value
            .chars()
            .map(|c| {
                if c == SEGMENT_DELIMITER {
                    DELIMITER_PLACEHOLDER
                } else {
                    c
                }
            })
            .collect();

        Self(format!("{}{}{}", namespace, SEGMENT_DELIMITER, value))
    }

    /// Key for a caller identified by its network address.
    pub fn from_ip(ip: IpAddr) -> Self {
        Self::new(IP_NAMESPACE, &ip.to_string())
    }

    /// Key shared by callers whose address could not be determined.
    pub fn unknown_ip() -> Self {
        Self::new(IP_NAMESPACE, "unknown")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for RateLimitKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
