//! Utility functions and helpers

/// Fold a nickname or channel name using RFC 1459 case mapping
///
/// `[]\~` are the lowercase forms of `{}|^`, on top of ASCII folding.
pub fn irc_to_lower(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '[' => '{',
            ']' => '}',
            '\\' => '|',
            '~' => '^',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

/// Case-insensitive comparison under RFC 1459 case mapping
pub fn irc_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && irc_to_lower(a) == irc_to_lower(b)
}

/// Current unix time in seconds
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// String utilities
pub mod string {
    /// Check if a string is a valid IRC channel name
    pub fn is_valid_channel_name(name: &str) -> bool {
        let Some(first) = name.chars().next() else {
            return false;
        };

        if !"#&".contains(first) || name.len() < 2 || name.len() > 200 {
            return false;
        }

        !name.chars().any(|c| c == ' ' || c == ',' || c == '\x07' || c.is_control())
    }

    /// Check if a string is a valid TS6 server id
    pub fn is_valid_sid(sid: &str) -> bool {
        let bytes = sid.as_bytes();
        bytes.len() == 3
            && bytes[0].is_ascii_digit()
            && bytes[1..].iter().all(|b| b.is_ascii_digit() || b.is_ascii_uppercase())
    }

    /// Check if a string looks like a TS6 user id (SID followed by six characters)
    pub fn is_uid(s: &str) -> bool {
        s.len() == 9 && s.is_ascii() && is_valid_sid(&s[..3]) && s[3..].bytes().all(|b| b.is_ascii_alphanumeric())
    }
}

/// Non-fatal assertion for internal invariants
///
/// Logs at error level and notices party-line operators, then carries on.
#[macro_export]
macro_rules! soft_assert {
    ($session:expr, $cond:expr, $($arg:tt)+) => {
        if !$cond {
            let detail = format!($($arg)+);
            $crate::error!("Assertion failed: {} ({})", stringify!($cond), detail);
            $session.notice_opers(&format!("Assertion failed: {}", detail));
        }
    };
}
