//! General utilities shared across the application.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;

// ─────────────────────────────────────────────────────────────────────────────
// Time Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ─────────────────────────────────────────────────────────────────────────────
// Random Material
// ─────────────────────────────────────────────────────────────────────────────

/// Generates `len` random bytes, URL-safe base64 encoded without padding.
#[must_use]
pub fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generates a zero-padded decimal code of `digits` digits.
#[must_use]
pub fn random_digit_code(digits: usize) -> String {
    let modulus = 10u64.pow(digits as u32);
    let value = rand::rngs::OsRng.next_u64() % modulus;
    format!("{:0width$}", value, width = digits)
}

// ─────────────────────────────────────────────────────────────────────────────
// Device Naming
// ─────────────────────────────────────────────────────────────────────────────

/// Derives a human-readable device name from a User-Agent string.
///
/// Produces "Browser on Platform" when both can be recognized, falling back
/// to whichever part is known, or "Unknown device" for an empty/opaque UA.
#[must_use]
pub fn friendly_device_name(user_agent: &str) -> String {
    // Order matters: Chrome ships "Safari" in its UA, Edge ships "Chrome".
    let browser = if user_agent.contains("Firefox/") {
        Some("Firefox")
    } else if user_agent.contains("Edg/") {
        Some("Edge")
    } else if user_agent.contains("OPR/") || user_agent.contains("Opera") {
        Some("Opera")
    } else if user_agent.contains("Chrome/") {
        Some("Chrome")
    } else if user_agent.contains("Safari/") {
        Some("Safari")
    } else {
        None
    };

    let platform = if user_agent.contains("Android") {
        Some("Android")
    } else if user_agent.contains("iPhone") {
        Some("iPhone")
    } else if user_agent.contains("iPad") {
        Some("iPad")
    } else if user_agent.contains("Windows") {
        Some("Windows")
    } else if user_agent.contains("Mac OS X") || user_agent.contains("Macintosh") {
        Some("Mac")
    } else if user_agent.contains("Linux") {
        Some("Linux")
    } else {
        None
    };

    match (browser, platform) {
        (Some(b), Some(p)) => format!("{} on {}", b, p),
        (Some(b), None) => b.to_string(),
        (None, Some(p)) => format!("Browser on {}", p),
        (None, None) => "Unknown device".to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Name Collision
// ─────────────────────────────────────────────────────────────────────────────

/// Finds a free variant of `name`, appending ` (n)` before the last extension.
///
/// `taken` reports whether a candidate is already in use. The original name
/// is returned unchanged when free.
pub fn unique_name<F>(name: &str, taken: F) -> String
where
    F: Fn(&str) -> bool,
{
    if !taken(name) {
        return name.to_string();
    }

    let (stem, ext) = match name.rfind('.') {
        // A leading dot is a hidden-file prefix, not an extension separator.
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    };

    let mut n = 1u32;
    loop {
        let candidate = format!("{} ({}){}", stem, n, ext);
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn random_tokens_are_distinct_and_url_safe() {
        let a = random_token(24);
        let b = random_token(24);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn digit_code_is_zero_padded() {
        for _ in 0..32 {
            let code = random_digit_code(6);
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn friendly_name_recognizes_chrome_on_windows() {
        let ua = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                  (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
        assert_eq!(friendly_device_name(ua), "Chrome on Windows");
    }

    #[test]
    fn friendly_name_recognizes_safari_on_iphone() {
        let ua = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) \
                  AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";
        assert_eq!(friendly_device_name(ua), "Safari on iPhone");
    }

    #[test]
    fn friendly_name_falls_back_for_opaque_ua() {
        assert_eq!(friendly_device_name(""), "Unknown device");
        assert_eq!(friendly_device_name("curl/8.4.0"), "Unknown device");
    }

    #[test]
    fn unique_name_appends_counter_before_extension() {
        let mut taken: HashSet<String> = HashSet::new();
        let mut claim = |name: &str, taken: &mut HashSet<String>| {
            let free = unique_name(name, |n| taken.contains(n));
            taken.insert(free.clone());
            free
        };

        assert_eq!(claim("a.txt", &mut taken), "a.txt");
        assert_eq!(claim("a.txt", &mut taken), "a (1).txt");
        assert_eq!(claim("a.txt", &mut taken), "a (2).txt");
        assert_eq!(claim("a.txt", &mut taken), "a (3).txt");
    }

    #[test]
    fn unique_name_without_extension() {
        let taken = |n: &str| n == "folder";
        assert_eq!(unique_name("folder", taken), "folder (1)");
    }

    #[test]
    fn unique_name_treats_leading_dot_as_hidden_prefix() {
        let taken = |n: &str| n == ".env";
        assert_eq!(unique_name(".env", taken), ".env (1)");
    }
}
