//! Control-plane client authentication.
//!
//! Clients present a static shared key in the `x-api-key` header.  Keys are
//! compared in constant time so the comparison leaks no timing information
//! about configured key material.

use subtle::ConstantTimeEq;

use crate::config::Settings;

/// Constant-time equality over the byte representations of two strings.
pub fn constant_time_equals(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Verify a presented client key against the configured key set.
///
/// When `require_client_auth` is off the check always passes.  Every
/// configured key is compared (no early exit on match position).
pub fn verify_client_key(settings: &Settings, provided: Option<&str>) -> bool {
    if !settings.require_client_auth {
        return true;
    }
    let Some(provided) = provided else {
        return false;
    };
    let mut matched = false;
    for key in &settings.client_api_keys {
        matched |= constant_time_equals(key, provided);
    }
    matched
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(require: bool, keys: &[&str]) -> Settings {
        Settings {
            require_client_auth: require,
            client_api_keys: keys.iter().map(|k| (*k).to_owned()).collect(),
            ..Settings::default()
        }
    }

    #[test]
    fn auth_disabled_admits_anyone() {
        let s = settings(false, &[]);
        assert!(verify_client_key(&s, None));
        assert!(verify_client_key(&s, Some("whatever")));
    }

    #[test]
    fn missing_key_is_rejected() {
        let s = settings(true, &["k1"]);
        assert!(!verify_client_key(&s, None));
    }

    #[test]
    fn matching_key_is_accepted() {
        let s = settings(true, &["k1", "k2"]);
        assert!(verify_client_key(&s, Some("k2")));
    }

    #[test]
    fn wrong_key_is_rejected() {
        let s = settings(true, &["k1"]);
        assert!(!verify_client_key(&s, Some("k1 ")));
        assert!(!verify_client_key(&s, Some("K1")));
    }

    #[test]
    fn no_keys_configured_rejects_everything() {
        let s = settings(true, &[]);
        assert!(!verify_client_key(&s, Some("anything")));
    }

    #[test]
    fn constant_time_equals_handles_length_mismatch() {
        assert!(!constant_time_equals("abc", "abcd"));
        assert!(constant_time_equals("abc", "abc"));
    }
}
