use std::collections::BTreeMap;

use crate::error::EnvError;

/// Shrink `env[key]` so that `key=value\0` fits in `max` bytes.
///
/// Oversized values are cut on a char boundary and end with
/// `[value truncated <orig> -> <max_value> bytes]`. Returns `Ok(true)` when
/// the value was changed; a missing key is left alone.
pub fn truncate_env(
    env: &mut BTreeMap<String, String>,
    key: &str,
    max: usize,
) -> Result<bool, EnvError> {
    let Some(value) = env.get_mut(key) else {
        return Ok(false);
    };
    if key.len() + value.len() + 2 <= max {
        return Ok(false);
    }

    let too_short = || EnvError::TruncationTooShort {
        key: key.to_string(),
        max,
    };
    let max_value = max.checked_sub(key.len() + 2).ok_or_else(too_short)?;
    let apology = format!("[value truncated {} -> {} bytes]", value.len(), max_value);
    if apology.len() > max_value {
        return Err(too_short());
    }

    let mut keep = max_value - apology.len();
    while !value.is_char_boundary(keep) {
        keep -= 1;
    }
    value.truncate(keep);
    value.push_str(&apology);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(key: &str, value: &str) -> BTreeMap<String, String> {
        BTreeMap::from([(key.to_string(), value.to_string())])
    }

    #[test]
    fn value_at_limit_is_untouched() {
        let mut e = env("MSG", &"a".repeat(95));
        assert!(!truncate_env(&mut e, "MSG", 100).unwrap());
        assert_eq!(e["MSG"].len(), 95);

        let mut e = env("MSG", "short");
        assert!(!truncate_env(&mut e, "MSG", 100).unwrap());
        assert_eq!(e["MSG"], "short");
    }

    #[test]
    fn value_over_limit_is_cut_with_apology() {
        let mut e = env("MSG", &"a".repeat(96));
        assert!(truncate_env(&mut e, "MSG", 100).unwrap());

        let v = &e["MSG"];
        assert!(v.ends_with("[value truncated 96 -> 95 bytes]"));
        assert_eq!("MSG".len() + 1 + v.len() + 1, 100);
    }

    #[test]
    fn large_values_always_fit() {
        for len in [200, 1_000, 70_000] {
            let mut e = env("BUILDKITE_MESSAGE", &"x".repeat(len));
            truncate_env(&mut e, "BUILDKITE_MESSAGE", 128).unwrap();
            assert!("BUILDKITE_MESSAGE".len() + 1 + e["BUILDKITE_MESSAGE"].len() + 1 <= 128);
            assert!(e["BUILDKITE_MESSAGE"].ends_with(&format!("[value truncated {len} -> 109 bytes]")));
        }
    }

    #[test]
    fn cut_respects_char_boundaries() {
        let mut e = env("MSG", &"é".repeat(100));
        assert!(truncate_env(&mut e, "MSG", 100).unwrap());
        let v = &e["MSG"];
        assert!(v.len() <= 95);
        assert!(v.starts_with('é'));
    }

    #[test]
    fn apology_that_does_not_fit_is_an_error() {
        let mut e = env("MSG", &"a".repeat(50));
        let err = truncate_env(&mut e, "MSG", 20).unwrap_err();
        assert!(matches!(err, EnvError::TruncationTooShort { max: 20, .. }));
        assert_eq!(e["MSG"].len(), 50);

        let mut e = env("A_VERY_LONG_KEY", "value");
        assert!(truncate_env(&mut e, "A_VERY_LONG_KEY", 4).is_err());
    }

    #[test]
    fn missing_key_is_a_noop() {
        let mut e = BTreeMap::new();
        assert!(!truncate_env(&mut e, "MSG", 10).unwrap());
    }
}
