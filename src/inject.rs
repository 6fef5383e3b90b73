//! Placeholder substitution for URLs, headers, payloads, and credentials.
//!
//! Two namespaces are recognized inside any string value:
//!
//! - dynamic: `{{_name}}`, resolved by a fixed generator registry and
//!   producing a fresh value on every call;
//! - environment: `{{name}}` (no leading underscore), resolved from the
//!   iteration's environment map.
//!
//! Substitution is a single left-to-right pass; replacement text is never
//! re-scanned. Strings without placeholders come back unchanged.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use rand::distr::Alphanumeric;
use rand::Rng;
use regex::Regex;

/// Matches dynamic placeholders such as `{{_uuid}}`.
pub static DYNAMIC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{_\w+\}\}").expect("dynamic placeholder regex"));

/// Matches environment placeholders such as `{{token}}`. The first
/// character must be a word character other than `_`, which keeps the
/// dynamic namespace separate while still allowing one-letter names.
pub static ENV_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{[^_\W]\w*\}\}").expect("environment placeholder regex"));

/// Substitution failures: unknown generator or missing environment entry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InjectError {
    #[error("unknown dynamic variable {name}")]
    UnknownGenerator { name: String },

    #[error("{placeholder} is not defined by global or captured environments")]
    EnvNotDefined { placeholder: String },
}

/// Whether `input` contains at least one dynamic placeholder.
pub fn has_dynamic(input: &str) -> bool {
    DYNAMIC_RE.is_match(input)
}

/// Whether `input` contains at least one environment placeholder.
pub fn has_env(input: &str) -> bool {
    ENV_RE.is_match(input)
}

/// Resolve every dynamic placeholder in `input` through the generator
/// registry. Unknown generator names are an error.
pub fn inject_dynamic(input: &str) -> Result<String, InjectError> {
    replace_all(&DYNAMIC_RE, input, |placeholder| {
        let name = &placeholder[2..placeholder.len() - 2];
        generate(name).ok_or_else(|| InjectError::UnknownGenerator {
            name: name.to_string(),
        })
    })
}

/// Resolve every environment placeholder in `input` from `envs`.
/// A missing variable is a hard error.
pub fn inject_env(input: &str, envs: &HashMap<String, String>) -> Result<String, InjectError> {
    replace_all(&ENV_RE, input, |placeholder| {
        let name = &placeholder[2..placeholder.len() - 2];
        envs.get(name)
            .cloned()
            .ok_or_else(|| InjectError::EnvNotDefined {
                placeholder: placeholder.to_string(),
            })
    })
}

/// Names of all registered dynamic generators.
pub const GENERATORS: &[&str] = &[
    "_uuid",
    "_guid",
    "_timestamp",
    "_timestampMs",
    "_randomInt",
    "_randomFloat",
    "_randomString",
    "_randomBoolean",
];

fn generate(name: &str) -> Option<String> {
    let mut rng = rand::rng();
    let value = match name {
        "_uuid" | "_guid" => uuid::Uuid::new_v4().to_string(),
        "_timestamp" => unix_now().as_secs().to_string(),
        "_timestampMs" => unix_now().as_millis().to_string(),
        "_randomInt" => rng.random_range(0..1000).to_string(),
        "_randomFloat" => format!("{:.4}", rng.random_range(0.0..1000.0_f64)),
        "_randomString" => (0..8)
            .map(|_| char::from(rng.sample(Alphanumeric)))
            .collect(),
        "_randomBoolean" => rng.random_bool(0.5).to_string(),
        _ => return None,
    };
    Some(value)
}

fn unix_now() -> std::time::Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Single-pass replacement; the produced text is not re-scanned.
fn replace_all<F>(re: &Regex, input: &str, mut resolve: F) -> Result<String, InjectError>
where
    F: FnMut(&str) -> Result<String, InjectError>,
{
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for m in re.find_iter(input) {
        out.push_str(&input[last..m.start()]);
        out.push_str(&resolve(m.as_str())?);
        last = m.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_plain_string_is_returned_identical() {
        let input = "https://example.com/path?q=1";
        assert_eq!(inject_dynamic(input).unwrap(), input);
        assert_eq!(inject_env(input, &envs(&[])).unwrap(), input);
    }

    #[test]
    fn test_env_substitution() {
        let out = inject_env("https://h/u?x={{token}}", &envs(&[("token", "abc")])).unwrap();
        assert_eq!(out, "https://h/u?x=abc");
    }

    #[test]
    fn test_env_substitution_multiple() {
        let out = inject_env(
            "{{aa}}-{{bb}}-{{aa}}",
            &envs(&[("aa", "1"), ("bb", "2")]),
        )
        .unwrap();
        assert_eq!(out, "1-2-1");
    }

    #[test]
    fn test_env_missing_is_error() {
        let err = inject_env("x={{missing}}", &envs(&[])).unwrap_err();
        assert_eq!(
            err,
            InjectError::EnvNotDefined {
                placeholder: "{{missing}}".to_string()
            }
        );
    }

    #[test]
    fn test_env_regex_ignores_dynamic_placeholders() {
        assert!(!has_env("{{_uuid}}"));
        assert!(has_env("{{token}}"));
        assert!(has_dynamic("{{_uuid}}"));
        assert!(!has_dynamic("{{token}}"));
    }

    #[test]
    fn test_single_letter_env_name() {
        let out = inject_env("https://h/u?x={{t}}", &envs(&[("t", "abc")])).unwrap();
        assert_eq!(out, "https://h/u?x=abc");
    }

    #[test]
    fn test_dynamic_uuid_shape() {
        let out = inject_dynamic("id={{_uuid}}").unwrap();
        let id = out.strip_prefix("id=").unwrap();
        assert_eq!(id.len(), 36);
        assert_eq!(id.matches('-').count(), 4);
    }

    #[test]
    fn test_dynamic_unknown_generator_is_error() {
        let err = inject_dynamic("{{_nope}}").unwrap_err();
        assert_eq!(
            err,
            InjectError::UnknownGenerator {
                name: "_nope".to_string()
            }
        );
    }

    #[test]
    fn test_dynamic_random_int_in_range() {
        for _ in 0..32 {
            let out = inject_dynamic("{{_randomInt}}").unwrap();
            let n: i64 = out.parse().unwrap();
            assert!((0..1000).contains(&n), "out of range: {n}");
        }
    }

    #[test]
    fn test_replacement_is_not_rescanned() {
        // The replacement contains what looks like a placeholder; a second
        // scan would fail on the unknown name.
        let out = inject_env("v={{outer}}", &envs(&[("outer", "{{inner}}")])).unwrap();
        assert_eq!(out, "v={{inner}}");
    }

    #[test]
    fn test_all_registered_generators_resolve() {
        for name in GENERATORS {
            let input = format!("{{{{{name}}}}}");
            assert!(inject_dynamic(&input).is_ok(), "generator {name} failed");
        }
    }
}
