use serde_json::Value;

/// Parse a boolean-like env var.
///
/// Truthy values (case-insensitive): `1`, `true`, `yes`, `y`, `on`.
#[must_use]
pub fn flag(name: &str) -> bool {
    matches!(
        std::env::var(name)
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

/// Parse a positive (`> 0`) u64 env var.
#[must_use]
pub fn positive_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
}

/// Expand `${VAR}` and `${VAR:default}` occurrences in a string.
///
/// `${VAR}` resolves to the variable's value, or the empty string when it is
/// unset (a warning is logged in that case). `${VAR:default}` resolves to the
/// variable's value, or to `default` when unset; an empty default is allowed.
/// Strings without `${` pass through unchanged.
#[must_use]
pub fn expand_str(s: &str) -> String {
    if !s.contains("${") {
        return s.to_string();
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated reference; keep the literal text.
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let inner = &after[..end];
        let (name, default) = match inner.split_once(':') {
            Some((name, default)) => (name, Some(default)),
            None => (inner, None),
        };
        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => match default {
                Some(default) => out.push_str(default),
                None => {
                    tracing::warn!(
                        variable = name,
                        "environment variable not set and no default provided"
                    );
                }
            },
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

/// Expand env references in every string of a JSON value tree, in place.
///
/// Recurses through objects and arrays; non-string leaves are untouched.
pub fn expand_value(value: &mut Value) {
    match value {
        Value::String(s) => *s = expand_str(s),
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                expand_value(v);
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                expand_value(v);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expand_str_basic() {
        unsafe { std::env::set_var("SWB_TEST_VAR", "hello") };
        assert_eq!(expand_str("${SWB_TEST_VAR}"), "hello");
        assert_eq!(expand_str("a_${SWB_TEST_VAR}_b"), "a_hello_b");
        assert_eq!(expand_str("no_vars_here"), "no_vars_here");
        unsafe { std::env::remove_var("SWB_TEST_VAR") };
    }

    #[test]
    fn expand_str_missing_var_is_empty() {
        assert_eq!(expand_str("x${SWB_DEFINITELY_NOT_SET_123}y"), "xy");
    }

    #[test]
    fn expand_str_default_used_when_unset() {
        assert_eq!(expand_str("${SWB_NOT_SET_456:default-abc}"), "default-abc");
        assert_eq!(expand_str("${SWB_NOT_SET_456:}"), "");
    }

    #[test]
    fn expand_str_env_wins_over_default() {
        unsafe { std::env::set_var("SWB_TEST_GH", "xyz") };
        assert_eq!(expand_str("${SWB_TEST_GH:default-abc}"), "xyz");
        unsafe { std::env::remove_var("SWB_TEST_GH") };
    }

    #[test]
    fn expand_str_unterminated_left_alone() {
        assert_eq!(expand_str("${OOPS"), "${OOPS");
    }

    #[test]
    fn expand_str_idempotent_without_refs() {
        let s = "plain $ text } with { braces";
        assert_eq!(expand_str(s), s);
        assert_eq!(expand_str(&expand_str(s)), s);
    }

    #[test]
    fn expand_value_recurses() {
        unsafe { std::env::set_var("SWB_TEST_TOKEN", "tok-1") };
        let mut v = json!({
            "env": { "TOKEN": "${SWB_TEST_TOKEN}" },
            "args": ["--key", "${SWB_TEST_TOKEN}"],
            "count": 3,
        });
        expand_value(&mut v);
        assert_eq!(v["env"]["TOKEN"], "tok-1");
        assert_eq!(v["args"][1], "tok-1");
        assert_eq!(v["count"], 3);
        unsafe { std::env::remove_var("SWB_TEST_TOKEN") };
    }
}
