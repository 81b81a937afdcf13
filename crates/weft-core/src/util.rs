//! Small shared helpers: duration strings, env expansion, truncation.

use std::time::Duration;

/// Parse a human duration string: `"60s"`, `"500ms"`, `"2m"`, `"1h"`.
///
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let value: f64 = num
        .parse()
        .map_err(|_| format!("invalid duration '{}'", s))?;

    let millis = match unit.trim() {
        "" | "s" | "sec" | "secs" => value * 1000.0,
        "ms" => value,
        "m" | "min" => value * 60_000.0,
        "h" => value * 3_600_000.0,
        other => return Err(format!("unknown duration unit '{}'", other)),
    };

    Ok(Duration::from_millis(millis as u64))
}

/// Serde adapter for optional duration strings (`timeout: "60s"`).
pub mod duration_opt {
    use super::parse_duration;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            Some(s) => parse_duration(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => {
                let millis = d.as_millis();
                if millis % 1000 == 0 {
                    serializer.serialize_str(&format!("{}s", millis / 1000))
                } else {
                    serializer.serialize_str(&format!("{}ms", millis))
                }
            }
            None => serializer.serialize_none(),
        }
    }
}

/// Expand `${VAR}` and `${VAR:-default}` references from the process
/// environment. Unknown variables without a default are left verbatim.
pub fn expand_env(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();
    re.replace_all(input, |caps: &regex::Captures| {
        let expr = &caps[1];
        if let Some(idx) = expr.find(":-") {
            let name = &expr[..idx];
            let default = &expr[idx + 2..];
            std::env::var(name).unwrap_or_else(|_| default.to_string())
        } else {
            std::env::var(expr).unwrap_or_else(|_| format!("${{{}}}", expr))
        }
    })
    .to_string()
}

/// Truncate a string to `max` characters, appending an ellipsis.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10 fortnights").is_err());
    }

    #[test]
    fn test_expand_env() {
        std::env::set_var("WEFT_UTIL_TEST_VAR", "hello");
        assert_eq!(expand_env("${WEFT_UTIL_TEST_VAR}"), "hello");
        assert_eq!(expand_env("pre-${WEFT_UTIL_TEST_VAR}-post"), "pre-hello-post");
        assert_eq!(expand_env("${WEFT_UTIL_NO_SUCH:-fallback}"), "fallback");
        assert_eq!(expand_env("${WEFT_UTIL_NO_SUCH}"), "${WEFT_UTIL_NO_SUCH}");
        std::env::remove_var("WEFT_UTIL_TEST_VAR");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a longer string", 8), "a longe…");
    }
}
