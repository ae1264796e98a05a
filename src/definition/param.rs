use humantime::parse_duration;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// A tunable given either literally or as a `{{key}}` property placeholder.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Param<T> {
    Value(T),
    Placeholder(String),
}

impl<T> From<T> for Param<T> {
    fn from(value: T) -> Self {
        Param::Value(value)
    }
}

/// Milliseconds as a number, or text holding milliseconds, a humantime
/// duration (`"250ms"`, `"5s"`) or a placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum DurationParam {
    Millis(u64),
    Text(String),
}

impl From<Duration> for DurationParam {
    fn from(value: Duration) -> Self {
        DurationParam::Millis(value.as_millis().min(u128::from(u64::MAX)) as u64)
    }
}

pub fn parse_duration_text(text: &str) -> Result<Duration, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("duration must not be empty".to_string());
    }
    if let Ok(ms) = trimmed.parse::<u64>() {
        return Ok(Duration::from_millis(ms));
    }
    parse_duration(trimmed).map_err(|err| {
        format!("expected numeric milliseconds or a duration, found `{trimmed}` ({err})")
    })
}

/// Replaces every `{{key}}` in `text`. The error carries the first unknown key.
pub fn resolve_placeholders(
    text: &str,
    properties: &BTreeMap<String, String>,
) -> Result<String, String> {
    if !text.contains("{{") {
        return Ok(text.to_string());
    }

    let mut resolved = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        resolved.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            resolved.push_str(&rest[start..]);
            return Ok(resolved);
        };
        let key = after[..end].trim();
        let value = properties.get(key).ok_or_else(|| key.to_string())?;
        resolved.push_str(value);
        rest = &after[end + 2..];
    }
    resolved.push_str(rest);
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("host".to_string(), "orders".to_string()),
            ("limit".to_string(), "5".to_string()),
        ])
    }

    #[test]
    fn placeholders_are_substituted_inline() {
        assert_eq!(
            resolve_placeholders("direct:{{ host }}-{{limit}}", &props()).unwrap(),
            "direct:orders-5"
        );
        assert_eq!(resolve_placeholders("plain", &props()).unwrap(), "plain");
        assert_eq!(
            resolve_placeholders("{{missing}}", &props()).unwrap_err(),
            "missing"
        );
    }

    #[test]
    fn durations_accept_millis_and_humantime() {
        assert_eq!(parse_duration_text("250").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration_text("5s").unwrap(), Duration::from_secs(5));
        assert!(parse_duration_text("soon").is_err());
    }

    #[test]
    fn params_deserialize_literals_and_placeholders() {
        let literal: Param<bool> = serde_yaml::from_str("true").unwrap();
        let placeholder: Param<bool> = serde_yaml::from_str("\"{{parallel}}\"").unwrap();
        assert_eq!(literal, Param::Value(true));
        assert_eq!(placeholder, Param::Placeholder("{{parallel}}".into()));
    }
}
