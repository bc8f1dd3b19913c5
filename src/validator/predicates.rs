//! Built-in custom predicates.

use std::collections::HashMap;
use std::sync::Arc;

use crate::model::{ConfigValue, RateLimitRule};
use crate::validator::Predicate;

pub const NON_EMPTY: &str = "non_empty";
pub const URL: &str = "url";
pub const EMAIL: &str = "email";
pub const POSITIVE_INTEGER: &str = "positive_integer";
pub const PORT: &str = "port";
pub const RATE_LIMIT_RULE: &str = "rate_limit_rule";

pub(crate) fn builtin() -> HashMap<String, Predicate> {
    let mut map: HashMap<String, Predicate> = HashMap::new();
    map.insert(NON_EMPTY.into(), Arc::new(non_empty));
    map.insert(URL.into(), Arc::new(url));
    map.insert(EMAIL.into(), Arc::new(email));
    map.insert(POSITIVE_INTEGER.into(), Arc::new(positive_integer));
    map.insert(PORT.into(), Arc::new(port));
    map.insert(RATE_LIMIT_RULE.into(), Arc::new(rate_limit_rule));
    map
}

fn non_empty(value: &ConfigValue) -> Result<(), String> {
    match value.length() {
        Some(0) => Err("must not be empty".into()),
        _ => Ok(()),
    }
}

fn url(value: &ConfigValue) -> Result<(), String> {
    let s = value.as_str().ok_or("must be a string")?;
    let parsed = url::Url::parse(s).map_err(|e| format!("not a valid URL: {e}"))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(()),
        scheme => Err(format!("unsupported scheme '{scheme}'")),
    }
}

fn email(value: &ConfigValue) -> Result<(), String> {
    let s = value.as_str().ok_or("must be a string")?;
    match s.split_once('@') {
        Some((local, domain))
            if !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.') =>
        {
            Ok(())
        }
        _ => Err("not a valid email address".into()),
    }
}

fn positive_integer(value: &ConfigValue) -> Result<(), String> {
    match value.as_f64() {
        Some(n) if n > 0.0 && n.fract() == 0.0 => Ok(()),
        _ => Err("must be a positive integer".into()),
    }
}

fn port(value: &ConfigValue) -> Result<(), String> {
    match value.as_f64() {
        Some(n) if n.fract() == 0.0 && (1.0..=65535.0).contains(&n) => Ok(()),
        _ => Err("must be an integer port between 1 and 65535".into()),
    }
}

fn rate_limit_rule(value: &ConfigValue) -> Result<(), String> {
    let rule: RateLimitRule = match value {
        ConfigValue::Json(v) => {
            serde_json::from_value(v.clone()).map_err(|e| format!("not a rate limit rule: {e}"))?
        }
        _ => return Err("must be a json object".into()),
    };
    rule.check()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_url_predicate() {
        assert!(url(&ConfigValue::String("https://api.example.com/v1".into())).is_ok());
        assert!(url(&ConfigValue::String("ftp://example.com".into())).is_err());
        assert!(url(&ConfigValue::String("not a url".into())).is_err());
    }

    #[test]
    fn test_email_predicate() {
        assert!(email(&ConfigValue::String("ops@example.com".into())).is_ok());
        assert!(email(&ConfigValue::String("ops@localhost".into())).is_err());
        assert!(email(&ConfigValue::String("@example.com".into())).is_err());
    }

    #[test]
    fn test_numeric_predicates() {
        assert!(positive_integer(&ConfigValue::Number(3.0)).is_ok());
        assert!(positive_integer(&ConfigValue::Number(0.0)).is_err());
        assert!(positive_integer(&ConfigValue::Number(1.5)).is_err());
        assert!(port(&ConfigValue::Number(8080.0)).is_ok());
        assert!(port(&ConfigValue::Number(70000.0)).is_err());
    }

    #[test]
    fn test_rate_limit_rule_predicate() {
        let ok = ConfigValue::Json(json!({
            "scope": "user", "window_secs": 60, "max_requests": 5, "action": "block"
        }));
        assert!(rate_limit_rule(&ok).is_ok());

        let zero = ConfigValue::Json(json!({
            "scope": "user", "window_secs": 60, "max_requests": 0, "action": "block"
        }));
        assert!(rate_limit_rule(&zero).is_err());
        assert!(rate_limit_rule(&ConfigValue::Json(json!({"scope": "user"}))).is_err());
    }
}
