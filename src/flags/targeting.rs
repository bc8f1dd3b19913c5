//! Targeting rule evaluation.
//!
//! Conditions are evaluated against a [`SubjectContext`] with
//! short-circuiting combinators. A missing attribute matches no operator,
//! so `not` over a missing attribute is true.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::model::{Attribute, Condition, Operator, SubjectContext};
use crate::validator::RegexCache;

pub fn matches(
    condition: &Condition,
    subject: &SubjectContext,
    now: DateTime<Utc>,
    regexes: &RegexCache,
) -> bool {
    match condition {
        Condition::All(children) => children.iter().all(|c| matches(c, subject, now, regexes)),
        Condition::Any(children) => children.iter().any(|c| matches(c, subject, now, regexes)),
        Condition::Not(inner) => !matches(inner, subject, now, regexes),
        Condition::Match {
            attribute,
            operator,
            value,
        } => {
            let actual = attribute_values(attribute, subject, now);
            if actual.is_empty() {
                return false;
            }
            match operator {
                // Multi-valued attributes (roles) match a negative operator
                // only when no value matches the positive one.
                Operator::NotEquals => !actual
                    .iter()
                    .any(|a| compare(a, Operator::Equals, value, attribute, regexes)),
                Operator::NotOneOf => !actual
                    .iter()
                    .any(|a| compare(a, Operator::OneOf, value, attribute, regexes)),
                op => actual
                    .iter()
                    .any(|a| compare(a, *op, value, attribute, regexes)),
            }
        }
    }
}

fn attribute_values(
    attribute: &Attribute,
    subject: &SubjectContext,
    now: DateTime<Utc>,
) -> Vec<Value> {
    let single = |v: &Option<String>| v.iter().map(|s| Value::String(s.clone())).collect();
    match attribute {
        Attribute::UserId => single(&subject.user_id),
        Attribute::Role => subject
            .roles
            .iter()
            .map(|r| Value::String(r.clone()))
            .collect(),
        Attribute::Environment => single(&subject.environment),
        Attribute::Country => single(&subject.country),
        Attribute::Region => single(&subject.region),
        Attribute::Device => single(&subject.device),
        Attribute::AppVersion => single(&subject.app_version),
        Attribute::Now => vec![Value::String(now.to_rfc3339())],
        Attribute::Custom(name) => subject.attributes.get(name).cloned().into_iter().collect(),
    }
}

fn compare(
    actual: &Value,
    operator: Operator,
    expected: &Value,
    attribute: &Attribute,
    regexes: &RegexCache,
) -> bool {
    match operator {
        Operator::Equals => values_equal(actual, expected),
        Operator::NotEquals => !values_equal(actual, expected),
        Operator::OneOf => candidates(expected).any(|c| values_equal(actual, c)),
        Operator::NotOneOf => !candidates(expected).any(|c| values_equal(actual, c)),
        Operator::Contains => match (actual, expected) {
            (Value::String(a), Value::String(e)) => a.contains(e.as_str()),
            (Value::Array(items), e) => items.iter().any(|i| values_equal(i, e)),
            _ => false,
        },
        Operator::StartsWith => string_pair(actual, expected).map_or(false, |(a, e)| a.starts_with(e)),
        Operator::EndsWith => string_pair(actual, expected).map_or(false, |(a, e)| a.ends_with(e)),
        Operator::Matches => match (as_text(actual), expected.as_str()) {
            (Some(a), Some(pattern)) => regexes
                .get_or_compile(pattern)
                .map_or(false, |re| re.is_match(&a)),
            _ => false,
        },
        Operator::GreaterThan => order(actual, expected, attribute) == Some(Ordering::Greater),
        Operator::GreaterOrEqual => matches!(
            order(actual, expected, attribute),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Operator::LessThan => order(actual, expected, attribute) == Some(Ordering::Less),
        Operator::LessOrEqual => matches!(
            order(actual, expected, attribute),
            Some(Ordering::Less | Ordering::Equal)
        ),
    }
}

fn candidates(expected: &Value) -> Box<dyn Iterator<Item = &Value> + '_> {
    match expected {
        Value::Array(items) => Box::new(items.iter()),
        single => Box::new(std::iter::once(single)),
    }
}

fn string_pair<'a>(actual: &'a Value, expected: &'a Value) -> Option<(&'a str, &'a str)> {
    Some((actual.as_str()?, expected.as_str()?))
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (as_number(actual), as_number(expected)) {
        (Some(a), Some(e)) => a == e,
        _ => match (actual, expected) {
            (Value::String(a), Value::String(e)) => a.eq_ignore_ascii_case(e),
            (Value::Bool(a), Value::String(e)) | (Value::String(e), Value::Bool(a)) => {
                e.eq_ignore_ascii_case(&a.to_string())
            }
            _ => false,
        },
    }
}

/// Dates first, then versions, then numbers, then plain strings.
fn order(actual: &Value, expected: &Value, attribute: &Attribute) -> Option<Ordering> {
    let (a, e) = (as_text(actual)?, as_text(expected)?);

    if let (Some(a), Some(e)) = (parse_datetime(&a), parse_datetime(&e)) {
        return Some(a.cmp(&e));
    }
    if matches!(attribute, Attribute::Now) {
        return None;
    }
    let versioned = matches!(attribute, Attribute::AppVersion) || (a.contains('.') && e.contains('.'));
    if versioned {
        if let (Some(a), Some(e)) = (parse_version(&a), parse_version(&e)) {
            return Some(compare_versions(&a, &e));
        }
    }
    if let (Some(a), Some(e)) = (as_number(actual), as_number(expected)) {
        return a.partial_cmp(&e);
    }
    Some(a.cmp(&e))
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// `v1.2.3-beta+build` → `[1, 2, 3]`. Pre-release and build tags are ignored.
fn parse_version(s: &str) -> Option<Vec<u64>> {
    let core = s
        .trim()
        .trim_start_matches(['v', 'V'])
        .split(['-', '+'])
        .next()?;
    core.split('.').map(|part| part.parse().ok()).collect()
}

fn compare_versions(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 29, 12, 0, 0).unwrap()
    }

    fn check(condition: Condition, subject: &SubjectContext) -> bool {
        matches(&condition, subject, now(), &RegexCache::default())
    }

    #[test]
    fn test_role_and_country_rules() {
        let subject = SubjectContext::for_subject("u1")
            .with_role("beta")
            .with_role("staff")
            .with_country("DE");

        assert!(check(
            Condition::matches(Attribute::Role, Operator::Equals, json!("beta")),
            &subject
        ));
        assert!(!check(
            Condition::matches(Attribute::Role, Operator::NotEquals, json!("staff")),
            &subject
        ));
        assert!(check(
            Condition::matches(Attribute::Country, Operator::OneOf, json!(["DE", "FR"])),
            &subject
        ));
        assert!(check(
            Condition::matches(Attribute::Country, Operator::NotOneOf, json!(["US"])),
            &subject
        ));
    }

    #[test]
    fn test_combinators_short_circuit() {
        let subject = SubjectContext::for_subject("u1").with_country("US");
        let us = Condition::matches(Attribute::Country, Operator::Equals, json!("us"));
        let beta = Condition::matches(Attribute::Role, Operator::Equals, json!("beta"));

        assert!(!check(Condition::All(vec![us.clone(), beta.clone()]), &subject));
        assert!(check(Condition::Any(vec![beta.clone(), us.clone()]), &subject));
        assert!(check(Condition::Not(Box::new(beta)), &subject));
        assert!(check(Condition::All(vec![]), &subject));
        assert!(!check(Condition::Any(vec![]), &subject));
    }

    #[test]
    fn test_missing_attribute_never_matches() {
        let subject = SubjectContext::for_subject("u1");
        assert!(!check(
            Condition::matches(Attribute::Country, Operator::NotEquals, json!("US")),
            &subject
        ));
    }

    #[test]
    fn test_version_comparison() {
        let subject = SubjectContext::for_subject("u1").with_app_version("2.10.0");
        assert!(check(
            Condition::matches(Attribute::AppVersion, Operator::GreaterThan, json!("2.9.5")),
            &subject
        ));
        assert!(check(
            Condition::matches(Attribute::AppVersion, Operator::GreaterOrEqual, json!("v2.10")),
            &subject
        ));
        assert!(!check(
            Condition::matches(Attribute::AppVersion, Operator::LessThan, json!("2.10.0-rc1")),
            &subject
        ));
    }

    #[test]
    fn test_time_window_rule() {
        let subject = SubjectContext::for_subject("u1");
        let after = Condition::matches(
            Attribute::Now,
            Operator::GreaterOrEqual,
            json!("2024-11-29T00:00:00Z"),
        );
        let before = Condition::matches(
            Attribute::Now,
            Operator::LessThan,
            json!("2024-12-02T00:00:00Z"),
        );
        assert!(check(Condition::All(vec![after, before]), &subject));
    }

    #[test]
    fn test_string_and_regex_operators() {
        let subject = SubjectContext::for_subject("u1")
            .with_attribute("email", json!("ops@example.com"))
            .with_attribute("plan_seats", json!(25));
        assert!(check(
            Condition::matches(
                Attribute::Custom("email".into()),
                Operator::EndsWith,
                json!("@example.com")
            ),
            &subject
        ));
        assert!(check(
            Condition::matches(
                Attribute::Custom("email".into()),
                Operator::Matches,
                json!("^[a-z]+@")
            ),
            &subject
        ));
        assert!(check(
            Condition::matches(
                Attribute::Custom("plan_seats".into()),
                Operator::GreaterThan,
                json!(10)
            ),
            &subject
        ));
    }
}
