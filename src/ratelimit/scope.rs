//! Scoped counter keys.

use crate::error::{ControlPlaneError, ControlPlaneResult};
use crate::model::{RateLimitScope, RateLimitSubject};

/// Counter key for `subject` under rule `rule`.
///
/// Custom templates substitute `{user_id}`, `{ip}` and any subject
/// attribute by name.
pub fn scoped_key(
    rule: &str,
    scope: &RateLimitScope,
    subject: &RateLimitSubject,
) -> ControlPlaneResult<String> {
    let part = match scope {
        RateLimitScope::User => subject
            .user_id
            .clone()
            .ok_or_else(|| missing(rule, "user_id"))?,
        RateLimitScope::Ip => subject.ip.clone().ok_or_else(|| missing(rule, "ip"))?,
        RateLimitScope::Global => "global".to_string(),
        RateLimitScope::Custom(template) => expand(rule, template, subject)?,
    };
    Ok(format!("ratelimit:{rule}:{part}"))
}

fn expand(rule: &str, template: &str, subject: &RateLimitSubject) -> ControlPlaneResult<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('}').ok_or_else(|| {
            ControlPlaneError::InvalidRequest(format!(
                "rule '{rule}' has an unterminated placeholder in '{template}'"
            ))
        })?;
        let name = &after[..end];
        let value = match name {
            "user_id" => subject.user_id.as_deref(),
            "ip" => subject.ip.as_deref(),
            other => subject.attributes.get(other).map(String::as_str),
        };
        out.push_str(value.ok_or_else(|| missing(rule, name))?);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn missing(rule: &str, attribute: &str) -> ControlPlaneError {
    ControlPlaneError::InvalidRequest(format!("rule '{rule}' needs subject attribute '{attribute}'"))
}
