//! `{{placeholder}}` substitution for action payloads.
//!
//! [`render`] never fails: a token with no value in the context is left in
//! the output verbatim and logged, so one missing variable cannot take
//! down a live campaign for every enrolled subject.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::workflow::WorkflowDefinition;

/// Values available to a template.
pub type RenderContext = Map<String, Value>;

/// Regex pattern matching `{{name}}` tokens (optional inner whitespace,
/// dotted names allowed).
pub const PLACEHOLDER_PATTERN: &str = r"\{\{\s*([A-Za-z_][A-Za-z0-9_.]*)\s*\}\}";

/// Compiled regex for placeholder extraction. Compiled once, reused forever.
static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(PLACEHOLDER_PATTERN).expect("valid regex"));

/// Legacy CRM placeholder names and the attribute they read.
const ALIASES: &[(&str, &str)] = &[
    ("contactName", "contactPerson"),
    ("leadId", "id"),
];

/// Names every template may use without declaring them: common subject
/// attributes and the values the scheduler computes at dispatch time.
pub const BUILTIN_PLACEHOLDERS: &[&str] = &[
    "firstName",
    "lastName",
    "email",
    "phone",
    "contactName",
    "contactPerson",
    "businessName",
    "leadId",
    "subject_id",
    "enrollment_id",
    "workflow_name",
    "today",
    "year",
    "hours_remaining",
    "days_remaining",
];

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Substitute every known `{{name}}` in `text`.
pub fn render(text: &str, context: &RenderContext) -> String {
    PLACEHOLDER_RE
        .replace_all(text, |caps: &Captures| {
            let name = &caps[1];
            match resolve(name, context) {
                Some(value) => display(value),
                None => {
                    tracing::warn!(
                        placeholder = name,
                        "Unknown template placeholder left verbatim"
                    );
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

/// Apply [`render`] to every string inside a JSON payload. Keys are left
/// untouched.
pub fn render_value(value: &Value, context: &RenderContext) -> Value {
    match value {
        Value::String(s) => Value::String(render(s, context)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| render_value(v, context)).collect())
        }
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), render_value(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve<'a>(name: &str, context: &'a RenderContext) -> Option<&'a Value> {
    if let Some(v) = context.get(name) {
        return Some(v);
    }
    if name.contains('.') {
        let mut parts = name.split('.');
        let first = context.get(parts.next()?)?;
        return parts.try_fold(first, |current, part| current.as_object()?.get(part));
    }
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .and_then(|(_, target)| context.get(*target))
}

/// Text form of a JSON value inside a template.
fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Placeholder discovery
// ---------------------------------------------------------------------------

/// Unique placeholder names in `text`, in order of first appearance.
pub fn extract_placeholders(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    PLACEHOLDER_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let name = caps[1].to_string();
            seen.insert(name.clone()).then_some(name)
        })
        .collect()
}

/// Every placeholder referenced anywhere in a JSON payload.
pub fn placeholders_in_value(value: &Value) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect_placeholders(value, &mut out);
    out
}

fn collect_placeholders(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => out.extend(extract_placeholders(s)),
        Value::Array(items) => items.iter().for_each(|v| collect_placeholders(v, out)),
        Value::Object(fields) => fields.values().for_each(|v| collect_placeholders(v, out)),
        _ => {}
    }
}

/// Definition-time lint: placeholders used by any action that are neither
/// declared in `variables` nor built in. Returns `(action index, name)`
/// pairs and logs each one. Never an error.
pub fn lint_variables(def: &WorkflowDefinition) -> Vec<(u32, String)> {
    let mut findings = Vec::new();
    for action in &def.actions {
        for name in placeholders_in_value(&action.config) {
            let root = name.split('.').next().unwrap_or(&name);
            let declared = def.variables.iter().any(|v| v == &name || v == root);
            if declared || BUILTIN_PLACEHOLDERS.contains(&root) {
                continue;
            }
            tracing::warn!(
                workflow_id = def.id,
                action_index = action.index,
                placeholder = %name,
                "Template references an undeclared variable"
            );
            findings.push((action.index, name));
        }
    }
    findings
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Action, ActionKind, WorkflowStatus};
    use serde_json::json;

    fn ctx(value: Value) -> RenderContext {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn substitutes_known_tokens() {
        let out = render(
            "Hi {{firstName}}, {{discount}}% off",
            &ctx(json!({"firstName": "Marie", "discount": 20})),
        );
        assert_eq!(out, "Hi Marie, 20% off");
    }

    #[test]
    fn unknown_tokens_stay_verbatim() {
        let out = render(
            "Hi {{firstName}}, {{discount}}% off",
            &ctx(json!({"firstName": "Marie"})),
        );
        assert_eq!(out, "Hi Marie, {{discount}}% off");
    }

    #[test]
    fn whitespace_inside_braces_is_tolerated() {
        let out = render("Hello {{ firstName }}!", &ctx(json!({"firstName": "Ana"})));
        assert_eq!(out, "Hello Ana!");
    }

    #[test]
    fn dotted_names_and_aliases_resolve() {
        let context = ctx(json!({
            "address": {"city": "Lyon"},
            "contactPerson": "Jo Smith",
            "id": 42
        }));
        assert_eq!(render("{{address.city}}", &context), "Lyon");
        assert_eq!(render("Dear {{contactName}}", &context), "Dear Jo Smith");
        assert_eq!(render("Lead #{{leadId}}", &context), "Lead #42");
    }

    #[test]
    fn value_kinds_render_as_text() {
        let context = ctx(json!({"flag": true, "none": null, "price": 19.5, "tags": ["a"]}));
        assert_eq!(render("{{flag}}|{{none}}|{{price}}|{{tags}}", &context), "true||19.5|[\"a\"]");
    }

    #[test]
    fn render_value_walks_nested_payloads() {
        let payload = json!({
            "subject": "Hi {{firstName}}",
            "tags": ["{{tier}}", "static"],
            "value": 0
        });
        let out = render_value(&payload, &ctx(json!({"firstName": "Marie", "tier": "gold"})));
        assert_eq!(
            out,
            json!({"subject": "Hi Marie", "tags": ["gold", "static"], "value": 0})
        );
    }

    #[test]
    fn extract_placeholders_dedups_in_order() {
        let names = extract_placeholders("{{b}} {{a}} {{b}} {{ c.d }}");
        assert_eq!(names, vec!["b", "a", "c.d"]);
    }

    #[test]
    fn single_braces_are_not_placeholders() {
        assert!(extract_placeholders("{not} a {{ }} token").is_empty());
    }

    #[test]
    fn lint_reports_only_undeclared_names() {
        let def = WorkflowDefinition {
            id: 3,
            tenant_id: 1,
            name: "Cart recovery".into(),
            status: WorkflowStatus::Active,
            version: 1,
            triggers: vec![],
            conditions: vec![],
            actions: vec![Action::new(
                0,
                ActionKind::SendEmail,
                60,
                json!({
                    "subject": "{{firstName}}, {{discount}}% off",
                    "body": "{{cart_url}} {{coupon}}"
                }),
            )],
            variables: vec!["discount".into(), "cart_url".into()],
        };
        assert_eq!(lint_variables(&def), vec![(0, "coupon".to_string())]);
    }
}
