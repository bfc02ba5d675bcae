use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::{EngineError, Result};

/// Data type of an injectable value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    Text,
    Number,
    Time,
    Boolean,
    Image,
    List,
    Table,
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DataType::Text => "TEXT",
            DataType::Number => "NUMBER",
            DataType::Time => "TIME",
            DataType::Boolean => "BOOLEAN",
            DataType::Image => "IMAGE",
            DataType::List => "LIST",
            DataType::Table => "TABLE",
        };
        f.write_str(s)
    }
}

/// Where a system injectable's value comes from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceType {
    /// Computed in-process from the ambient context.
    Internal,
    /// Supplied by the caller in the render request body.
    External,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ImageValue {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListItem {
    pub id: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ListItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ListValue {
    pub items: Vec<ListItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TableValue {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// A resolved injectable value: an explicit discriminated union over the
/// closed value-type set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InjectableValue {
    Text(String),
    Number(f64),
    Time(DateTime<Utc>),
    Boolean(bool),
    Image(ImageValue),
    List(ListValue),
    Table(TableValue),
}

impl InjectableValue {
    pub fn data_type(&self) -> DataType {
        match self {
            InjectableValue::Text(_) => DataType::Text,
            InjectableValue::Number(_) => DataType::Number,
            InjectableValue::Time(_) => DataType::Time,
            InjectableValue::Boolean(_) => DataType::Boolean,
            InjectableValue::Image(_) => DataType::Image,
            InjectableValue::List(_) => DataType::List,
            InjectableValue::Table(_) => DataType::Table,
        }
    }

    /// The zero value of a data type, substituted when a non-critical
    /// injector fails and declares no default.
    pub fn zero(data_type: DataType) -> InjectableValue {
        match data_type {
            DataType::Text => InjectableValue::Text(String::new()),
            DataType::Number => InjectableValue::Number(0.0),
            DataType::Time => InjectableValue::Time(DateTime::<Utc>::UNIX_EPOCH),
            DataType::Boolean => InjectableValue::Boolean(false),
            DataType::Image => InjectableValue::Image(ImageValue::default()),
            DataType::List => InjectableValue::List(ListValue::default()),
            DataType::Table => InjectableValue::Table(TableValue::default()),
        }
    }

    /// Parses a caller-supplied JSON value against the declared data
    /// type. Shapes follow the render request contract: plain JSON
    /// scalars, RFC 3339 strings for TIME, `{url}` for IMAGE, `{items}`
    /// for LIST and `{columns, rows}` for TABLE.
    pub fn from_json(data_type: DataType, raw: &serde_json::Value) -> Result<InjectableValue> {
        let mismatch = |want: &str| {
            EngineError::Validation(format!("expected {want}, got `{raw}`"))
        };
        match data_type {
            DataType::Text => raw
                .as_str()
                .map(|s| InjectableValue::Text(s.to_string()))
                .ok_or_else(|| mismatch("a string")),
            DataType::Number => raw
                .as_f64()
                .map(InjectableValue::Number)
                .ok_or_else(|| mismatch("a number")),
            DataType::Boolean => raw
                .as_bool()
                .map(InjectableValue::Boolean)
                .ok_or_else(|| mismatch("a boolean")),
            DataType::Time => {
                let s = raw.as_str().ok_or_else(|| mismatch("an ISO-8601 string"))?;
                let parsed = DateTime::parse_from_rfc3339(s)
                    .map_err(|e| EngineError::Validation(format!("bad time `{s}`: {e}")))?;
                Ok(InjectableValue::Time(parsed.with_timezone(&Utc)))
            }
            DataType::Image => serde_json::from_value(raw.clone())
                .map(InjectableValue::Image)
                .map_err(|_| mismatch("an object {url}")),
            DataType::List => serde_json::from_value(raw.clone())
                .map(InjectableValue::List)
                .map_err(|_| mismatch("an object {items: [...]}")),
            DataType::Table => serde_json::from_value(raw.clone())
                .map(InjectableValue::Table)
                .map_err(|_| mismatch("an object {columns, rows}")),
        }
    }

    /// Interprets a bare JSON literal from a conditional expression.
    pub fn from_literal(raw: &serde_json::Value) -> Option<InjectableValue> {
        match raw {
            serde_json::Value::Bool(b) => Some(InjectableValue::Boolean(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(InjectableValue::Number),
            serde_json::Value::String(s) => match DateTime::parse_from_rfc3339(s) {
                Ok(t) => Some(InjectableValue::Time(t.with_timezone(&Utc))),
                Err(_) => Some(InjectableValue::Text(s.clone())),
            },
            _ => None,
        }
    }

    /// Loose ordering across comparable values. Text compares lexically,
    /// numbers numerically (text parseable as a number coerces when the
    /// other side is numeric), times chronologically, booleans with
    /// `false < true`. Structured values only compare for equality.
    pub fn partial_cmp_value(&self, other: &InjectableValue) -> Option<std::cmp::Ordering> {
        use InjectableValue::*;
        match (self, other) {
            (Text(a), Text(b)) => Some(a.cmp(b)),
            (Number(a), Number(b)) => a.partial_cmp(b),
            (Text(a), Number(b)) => a.parse::<f64>().ok()?.partial_cmp(b),
            (Number(a), Text(b)) => a.partial_cmp(&b.parse::<f64>().ok()?),
            (Time(a), Time(b)) => Some(a.cmp(b)),
            (Boolean(a), Boolean(b)) => Some(a.cmp(b)),
            (a, b) if a == b => Some(std::cmp::Ordering::Equal),
            _ => None,
        }
    }

    /// Renders the value as display text, honoring a format string for
    /// NUMBER and TIME values. Format application is post-resolution.
    pub fn formatted(&self, format: Option<&str>) -> String {
        match self {
            InjectableValue::Text(s) => s.clone(),
            InjectableValue::Number(n) => match format {
                Some(f) => format_number(*n, f),
                None => trim_float(*n),
            },
            InjectableValue::Time(t) => match format {
                Some(f) => t.format(f).to_string(),
                None => t.to_rfc3339_opts(SecondsFormat::Secs, true),
            },
            InjectableValue::Boolean(b) => b.to_string(),
            InjectableValue::Image(img) => img.url.clone(),
            InjectableValue::List(list) => list
                .items
                .iter()
                .map(|i| i.value.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            InjectableValue::Table(table) => format!(
                "{} column(s), {} row(s)",
                table.columns.len(),
                table.rows.len()
            ),
        }
    }
}

fn trim_float(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// Applies a display pattern of the shape `[prefix]0[,000][.00][suffix]`,
/// e.g. `0.00`, `0,000`, `$0,000.00`, `0.0 kg`.
fn format_number(n: f64, pattern: &str) -> String {
    let start = match pattern.find('0') {
        Some(i) => i,
        None => return trim_float(n),
    };
    let digits_end = pattern[start..]
        .find(|c: char| !matches!(c, '0' | ',' | '.'))
        .map(|i| start + i)
        .unwrap_or(pattern.len());
    let prefix = &pattern[..start];
    let suffix = &pattern[digits_end..];
    let body = &pattern[start..digits_end];
    let grouped = body.contains(',');
    let decimals = body.rfind('.').map(|i| body.len() - i - 1).unwrap_or(0);

    let negative = n < 0.0;
    let rounded = format!("{:.*}", decimals, n.abs());
    let (int_part, frac_part) = match rounded.split_once('.') {
        Some((i, f)) => (i.to_string(), Some(f.to_string())),
        None => (rounded, None),
    };
    let int_part = if grouped {
        group_thousands(&int_part)
    } else {
        int_part
    };
    let mut out = String::new();
    if negative {
        out.push('-');
    }
    out.push_str(prefix);
    out.push_str(&int_part);
    if let Some(f) = frac_part {
        out.push('.');
        out.push_str(&f);
    }
    out.push_str(suffix);
    out
}

fn group_thousands(digits: &str) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    let offset = digits.len() % 3;
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (i + 3 - offset) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Allowed display formats for an injectable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FormatSpec {
    pub default: String,
    #[serde(default)]
    pub options: Vec<String>,
}

impl FormatSpec {
    /// Picks the user-selected format when it is an allowed option,
    /// otherwise the declared default.
    pub fn effective<'a>(&'a self, selected: Option<&'a str>) -> Option<&'a str> {
        match selected {
            Some(s) if self.options.iter().any(|o| o == s) => Some(s),
            _ => (!self.default.is_empty()).then_some(self.default.as_str()),
        }
    }
}

/// Per-locale display strings, keyed by locale tag.
pub type LocaleMap = BTreeMap<String, String>;

/// Locale fallback chain: requested locale, then `en`, then the first
/// non-empty entry, then the provided code.
pub fn resolve_locale<'a>(map: &'a LocaleMap, locale: &str, code: &'a str) -> &'a str {
    if let Some(v) = map.get(locale).filter(|v| !v.is_empty()) {
        return v;
    }
    if let Some(v) = map.get("en").filter(|v| !v.is_empty()) {
        return v;
    }
    if let Some(v) = map.values().find(|v| !v.is_empty()) {
        return v;
    }
    code
}

/// A workspace-owned injectable definition. Always TEXT-typed and backed
/// by a stored default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceInjectable {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub key: String,
    #[serde(default)]
    pub label: LocaleMap,
    #[serde(default)]
    pub description: LocaleMap,
    pub default_value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Validates a workspace injectable key: `^[a-z][a-z0-9_]*$`.
pub fn validate_workspace_key(key: &str) -> Result<()> {
    let mut chars = key.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {
            chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(EngineError::Validation(format!(
            "injectable key `{key}` must match ^[a-z][a-z0-9_]*$"
        )))
    }
}

/// Visibility scope of a system injectable assignment. More specific
/// scopes mask more general ones.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentScope {
    Public,
    Tenant,
    Workspace,
}

/// Grants (or revokes, via `is_active = false`) visibility of a system
/// injector to a scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemAssignment {
    pub id: Uuid,
    pub injector_code: String,
    pub scope: AssignmentScope,
    pub tenant_id: Option<Uuid>,
    pub workspace_id: Option<Uuid>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Reduces the assignments relevant to one workspace into the effective
/// visibility per code: the most specific scope wins, and an inactive
/// winner hides the code entirely.
pub fn effective_visibility(assignments: &[SystemAssignment]) -> HashMap<String, bool> {
    let mut winners: HashMap<String, (AssignmentScope, bool)> = HashMap::new();
    for a in assignments {
        match winners.get(&a.injector_code) {
            Some((scope, _)) if *scope >= a.scope => {}
            _ => {
                winners.insert(a.injector_code.clone(), (a.scope, a.is_active));
            }
        }
    }
    winners
        .into_iter()
        .map(|(code, (_, active))| (code, active))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_values_by_declared_type() {
        let v = InjectableValue::from_json(DataType::Text, &serde_json::json!("Acme")).unwrap();
        assert_eq!(v, InjectableValue::Text("Acme".to_string()));

        let v = InjectableValue::from_json(
            DataType::Time,
            &serde_json::json!("2026-03-01T09:30:00Z"),
        )
        .unwrap();
        assert_eq!(v.data_type(), DataType::Time);

        assert!(InjectableValue::from_json(DataType::Number, &serde_json::json!("nope")).is_err());
    }

    #[test]
    fn zero_values_match_declared_types() {
        for dt in [
            DataType::Text,
            DataType::Number,
            DataType::Time,
            DataType::Boolean,
            DataType::Image,
            DataType::List,
            DataType::Table,
        ] {
            assert_eq!(InjectableValue::zero(dt).data_type(), dt);
        }
    }

    #[test]
    fn number_formatting_patterns() {
        assert_eq!(format_number(1234.5, "0.00"), "1234.50");
        assert_eq!(format_number(1234567.0, "0,000"), "1,234,567");
        assert_eq!(format_number(1234.5, "$0,000.00"), "$1,234.50");
        assert_eq!(format_number(-42.0, "0.0 kg"), "-42.0 kg");
    }

    #[test]
    fn format_spec_rejects_unlisted_selection() {
        let spec = FormatSpec {
            default: "0.00".to_string(),
            options: vec!["0.00".to_string(), "0,000.00".to_string()],
        };
        assert_eq!(spec.effective(Some("0,000.00")), Some("0,000.00"));
        assert_eq!(spec.effective(Some("0,0")), Some("0.00"));
        assert_eq!(spec.effective(None), Some("0.00"));
    }

    #[test]
    fn locale_fallback_chain() {
        let mut map = LocaleMap::new();
        map.insert("de".to_string(), "Kunde".to_string());
        assert_eq!(resolve_locale(&map, "de", "customer"), "Kunde");
        assert_eq!(resolve_locale(&map, "fr", "customer"), "Kunde");
        map.insert("en".to_string(), "Customer".to_string());
        assert_eq!(resolve_locale(&map, "fr", "customer"), "Customer");
        assert_eq!(resolve_locale(&LocaleMap::new(), "fr", "customer"), "customer");
    }

    #[test]
    fn workspace_key_rules() {
        validate_workspace_key("customer_name").unwrap();
        validate_workspace_key("a2_b").unwrap();
        assert!(validate_workspace_key("Customer").is_err());
        assert!(validate_workspace_key("2abc").is_err());
        assert!(validate_workspace_key("").is_err());
    }

    #[test]
    fn most_specific_assignment_wins() {
        let base = SystemAssignment {
            id: Uuid::new_v4(),
            injector_code: "date_now".to_string(),
            scope: AssignmentScope::Public,
            tenant_id: None,
            workspace_id: None,
            is_active: true,
            created_at: Utc::now(),
        };
        let mut tenant_off = base.clone();
        tenant_off.scope = AssignmentScope::Tenant;
        tenant_off.is_active = false;

        let vis = effective_visibility(&[base.clone(), tenant_off]);
        assert_eq!(vis.get("date_now"), Some(&false));

        let vis = effective_visibility(&[base]);
        assert_eq!(vis.get("date_now"), Some(&true));
    }
}
