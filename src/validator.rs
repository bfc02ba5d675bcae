use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::content::{ConditionExpr, ContentStructure, Node, Operand, RefKind};
use crate::injectable::DataType;
use crate::registry::InjectorRegistry;
use crate::EngineError;

/// One structured diagnostic: a stable code, the node path it was found
/// at and a human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationIssue {
    pub code: String,
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, code: &str, path: &str, message: impl Into<String>) {
        self.errors.push(ValidationIssue {
            code: code.to_string(),
            path: path.to_string(),
            message: message.into(),
        });
    }

    fn warning(&mut self, code: &str, path: &str, message: impl Into<String>) {
        self.warnings.push(ValidationIssue {
            code: code.to_string(),
            path: path.to_string(),
            message: message.into(),
        });
    }
}

/// The injectables a workspace can see at validation time: every visible
/// code mapped to its declared data type.
#[derive(Debug, Clone, Default)]
pub struct ValidationCatalog {
    pub types: HashMap<String, DataType>,
}

impl ValidationCatalog {
    pub fn with(codes: &[(&str, DataType)]) -> Self {
        Self {
            types: codes
                .iter()
                .map(|(c, t)| (c.to_string(), *t))
                .collect(),
        }
    }
}

/// Walks the portable tree and reports every reference or typing
/// problem. Side-effect free; shared by publish and preview.
pub fn validate_content(
    content: &ContentStructure,
    catalog: &ValidationCatalog,
    registry: &InjectorRegistry,
) -> ValidationReport {
    let mut report = ValidationReport::default();

    for r in content.injector_refs() {
        let Some(data_type) = catalog.types.get(&r.code) else {
            report.error(
                "UNKNOWN_INJECTABLE",
                &r.path,
                format!("injectable `{}` is not visible to this workspace", r.code),
            );
            continue;
        };
        match r.kind {
            RefKind::List if *data_type != DataType::List => {
                report.error(
                    "DATATYPE_MISMATCH",
                    &r.path,
                    format!("list injector `{}` must reference a LIST injectable, found {data_type}", r.code),
                );
            }
            RefKind::Table if *data_type != DataType::Table => {
                report.error(
                    "DATATYPE_MISMATCH",
                    &r.path,
                    format!("table injector `{}` must reference a TABLE injectable, found {data_type}", r.code),
                );
            }
            RefKind::Image if *data_type != DataType::Image => {
                report.error(
                    "DATATYPE_MISMATCH",
                    &r.path,
                    format!("image node `{}` must reference an IMAGE injectable, found {data_type}", r.code),
                );
            }
            RefKind::Inline if *data_type == DataType::Image => {
                report.error(
                    "IMAGE_PLACEMENT",
                    &r.path,
                    format!("IMAGE injectable `{}` may only be placed as an image node", r.code),
                );
            }
            _ => {}
        }
    }

    content.doc.walk("doc", &mut |node, path| {
        if let Node::Conditional { attrs, .. } = node {
            check_expression(&attrs.expression, catalog, path, &mut report);
        }
    });

    // Planning over the referenced registry codes catches cycles at
    // publish time, keeping them unreachable at render time.
    let registry_codes: Vec<String> = content
        .injector_refs()
        .into_iter()
        .map(|r| r.code)
        .filter(|c| registry.contains(c))
        .collect();
    if let Err(EngineError::CircularDependency(path)) = registry.resolve_order(&registry_codes) {
        report.error("CIRCULAR_DEPENDENCY", "injectors", path.join(" -> "));
    }

    report
}

fn check_expression(
    expr: &ConditionExpr,
    catalog: &ValidationCatalog,
    path: &str,
    report: &mut ValidationReport,
) {
    match expr {
        ConditionExpr::Eq { left, right } | ConditionExpr::Neq { left, right } => {
            check_operand_pair(left, right, false, catalog, path, report);
        }
        ConditionExpr::Lt { left, right }
        | ConditionExpr::Lte { left, right }
        | ConditionExpr::Gt { left, right }
        | ConditionExpr::Gte { left, right } => {
            check_operand_pair(left, right, true, catalog, path, report);
        }
        ConditionExpr::In { left, right } | ConditionExpr::NotIn { left, right } => {
            for r in right {
                check_operand_pair(left, r, false, catalog, path, report);
            }
        }
        ConditionExpr::And { args } | ConditionExpr::Or { args } => {
            for arg in args {
                check_expression(arg, catalog, path, report);
            }
        }
        ConditionExpr::Not { arg } => check_expression(arg, catalog, path, report),
    }
}

fn operand_type(op: &Operand, catalog: &ValidationCatalog) -> Option<DataType> {
    match op {
        Operand::Variable { code } => catalog.types.get(code).copied(),
        Operand::Literal { value } => match value {
            serde_json::Value::Bool(_) => Some(DataType::Boolean),
            serde_json::Value::Number(_) => Some(DataType::Number),
            serde_json::Value::String(_) => Some(DataType::Text),
            _ => None,
        },
    }
}

fn check_operand_pair(
    left: &Operand,
    right: &Operand,
    ordering: bool,
    catalog: &ValidationCatalog,
    path: &str,
    report: &mut ValidationReport,
) {
    let lt = operand_type(left, catalog);
    let rt = operand_type(right, catalog);
    if ordering {
        for t in [lt, rt].into_iter().flatten() {
            if t == DataType::Boolean {
                report.error(
                    "BOOLEAN_COMPARISON",
                    path,
                    "BOOLEAN values cannot be ordered; use eq/neq",
                );
                return;
            }
        }
    }
    if let (Some(a), Some(b)) = (lt, rt) {
        if a != b {
            if matches!(
                (a, b),
                (DataType::Text, DataType::Number) | (DataType::Number, DataType::Text)
            ) {
                report.warning(
                    "TEXT_NUMBER_COERCION",
                    path,
                    "TEXT operand will be coerced to NUMBER at render time",
                );
            } else {
                report.error(
                    "DATATYPE_MISMATCH",
                    path,
                    format!("cannot compare {a} with {b}"),
                );
            }
        }
    }
}
