use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::injectable::InjectableValue;

/// Revision of the portable document vocabulary understood by this build.
/// Stored alongside content so readers can stay forward-compatible.
pub const SCHEMA_REVISION: &str = "pd-1";

/// Versioned template content: a portable document tree plus the
/// vocabulary revision it was written against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentStructure {
    #[serde(default = "default_revision")]
    pub schema_revision: String,
    pub doc: Node,
}

fn default_revision() -> String {
    SCHEMA_REVISION.to_string()
}

impl ContentStructure {
    pub fn new(doc: Node) -> Self {
        Self {
            schema_revision: SCHEMA_REVISION.to_string(),
            doc,
        }
    }

    /// True when the tree carries no renderable content at all.
    pub fn is_empty(&self) -> bool {
        fn has_substance(node: &Node) -> bool {
            match node {
                Node::Doc { content } | Node::Paragraph { content } => {
                    content.iter().any(has_substance)
                }
                Node::Text { text, .. } => !text.trim().is_empty(),
                _ => true,
            }
        }
        !has_substance(&self.doc)
    }

    /// Stable fingerprint of the serialized tree, used as a cache key
    /// component and to detect content drift between edits.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(bytes))
    }

    /// Collects every injectable reference in the tree together with the
    /// node path it occurs at.
    pub fn injector_refs(&self) -> Vec<InjectorRef> {
        let mut refs = Vec::new();
        self.doc.walk("doc", &mut |node, path| match node {
            Node::Injector { attrs } => refs.push(InjectorRef {
                code: attrs.variable_id.clone(),
                kind: RefKind::Inline,
                path: path.to_string(),
            }),
            Node::ListInjector { attrs } => refs.push(InjectorRef {
                code: attrs.variable_id.clone(),
                kind: RefKind::List,
                path: path.to_string(),
            }),
            Node::TableInjector { attrs } => refs.push(InjectorRef {
                code: attrs.variable_id.clone(),
                kind: RefKind::Table,
                path: path.to_string(),
            }),
            Node::CustomImage { attrs } => refs.push(InjectorRef {
                code: attrs.variable_id.clone(),
                kind: RefKind::Image,
                path: path.to_string(),
            }),
            Node::Conditional { attrs, .. } => {
                for code in attrs.expression.referenced_codes() {
                    refs.push(InjectorRef {
                        code,
                        kind: RefKind::Condition,
                        path: path.to_string(),
                    });
                }
            }
            _ => {}
        });
        refs
    }
}

/// Where in the tree an injectable code is referenced from. Determines
/// which data types are legal at that position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Inline,
    List,
    Table,
    Image,
    Condition,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InjectorRef {
    pub code: String,
    pub kind: RefKind,
    pub path: String,
}

/// A node of the portable document tree. The vocabulary is closed;
/// unknown attributes on known nodes are ignored for forward
/// compatibility.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Node {
    Doc {
        #[serde(default)]
        content: Vec<Node>,
    },
    Paragraph {
        #[serde(default)]
        content: Vec<Node>,
    },
    Heading {
        attrs: HeadingAttrs,
        #[serde(default)]
        content: Vec<Node>,
    },
    Blockquote {
        #[serde(default)]
        content: Vec<Node>,
    },
    BulletList {
        #[serde(default)]
        content: Vec<Node>,
    },
    OrderedList {
        #[serde(default)]
        content: Vec<Node>,
    },
    TaskList {
        #[serde(default)]
        content: Vec<Node>,
    },
    ListItem {
        #[serde(default)]
        attrs: ListItemAttrs,
        #[serde(default)]
        content: Vec<Node>,
    },
    /// Inline reference to an injectable value.
    Injector { attrs: InjectorAttrs },
    /// Content gated by a boolean expression over injectable values.
    Conditional {
        attrs: ConditionalAttrs,
        #[serde(default)]
        content: Vec<Node>,
    },
    PageBreak,
    /// Static image by URL.
    Image { attrs: ImageAttrs },
    /// Image whose bytes come from an IMAGE-typed injectable.
    CustomImage { attrs: InjectorAttrs },
    /// Repeated block driven by a LIST-typed injectable.
    ListInjector { attrs: InjectorAttrs },
    /// Table driven by a TABLE-typed injectable.
    TableInjector { attrs: InjectorAttrs },
    Table {
        #[serde(default)]
        content: Vec<Node>,
    },
    TableRow {
        #[serde(default)]
        content: Vec<Node>,
    },
    TableCell {
        #[serde(default)]
        content: Vec<Node>,
    },
    TableHeader {
        #[serde(default)]
        content: Vec<Node>,
    },
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        marks: Vec<Mark>,
    },
}

impl Node {
    /// Depth-first walk invoking `f` with each node and its path.
    pub fn walk(&self, path: &str, f: &mut impl FnMut(&Node, &str)) {
        f(self, path);
        if let Some(children) = self.children() {
            for (i, child) in children.iter().enumerate() {
                let child_path = format!("{path}.content[{i}]");
                child.walk(&child_path, f);
            }
        }
    }

    pub fn children(&self) -> Option<&[Node]> {
        match self {
            Node::Doc { content }
            | Node::Paragraph { content }
            | Node::Heading { content, .. }
            | Node::Blockquote { content }
            | Node::BulletList { content }
            | Node::OrderedList { content }
            | Node::TaskList { content }
            | Node::ListItem { content, .. }
            | Node::Conditional { content, .. }
            | Node::Table { content }
            | Node::TableRow { content }
            | Node::TableCell { content }
            | Node::TableHeader { content } => Some(content),
            _ => None,
        }
    }

    /// Convenience constructor for a plain text run.
    pub fn text(s: impl Into<String>) -> Node {
        Node::Text {
            text: s.into(),
            marks: Vec::new(),
        }
    }

    /// Convenience constructor for a paragraph of plain text.
    pub fn paragraph(s: impl Into<String>) -> Node {
        Node::Paragraph {
            content: vec![Node::text(s)],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeadingAttrs {
    pub level: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListItemAttrs {
    /// Task-list checkbox state; unused for plain list items.
    #[serde(default)]
    pub checked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InjectorAttrs {
    /// Injectable code this node resolves against.
    pub variable_id: String,
    /// Selected format key; must be one of the injectable's options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageAttrs {
    pub src: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConditionalAttrs {
    pub expression: ConditionExpr,
}

/// Inline text decoration. `link` is the only mark carrying attributes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Mark {
    Bold,
    Italic,
    Strike,
    Code,
    Underline,
    Highlight,
    Link { attrs: LinkAttrs },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkAttrs {
    pub href: String,
}

/// Boolean expression tree evaluated against resolved injectable values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ConditionExpr {
    Eq { left: Operand, right: Operand },
    Neq { left: Operand, right: Operand },
    Lt { left: Operand, right: Operand },
    Lte { left: Operand, right: Operand },
    Gt { left: Operand, right: Operand },
    Gte { left: Operand, right: Operand },
    In { left: Operand, right: Vec<Operand> },
    NotIn { left: Operand, right: Vec<Operand> },
    And { args: Vec<ConditionExpr> },
    Or { args: Vec<ConditionExpr> },
    Not { arg: Box<ConditionExpr> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Operand {
    Variable { code: String },
    Literal { value: serde_json::Value },
}

impl ConditionExpr {
    /// Every injectable code the expression reads.
    pub fn referenced_codes(&self) -> Vec<String> {
        fn from_operand(op: &Operand, out: &mut Vec<String>) {
            if let Operand::Variable { code } = op {
                out.push(code.clone());
            }
        }
        let mut out = Vec::new();
        match self {
            ConditionExpr::Eq { left, right }
            | ConditionExpr::Neq { left, right }
            | ConditionExpr::Lt { left, right }
            | ConditionExpr::Lte { left, right }
            | ConditionExpr::Gt { left, right }
            | ConditionExpr::Gte { left, right } => {
                from_operand(left, &mut out);
                from_operand(right, &mut out);
            }
            ConditionExpr::In { left, right } | ConditionExpr::NotIn { left, right } => {
                from_operand(left, &mut out);
                for op in right {
                    from_operand(op, &mut out);
                }
            }
            ConditionExpr::And { args } | ConditionExpr::Or { args } => {
                for arg in args {
                    out.extend(arg.referenced_codes());
                }
            }
            ConditionExpr::Not { arg } => out.extend(arg.referenced_codes()),
        }
        out
    }

    /// Evaluates the expression. `lookup` returns the committed value for
    /// an injectable code; an unresolved code makes the condition false
    /// rather than failing the render.
    pub fn evaluate(&self, lookup: &dyn Fn(&str) -> Option<InjectableValue>) -> bool {
        match self {
            ConditionExpr::Eq { left, right } => cmp(left, right, lookup)
                .map(|o| o == std::cmp::Ordering::Equal)
                .unwrap_or(false),
            ConditionExpr::Neq { left, right } => cmp(left, right, lookup)
                .map(|o| o != std::cmp::Ordering::Equal)
                .unwrap_or(false),
            ConditionExpr::Lt { left, right } => cmp(left, right, lookup)
                .map(|o| o == std::cmp::Ordering::Less)
                .unwrap_or(false),
            ConditionExpr::Lte { left, right } => cmp(left, right, lookup)
                .map(|o| o != std::cmp::Ordering::Greater)
                .unwrap_or(false),
            ConditionExpr::Gt { left, right } => cmp(left, right, lookup)
                .map(|o| o == std::cmp::Ordering::Greater)
                .unwrap_or(false),
            ConditionExpr::Gte { left, right } => cmp(left, right, lookup)
                .map(|o| o != std::cmp::Ordering::Less)
                .unwrap_or(false),
            ConditionExpr::In { left, right } => right.iter().any(|r| {
                cmp(left, r, lookup)
                    .map(|o| o == std::cmp::Ordering::Equal)
                    .unwrap_or(false)
            }),
            ConditionExpr::NotIn { left, right } => !right.iter().any(|r| {
                cmp(left, r, lookup)
                    .map(|o| o == std::cmp::Ordering::Equal)
                    .unwrap_or(false)
            }),
            ConditionExpr::And { args } => args.iter().all(|a| a.evaluate(lookup)),
            ConditionExpr::Or { args } => args.iter().any(|a| a.evaluate(lookup)),
            ConditionExpr::Not { arg } => !arg.evaluate(lookup),
        }
    }
}

fn operand_value(
    op: &Operand,
    lookup: &dyn Fn(&str) -> Option<InjectableValue>,
) -> Option<InjectableValue> {
    match op {
        Operand::Variable { code } => lookup(code),
        Operand::Literal { value } => InjectableValue::from_literal(value),
    }
}

fn cmp(
    left: &Operand,
    right: &Operand,
    lookup: &dyn Fn(&str) -> Option<InjectableValue>,
) -> Option<std::cmp::Ordering> {
    let l = operand_value(left, lookup)?;
    let r = operand_value(right, lookup)?;
    l.partial_cmp_value(&r)
}
