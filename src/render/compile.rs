use std::collections::HashMap;

use crate::content::{ConditionExpr, ContentStructure, Mark, Node, Operand};
use crate::injectable::InjectableValue;
use crate::render::images::{PLACEHOLDER_FILE, staged_name};

/// A compiled, value-free template skeleton. Injected values arrive via
/// a per-request prelude prepended to `source`, which keeps the skeleton
/// cacheable per version fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledSkeleton {
    pub source: String,
    /// Static images referenced by URL in the content tree.
    pub images: Vec<StaticImage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StaticImage {
    pub url: String,
    pub file_name: String,
}

/// Helper definitions every skeleton carries. They read the value
/// dictionaries bound by the prelude.
const HELPERS: &str = r#"#let v(code) = injected.at(code, default: "")
#let render-list(items) = if items.len() > 0 {
  list(..items.map(it => [#it.at(0)] + if it.at(1).len() > 0 { render-list(it.at(1)) } else { [] }))
}
#let render-table(t) = if t.columns.len() > 0 {
  table(columns: t.columns.len(), ..t.columns.map(c => [*#c*]), ..t.rows.flatten().map(c => [#c]))
}
"#;

/// Pure transformation of a content tree into typesetter markup.
pub fn compile_skeleton(content: &ContentStructure) -> CompiledSkeleton {
    let mut emitter = Emitter::default();
    let body = emitter.block(&content.doc);
    let source = format!("{HELPERS}\n{body}\n");
    CompiledSkeleton {
        source,
        images: emitter.images,
    }
}

#[derive(Default)]
struct Emitter {
    images: Vec<StaticImage>,
}

impl Emitter {
    fn block(&mut self, node: &Node) -> String {
        match node {
            Node::Doc { content } => self.blocks(content),
            Node::Paragraph { content } => self.inline_all(content),
            Node::Heading { attrs, content } => {
                let level = attrs.level.clamp(1, 6) as usize;
                format!("{} {}", "=".repeat(level), self.inline_all(content))
            }
            Node::Blockquote { content } => {
                format!("#quote(block: true)[\n{}\n]", self.blocks(content))
            }
            Node::BulletList { content } => self.list_items(content, "-"),
            Node::OrderedList { content } => self.list_items(content, "+"),
            Node::TaskList { content } => content
                .iter()
                .map(|item| match item {
                    Node::ListItem { attrs, content } => {
                        let tick = if attrs.checked { "[x]" } else { "[ ]" };
                        format!("- {} {}", tick, self.inline_all(content))
                    }
                    other => self.block(other),
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Node::ListItem { content, .. } => self.inline_all(content),
            Node::Conditional { attrs, content } => {
                format!(
                    "#if {} [\n{}\n]",
                    condition_expr(&attrs.expression),
                    self.blocks(content)
                )
            }
            Node::PageBreak => "#pagebreak()".to_string(),
            Node::Image { attrs } => {
                let file_name = staged_name(&attrs.src);
                self.images.push(StaticImage {
                    url: attrs.src.clone(),
                    file_name: file_name.clone(),
                });
                format!("#image(\"{file_name}\")")
            }
            Node::CustomImage { attrs } => format!(
                "#image(images.at({}, default: \"{PLACEHOLDER_FILE}\"))",
                string_literal(&attrs.variable_id)
            ),
            Node::ListInjector { attrs } => format!(
                "#render-list(lists.at({}, default: ()))",
                string_literal(&attrs.variable_id)
            ),
            Node::TableInjector { attrs } => format!(
                "#render-table(tables.at({}, default: (columns: (), rows: ())))",
                string_literal(&attrs.variable_id)
            ),
            Node::Table { content } => self.table(content),
            // Row/cell nodes only occur under Table; stray ones flatten.
            Node::TableRow { content }
            | Node::TableCell { content }
            | Node::TableHeader { content } => self.inline_all(content),
            inline @ (Node::Injector { .. } | Node::Text { .. }) => self.inline(inline),
        }
    }

    fn blocks(&mut self, nodes: &[Node]) -> String {
        nodes
            .iter()
            .map(|n| self.block(n))
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn list_items(&mut self, items: &[Node], bullet: &str) -> String {
        items
            .iter()
            .map(|item| format!("{bullet} {}", self.block(item)))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn table(&mut self, rows: &[Node]) -> String {
        let columns = rows
            .iter()
            .filter_map(Node::children)
            .map(|cells| cells.len())
            .max()
            .unwrap_or(0);
        if columns == 0 {
            return String::new();
        }
        let mut cells: Vec<String> = Vec::new();
        for row in rows {
            let Some(row_cells) = row.children() else {
                continue;
            };
            for i in 0..columns {
                let rendered = match row_cells.get(i) {
                    Some(Node::TableHeader { content }) => {
                        format!("[*{}*]", self.inline_all(content))
                    }
                    Some(cell) => format!("[{}]", self.block(cell)),
                    None => "[]".to_string(),
                };
                cells.push(rendered);
            }
        }
        format!("#table(columns: {columns}, {})", cells.join(", "))
    }

    fn inline_all(&mut self, nodes: &[Node]) -> String {
        nodes.iter().map(|n| self.inline(n)).collect()
    }

    fn inline(&mut self, node: &Node) -> String {
        match node {
            Node::Text { text, marks } => {
                let mut out = escape_markup(text);
                for mark in marks {
                    out = apply_mark(out, mark);
                }
                out
            }
            Node::Injector { attrs } => {
                format!("#v({})", string_literal(&attrs.variable_id))
            }
            other => self.block(other),
        }
    }
}

fn apply_mark(inner: String, mark: &Mark) -> String {
    match mark {
        Mark::Bold => format!("*{inner}*"),
        Mark::Italic => format!("_{inner}_"),
        Mark::Strike => format!("#strike[{inner}]"),
        Mark::Code => format!("#raw(\"{inner}\")"),
        Mark::Underline => format!("#underline[{inner}]"),
        Mark::Highlight => format!("#highlight[{inner}]"),
        Mark::Link { attrs } => format!("#link({})[{inner}]", string_literal(&attrs.href)),
    }
}

/// Escapes text for typesetter markup context.
fn escape_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '#' | '[' | ']' | '*' | '_' | '`' | '$' | '@' | '<' | '>') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Quotes a string for typesetter code context.
fn string_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

fn condition_expr(expr: &ConditionExpr) -> String {
    match expr {
        ConditionExpr::Eq { left, right } => binary(left, "==", right),
        ConditionExpr::Neq { left, right } => binary(left, "!=", right),
        ConditionExpr::Lt { left, right } => binary(left, "<", right),
        ConditionExpr::Lte { left, right } => binary(left, "<=", right),
        ConditionExpr::Gt { left, right } => binary(left, ">", right),
        ConditionExpr::Gte { left, right } => binary(left, ">=", right),
        ConditionExpr::In { left, right } => contains(left, right, false),
        ConditionExpr::NotIn { left, right } => contains(left, right, true),
        ConditionExpr::And { args } => nary(args, "and"),
        ConditionExpr::Or { args } => nary(args, "or"),
        ConditionExpr::Not { arg } => format!("(not {})", condition_expr(arg)),
    }
}

fn binary(left: &Operand, op: &str, right: &Operand) -> String {
    format!("({} {op} {})", operand(left), operand(right))
}

fn contains(left: &Operand, right: &[Operand], negate: bool) -> String {
    let elems: String = right.iter().map(|r| format!("{}, ", operand(r))).collect();
    let inner = format!("({elems}).contains({})", operand(left));
    if negate {
        format!("(not {inner})")
    } else {
        inner
    }
}

fn nary(args: &[ConditionExpr], op: &str) -> String {
    if args.is_empty() {
        return "true".to_string();
    }
    format!(
        "({})",
        args.iter()
            .map(condition_expr)
            .collect::<Vec<_>>()
            .join(&format!(" {op} "))
    )
}

fn operand(op: &Operand) -> String {
    match op {
        Operand::Variable { code } => format!("raw-values.at({}, default: none)", string_literal(code)),
        Operand::Literal { value } => match value {
            serde_json::Value::String(s) => string_literal(s),
            other => other.to_string(),
        },
    }
}

/// Builds the per-request prelude binding every resolved value into the
/// dictionaries the skeleton reads. `formats` carries the effective
/// display format per code; `image_files` the staged filename for each
/// IMAGE-typed code.
pub fn build_prelude(
    values: &HashMap<String, InjectableValue>,
    formats: &HashMap<String, Option<String>>,
    image_files: &HashMap<String, String>,
) -> String {
    let mut codes: Vec<&String> = values.keys().collect();
    codes.sort();

    let mut injected = String::new();
    let mut raw = String::new();
    let mut lists = String::new();
    let mut tables = String::new();
    for code in &codes {
        let value = &values[code.as_str()];
        let format = formats.get(code.as_str()).and_then(|f| f.as_deref());
        let key = string_literal(code);
        injected.push_str(&format!(
            "{key}: {}, ",
            string_literal(&value.formatted(format))
        ));
        match value {
            InjectableValue::Text(s) => raw.push_str(&format!("{key}: {}, ", string_literal(s))),
            InjectableValue::Number(n) => raw.push_str(&format!("{key}: {n}, ")),
            InjectableValue::Boolean(b) => raw.push_str(&format!("{key}: {b}, ")),
            InjectableValue::Time(t) => {
                raw.push_str(&format!("{key}: {}, ", string_literal(&t.to_rfc3339())))
            }
            InjectableValue::List(list) => {
                lists.push_str(&format!("{key}: {}, ", list_literal(&list.items)))
            }
            InjectableValue::Table(table) => {
                let columns: String = table
                    .columns
                    .iter()
                    .map(|c| format!("{}, ", string_literal(c)))
                    .collect();
                let rows: String = table
                    .rows
                    .iter()
                    .map(|row| {
                        let cells: String =
                            row.iter().map(|c| format!("{}, ", string_literal(c))).collect();
                        format!("({cells}), ")
                    })
                    .collect();
                tables.push_str(&format!("{key}: (columns: ({columns}), rows: ({rows})), "));
            }
            InjectableValue::Image(_) => {}
        }
    }

    let mut images = String::new();
    let mut image_codes: Vec<&String> = image_files.keys().collect();
    image_codes.sort();
    for code in image_codes {
        images.push_str(&format!(
            "{}: {}, ",
            string_literal(code),
            string_literal(&image_files[code])
        ));
    }

    format!(
        "#let injected = ({})\n#let raw-values = ({})\n#let images = ({})\n#let lists = ({})\n#let tables = ({})\n",
        dict_body(injected),
        dict_body(raw),
        dict_body(images),
        dict_body(lists),
        dict_body(tables),
    )
}

fn dict_body(body: String) -> String {
    if body.is_empty() {
        ":".to_string()
    } else {
        body
    }
}

fn list_literal(items: &[crate::injectable::ListItem]) -> String {
    let inner: String = items
        .iter()
        .map(|item| {
            format!(
                "({}, {}), ",
                string_literal(&item.value),
                list_literal(&item.children)
            )
        })
        .collect();
    format!("({inner})")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{
        ConditionalAttrs, HeadingAttrs, ImageAttrs, InjectorAttrs, LinkAttrs, ListItemAttrs,
    };
    use crate::injectable::{ImageValue, ListItem, ListValue, TableValue};

    fn structure(nodes: Vec<Node>) -> ContentStructure {
        ContentStructure::new(Node::Doc { content: nodes })
    }

    #[test]
    fn skeleton_is_value_free_and_references_codes() {
        let content = structure(vec![
            Node::Heading {
                attrs: HeadingAttrs { level: 2 },
                content: vec![Node::text("Order")],
            },
            Node::Paragraph {
                content: vec![
                    Node::text("For "),
                    Node::Injector {
                        attrs: InjectorAttrs {
                            variable_id: "customer_name".to_string(),
                            format: None,
                        },
                    },
                ],
            },
        ]);
        let skeleton = compile_skeleton(&content);
        assert!(skeleton.source.contains("== Order"));
        assert!(skeleton.source.contains("#v(\"customer_name\")"));
        assert!(!skeleton.source.contains("Acme"));
    }

    #[test]
    fn static_images_are_collected_and_rewritten() {
        let content = structure(vec![Node::Image {
            attrs: ImageAttrs {
                src: "https://cdn.example/logo.png".to_string(),
                alt: None,
                width: None,
            },
        }]);
        let skeleton = compile_skeleton(&content);
        assert_eq!(skeleton.images.len(), 1);
        let file = &skeleton.images[0].file_name;
        assert!(file.starts_with("img-") && file.ends_with(".png"));
        assert!(skeleton.source.contains(&format!("#image(\"{file}\")")));
    }

    #[test]
    fn conditional_compiles_to_expression_over_raw_values() {
        let content = structure(vec![Node::Conditional {
            attrs: ConditionalAttrs {
                expression: ConditionExpr::And {
                    args: vec![
                        ConditionExpr::Gt {
                            left: Operand::Variable {
                                code: "total".to_string(),
                            },
                            right: Operand::Literal {
                                value: serde_json::json!(100),
                            },
                        },
                        ConditionExpr::In {
                            left: Operand::Variable {
                                code: "region".to_string(),
                            },
                            right: vec![
                                Operand::Literal {
                                    value: serde_json::json!("EU"),
                                },
                                Operand::Literal {
                                    value: serde_json::json!("UK"),
                                },
                            ],
                        },
                    ],
                },
            },
            content: vec![Node::paragraph("Free shipping")],
        }]);
        let skeleton = compile_skeleton(&content);
        assert!(skeleton
            .source
            .contains("#if ((raw-values.at(\"total\", default: none) > 100) and (\"EU\", \"UK\", ).contains(raw-values.at(\"region\", default: none))) ["));
    }

    #[test]
    fn marks_and_escaping() {
        let content = structure(vec![Node::Paragraph {
            content: vec![
                Node::Text {
                    text: "pay #1 [now]".to_string(),
                    marks: vec![Mark::Bold],
                },
                Node::Text {
                    text: "terms".to_string(),
                    marks: vec![Mark::Link {
                        attrs: LinkAttrs {
                            href: "https://example.com/t".to_string(),
                        },
                    }],
                },
            ],
        }]);
        let skeleton = compile_skeleton(&content);
        assert!(skeleton.source.contains("*pay \\#1 \\[now\\]*"));
        assert!(skeleton
            .source
            .contains("#link(\"https://example.com/t\")[terms]"));
    }

    #[test]
    fn tables_and_task_lists_emit_grid_markup() {
        let content = structure(vec![
            Node::Table {
                content: vec![
                    Node::TableRow {
                        content: vec![
                            Node::TableHeader {
                                content: vec![Node::text("Item")],
                            },
                            Node::TableHeader {
                                content: vec![Node::text("Qty")],
                            },
                        ],
                    },
                    Node::TableRow {
                        content: vec![
                            Node::TableCell {
                                content: vec![Node::text("Widget")],
                            },
                            Node::TableCell {
                                content: vec![Node::text("2")],
                            },
                        ],
                    },
                ],
            },
            Node::TaskList {
                content: vec![Node::ListItem {
                    attrs: ListItemAttrs { checked: true },
                    content: vec![Node::text("signed")],
                }],
            },
        ]);
        let skeleton = compile_skeleton(&content);
        assert!(skeleton
            .source
            .contains("#table(columns: 2, [*Item*], [*Qty*], [Widget], [2])"));
        assert!(skeleton.source.contains("- [x] signed"));
    }

    #[test]
    fn prelude_binds_formatted_and_raw_values() {
        let values = HashMap::from([
            (
                "customer_name".to_string(),
                InjectableValue::Text("Acme".to_string()),
            ),
            ("total".to_string(), InjectableValue::Number(1234.5)),
        ]);
        let formats = HashMap::from([
            ("customer_name".to_string(), None),
            ("total".to_string(), Some("0,000.00".to_string())),
        ]);
        let prelude = build_prelude(&values, &formats, &HashMap::new());
        assert!(prelude.contains("\"customer_name\": \"Acme\""));
        assert!(prelude.contains("\"total\": \"1,234.50\""));
        assert!(prelude.contains("#let raw-values = (\"customer_name\": \"Acme\", \"total\": 1234.5, )"));
        assert!(prelude.contains("#let images = (:)"));
    }

    #[test]
    fn prelude_binds_lists_tables_and_images() {
        let values = HashMap::from([
            (
                "names".to_string(),
                InjectableValue::List(ListValue {
                    items: vec![ListItem {
                        id: "1".to_string(),
                        value: "Alice".to_string(),
                        children: vec![ListItem {
                            id: "2".to_string(),
                            value: "Bob".to_string(),
                            children: Vec::new(),
                        }],
                    }],
                }),
            ),
            (
                "totals".to_string(),
                InjectableValue::Table(TableValue {
                    columns: vec!["A".to_string()],
                    rows: vec![vec!["1".to_string()]],
                }),
            ),
            (
                "logo".to_string(),
                InjectableValue::Image(ImageValue {
                    url: "https://cdn.example/logo.png".to_string(),
                }),
            ),
        ]);
        let image_files = HashMap::from([(
            "logo".to_string(),
            staged_name("https://cdn.example/logo.png"),
        )]);
        let prelude = build_prelude(&values, &HashMap::new(), &image_files);
        assert!(prelude.contains("#let lists = (\"names\": ((\"Alice\", ((\"Bob\", ()), )), ), )"));
        assert!(prelude.contains("(columns: (\"A\", ), rows: ((\"1\", ), ))"));
        assert!(prelude.contains("\"logo\": \"img-"));
    }
}
