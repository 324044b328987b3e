//! Dependency Engine - Get / Set / Switch propagation rules
//!
//! A dependency is declared on one node and names the other end by path:
//! Get and Switch pull into the declaring node, Set pushes out of it. One
//! `execute` call applies one rule once and reports what it changed;
//! reaching a fixed point across chained rules is the caller's job.
//!
//! With a bit range, Get reads only those bits of the source, while Set and
//! Switch write only those bits of the target.

use serde_json::Value as Json;

use crate::bitpack;
use crate::change::PropertyChangeRecord;
use crate::config::BuildContext;
use crate::convert;
use crate::declaration::DependencyDecl;
use crate::error::{BuildError, Result};
use crate::expr::{Formula, Resolution};
use crate::node::{self, NodeKind};
use crate::scope::Evaluator;
use crate::tree::{NodeId, Tree};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetProperty {
    Value,
    Enabled,
    Visible,
    Save,
    Path,
}

impl TargetProperty {
    fn parse(name: Option<&str>, node: &str) -> Result<Self> {
        Ok(match name.unwrap_or("value") {
            "value" => Self::Value,
            "enabled" => Self::Enabled,
            "visible" => Self::Visible,
            "save" | "xml_save" => Self::Save,
            "path" => Self::Path,
            other => {
                return Err(BuildError::dependency(
                    node,
                    format!("unsupported target property {other:?}"),
                ))
            }
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Value => "value",
            Self::Enabled => "enabled",
            Self::Visible => "visible",
            Self::Save => "save",
            Self::Path => "path",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitRange {
    pub low: u32,
    pub high: u32,
}

impl BitRange {
    fn parse(low: Option<u32>, high: Option<u32>, node: &str) -> Result<Option<Self>> {
        match (low, high) {
            (None, None) => Ok(None),
            (Some(low), Some(high)) if low <= high && high < 128 => Ok(Some(Self { low, high })),
            (Some(low), Some(high)) => Err(BuildError::dependency(
                node,
                format!("invalid bit range [{low}:{high}]"),
            )),
            _ => Err(BuildError::dependency(node, "bit_low and bit_high must be given together")),
        }
    }

    pub fn width(self) -> u32 {
        self.high - self.low + 1
    }
}

#[derive(Debug, Clone)]
pub enum Rule {
    Get {
        source: String,
        property: String,
        formula: Option<Formula>,
    },
    Set {
        target: String,
        duplicate: bool,
    },
    Switch {
        source: String,
        cases: Vec<(Value, Json)>,
        default: Option<Json>,
    },
}

#[derive(Debug, Clone)]
pub struct Dependency {
    pub rule: Rule,
    pub target_property: TargetProperty,
    pub bits: Option<BitRange>,
}

fn case_key(text: &str) -> Value {
    if let Ok(v) = convert::parse_int(text) {
        Value::Int(v)
    } else if let Ok(b) = convert::parse_bool(text) {
        Value::Bool(b)
    } else {
        Value::Str(text.to_string())
    }
}

fn json_value(json: &Json) -> Value {
    match json {
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => n
            .as_i64()
            .map(|v| Value::Int(i128::from(v)))
            .or_else(|| n.as_u64().map(|v| Value::Int(i128::from(v))))
            .unwrap_or_else(|| Value::Str(n.to_string())),
        Json::String(s) => Value::Str(s.clone()),
        other => Value::Str(other.to_string()),
    }
}

impl Dependency {
    pub fn parse(decl: &DependencyDecl, node: &str) -> Result<Self> {
        let formula = |src: &str| Formula::parse(src).map_err(|e| BuildError::dependency(node, e.to_string()));
        let (rule, target_property, low, high) = match decl {
            DependencyDecl::Get {
                source,
                property,
                formula: f,
                target_property,
                bit_low,
                bit_high,
            } => (
                Rule::Get {
                    source: source.clone(),
                    property: property.clone().unwrap_or_else(|| "value".to_string()),
                    formula: f.as_deref().map(formula).transpose()?,
                },
                target_property,
                bit_low,
                bit_high,
            ),
            DependencyDecl::Set {
                target,
                target_property,
                duplicate,
                bit_low,
                bit_high,
            } => (
                Rule::Set {
                    target: target.clone(),
                    duplicate: *duplicate,
                },
                target_property,
                bit_low,
                bit_high,
            ),
            DependencyDecl::Switch {
                source,
                values,
                default,
                target_property,
                bit_low,
                bit_high,
            } => (
                Rule::Switch {
                    source: source.clone(),
                    cases: values.iter().map(|(k, v)| (case_key(k), v.clone())).collect(),
                    default: default.clone(),
                },
                target_property,
                bit_low,
                bit_high,
            ),
        };
        if source_or_target(&rule).is_empty() {
            return Err(BuildError::dependency(node, "dependency needs a source or target path"));
        }
        Ok(Self {
            rule,
            target_property: TargetProperty::parse(target_property.as_deref(), node)?,
            bits: BitRange::parse(*low, *high, node)?,
        })
    }

    pub fn kind(&self) -> &'static str {
        match self.rule {
            Rule::Get { .. } => "get",
            Rule::Set { .. } => "set",
            Rule::Switch { .. } => "switch",
        }
    }

    /// Apply the rule once. `owner` is the node that declared it.
    pub fn execute(&self, tree: &mut Tree, owner: NodeId, ctx: &BuildContext) -> Result<Vec<PropertyChangeRecord>> {
        match &self.rule {
            Rule::Get {
                source,
                property,
                formula,
            } => {
                let (src, explicit) = tree.locate(owner, source)?;
                let ev = Evaluator::new(tree, ctx);
                let read = match formula {
                    Some(f) => ev.formula(src, f)?,
                    None => ev.property(src, explicit.as_deref().unwrap_or(property))?,
                };
                let Resolution::Resolved(value) = read else {
                    return Ok(Vec::new());
                };
                let value = match self.bits {
                    Some(bits) => {
                        let raw = value.as_int().map_err(|e| BuildError::convert(&tree.node(src).name, e))?;
                        Value::Int(bitpack::extract(raw, bits.low, bits.high))
                    }
                    None => value,
                };
                self.write(tree, owner, value, false, ctx)
            }
            Rule::Set { target, duplicate } => {
                let Resolution::Resolved(value) = Evaluator::new(tree, ctx).value(owner)? else {
                    return Ok(Vec::new());
                };
                let (dst, _) = tree.locate(owner, target)?;
                if self.target_property == TargetProperty::Enabled
                    && !matches!(tree.node(dst).kind, NodeKind::Group)
                {
                    return Err(BuildError::dependency(
                        &tree.node(owner).name,
                        format!("enabled can only be set on a group, '{}' is not one", tree.node(dst).name),
                    ));
                }
                if *duplicate {
                    self.check_range(tree, owner, dst, &value, ctx)?;
                }
                self.write(tree, dst, value, true, ctx)
            }
            Rule::Switch {
                source,
                cases,
                default,
            } => {
                let (src, explicit) = tree.locate(owner, source)?;
                let read = Evaluator::new(tree, ctx).property(src, explicit.as_deref().unwrap_or("value"))?;
                let Resolution::Resolved(key) = read else {
                    return Ok(Vec::new());
                };
                let mapped = cases
                    .iter()
                    .find(|(case, _)| case.loosely_equals(&key))
                    .map(|(_, json)| json)
                    .or(default.as_ref())
                    .ok_or_else(|| {
                        BuildError::dependency(&tree.node(owner).name, format!("no case matches {key}"))
                    })?;
                let target = tree.node(owner);
                let value = match (self.target_property, self.bits) {
                    (TargetProperty::Value, None) => node::literal_for(&target.kind, &target.name, mapped)?,
                    _ => json_value(mapped),
                };
                self.write(tree, owner, value, true, ctx)
            }
        }
    }

    /// A duplicated value must fit the destination's bits as they are.
    fn check_range(&self, tree: &Tree, owner: NodeId, dst: NodeId, value: &Value, ctx: &BuildContext) -> Result<()> {
        let width = match self.bits {
            Some(bits) => bits.width(),
            None => match Evaluator::new(tree, ctx).size(dst)? {
                Resolution::Resolved(size) => (size * 8).min(128) as u32,
                Resolution::Deferred(_) => return Ok(()),
            },
        };
        let raw = value
            .as_int()
            .map_err(|e| BuildError::convert(&tree.node(owner).name, e))?;
        if raw < 0 || (width < 128 && raw > bitpack::field_mask(width)) {
            return Err(BuildError::RangeExceeded {
                source_node: tree.path_of(owner),
                target: tree.path_of(dst),
                value: raw,
                width,
            });
        }
        Ok(())
    }

    fn write(
        &self,
        tree: &mut Tree,
        target: NodeId,
        value: Value,
        into_bits: bool,
        ctx: &BuildContext,
    ) -> Result<Vec<PropertyChangeRecord>> {
        let value = match self.bits {
            Some(bits) if into_bits && self.target_property == TargetProperty::Value => {
                let name = &tree.node(target).name;
                let field = value.as_int().map_err(|e| BuildError::convert(name, e))?;
                let current = Evaluator::new(tree, ctx)
                    .value(target)?
                    .resolved()
                    .map(|v| v.as_int())
                    .transpose()
                    .map_err(|e| BuildError::convert(name, e))?
                    .unwrap_or(0);
                Value::Int(bitpack::insert(current, bits.low, bits.high, field))
            }
            _ => value,
        };
        tree.set_property(target, self.target_property.name(), value, ctx)
    }
}

fn source_or_target(rule: &Rule) -> &str {
    match rule {
        Rule::Get { source, .. } | Rule::Switch { source, .. } => source,
        Rule::Set { target, .. } => target,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::Declaration;
    use serde_json::json;

    fn tree(settings: serde_json::Value) -> Tree {
        let decl: Declaration = serde_json::from_value(json!({"name": "fw", "settings": settings})).unwrap();
        Tree::from_declaration(&decl, &BuildContext::default()).unwrap()
    }

    fn at(t: &Tree, path: &str) -> NodeId {
        t.locate(t.root(), path).unwrap().0
    }

    fn value(t: &Tree, path: &str) -> Value {
        let ctx = BuildContext::default();
        Evaluator::new(t, &ctx).value(at(t, path)).unwrap().resolved().unwrap()
    }

    fn run(t: &mut Tree, path: &str) -> Result<Vec<PropertyChangeRecord>> {
        let id = at(t, path);
        let deps = t.node(id).dependencies.clone();
        let mut out = Vec::new();
        for dep in deps {
            out.extend(dep.execute(t, id, &BuildContext::default())?);
        }
        Ok(out)
    }

    #[test]
    fn test_get_is_idempotent() {
        let mut t = tree(json!([
            {"kind": "int", "name": "a", "size": 1, "value": 5},
            {"kind": "int", "name": "b", "size": 1, "value": 1,
             "dependency": [{"type": "get", "source": "a"}]}
        ]));
        let first = run(&mut t, "/settings/b").unwrap();
        assert_eq!(value(&t, "/settings/b"), Value::Int(5));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].previous["value"], Some(Value::Int(1)));
        assert!(run(&mut t, "/settings/b").unwrap().is_empty());
    }

    #[test]
    fn test_get_with_formula_and_bits() {
        let mut t = tree(json!([
            {"kind": "int", "name": "a", "size": 1, "value": 0xB4},
            {"kind": "int", "name": "hi", "size": 1,
             "dependency": [{"type": "get", "source": "a", "bit_low": 4, "bit_high": 7}]},
            {"kind": "int", "name": "twice", "size": 2,
             "dependency": [{"type": "get", "source": "a", "formula": "this.value * 2"}]}
        ]));
        run(&mut t, "/settings/hi").unwrap();
        run(&mut t, "/settings/twice").unwrap();
        assert_eq!(value(&t, "/settings/hi"), Value::Int(0xB));
        assert_eq!(value(&t, "/settings/twice"), Value::Int(0x168));
    }

    #[test]
    fn test_set_into_bits_and_enabled_rules() {
        let mut t = tree(json!([
            {"kind": "int", "name": "mode", "size": 1, "value": 2,
             "dependency": [{"type": "set", "target": "reg", "bit_low": 4, "bit_high": 5}]},
            {"kind": "int", "name": "reg", "size": 1, "value": 0x0F}
        ]));
        run(&mut t, "/settings/mode").unwrap();
        assert_eq!(value(&t, "/settings/reg"), Value::Int(0x2F));

        let mut t = tree(json!([
            {"kind": "int", "name": "on", "size": 1, "value": 0,
             "dependency": [{"type": "set", "target": "leaf", "target_property": "enabled"}]},
            {"kind": "int", "name": "leaf", "size": 1, "value": 0}
        ]));
        assert!(matches!(run(&mut t, "/settings/on"), Err(BuildError::Dependency { .. })));
    }

    #[test]
    fn test_duplicate_reports_range_exceeded() {
        let mut t = tree(json!([
            {"kind": "int", "name": "src", "size": 2, "value": 300,
             "dependency": [{"type": "set", "target": "dst", "duplicate": true}]},
            {"kind": "int", "name": "dst", "size": 1, "value": 0}
        ]));
        assert!(matches!(
            run(&mut t, "/settings/src"),
            Err(BuildError::RangeExceeded { value: 300, width: 8, .. })
        ));
        assert_eq!(value(&t, "/settings/dst"), Value::Int(0));
    }

    #[test]
    fn test_switch_maps_and_falls_back() {
        let mut t = tree(json!([
            {"kind": "string", "name": "board", "size": 8, "value": "rev-b"},
            {"kind": "int", "name": "clock", "size": 4,
             "dependency": [{"type": "switch", "source": "board",
                             "values": {"rev-a": 48, "rev-b": 96}, "default": 12}]}
        ]));
        run(&mut t, "/settings/clock").unwrap();
        assert_eq!(value(&t, "/settings/clock"), Value::Int(96));

        let board = at(&t, "/settings/board");
        t.set_value(board, Value::Str("proto".into()), &BuildContext::default()).unwrap();
        run(&mut t, "/settings/clock").unwrap();
        assert_eq!(value(&t, "/settings/clock"), Value::Int(12));
    }

    #[test]
    fn test_malformed_specs() {
        let get = |extra: serde_json::Value| {
            let mut d = json!({"type": "get", "source": "a"});
            d.as_object_mut().unwrap().extend(extra.as_object().unwrap().clone());
            let decl: DependencyDecl = serde_json::from_value(d).unwrap();
            Dependency::parse(&decl, "b")
        };
        assert!(get(json!({})).is_ok());
        assert!(get(json!({"bit_low": 2})).is_err());
        assert!(get(json!({"bit_low": 5, "bit_high": 2})).is_err());
        assert!(get(json!({"target_property": "offset"})).is_err());
    }
}
