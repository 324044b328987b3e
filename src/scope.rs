//! Evaluation Scope - read-only view of the tree for formulas
//!
//! [`Evaluator`] answers value, byte and property reads for any node, and
//! evaluates formulas in the scope of the node that owns them. During the
//! build phase it is created with [`Evaluator::for_build`], which makes byte
//! reads of nodes that are not yet built defer instead of answering with
//! provisional bytes.

use std::cell::Cell;
use std::io;

use crate::bitpack;
use crate::config::BuildContext;
use crate::convert;
use crate::error::{BuildError, Result};
use crate::expr::{Environment, Formula, Lookup, Resolution};
use crate::node::{NodeKind, Phase};
use crate::resolved;
use crate::tree::{NodeId, Section, Tree};
use crate::value::Value;

/// Formula nesting beyond this is treated as a reference cycle.
pub const MAX_EVAL_DEPTH: usize = 64;

pub struct Evaluator<'a> {
    tree: &'a Tree,
    ctx: &'a BuildContext,
    require_built: bool,
    depth: Cell<usize>,
}

impl<'a> Evaluator<'a> {
    pub fn new(tree: &'a Tree, ctx: &'a BuildContext) -> Self {
        Self {
            tree,
            ctx,
            require_built: false,
            depth: Cell::new(0),
        }
    }

    pub fn for_build(tree: &'a Tree, ctx: &'a BuildContext) -> Self {
        Self {
            require_built: true,
            ..Self::new(tree, ctx)
        }
    }

    pub fn tree(&self) -> &'a Tree {
        self.tree
    }

    pub fn ctx(&self) -> &'a BuildContext {
        self.ctx
    }

    pub fn formula(&self, origin: NodeId, formula: &Formula) -> Result<Resolution<Value>> {
        let depth = self.depth.get();
        if depth >= MAX_EVAL_DEPTH {
            return Err(BuildError::component(
                &self.tree.node(origin).name,
                format!("formula {:?} nests too deeply (circular reference?)", formula.source()),
            ));
        }
        self.depth.set(depth + 1);
        let result = formula.evaluate(&NodeScope { eval: self, origin });
        self.depth.set(depth);
        result
    }

    /// Evaluate a formula that must produce a non-negative integer.
    pub fn usize(&self, origin: NodeId, formula: &Formula, what: &str) -> Result<Resolution<usize>> {
        let value = resolved!(self.formula(origin, formula));
        let name = &self.tree.node(origin).name;
        let int = value.as_int().map_err(|e| BuildError::convert(name, e))?;
        usize::try_from(int)
            .map(Resolution::Resolved)
            .map_err(|_| BuildError::component(name, format!("{what} must be non-negative, got {int}")))
    }

    /// Own enablement and that of every ancestor.
    pub fn enabled(&self, id: NodeId) -> Result<Resolution<bool>> {
        let mut current = Some(id);
        while let Some(n) = current {
            let node = self.tree.node(n);
            if node.state.enabled == Some(false) {
                return Ok(Resolution::Resolved(false));
            }
            if let Some(formula) = &node.enabled {
                if !resolved!(self.formula(n, formula)).truthy() {
                    return Ok(Resolution::Resolved(false));
                }
            }
            current = node.parent;
        }
        Ok(Resolution::Resolved(true))
    }

    pub fn size(&self, id: NodeId) -> Result<Resolution<usize>> {
        let node = self.tree.node(id);
        if let Some(size) = node.state.size {
            return Ok(Resolution::Resolved(size));
        }
        if let Some(formula) = &node.size {
            return self.usize(id, formula, "size");
        }
        if let Some(size) = node.natural_size(self.ctx) {
            return Ok(Resolution::Resolved(size));
        }
        if self.tree.is_bit_field(id) {
            return Ok(Resolution::Resolved(0));
        }
        Ok(Resolution::Deferred(format!("size of '{}' is not laid out yet", node.name)))
    }

    pub fn value(&self, id: NodeId) -> Result<Resolution<Value>> {
        let node = self.tree.node(id);
        if node.state.enabled == Some(false) {
            return Ok(Resolution::Resolved(node.default_value()));
        }
        match &node.kind {
            NodeKind::Function(_) => {
                return Ok(match &node.state.bytes {
                    Some(bytes) if node.state.phase == Phase::Built => {
                        Resolution::Resolved(Value::Bytes(node.state.plain.clone().unwrap_or_else(|| bytes.clone())))
                    }
                    _ => Resolution::Deferred(format!("function '{}' is not built yet", node.name)),
                });
            }
            NodeKind::File(file) if node.value.is_none() => {
                if let Some(cache) = &file.cache {
                    return Ok(Resolution::Resolved(Value::Bytes(cache.bytes.clone())));
                }
                if let Some(error) = &file.error {
                    return Err(BuildError::file(
                        &file.path,
                        io::Error::new(error.kind, error.message.clone()),
                    ));
                }
                return Ok(Resolution::Deferred(format!("file '{}' is not loaded", file.path)));
            }
            _ => {}
        }
        if self.tree.is_bit_field(id) {
            return bitpack::field_value(self, id);
        }
        if node.kind.holds_bits() && !node.children.is_empty() {
            return bitpack::register_value(self, id);
        }
        if let Some(value) = &node.value {
            return Ok(Resolution::Resolved(value.clone()));
        }
        if let Some(formula) = &node.calculate {
            return self.formula(id, formula);
        }
        if !node.children.is_empty() || node.kind.is_repetition() {
            return Ok(self.bytes(id)?.map(Value::Bytes));
        }
        if let Some(bytes) = &node.state.bytes {
            return node.decode(bytes).map(Resolution::Resolved);
        }
        Err(BuildError::component(&node.name, "node has neither a value nor children"))
    }

    /// Bytes a node contributes to the image.
    pub fn bytes(&self, id: NodeId) -> Result<Resolution<Vec<u8>>> {
        let node = self.tree.node(id);
        if let Some(bytes) = &node.state.bytes {
            return Ok(Resolution::Resolved(bytes.clone()));
        }
        if node.state.enabled == Some(false) {
            return Ok(Resolution::Resolved(Vec::new()));
        }
        let is_container = node.value.is_none()
            && node.calculate.is_none()
            && !node.kind.holds_bits()
            && (!node.children.is_empty() || node.kind.is_repetition());
        if is_container {
            let mut out = Vec::new();
            for &child in &node.children {
                out.extend(resolved!(self.bytes(child)));
            }
            return Ok(Resolution::Resolved(out));
        }
        let value = resolved!(self.value(id));
        let size = match node.state.content_size {
            Some(size) => Some(size),
            None => match &node.size {
                Some(formula) => Some(resolved!(self.usize(id, formula, "size"))),
                None => node.natural_size(self.ctx),
            },
        };
        let pad = self.tree.pad_byte(id, self.ctx);
        node.encode(&value, size, pad).map(Resolution::Resolved)
    }

    /// During the build phase, other nodes' bytes are only final once built.
    fn unbuilt(&self, id: NodeId) -> Option<Resolution<Value>> {
        let node = self.tree.node(id);
        let pending = self.require_built
            && node.state.phase != Phase::Built
            && node.state.enabled != Some(false)
            && !self.tree.is_bit_field(id)
            && self.tree.in_section(id, Section::Layout);
        pending.then(|| Resolution::Deferred(format!("'{}' is not built yet", node.name)))
    }

    /// Bytes before encryption.
    pub fn plain(&self, id: NodeId) -> Result<Resolution<Vec<u8>>> {
        match &self.tree.node(id).state.plain {
            Some(plain) => Ok(Resolution::Resolved(plain.clone())),
            None => self.bytes(id),
        }
    }

    pub fn property(&self, id: NodeId, property: &str) -> Result<Resolution<Value>> {
        let node = self.tree.node(id);
        if !node.has_property(property) {
            return Err(BuildError::UnknownProperty {
                node: node.name.clone(),
                kind: node.kind.name(),
                property: property.to_string(),
            });
        }
        let int = |v: usize| -> Result<Resolution<Value>> { Ok(Resolution::Resolved(Value::Int(v as i128))) };
        match (property, &node.kind) {
            ("name", _) => Ok(Resolution::Resolved(Value::Str(node.name.clone()))),
            ("kind", _) => Ok(Resolution::Resolved(Value::Str(node.kind.name().to_string()))),
            ("index", _) => match node.index {
                Some(i) => int(i),
                None => Err(BuildError::component(&node.name, "not a repetition entry")),
            },
            ("offset", _) => match node.state.offset {
                Some(offset) => int(offset),
                None => Ok(Resolution::Deferred(format!("offset of '{}' is not laid out yet", node.name))),
            },
            ("size", _) => Ok(self.size(id)?.map(|s| Value::Int(s as i128))),
            ("enabled", _) => Ok(self.enabled(id)?.map(Value::Bool)),
            ("visible", _) => Ok(Resolution::Resolved(Value::Bool(node.visible))),
            ("save", _) => Ok(Resolution::Resolved(Value::Bool(node.save))),
            ("value", kind)
                if !node.children.is_empty()
                    && !kind.holds_bits()
                    && node.value.is_none()
                    && node.calculate.is_none() =>
            {
                match self.unbuilt(id) {
                    Some(pending) => Ok(pending),
                    None => self.value(id),
                }
            }
            ("value", _) => self.value(id),
            ("data" | "plain", _) => match self.unbuilt(id) {
                Some(pending) => Ok(pending),
                None if property == "data" => Ok(self.bytes(id)?.map(Value::Bytes)),
                None => Ok(self.plain(id)?.map(Value::Bytes)),
            },
            ("signed", NodeKind::Int { signed }) => Ok(Resolution::Resolved(Value::Bool(*signed))),
            ("signed", _) => Ok(Resolution::Resolved(Value::Bool(false))),
            ("min" | "max", kind) => {
                let size = resolved!(self.size(id));
                let signed = matches!(kind, NodeKind::Int { signed: true });
                let (min, max) = convert::int_bounds(size, signed).map_err(|e| BuildError::convert(&node.name, e))?;
                Ok(Resolution::Resolved(Value::Int(if property == "min" { min } else { max })))
            }
            ("position" | "bit_low" | "bit_high" | "mask" | "width", kind) => {
                let (low, high) = kind
                    .bit_range()
                    .ok_or_else(|| BuildError::component(&node.name, "not a bit field"))?;
                let width = high - low + 1;
                Ok(Resolution::Resolved(Value::Int(match property {
                    "position" | "bit_low" => i128::from(low),
                    "bit_high" => i128::from(high),
                    "width" => i128::from(width),
                    _ => bitpack::field_mask(width) << low,
                })))
            }
            ("count", _) => int(node.children.len()),
            ("path", NodeKind::File(file)) => Ok(Resolution::Resolved(Value::Str(file.path.clone()))),
            ("mtime", NodeKind::File(file)) => {
                let secs = file
                    .cache
                    .as_ref()
                    .and_then(|c| c.modified)
                    .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
                    .map_or(0, |d| d.as_secs());
                Ok(Resolution::Resolved(Value::Int(i128::from(secs))))
            }
            ("algorithm", NodeKind::Function(spec)) => {
                Ok(Resolution::Resolved(Value::Str(spec.algorithm.name().to_string())))
            }
            _ => {
                let value = resolved!(self.value(id));
                match node.value_facet(property, &value)? {
                    Some(v) => Ok(Resolution::Resolved(v)),
                    None => Err(BuildError::UnknownProperty {
                        node: node.name.clone(),
                        kind: node.kind.name(),
                        property: property.to_string(),
                    }),
                }
            }
        }
    }
}

/// The environment a formula owned by `origin` evaluates in.
struct NodeScope<'e, 'a> {
    eval: &'e Evaluator<'a>,
    origin: NodeId,
}

impl Environment for NodeScope<'_, '_> {
    fn origin_name(&self) -> String {
        self.eval.tree.node(self.origin).name.clone()
    }

    fn placeholder(&self, key: &str) -> Result<Option<usize>> {
        let tree = self.eval.tree;
        let mut entries = std::iter::successors(Some(self.origin), |n| tree.parent(*n))
            .filter_map(|n| tree.node(n).index);
        match key {
            "index" => Ok(entries.next()),
            "parent_index" => Ok(entries.nth(1)),
            other => Err(BuildError::component(
                &self.origin_name(),
                format!("unknown placeholder {{{other}}}"),
            )),
        }
    }

    fn lookup(&self, lookup: &Lookup) -> Result<Resolution<Value>> {
        let target = self.eval.tree.find(self.origin, lookup)?;
        self.eval
            .property(target, lookup.property.as_deref().unwrap_or("value"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::Declaration;
    use serde_json::json;

    fn tree(layout: serde_json::Value) -> Tree {
        let decl: Declaration = serde_json::from_value(json!({
            "name": "fw",
            "settings": [
                {"kind": "int", "name": "mode", "size": 1, "value": 3},
                {"kind": "string", "name": "label", "size": 8, "value": "boot"}
            ],
            "layout": layout
        }))
        .unwrap();
        Tree::from_declaration(&decl, &BuildContext::default()).unwrap()
    }

    fn id(t: &Tree, path: &str) -> NodeId {
        t.locate(t.root(), path).unwrap().0
    }

    #[test]
    fn test_formula_reads_settings_and_siblings() {
        let t = tree(json!([
            {"kind": "int", "name": "a", "size": 1, "value": 4},
            {"kind": "int", "name": "b", "size": 2, "calculate": "a * 2 + mode"}
        ]));
        let ctx = BuildContext::default();
        let ev = Evaluator::new(&t, &ctx);
        assert_eq!(ev.value(id(&t, "/layout/b")).unwrap(), Resolution::Resolved(Value::Int(11)));
        assert_eq!(
            ev.bytes(id(&t, "/layout/b")).unwrap(),
            Resolution::Resolved(vec![11, 0])
        );
    }

    #[test]
    fn test_offset_defers_until_laid_out() {
        let t = tree(json!([
            {"kind": "int", "name": "ptr", "size": 4, "calculate": "body.offset"},
            {"kind": "bytes", "name": "body", "value": "AABB"}
        ]));
        let ctx = BuildContext::default();
        let ev = Evaluator::new(&t, &ctx);
        assert!(matches!(ev.value(id(&t, "/layout/ptr")).unwrap(), Resolution::Deferred(_)));
    }

    #[test]
    fn test_container_bytes_concatenate_children() {
        let t = tree(json!([{
            "kind": "group", "name": "g",
            "children": [
                {"kind": "int", "name": "x", "size": 2, "value": 1, "byte_order": "big"},
                {"kind": "string", "name": "s", "size": 4, "calculate": "label"}
            ]
        }]));
        let ctx = BuildContext::default();
        let ev = Evaluator::new(&t, &ctx);
        assert_eq!(
            ev.bytes(id(&t, "/layout/g")).unwrap(),
            Resolution::Resolved(b"\x00\x01boot".to_vec())
        );
        assert_eq!(
            ev.property(id(&t, "/layout/g"), "count").unwrap(),
            Resolution::Resolved(Value::Int(2))
        );
    }

    #[test]
    fn test_disabled_node_reports_default() {
        let mut t = tree(json!([
            {"kind": "int", "name": "x", "size": 1, "value": 9, "enabled": "mode == 4"},
            {"kind": "int", "name": "y", "size": 2, "calculate": "mode + 1", "enabled": "mode == 4"},
            {"kind": "int", "name": "z", "size": 1, "value": 7}
        ]));
        let ctx = BuildContext::default();
        let x = id(&t, "/layout/x");
        let y = id(&t, "/layout/y");
        assert_eq!(Evaluator::new(&t, &ctx).enabled(x).unwrap(), Resolution::Resolved(false));

        let mut buffer = crate::buffer::Buffer::with_capacity(16, 0);
        crate::layout::Layouter::new(&ctx).run(&mut t, &mut buffer).unwrap();
        let ev = Evaluator::new(&t, &ctx);
        for disabled in [x, y] {
            assert_eq!(ev.value(disabled).unwrap(), Resolution::Resolved(Value::Int(0)));
            assert_eq!(ev.size(disabled).unwrap(), Resolution::Resolved(0));
            assert_eq!(ev.bytes(disabled).unwrap(), Resolution::Resolved(Vec::new()));
        }
        assert_eq!(ev.property(x, "max").unwrap(), Resolution::Resolved(Value::Int(255)));
        assert_eq!(ev.property(id(&t, "/layout/z"), "offset").unwrap(), Resolution::Resolved(Value::Int(0)));
    }

    #[test]
    fn test_reference_cycle_is_an_error() {
        let t = tree(json!([
            {"kind": "int", "name": "a", "size": 1, "calculate": "b"},
            {"kind": "int", "name": "b", "size": 1, "calculate": "a"}
        ]));
        let ctx = BuildContext::default();
        let ev = Evaluator::new(&t, &ctx);
        assert!(ev.value(id(&t, "/layout/a")).is_err());
    }

    #[test]
    fn test_unknown_property_is_typed() {
        let t = tree(json!([{"kind": "int", "name": "a", "size": 1, "value": 1}]));
        let ctx = BuildContext::default();
        let ev = Evaluator::new(&t, &ctx);
        assert!(matches!(
            ev.property(id(&t, "/layout/a"), "major"),
            Err(BuildError::UnknownProperty { .. })
        ));
    }
}
