//! Node Arena - ownership tree with handle back-references
//!
//! Parents own their children through `children` lists; `parent` links and
//! repetition templates are plain [`NodeId`] handles into the same arena.
//! Templates stay detached in the arena; dropped repetition entries are
//! released and their slots reused by later nodes.

use serde::Serialize;

use crate::bitpack;
use crate::change::PropertyChangeRecord;
use crate::config::BuildContext;
use crate::declaration::{Declaration, NodeDecl};
use crate::error::{BuildError, Result, WithinExt};
use crate::expr::{Formula, Lookup, Step};
use crate::node::{Node, NodeKind};
use crate::scope::Evaluator;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NodeId(usize);

impl NodeId {
    pub fn from_raw(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Settings,
    Layout,
    Decomposition,
}

impl Section {
    pub fn name(self) -> &'static str {
        match self {
            Self::Settings => "settings",
            Self::Layout => "layout",
            Self::Decomposition => "decomposition",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<Node>,
    root: NodeId,
    settings: NodeId,
    layout: NodeId,
    decomposition: NodeId,
    free: Vec<NodeId>,
}

impl Tree {
    pub fn from_declaration(decl: &Declaration, ctx: &BuildContext) -> Result<Self> {
        let mut tree = Self {
            nodes: vec![Node::synthetic("", NodeKind::Group)],
            root: NodeId(0),
            settings: NodeId(0),
            layout: NodeId(0),
            decomposition: NodeId(0),
            free: Vec::new(),
        };
        tree.settings = tree.add_section(Section::Settings, &decl.settings, ctx)?;
        tree.layout = tree.add_section(Section::Layout, &decl.layout, ctx)?;
        tree.decomposition = tree.add_section(Section::Decomposition, &decl.decomposition, ctx)?;
        Ok(tree)
    }

    fn add_section(&mut self, section: Section, decls: &[NodeDecl], ctx: &BuildContext) -> Result<NodeId> {
        let id = self.push(Node::synthetic(section.name(), NodeKind::Group), Some(self.root));
        self.nodes[self.root.0].children.push(id);
        for decl in decls {
            let child = self.insert(decl, id, ctx).within(section.name())?;
            self.nodes[id.0].children.push(child);
        }
        Ok(id)
    }

    fn push(&mut self, mut node: Node, parent: Option<NodeId>) -> NodeId {
        node.parent = parent;
        if let Some(slot) = self.free.pop() {
            self.nodes[slot.0] = node;
            return slot;
        }
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    /// Return a detached subtree (children and nested templates included)
    /// to the free list. The caller must already have unlinked `id`.
    pub fn release(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            let node = std::mem::replace(&mut self.nodes[next.0], Node::synthetic("", NodeKind::Group));
            stack.extend(node.children);
            if let Some(template) = node.kind.repetition().and_then(|r| r.template) {
                stack.push(template);
            }
            self.free.push(next);
        }
    }

    /// Number of arena slots in use, detached templates included.
    pub fn live_nodes(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Number of arena slots allocated.
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Parse `decl` and its subtree under `parent`; the caller attaches it.
    fn insert(&mut self, decl: &NodeDecl, parent: NodeId, ctx: &BuildContext) -> Result<NodeId> {
        let node = Node::parse(decl, ctx)?;
        let name = node.name.clone();
        let is_repetition = node.kind.is_repetition();
        let id = self.push(node, Some(parent));

        if is_repetition {
            let [template] = decl.children.as_slice() else {
                return Err(BuildError::parse(&name, "repetition requires exactly one template child"));
            };
            let template = self.insert(template, id, ctx).within(&name)?;
            if let NodeKind::Table(rep) | NodeKind::Iterable(rep) = &mut self.nodes[id.0].kind {
                rep.template = Some(template);
            }
            return Ok(id);
        }

        for child in &decl.children {
            let child = self.insert(child, id, ctx).within(&name)?;
            self.nodes[id.0].children.push(child);
        }

        let holds_bits = self.node(id).kind.holds_bits();
        let has_fields = !self.node(id).children.is_empty();
        for &child in &self.node(id).children {
            if self.node(child).kind.bit_range().is_some() != holds_bits {
                return Err(BuildError::parse(
                    &self.node(child).name,
                    "bit fields must be direct children of an int or bitregister",
                )
                .within(&name));
            }
        }
        if holds_bits && (has_fields || matches!(self.node(id).kind, NodeKind::BitRegister)) {
            bitpack::check_fields(self, id)?;
        }
        Ok(id)
    }

    /// Attach a generated node as the last child of `parent`.
    pub fn attach(&mut self, node: Node, parent: NodeId) -> NodeId {
        let id = self.push(node, Some(parent));
        self.nodes[parent.0].children.push(id);
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn section(&self, section: Section) -> NodeId {
        match section {
            Section::Settings => self.settings,
            Section::Layout => self.layout,
            Section::Decomposition => self.decomposition,
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).children
    }

    /// `id` and its attached descendants, depth-first in declaration order.
    pub fn preorder(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.children(next).iter().rev());
        }
        out
    }

    pub fn depth(&self, id: NodeId) -> usize {
        std::iter::successors(self.parent(id), |p| self.parent(*p)).count()
    }

    pub fn is_bit_field(&self, id: NodeId) -> bool {
        self.node(id).kind.bit_range().is_some()
            && self.parent(id).is_some_and(|p| self.node(p).kind.holds_bits())
    }

    pub fn in_section(&self, id: NodeId, section: Section) -> bool {
        let target = self.section(section);
        std::iter::successors(Some(id), |n| self.parent(*n)).any(|n| n == target)
    }

    /// Absolute path, with repetition entries rendered as `name[i]`.
    pub fn path_of(&self, id: NodeId) -> String {
        let Some(parent) = self.parent(id) else {
            return String::new();
        };
        let node = self.node(id);
        match node.index {
            Some(i) if self.node(parent).kind.is_repetition() => format!("{}[{i}]", self.path_of(parent)),
            _ => format!("{}/{}", self.path_of(parent), node.name),
        }
    }

    /// Pad byte declared on the node or its nearest ancestor.
    pub fn pad_byte(&self, id: NodeId, ctx: &BuildContext) -> u8 {
        std::iter::successors(Some(id), |n| self.parent(*n))
            .find_map(|n| self.node(n).pad)
            .unwrap_or(ctx.pad_byte)
    }

    fn select(&self, parent: NodeId, step: &Step) -> Option<NodeId> {
        let mut named = self
            .children(parent)
            .iter()
            .copied()
            .filter(|c| self.node(*c).name == step.name);
        match step.index {
            None => named.next(),
            Some(i) => {
                let first = named.next()?;
                if self.node(first).kind.is_repetition() {
                    self.children(first).get(i).copied()
                } else {
                    std::iter::once(first).chain(named).nth(i)
                }
            }
        }
    }

    /// Lexical lookup: siblings first, then each ancestor's children, then
    /// the top-level settings.
    fn select_in_scope(&self, origin: NodeId, step: &Step) -> Option<NodeId> {
        let mut scope = self.parent(origin).or(Some(origin));
        while let Some(s) = scope {
            if let Some(found) = self.select(s, step) {
                return Some(found);
            }
            scope = self.parent(s);
        }
        self.select(self.settings, step)
    }

    fn walk(&self, from: NodeId, step: &Step) -> Option<NodeId> {
        match step.name.as_str() {
            "this" => Some(from),
            "parent" => self.parent(from),
            _ => self.select(from, step),
        }
    }

    pub fn find(&self, origin: NodeId, lookup: &Lookup) -> Result<NodeId> {
        let not_found = || {
            let rendered: Vec<String> = lookup
                .steps
                .iter()
                .map(|s| match s.index {
                    Some(i) => format!("{}[{i}]", s.name),
                    None => s.name.clone(),
                })
                .collect();
            let prefix = if lookup.absolute { "/" } else { "" };
            BuildError::component(
                &self.node(origin).name,
                format!("no node matches path {prefix}{}", rendered.join("/")),
            )
        };

        let mut steps = lookup.steps.iter();
        let mut current = match steps.next() {
            None if lookup.absolute => self.root,
            None => origin,
            Some(first) if lookup.absolute => self.select(self.root, first).ok_or_else(not_found)?,
            Some(first) => match first.name.as_str() {
                "this" | "parent" => self.walk(origin, first).ok_or_else(not_found)?,
                _ => self.select_in_scope(origin, first).ok_or_else(not_found)?,
            },
        };
        for step in steps {
            current = self.walk(current, step).ok_or_else(not_found)?;
        }
        Ok(current)
    }

    /// Resolve a plain `a/b[2]/c.property` path without evaluating formulas.
    pub fn locate(&self, origin: NodeId, path: &str) -> Result<(NodeId, Option<String>)> {
        let lookup = parse_plain_path(path).map_err(|message| {
            BuildError::component(&self.node(origin).name, format!("invalid path {path:?}: {message}"))
        })?;
        let property = lookup.property.clone();
        Ok((self.find(origin, &lookup)?, property))
    }

    /// Clone `source`'s subtree under `parent` with fresh state.
    pub fn semideepcopy(&mut self, source: NodeId, parent: NodeId, index: Option<usize>) -> NodeId {
        let mut node = self.node(source).clone();
        node.children = Vec::new();
        node.state.reset();
        node.index = index;
        if let NodeKind::File(file) = &mut node.kind {
            file.invalidate();
        }
        let id = self.push(node, Some(parent));

        let nested = self.node(id).kind.repetition().and_then(|r| r.template);
        if let Some(template) = nested {
            let copy = self.semideepcopy(template, id, None);
            if let NodeKind::Table(rep) | NodeKind::Iterable(rep) = &mut self.nodes[id.0].kind {
                rep.template = Some(copy);
            }
        }

        let children = self.node(source).children.clone();
        for child in children {
            let copy = self.semideepcopy(child, id, None);
            self.nodes[id.0].children.push(copy);
        }
        id
    }

    /// Clear per-build state for a new layout/build cycle.
    pub fn reset(&mut self) {
        for node in &mut self.nodes {
            node.state.reset();
        }
    }

    fn record(&self, id: NodeId, property: &str, previous: Option<Value>) -> Vec<PropertyChangeRecord> {
        vec![PropertyChangeRecord::single(id, self.path_of(id), property, previous)]
    }

    pub fn set_value(&mut self, id: NodeId, value: Value, ctx: &BuildContext) -> Result<Vec<PropertyChangeRecord>> {
        let value = self.node(id).coerce(&value)?;
        if self.is_bit_field(id) {
            return bitpack::set_field(self, id, &value, ctx);
        }
        if self.node(id).kind.holds_bits() && !self.children(id).is_empty() {
            return bitpack::set_register(self, id, &value, ctx);
        }

        let previous = Evaluator::new(self, ctx).value(id).ok().and_then(|r| r.resolved());
        if previous.as_ref() == Some(&value) {
            return Ok(Vec::new());
        }
        self.node_mut(id).value = Some(value);
        Ok(self.record(id, "value", previous))
    }

    pub fn set_property(
        &mut self,
        id: NodeId,
        property: &str,
        value: Value,
        ctx: &BuildContext,
    ) -> Result<Vec<PropertyChangeRecord>> {
        let node = self.node(id);
        if !node.has_property(property) {
            return Err(BuildError::UnknownProperty {
                node: node.name.clone(),
                kind: node.kind.name(),
                property: property.to_string(),
            });
        }
        match property {
            "value" => self.set_value(id, value, ctx),
            "enabled" => {
                let previous = match &node.enabled {
                    Some(f) => Evaluator::new(self, ctx)
                        .formula(id, f)
                        .ok()
                        .and_then(|r| r.resolved())
                        .map(|v| Value::Bool(v.truthy())),
                    None => Some(Value::Bool(true)),
                };
                let next = Value::Bool(value.truthy());
                if previous.as_ref() == Some(&next) {
                    return Ok(Vec::new());
                }
                self.node_mut(id).enabled = Some(Formula::literal(next));
                Ok(self.record(id, "enabled", previous))
            }
            "visible" | "save" => {
                let next = value.truthy();
                let slot = if property == "visible" {
                    &mut self.node_mut(id).visible
                } else {
                    &mut self.node_mut(id).save
                };
                let previous = *slot;
                if previous == next {
                    return Ok(Vec::new());
                }
                *slot = next;
                Ok(self.record(id, property, Some(Value::Bool(previous))))
            }
            "path" => {
                let name = node.name.clone();
                let next = value.as_string().map_err(|e| BuildError::convert(&name, e))?;
                let previous = match &mut self.node_mut(id).kind {
                    NodeKind::File(file) if file.path == next => return Ok(Vec::new()),
                    NodeKind::File(file) => {
                        file.invalidate();
                        std::mem::replace(&mut file.path, next)
                    }
                    _ => return Err(BuildError::component(&name, "path is read-only")),
                };
                Ok(self.record(id, "path", Some(Value::Str(previous))))
            }
            other => Err(BuildError::component(
                &self.node(id).name,
                format!("property {other} is read-only"),
            )),
        }
    }
}

fn parse_plain_path(path: &str) -> std::result::Result<Lookup, String> {
    let absolute = path.starts_with('/');
    let body = path.trim_start_matches('/');
    let mut steps = Vec::new();
    let mut property = None;
    let parts: Vec<&str> = body.split('/').collect();
    for (n, part) in parts.iter().enumerate() {
        let mut part = *part;
        if n + 1 == parts.len() {
            if let Some((head, prop)) = part.split_once('.') {
                property = Some(prop.to_string());
                part = head;
            }
        }
        let (name, index) = match part.split_once('[') {
            Some((name, rest)) => {
                let digits = rest.strip_suffix(']').ok_or("unmatched '['")?;
                let index = digits.parse::<usize>().map_err(|_| format!("bad index {digits:?}"))?;
                (name, Some(index))
            }
            None => (part, None),
        };
        if name.is_empty() {
            return Err("empty segment".to_string());
        }
        steps.push(Step {
            name: name.to_string(),
            index,
        });
    }
    Ok(Lookup {
        absolute,
        steps,
        property,
    })
}
