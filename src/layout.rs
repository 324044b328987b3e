//! Phase 1 - offsets and sizes
//!
//! Walks the layout section over one shared buffer cursor. Forward references
//! (a size that depends on a later node's offset, say) cannot be answered on
//! the first walk, so the walk repeats, keeping the previous pass's offsets
//! and sizes as the best known answers, until nothing is deferred and the
//! result no longer moves.

use serde::Serialize;
use tracing::{debug, info};

use crate::buffer::Buffer;
use crate::config::BuildContext;
use crate::convert;
use crate::crypto;
use crate::error::{BuildError, Result, WithinExt};
use crate::expr::{Formula, Resolution};
use crate::node::{NodeKind, Phase};
use crate::scope::Evaluator;
use crate::tree::{NodeId, Section, Tree};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LayoutReport {
    pub passes: usize,
    /// Offset one past the last laid-out byte.
    pub extent: usize,
    pub nodes: usize,
}

/// Unresolved lookups met during one pass.
#[derive(Default)]
struct Pass {
    deferred: Vec<(NodeId, String)>,
}

impl Pass {
    fn defer(&mut self, id: NodeId, reason: String) {
        self.deferred.push((id, reason));
    }
}

pub struct Layouter<'c> {
    ctx: &'c BuildContext,
}

impl<'c> Layouter<'c> {
    pub fn new(ctx: &'c BuildContext) -> Self {
        Self { ctx }
    }

    pub fn run(&self, tree: &mut Tree, buffer: &mut Buffer) -> Result<LayoutReport> {
        let layout = tree.section(Section::Layout);
        if tree.children(layout).is_empty() {
            return Ok(LayoutReport {
                passes: 0,
                extent: 0,
                nodes: 0,
            });
        }
        let mut previous: Option<Vec<(Option<usize>, Option<usize>)>> = None;
        let mut last = Pass::default();

        for pass_no in 1..=self.ctx.max_layout_passes.max(1) {
            buffer.rewind();
            let mut pass = Pass::default();
            self.lay_out(tree, buffer, layout, &mut pass)?;

            let snapshot = snapshot(tree, layout);
            let stable = previous.is_none() || previous.as_ref() == Some(&snapshot);
            if pass.deferred.is_empty() && stable {
                let report = LayoutReport {
                    passes: pass_no,
                    extent: tree.node(layout).state.size.unwrap_or(0),
                    nodes: snapshot.len(),
                };
                info!(passes = report.passes, extent = report.extent, nodes = report.nodes, "layout complete");
                return Ok(report);
            }
            debug!(pass = pass_no, deferred = pass.deferred.len(), "layout pass unresolved");
            previous = Some(snapshot);
            last = pass;
        }

        match last.deferred.first() {
            Some((id, reason)) => Err(BuildError::component(
                &tree.path_of(*id),
                format!("unknown size: {reason}"),
            )),
            None => Err(BuildError::component(
                &tree.path_of(layout),
                format!("layout did not settle after {} passes", self.ctx.max_layout_passes),
            )),
        }
    }

    fn resolve(&self, tree: &Tree, id: NodeId, formula: Option<&Formula>, what: &str, pass: &mut Pass) -> Result<Option<usize>> {
        let Some(formula) = formula else {
            return Ok(None);
        };
        match Evaluator::new(tree, self.ctx).usize(id, formula, what)? {
            Resolution::Resolved(v) => Ok(Some(v)),
            Resolution::Deferred(reason) => {
                pass.defer(id, reason);
                Ok(None)
            }
        }
    }

    fn lay_out(&self, tree: &mut Tree, buffer: &mut Buffer, id: NodeId, pass: &mut Pass) -> Result<()> {
        let pad = tree.pad_byte(id, self.ctx);
        let name = tree.node(id).name.clone();

        tree.node_mut(id).state.enabled = None;
        let enabled = match Evaluator::new(tree, self.ctx).enabled(id)? {
            Resolution::Resolved(enabled) => enabled,
            Resolution::Deferred(reason) => {
                pass.defer(id, reason);
                true
            }
        };
        if !enabled {
            disable(tree, id, buffer.cursor());
            debug!(node = %tree.path_of(id), "disabled");
            return Ok(());
        }
        tree.node_mut(id).state.enabled = Some(true);

        let node = tree.node(id);
        if let Some(align) = self.resolve(tree, id, node.align.as_ref(), "align", pass)? {
            let target = convert::align_up(buffer.cursor(), align);
            buffer.seek(target, pad)?;
        }
        let node = tree.node(id);
        if let Some(offset) = self.resolve(tree, id, node.offset.as_ref(), "offset", pass)? {
            if offset < buffer.cursor() {
                return Err(BuildError::component(
                    &name,
                    format!("requested offset {offset:#x} is behind the cursor at {:#x}", buffer.cursor()),
                ));
            }
            buffer.seek(offset, pad)?;
        }

        let start = buffer.cursor();
        let node = tree.node(id);
        let declared = match &node.size {
            Some(formula) => self.resolve(tree, id, Some(formula), "size", pass)?,
            None => node.natural_size(self.ctx),
        };

        let node = tree.node(id);
        let is_container = node.value.is_none()
            && node.calculate.is_none()
            && !node.kind.holds_bits()
            && (!node.children.is_empty() || node.kind.is_repetition());

        let content = if is_container {
            for child in tree.children(id).to_vec() {
                self.lay_out(tree, buffer, child, pass).within(&name)?;
            }
            let spanned = buffer.cursor() - start;
            match declared {
                Some(size) if spanned > size => {
                    return Err(BuildError::component(
                        &name,
                        format!("children span {spanned} bytes, more than the declared size {size}"),
                    ));
                }
                Some(size) => {
                    buffer.seek(start + size, pad)?;
                    size
                }
                None => spanned,
            }
        } else {
            let content = self.lay_out_leaf(tree, buffer, id, declared, pad, pass)?;
            let bits: Vec<NodeId> = tree.children(id).to_vec();
            for child in bits {
                let state = &mut tree.node_mut(child).state;
                state.reset();
                state.offset = Some(start);
                state.size = Some(0);
                state.content_size = Some(0);
                state.plain_size = Some(0);
                state.phase = Phase::LayoutComputed;
            }
            content
        };

        let node = tree.node(id);
        let mut plain_size = content;
        if let Some(multiple) = self.resolve(tree, id, node.pad_align.as_ref(), "pad_align", pass)? {
            plain_size = convert::align_up(content, multiple);
        }
        let size = match &tree.node(id).encrypt {
            Some(encryption) => crypto::encrypted_size(plain_size, encryption.mode),
            None => plain_size,
        };
        buffer.seek(start + size, pad)?;

        let state = &mut tree.node_mut(id).state;
        state.offset = Some(start);
        state.content_size = Some(content);
        state.plain_size = Some(plain_size);
        state.size = Some(size);
        state.phase = Phase::LayoutComputed;
        debug!(node = %tree.path_of(id), offset = start, size, "laid out");
        Ok(())
    }

    /// Provisional bytes of a value node. Returns the content size.
    fn lay_out_leaf(
        &self,
        tree: &Tree,
        buffer: &mut Buffer,
        id: NodeId,
        declared: Option<usize>,
        pad: u8,
        pass: &mut Pass,
    ) -> Result<usize> {
        let node = tree.node(id);
        let has_source = node.value.is_some()
            || node.calculate.is_some()
            || matches!(node.kind, NodeKind::File(_))
            || (node.kind.holds_bits() && !node.children.is_empty());

        if node.kind.is_function() || !has_source {
            return match declared {
                Some(size) => {
                    buffer.skip(size, pad)?;
                    Ok(size)
                }
                None if node.size.is_some() => {
                    pass.defer(id, format!("size of '{}' is not resolvable yet", node.name));
                    Ok(node.state.content_size.unwrap_or(0))
                }
                None => Err(BuildError::component(
                    &node.name,
                    "unknown size: node has no value, no children and no size",
                )),
            };
        }

        match Evaluator::new(tree, self.ctx).value(id)? {
            Resolution::Resolved(value) => {
                let bytes = node.encode(&value, declared, pad)?;
                buffer.write(&bytes)?;
                Ok(bytes.len())
            }
            Resolution::Deferred(reason) => match declared {
                Some(size) => {
                    buffer.skip(size, pad)?;
                    Ok(size)
                }
                None => {
                    pass.defer(id, reason);
                    Ok(tree.node(id).state.content_size.unwrap_or(0))
                }
            },
        }
    }
}

/// A disabled node and everything under it occupy no bytes.
fn disable(tree: &mut Tree, id: NodeId, cursor: usize) {
    for n in tree.preorder(id) {
        let state = &mut tree.node_mut(n).state;
        state.reset();
        state.enabled = Some(false);
        state.offset = Some(cursor);
        state.size = Some(0);
        state.content_size = Some(0);
        state.plain_size = Some(0);
        state.phase = Phase::LayoutComputed;
    }
}

fn snapshot(tree: &Tree, id: NodeId) -> Vec<(Option<usize>, Option<usize>)> {
    tree.preorder(id)
        .into_iter()
        .map(|n| (tree.node(n).state.offset, tree.node(n).state.size))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::Declaration;
    use crate::repeat;
    use serde_json::json;

    fn laid_out(layout: serde_json::Value) -> Result<(Tree, LayoutReport)> {
        let ctx = BuildContext::default();
        let decl: Declaration = serde_json::from_value(json!({
            "name": "fw",
            "settings": [{"kind": "int", "name": "debug", "size": 1, "value": 0}],
            "layout": layout
        }))
        .unwrap();
        let mut tree = Tree::from_declaration(&decl, &ctx)?;
        repeat::refresh_all(&mut tree, &ctx)?;
        let mut buffer = Buffer::with_capacity(4096, 0);
        let report = Layouter::new(&ctx).run(&mut tree, &mut buffer)?;
        Ok((tree, report))
    }

    fn span(t: &Tree, path: &str) -> (usize, usize) {
        let (id, _) = t.locate(t.root(), path).unwrap();
        let state = &t.node(id).state;
        (state.offset.unwrap(), state.size.unwrap())
    }

    #[test]
    fn test_sequential_offsets_align_and_padding() {
        let (t, report) = laid_out(json!([
            {"kind": "int", "name": "magic", "size": 4, "value": "0xFEEDC0DE"},
            {"kind": "bytes", "name": "body", "align": 16, "pad_align": 8, "value": "010203"},
            {"kind": "int", "name": "tail", "size": 2, "offset": 0x40, "value": 1}
        ]))
        .unwrap();
        assert_eq!(span(&t, "/layout/magic"), (0, 4));
        assert_eq!(span(&t, "/layout/body"), (16, 8));
        assert_eq!(span(&t, "/layout/tail"), (0x40, 2));
        assert_eq!(report.extent, 0x42);
        assert_eq!(report.passes, 1);
    }

    #[test]
    fn test_forward_reference_takes_more_passes() {
        let (t, report) = laid_out(json!([
            {"kind": "int", "name": "header", "size": 4, "calculate": "marker.offset"},
            {"kind": "bytes", "name": "gap", "size": "marker.offset - 4", "pad": 255},
            {"kind": "int", "name": "marker", "size": 1, "offset": 0x20, "value": 0xAA}
        ]))
        .unwrap();
        assert_eq!(span(&t, "/layout/header"), (0, 4));
        assert_eq!(span(&t, "/layout/gap"), (4, 0x1C));
        assert_eq!(span(&t, "/layout/marker"), (0x20, 1));
        assert_eq!(report.passes, 3);
    }

    #[test]
    fn test_empty_group_without_size_is_unknown() {
        let err = laid_out(json!([{"kind": "group", "name": "end", "children": []}])).unwrap_err();
        assert!(err.to_string().contains("unknown size"));
    }

    #[test]
    fn test_disabled_subtree_takes_no_space() {
        let (t, _) = laid_out(json!([
            {"kind": "group", "name": "dbg", "enabled": "debug", "children": [
                {"kind": "int", "name": "level", "size": 4, "value": 3}
            ]},
            {"kind": "int", "name": "next", "size": 1, "value": 7}
        ]))
        .unwrap();
        assert_eq!(span(&t, "/layout/dbg"), (0, 0));
        assert_eq!(span(&t, "/layout/dbg/level"), (0, 0));
        assert_eq!(span(&t, "/layout/next"), (0, 1));
    }

    #[test]
    fn test_encryption_rounds_up_and_group_spans_children() {
        let (t, _) = laid_out(json!([
            {"kind": "group", "name": "secret", "encrypt": {"key": "k.bin", "mode": "ecb"}, "children": [
                {"kind": "int", "name": "a", "size": 4, "value": 1},
                {"kind": "int", "name": "b", "size": 2, "value": 2}
            ]},
            {"kind": "int", "name": "after", "size": 1, "value": 0}
        ]))
        .unwrap();
        assert_eq!(span(&t, "/layout/secret"), (0, 16));
        assert_eq!(span(&t, "/layout/secret/b"), (4, 2));
        assert_eq!(span(&t, "/layout/after"), (16, 1));
    }

    #[test]
    fn test_offset_behind_cursor_and_oversized_children() {
        assert!(laid_out(json!([
            {"kind": "int", "name": "a", "size": 4, "value": 1},
            {"kind": "int", "name": "b", "size": 1, "offset": 2, "value": 1}
        ]))
        .is_err());
        assert!(laid_out(json!([
            {"kind": "group", "name": "g", "size": 2, "children": [
                {"kind": "int", "name": "a", "size": 4, "value": 1}
            ]}
        ]))
        .is_err());
    }
}
