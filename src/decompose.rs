//! Decomposition - recover settings from an existing image
//!
//! The same declarations that build an image are laid out over a scratch
//! copy of the tree, every layout leaf is decoded from the image at its
//! offset, and leaves that merely reference a setting write the decoded value
//! back into that setting. Recovered settings can move offsets (a count, a
//! length), so the round repeats until no setting changes.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::buffer::Buffer;
use crate::change::{self, PropertyChangeRecord};
use crate::config::BuildContext;
use crate::error::{BuildError, Result, WithinExt};
use crate::expr::Resolution;
use crate::layout::Layouter;
use crate::repeat;
use crate::scope::Evaluator;
use crate::tree::{NodeId, Section, Tree};
use crate::value::Value;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DecomposeReport {
    pub image_size: usize,
    pub rounds: usize,
    /// Decoded value of every readable layout leaf, by path.
    pub values: BTreeMap<String, Value>,
    /// Settings whose value changed, with what they held before.
    pub changes: Vec<PropertyChangeRecord>,
    /// Leaves whose bytes cannot be turned back into a value.
    pub skipped: Vec<String>,
}

pub struct Decomposer<'c> {
    ctx: &'c BuildContext,
}

impl<'c> Decomposer<'c> {
    pub fn new(ctx: &'c BuildContext) -> Self {
        Self { ctx }
    }

    pub fn run(&self, tree: &mut Tree, image: &Buffer) -> Result<DecomposeReport> {
        let mut report = DecomposeReport {
            image_size: image.capacity(),
            ..Default::default()
        };

        for round in 1..=self.ctx.max_propagation_rounds.max(1) {
            repeat::refresh_all(tree, self.ctx)?;
            let mut scratch = tree.clone();
            scratch.reset();
            let mut provisional = Buffer::with_capacity(self.ctx.capacity.max(image.capacity()), self.ctx.pad_byte);
            Layouter::new(self.ctx).run(&mut scratch, &mut provisional)?;

            report.values.clear();
            report.skipped.clear();
            let mut changed = Vec::new();
            let layout = scratch.section(Section::Layout);
            for id in scratch.preorder(layout) {
                if id != layout {
                    change::merge(&mut changed, self.read_leaf(tree, &mut scratch, image, id, &mut report)?);
                }
            }
            change::merge(&mut changed, self.derive(tree, &scratch)?);

            report.rounds = round;
            debug!(round, changed = changed.len(), "decomposition round");
            if changed.is_empty() {
                info!(
                    rounds = round,
                    values = report.values.len(),
                    changed = report.changes.len(),
                    "decomposition complete"
                );
                return Ok(report);
            }
            change::merge(&mut report.changes, changed);
        }
        Err(BuildError::component(
            "decomposition",
            format!("settings did not settle after {} rounds", self.ctx.max_propagation_rounds),
        ))
    }

    /// Decode one leaf and write references back into `tree`'s settings.
    fn read_leaf(
        &self,
        tree: &mut Tree,
        scratch: &mut Tree,
        image: &Buffer,
        id: NodeId,
        report: &mut DecomposeReport,
    ) -> Result<Vec<PropertyChangeRecord>> {
        let node = scratch.node(id);
        let is_container = node.value.is_none()
            && node.calculate.is_none()
            && !node.kind.holds_bits()
            && (!node.children.is_empty() || node.kind.is_repetition());
        if is_container || node.state.enabled == Some(false) || scratch.is_bit_field(id) {
            return Ok(Vec::new());
        }
        let path = scratch.path_of(id);
        let encrypted = std::iter::successors(Some(id), |n| scratch.parent(*n)).any(|n| scratch.node(n).encrypt.is_some());
        if node.kind.is_function() || encrypted {
            warn!(node = %path, "cannot recover a value from computed or encrypted bytes");
            report.skipped.push(path);
            return Ok(Vec::new());
        }
        let (Some(offset), Some(len)) = (node.state.offset, node.state.content_size) else {
            return Ok(Vec::new());
        };
        let bytes = image.read(offset, len)?;
        let value = node.decode(bytes).within(&path)?;
        scratch.set_value(id, value.clone(), self.ctx)?;
        report.values.insert(path, value);

        let mut fields = vec![id];
        fields.extend(scratch.children(id).iter().copied().filter(|c| scratch.is_bit_field(*c)));

        let mut changed = Vec::new();
        for field in fields {
            let Some(setting) = self.referenced_setting(tree, scratch, field)? else {
                continue;
            };
            let Resolution::Resolved(value) = Evaluator::new(scratch, self.ctx).value(field)? else {
                continue;
            };
            change::merge(&mut changed, tree.set_value(setting, value, self.ctx)?);
        }
        Ok(changed)
    }

    /// The setting named by `id_setting`, else the one the node's formula
    /// is a bare reference to.
    fn referenced_setting(&self, tree: &Tree, scratch: &Tree, id: NodeId) -> Result<Option<NodeId>> {
        let node = scratch.node(id);
        let Some(path) = node
            .id_setting
            .as_deref()
            .or_else(|| node.calculate.as_ref().and_then(|f| f.as_path()))
        else {
            return Ok(None);
        };
        let (target, property) = tree.locate(id, path)?;
        let is_value = property.as_deref().map_or(true, |p| p == "value");
        Ok((is_value && tree.in_section(target, Section::Settings)).then_some(target))
    }

    /// Decomposition-section nodes compute further settings from the
    /// decoded layout.
    fn derive(&self, tree: &mut Tree, scratch: &Tree) -> Result<Vec<PropertyChangeRecord>> {
        let section = scratch.section(Section::Decomposition);
        let mut changed = Vec::new();
        for id in scratch.preorder(section) {
            let node = scratch.node(id);
            let (Some(formula), Some(target)) = (&node.calculate, &node.target) else {
                continue;
            };
            let value = match Evaluator::new(scratch, self.ctx).formula(id, formula).within(&node.name)? {
                Resolution::Resolved(value) => value,
                Resolution::Deferred(reason) => {
                    warn!(node = %node.name, %reason, "decomposition value not resolvable");
                    continue;
                }
            };
            let (setting, _) = tree.locate(tree.root(), target)?;
            change::merge(&mut changed, tree.set_value(setting, value, self.ctx)?);
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::Builder;
    use crate::crypto::SoftwareCrypto;
    use crate::declaration::Declaration;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn declaration(rev: i64, name: &str, count: i64) -> Declaration {
        serde_json::from_value(json!({
            "name": "fw",
            "settings": [
                {"kind": "int", "name": "rev", "size": 1, "value": rev},
                {"kind": "string", "name": "board", "size": 8, "value": name},
                {"kind": "int", "name": "slots", "size": 1, "value": count},
                {"kind": "int", "name": "fast", "size": 1, "value": 0},
                {"kind": "int", "name": "tail_len", "size": 2, "value": 0}
            ],
            "layout": [
                {"kind": "int", "name": "slot_count", "size": 1, "calculate": "slots"},
                {"kind": "bitregister", "name": "flags", "size": 1, "children": [
                    {"kind": "bitfield", "name": "revision", "params": {"bits": [0, 3]}, "calculate": "rev"},
                    {"kind": "bit", "name": "fast_boot", "params": {"bit": 7}, "calculate": "fast"}
                ]},
                {"kind": "string", "name": "label", "size": 8, "calculate": "board"},
                {"kind": "iterable", "name": "slot", "params": {"count": "slots"}, "children": [
                    {"kind": "int", "name": "entry", "size": 2, "calculate": "{index} + 0x100"}
                ]},
                {"kind": "function", "name": "crc", "params": {"algorithm": "crc16"}}
            ],
            "decomposition": [
                {"kind": "int", "name": "end", "size": 2, "calculate": "/layout/crc.offset",
                 "params": {"target": "tail_len"}}
            ]
        }))
        .unwrap()
    }

    fn image(decl: &Declaration) -> Vec<u8> {
        let ctx = BuildContext::default();
        let mut tree = Tree::from_declaration(decl, &ctx).unwrap();
        repeat::refresh_all(&mut tree, &ctx).unwrap();
        let mut buffer = Buffer::with_capacity(256, 0);
        Layouter::new(&ctx).run(&mut tree, &mut buffer).unwrap();
        Builder::new(&ctx, &SoftwareCrypto, &MemoryStore::new())
            .run(&mut tree, &mut buffer)
            .unwrap();
        buffer.image()
    }

    fn setting(tree: &Tree, name: &str) -> Value {
        let ctx = BuildContext::default();
        let (id, _) = tree.locate(tree.root(), &format!("/settings/{name}")).unwrap();
        Evaluator::new(tree, &ctx).value(id).unwrap().resolved().unwrap()
    }

    #[test]
    fn test_recovers_settings_including_counts() {
        let bytes = image(&declaration(5, "rev-b", 3));
        let ctx = BuildContext::default().with_mode(crate::config::ToolMode::Decompose);
        let mut tree = Tree::from_declaration(&declaration(1, "proto", 1), &ctx).unwrap();

        let report = Decomposer::new(&ctx).run(&mut tree, &Buffer::from_bytes(bytes)).unwrap();

        assert_eq!(setting(&tree, "rev"), Value::Int(5));
        assert_eq!(setting(&tree, "board"), Value::Str("rev-b".into()));
        assert_eq!(setting(&tree, "slots"), Value::Int(3));
        assert_eq!(setting(&tree, "fast"), Value::Int(0));
        assert_eq!(setting(&tree, "tail_len"), Value::Int(16));
        assert!(report.rounds >= 2);
        assert_eq!(report.skipped, vec!["/layout/crc".to_string()]);
        assert_eq!(report.values["/layout/slot[2]"], Value::Int(0x102));
    }

    #[test]
    fn test_id_setting_receives_computed_field() {
        let decl = |sn: i64| -> Declaration {
            serde_json::from_value(json!({
                "name": "fw",
                "settings": [{"kind": "int", "name": "sn", "size": 2, "value": sn}],
                "layout": [{"kind": "int", "name": "serial", "size": 2, "calculate": "sn * 1",
                            "params": {"id_setting": "sn"}}]
            }))
            .unwrap()
        };
        let bytes = image(&decl(0x1234));
        let ctx = BuildContext::default();
        let mut tree = Tree::from_declaration(&decl(1), &ctx).unwrap();
        Decomposer::new(&ctx).run(&mut tree, &Buffer::from_bytes(bytes)).unwrap();
        assert_eq!(setting(&tree, "sn"), Value::Int(0x1234));
    }

    #[test]
    fn test_short_image_is_an_error() {
        let ctx = BuildContext::default();
        let mut tree = Tree::from_declaration(&declaration(1, "x", 1), &ctx).unwrap();
        let err = Decomposer::new(&ctx)
            .run(&mut tree, &Buffer::from_bytes(vec![1, 2]))
            .unwrap_err();
        assert!(matches!(err, BuildError::Buffer(_)));
    }
}
