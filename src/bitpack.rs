//! Bit-Level Packing
//!
//! A fixed-size `int` or `bitregister` split into named fields with inclusive
//! `[low, high]` bit ranges. Reading a field masks it out of the parent;
//! writing a field clears its mask in the parent and ORs the new bits in;
//! writing the parent rewrites every field. Bit registers get
//! `reserved_<low>_<high>` fillers so every bit is addressable.

use crate::change::PropertyChangeRecord;
use crate::config::BuildContext;
use crate::convert::{self, MAX_INT_BYTES};
use crate::error::{BuildError, ConvertError, Result};
use crate::expr::Resolution;
use crate::node::{Node, NodeKind};
use crate::resolved;
use crate::scope::Evaluator;
use crate::tree::{NodeId, Tree};
use crate::value::Value;

/// Mask of `width` low bits.
pub fn field_mask(width: u32) -> i128 {
    if width >= 128 {
        -1
    } else {
        (1i128 << width).wrapping_sub(1)
    }
}

pub fn extract(raw: i128, low: u32, high: u32) -> i128 {
    (raw >> low) & field_mask(high - low + 1)
}

pub fn insert(raw: i128, low: u32, high: u32, field: i128) -> i128 {
    let mask = field_mask(high - low + 1) << low;
    (raw & !mask) | ((field << low) & mask)
}

fn register_width(node: &Node) -> Result<u32> {
    let size = node
        .state
        .size
        .or_else(|| node.literal_size())
        .ok_or_else(|| BuildError::component(&node.name, "bit-packed integer needs a literal size"))?;
    Ok((size * 8) as u32)
}

/// Reinterpret the low `width` bits of `raw` for the parent's signedness.
fn normalize(raw: i128, width: u32, signed: bool) -> i128 {
    if width >= 128 {
        return raw;
    }
    let unsigned = raw & field_mask(width);
    if signed && (unsigned >> (width - 1)) & 1 == 1 {
        unsigned - (1i128 << width)
    } else {
        unsigned
    }
}

fn fits(value: i128, low: u32, high: u32) -> bool {
    value >= 0 && value <= field_mask(high - low + 1)
}

/// Check field ranges at parse time and add reserved fillers to registers.
pub fn check_fields(tree: &mut Tree, id: NodeId) -> Result<()> {
    let node = tree.node(id);
    let name = node.name.clone();
    let size = node
        .literal_size()
        .ok_or_else(|| BuildError::parse(&name, "bit-packed integer needs a literal size"))?;
    if size == 0 || size > MAX_INT_BYTES {
        return Err(BuildError::parse(&name, format!("bit-packed size {size} out of range")));
    }
    let width = (size * 8) as u32;

    let mut fields: Vec<(u32, u32, &str)> = node
        .children
        .iter()
        .filter_map(|c| {
            let child = tree.node(*c);
            child.kind.bit_range().map(|(l, h)| (l, h, child.name.as_str()))
        })
        .collect();
    fields.sort_by_key(|f| f.0);

    for &(low, high, field) in &fields {
        if high >= width {
            return Err(BuildError::parse(
                field,
                format!("bits [{low}:{high}] exceed the {width}-bit parent"),
            ));
        }
    }
    for pair in fields.windows(2) {
        let ((al, ah, a), (bl, bh, b)) = (pair[0], pair[1]);
        if bl <= ah {
            return Err(BuildError::parse(
                &name,
                format!("fields '{a}' [{al}:{ah}] and '{b}' [{bl}:{bh}] overlap"),
            ));
        }
    }

    let mut gaps = Vec::new();
    let mut next = 0;
    for &(low, high, _) in &fields {
        if low > next {
            gaps.push((next, low - 1));
        }
        next = high + 1;
    }
    if next < width {
        gaps.push((next, width - 1));
    }
    if gaps.is_empty() {
        return Ok(());
    }

    let covered: u32 = fields.iter().map(|(l, h, _)| h - l + 1).sum();
    let is_register = matches!(node.kind, NodeKind::BitRegister);
    if !is_register {
        if node.has_own_value() {
            return Ok(());
        }
        return Err(BuildError::parse(
            &name,
            format!("fields cover {covered} of {width} bits and the parent has no value of its own"),
        ));
    }

    for (low, high) in gaps {
        let filler = Node::synthetic(&format!("reserved_{low}_{high}"), NodeKind::BitField { low, high });
        tree.attach(filler, id);
    }
    let mut children = tree.children(id).to_vec();
    children.sort_by_key(|c| tree.node(*c).kind.bit_range().map_or(0, |r| r.0));
    tree.node_mut(id).children = children;
    Ok(())
}

/// Value of a field: its own value if declared, else its bits of the parent.
pub fn field_value(ev: &Evaluator<'_>, id: NodeId) -> Result<Resolution<Value>> {
    let tree = ev.tree();
    let node = tree.node(id);
    if let Some(value) = &node.value {
        return Ok(Resolution::Resolved(value.clone()));
    }
    if let Some(formula) = &node.calculate {
        return ev.formula(id, formula);
    }
    let (low, high) = node
        .kind
        .bit_range()
        .ok_or_else(|| BuildError::component(&node.name, "not a bit field"))?;
    let parent = node
        .parent
        .ok_or_else(|| BuildError::component(&node.name, "bit field without parent"))?;
    let raw = resolved!(ev.value(parent))
        .as_int()
        .map_err(|e| BuildError::convert(&node.name, e))?;
    Ok(Resolution::Resolved(Value::Int(extract(raw, low, high))))
}

/// Value of a packed parent: its own value (or zero) with the bits of every
/// field that has a value of its own laid over it.
pub fn register_value(ev: &Evaluator<'_>, id: NodeId) -> Result<Resolution<Value>> {
    let tree = ev.tree();
    let node = tree.node(id);
    let own = match (&node.value, &node.calculate) {
        (Some(value), _) => value.clone(),
        (None, Some(formula)) => resolved!(ev.formula(id, formula)),
        (None, None) => Value::Int(0),
    };
    let mut raw = own.as_int().map_err(|e| BuildError::convert(&node.name, e))?;

    for &child in &node.children {
        let field = tree.node(child);
        let Some((low, high)) = field.kind.bit_range() else {
            continue;
        };
        let value = match (&field.value, &field.calculate) {
            (Some(value), _) => value.clone(),
            (None, Some(formula)) => resolved!(ev.formula(child, formula)),
            (None, None) => continue,
        };
        let bits = value.as_int().map_err(|e| BuildError::convert(&field.name, e))?;
        if !fits(bits, low, high) {
            return Err(BuildError::component(
                &field.name,
                format!("value {bits} does not fit in bits [{low}:{high}]"),
            ));
        }
        raw = insert(raw, low, high, bits);
    }

    let signed = matches!(node.kind, NodeKind::Int { signed: true });
    Ok(Resolution::Resolved(Value::Int(normalize(raw, register_width(node)?, signed))))
}

fn snapshot(tree: &Tree, ctx: &BuildContext, ids: &[NodeId]) -> Vec<Option<Value>> {
    let ev = Evaluator::new(tree, ctx);
    ids.iter()
        .map(|id| ev.value(*id).ok().and_then(Resolution::resolved))
        .collect()
}

fn changes(tree: &Tree, ctx: &BuildContext, ids: &[NodeId], before: Vec<Option<Value>>) -> Vec<PropertyChangeRecord> {
    let after = snapshot(tree, ctx, ids);
    ids.iter()
        .zip(before.into_iter().zip(after))
        .filter(|(_, (old, new))| old != new)
        .map(|(id, (old, _))| PropertyChangeRecord::single(*id, tree.path_of(*id), "value", old))
        .collect()
}

/// Set the packed parent and recompute every field from it.
pub fn set_register(tree: &mut Tree, id: NodeId, value: &Value, ctx: &BuildContext) -> Result<Vec<PropertyChangeRecord>> {
    let node = tree.node(id);
    let raw = value.as_int().map_err(|e| BuildError::convert(&node.name, e))?;
    let signed = matches!(node.kind, NodeKind::Int { signed: true });
    let width = register_width(node)?;
    let (min, max) = convert::int_bounds((width / 8) as usize, signed)
        .map_err(|e| BuildError::convert(&node.name, e))?;
    if raw < min || raw > max {
        return Err(BuildError::convert(
            &node.name,
            ConvertError::Overflow {
                value: raw,
                size: (width / 8) as usize,
                signed,
            },
        ));
    }

    let mut ids = vec![id];
    ids.extend(node.children.iter().copied());
    let before = snapshot(tree, ctx, &ids);

    tree.node_mut(id).value = Some(Value::Int(raw));
    for &child in &ids[1..] {
        if let Some((low, high)) = tree.node(child).kind.bit_range() {
            tree.node_mut(child).value = Some(Value::Int(extract(raw, low, high)));
        }
    }
    Ok(changes(tree, ctx, &ids, before))
}

/// Set one field and fold it into the parent.
pub fn set_field(tree: &mut Tree, id: NodeId, value: &Value, ctx: &BuildContext) -> Result<Vec<PropertyChangeRecord>> {
    let node = tree.node(id);
    let bits = value.as_int().map_err(|e| BuildError::convert(&node.name, e))?;
    let (low, high) = node
        .kind
        .bit_range()
        .ok_or_else(|| BuildError::component(&node.name, "not a bit field"))?;
    if !fits(bits, low, high) {
        return Err(BuildError::component(
            &node.name,
            format!("value {bits} does not fit in bits [{low}:{high}]"),
        ));
    }
    let parent = node
        .parent
        .ok_or_else(|| BuildError::component(&node.name, "bit field without parent"))?;

    let ids = [id, parent];
    let before = snapshot(tree, ctx, &ids);
    let parent_raw = match &before[1] {
        Some(v) => v.as_int().map_err(|e| BuildError::convert(&tree.node(parent).name, e))?,
        None => 0,
    };
    let parent_node = tree.node(parent);
    let signed = matches!(parent_node.kind, NodeKind::Int { signed: true });
    let updated = normalize(insert(parent_raw, low, high, bits), register_width(parent_node)?, signed);

    tree.node_mut(id).value = Some(Value::Int(bits));
    tree.node_mut(parent).value = Some(Value::Int(updated));
    Ok(changes(tree, ctx, &ids, before))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::Declaration;
    use serde_json::json;

    fn register(fields: serde_json::Value) -> Result<Tree> {
        let decl: Declaration = serde_json::from_value(json!({
            "name": "fw",
            "layout": [{"kind": "bitregister", "name": "ctrl", "size": 1, "children": fields}]
        }))
        .unwrap();
        Tree::from_declaration(&decl, &BuildContext::default())
    }

    fn value(tree: &Tree, path: &str) -> i128 {
        let ctx = BuildContext::default();
        let id = tree.locate(tree.root(), path).unwrap().0;
        Evaluator::new(tree, &ctx)
            .value(id)
            .unwrap()
            .resolved()
            .unwrap()
            .as_int()
            .unwrap()
    }

    #[test]
    fn test_mask_helpers() {
        assert_eq!(field_mask(3), 0b111);
        assert_eq!(field_mask(127), i128::MAX);
        assert_eq!(field_mask(128), -1);
        assert_eq!(extract(0b1011_0100, 2, 4), 0b101);
        assert_eq!(insert(0xFF, 2, 4, 0), 0xE3);
    }

    #[test]
    fn test_parent_and_fields_stay_consistent() {
        let mut t = register(json!([
            {"kind": "bitfield", "name": "a", "params": {"bits": [0, 1]}},
            {"kind": "bitfield", "name": "b", "params": {"bits": [2, 4]}},
            {"kind": "bitfield", "name": "c", "params": {"bits": [5, 7]}}
        ]))
        .unwrap();
        let ctx = BuildContext::default();
        let ctrl = t.locate(t.root(), "/layout/ctrl").unwrap().0;
        t.set_value(ctrl, Value::Int(0xFF), &ctx).unwrap();
        assert_eq!(value(&t, "/layout/ctrl/a"), 0b11);
        assert_eq!(value(&t, "/layout/ctrl/b"), 0b111);
        assert_eq!(value(&t, "/layout/ctrl/c"), 0b111);

        let b = t.locate(t.root(), "/layout/ctrl/b").unwrap().0;
        let records = t.set_value(b, Value::Int(0), &ctx).unwrap();
        assert_eq!(value(&t, "/layout/ctrl"), 0xE3);
        assert_eq!(records.len(), 2);
        assert!(t.set_value(b, Value::Int(8), &ctx).is_err());
    }

    #[test]
    fn test_reserved_fillers_are_generated() {
        let mut t = register(json!([
            {"kind": "bit", "name": "en", "params": {"bit": 0}},
            {"kind": "bitfield", "name": "b", "params": {"bits": [2, 4]}},
            {"kind": "bitfield", "name": "c", "params": {"bits": [5, 7]}}
        ]))
        .unwrap();
        let ctx = BuildContext::default();
        let ctrl = t.locate(t.root(), "/layout/ctrl").unwrap().0;
        let names: Vec<&str> = t.children(ctrl).iter().map(|c| t.node(*c).name.as_str()).collect();
        assert_eq!(names, vec!["en", "reserved_1_1", "b", "c"]);

        t.set_value(ctrl, Value::Int(0b10), &ctx).unwrap();
        assert_eq!(value(&t, "/layout/ctrl/reserved_1_1"), 1);
        let reserved = t.locate(t.root(), "/layout/ctrl/reserved_1_1").unwrap().0;
        t.set_value(reserved, Value::Int(0), &ctx).unwrap();
        assert_eq!(value(&t, "/layout/ctrl"), 0);
    }

    #[test]
    fn test_overlap_and_coverage_rules() {
        assert!(matches!(
            register(json!([
                {"kind": "bitfield", "name": "a", "params": {"bits": [0, 3]}},
                {"kind": "bitfield", "name": "b", "params": {"bits": [3, 7]}}
            ])),
            Err(BuildError::Parse { .. })
        ));
        assert!(register(json!([{"kind": "bitfield", "name": "a", "params": {"bits": [4, 8]}}])).is_err());

        let partial = |value: Option<i64>| {
            let mut int = json!({"kind": "int", "name": "flags", "size": 1,
                "children": [{"kind": "bitfield", "name": "lo", "params": {"bits": [0, 3]}}]});
            if let Some(v) = value {
                int["value"] = json!(v);
            }
            let decl: Declaration = serde_json::from_value(json!({"name": "fw", "layout": [int]})).unwrap();
            Tree::from_declaration(&decl, &BuildContext::default())
        };
        assert!(partial(None).is_err());
        let t = partial(Some(0xA5)).unwrap();
        assert_eq!(value(&t, "/layout/flags/lo"), 0x5);
    }

    #[test]
    fn test_signed_parent_round_trips() {
        let decl: Declaration = serde_json::from_value(json!({
            "name": "fw",
            "layout": [{"kind": "int", "name": "s", "size": 1, "params": {"signed": true},
                "children": [
                    {"kind": "bitfield", "name": "lo", "params": {"bits": [0, 3]}},
                    {"kind": "bitfield", "name": "hi", "params": {"bits": [4, 7]}}
                ]}]
        }))
        .unwrap();
        let mut t = Tree::from_declaration(&decl, &BuildContext::default()).unwrap();
        let ctx = BuildContext::default();
        let s = t.locate(t.root(), "/layout/s").unwrap().0;
        t.set_value(s, Value::Int(-2), &ctx).unwrap();
        assert_eq!(value(&t, "/layout/s/hi"), 0xF);
        assert_eq!(value(&t, "/layout/s/lo"), 0xE);
        assert_eq!(value(&t, "/layout/s"), -2);
    }
}
