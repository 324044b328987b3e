//! Table / Iterable materialization
//!
//! A repetition owns a detached template. Tables clone it once per declared
//! row and apply the row's column values; iterables clone it `count` times and
//! follow the count formula, keeping existing entries when it grows and
//! releasing the dropped ones when it shrinks.

use serde_json::Value as Json;
use tracing::debug;

use crate::config::BuildContext;
use crate::error::{BuildError, Result, WithinExt};
use crate::expr::Resolution;
use crate::node::{self, NodeKind};
use crate::scope::Evaluator;
use crate::tree::{NodeId, Tree};

/// Bring every repetition in the tree up to date. Returns whether any entry
/// list changed.
pub fn refresh_all(tree: &mut Tree, ctx: &BuildContext) -> Result<bool> {
    let mut changed_any = false;
    for _ in 0..ctx.max_propagation_rounds.max(1) {
        let mut changed = false;
        let repetitions: Vec<NodeId> = tree
            .preorder(tree.root())
            .into_iter()
            .filter(|id| tree.node(*id).kind.is_repetition())
            .collect();
        for id in repetitions {
            let name = tree.node(id).name.clone();
            changed |= refresh(tree, id, ctx).within(&name)?;
        }
        if !changed {
            return Ok(changed_any);
        }
        changed_any = true;
    }
    Err(BuildError::component("", "repetition counts did not settle"))
}

/// Materialize one repetition. A count that cannot be resolved yet leaves the
/// entries untouched.
pub fn refresh(tree: &mut Tree, id: NodeId, ctx: &BuildContext) -> Result<bool> {
    let node = tree.node(id);
    let name = node.name.clone();
    let Some(rep) = node.kind.repetition() else {
        return Ok(false);
    };
    let template = rep
        .template
        .ok_or_else(|| BuildError::parse(&name, "repetition has no template"))?;
    let current = node.children.len();

    match &node.kind {
        NodeKind::Table(rep) => {
            if current == rep.rows.len() {
                return Ok(false);
            }
            let rows = rep.rows.clone();
            for old in std::mem::take(&mut tree.node_mut(id).children) {
                tree.release(old);
            }
            for (i, row) in rows.iter().enumerate() {
                let entry = tree.semideepcopy(template, id, Some(i));
                tree.node_mut(id).children.push(entry);
                apply_row(tree, entry, row).within(&format!("{name}[{i}]"))?;
            }
            debug!(table = %name, rows = rows.len(), "materialized table");
            Ok(true)
        }
        NodeKind::Iterable(rep) => {
            let Some(formula) = rep.count.clone() else {
                return Err(BuildError::parse(&name, "iterable requires a count"));
            };
            let count = match Evaluator::new(tree, ctx).usize(id, &formula, "count")? {
                Resolution::Resolved(count) => count,
                Resolution::Deferred(_) => return Ok(false),
            };
            if count == current {
                return Ok(false);
            }
            if count < current {
                let dropped = tree.node_mut(id).children.split_off(count);
                for old in dropped {
                    tree.release(old);
                }
            } else {
                for i in current..count {
                    let entry = tree.semideepcopy(template, id, Some(i));
                    tree.node_mut(id).children.push(entry);
                }
            }
            debug!(iterable = %name, from = current, to = count, "resized iterable");
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Write each column of a table row into the matching child of `entry`. A
/// column named like the entry itself sets the entry's own value.
fn apply_row(tree: &mut Tree, entry: NodeId, row: &serde_json::Map<String, Json>) -> Result<()> {
    for (column, json) in row {
        let target = if tree.node(entry).name == *column {
            entry
        } else {
            tree.children(entry)
                .iter()
                .copied()
                .find(|c| tree.node(*c).name == *column)
                .ok_or_else(|| BuildError::parse(&tree.node(entry).name, format!("no column named {column:?}")))?
        };
        let node = tree.node(target);
        let value = node::literal_for(&node.kind, &node.name, json)?;
        tree.node_mut(target).value = Some(value);
    }
    Ok(())
}
