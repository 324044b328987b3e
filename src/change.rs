//! Property change records
//!
//! Every mutating call reports what it overwrote so callers can propagate,
//! undo or refresh a view.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::tree::NodeId;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertyChangeRecord {
    pub node: NodeId,
    pub path: String,
    /// Property name to the value it held before the change. `None` when the
    /// previous value was unset or not resolvable.
    pub previous: BTreeMap<String, Option<Value>>,
}

impl PropertyChangeRecord {
    pub fn single(node: NodeId, path: String, property: &str, previous: Option<Value>) -> Self {
        let mut map = BTreeMap::new();
        map.insert(property.to_string(), previous);
        Self {
            node,
            path,
            previous: map,
        }
    }
}

/// Fold `incoming` into `records`, one record per node. The earliest
/// previous value of a property wins so undo restores the original state.
pub fn merge(records: &mut Vec<PropertyChangeRecord>, incoming: Vec<PropertyChangeRecord>) {
    for record in incoming {
        match records.iter_mut().find(|r| r.node == record.node) {
            Some(existing) => {
                for (key, value) in record.previous {
                    existing.previous.entry(key).or_insert(value);
                }
            }
            None => records.push(record),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_keeps_earliest_previous() {
        let a = NodeId::from_raw(1);
        let mut records = vec![PropertyChangeRecord::single(a, "/a".into(), "value", Some(Value::Int(1)))];
        merge(
            &mut records,
            vec![
                PropertyChangeRecord::single(a, "/a".into(), "value", Some(Value::Int(2))),
                PropertyChangeRecord::single(a, "/a".into(), "enabled", Some(Value::Bool(true))),
            ],
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].previous["value"], Some(Value::Int(1)));
        assert_eq!(records[0].previous["enabled"], Some(Value::Bool(true)));
    }
}
