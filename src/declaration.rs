//! Declaration Model - the declarative source of a binary
//!
//! A declaration has a `settings` section (user inputs), a `layout` section
//! (the binary itself) and an optional `decomposition` section. Loading only
//! deserializes; required attributes are enforced when the tree is parsed.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::convert::ByteOrder;
use crate::crypto::{EncryptMode, SignPadding};
use crate::error::{BuildError, Result};
use crate::validation::ViolationSeverity;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Declaration {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_version")]
    pub engine_min_version: String,
    #[serde(default)]
    pub settings: Vec<NodeDecl>,
    #[serde(default)]
    pub layout: Vec<NodeDecl>,
    #[serde(default)]
    pub decomposition: Vec<NodeDecl>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl Declaration {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| BuildError::FileAccess {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }
}

/// A literal number/bool or a formula string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    Bool(bool),
    Text(String),
}

impl Scalar {
    pub fn to_formula(&self) -> String {
        match self {
            Self::Int(v) => v.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Text(s) => s.clone(),
        }
    }
}

/// A JSON attribute that may also arrive encoded as a JSON string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Embedded<T> {
    Inline(T),
    Encoded(String),
}

impl<T: DeserializeOwned + Clone> Embedded<T> {
    pub fn resolve(&self) -> std::result::Result<T, serde_json::Error> {
        match self {
            Self::Inline(v) => Ok(v.clone()),
            Self::Encoded(text) => serde_json::from_str(text),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NodeDecl {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: Option<Scalar>,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub calculate: Option<String>,
    #[serde(default)]
    pub offset: Option<Scalar>,
    #[serde(default)]
    pub align: Option<Scalar>,
    /// Trailing padding: grow the node to a multiple of this.
    #[serde(default)]
    pub pad_align: Option<Scalar>,
    /// Pad byte; inherited from the nearest ancestor declaring one.
    #[serde(default)]
    pub pad: Option<u8>,
    #[serde(default)]
    pub align_end: bool,
    #[serde(default)]
    pub byte_order: Option<ByteOrder>,
    #[serde(default)]
    pub enabled: Option<Scalar>,
    #[serde(default)]
    pub visible: Option<bool>,
    #[serde(default)]
    pub save: Option<bool>,
    #[serde(default)]
    pub encrypt: Option<EncryptDecl>,
    #[serde(default)]
    pub dependency: Option<Embedded<Vec<DependencyDecl>>>,
    #[serde(default)]
    pub validate: Option<ValidateDecl>,
    #[serde(default)]
    pub params: Option<Embedded<Params>>,
    #[serde(default)]
    pub children: Vec<NodeDecl>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Params {
    #[serde(default)]
    pub value_list: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub value_min: Option<Scalar>,
    #[serde(default)]
    pub value_max: Option<Scalar>,
    #[serde(default)]
    pub pattern: Option<String>,
    /// Setting that receives this node's decoded value on decomposition.
    #[serde(default)]
    pub id_setting: Option<String>,
    #[serde(default)]
    pub signed: Option<bool>,
    #[serde(default)]
    pub bit: Option<u32>,
    #[serde(default)]
    pub bits: Option<[u32; 2]>,
    #[serde(default)]
    pub count: Option<Scalar>,
    #[serde(default)]
    pub rows: Option<Vec<serde_json::Map<String, serde_json::Value>>>,
    #[serde(default)]
    pub algorithm: Option<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub decrypted: bool,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub padding: Option<SignPadding>,
    #[serde(default)]
    pub key_bits: Option<u32>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub field_bytes: Option<usize>,
    #[serde(default)]
    pub terminated: bool,
    /// Setting written by a decomposition-section node.
    #[serde(default)]
    pub target: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EncryptDecl {
    pub key: String,
    #[serde(default)]
    pub iv: Option<String>,
    #[serde(default)]
    pub mode: EncryptMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DependencyDecl {
    Get {
        source: String,
        #[serde(default)]
        property: Option<String>,
        #[serde(default)]
        formula: Option<String>,
        #[serde(default)]
        target_property: Option<String>,
        #[serde(default)]
        bit_low: Option<u32>,
        #[serde(default)]
        bit_high: Option<u32>,
    },
    Set {
        target: String,
        #[serde(default)]
        target_property: Option<String>,
        #[serde(default)]
        duplicate: bool,
        #[serde(default)]
        bit_low: Option<u32>,
        #[serde(default)]
        bit_high: Option<u32>,
    },
    Switch {
        source: String,
        values: BTreeMap<String, serde_json::Value>,
        #[serde(default)]
        default: Option<serde_json::Value>,
        #[serde(default)]
        target_property: Option<String>,
        #[serde(default)]
        bit_low: Option<u32>,
        #[serde(default)]
        bit_high: Option<u32>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValidateDecl {
    Formula(String),
    Full {
        calculate: String,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        severity: ViolationSeverity,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_minimal_declaration() {
        let decl: Declaration = serde_json::from_value(json!({
            "name": "fw",
            "layout": [{"kind": "int", "name": "magic", "size": 4, "value": "0xCAFE"}]
        }))
        .unwrap();
        assert_eq!(decl.version, "1.0.0");
        assert_eq!(decl.layout[0].size, Some(Scalar::Int(4)));
        assert!(decl.settings.is_empty());
    }

    #[test]
    fn test_embedded_dependency_string() {
        let node: NodeDecl = serde_json::from_value(json!({
            "kind": "int", "name": "b", "size": 1,
            "dependency": "[{\"type\": \"get\", \"source\": \"a\"}]"
        }))
        .unwrap();
        let deps = node.dependency.unwrap().resolve().unwrap();
        assert!(matches!(&deps[0], DependencyDecl::Get { source, .. } if source == "a"));
    }

    #[test]
    fn test_validate_forms() {
        let short: ValidateDecl = serde_json::from_value(json!("this.value < 10")).unwrap();
        assert!(matches!(short, ValidateDecl::Formula(_)));
        let full: ValidateDecl = serde_json::from_value(json!({
            "calculate": "this.value < 10", "message": "too big", "severity": "warning"
        }))
        .unwrap();
        assert!(matches!(full, ValidateDecl::Full { severity: ViolationSeverity::Warning, .. }));
    }

    #[test]
    fn test_params_inline_and_encoded() {
        let inline: Embedded<Params> =
            serde_json::from_value(json!({"bits": [2, 4]})).unwrap();
        assert_eq!(inline.resolve().unwrap().bits, Some([2, 4]));
        let encoded: Embedded<Params> =
            serde_json::from_value(json!("{\"value_list\": [1, 2]}")).unwrap();
        assert_eq!(encoded.resolve().unwrap().value_list.unwrap().len(), 2);
    }
}
