//! Component Type System
//!
//! A node is one closed [`NodeKind`] plus the attributes every kind shares
//! (size, offset, alignment, padding, enablement, encryption, validation,
//! dependencies). The generic layout/build engine works on those shared
//! attributes; kinds only customize how values become bytes and back, and
//! which properties they expose.

use std::io;
use std::time::SystemTime;

use chrono::{DateTime, Datelike, NaiveDate};
use serde_json::Value as Json;

use crate::config::BuildContext;
use crate::convert::{self, ByteOrder};
use crate::crypto::EncryptMode;
use crate::declaration::{NodeDecl, Params, Scalar};
use crate::dependency::Dependency;
use crate::error::{BuildError, ConvertError, Result};
use crate::expr::Formula;
use crate::function::FunctionSpec;
use crate::tree::NodeId;
use crate::validation::{Constraints, ValidationSpec};
use crate::value::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Unbuilt,
    LayoutComputed,
    Built,
}

/// Per-build derived state; cleared on every rebuild cycle.
#[derive(Debug, Clone, Default)]
pub struct NodeState {
    pub phase: Phase,
    pub offset: Option<usize>,
    /// Final size, after trailing padding and encryption.
    pub size: Option<usize>,
    /// Size of the value or children alone.
    pub content_size: Option<usize>,
    /// Size before encryption.
    pub plain_size: Option<usize>,
    /// Final bytes as written to the buffer.
    pub bytes: Option<Vec<u8>>,
    /// Bytes before encryption, when the node is encrypted.
    pub plain: Option<Vec<u8>>,
    /// Result of the last enablement check; `None` until laid out.
    pub enabled: Option<bool>,
}

impl NodeState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateEncoding {
    /// `YYYYMMDD` as four packed BCD bytes.
    Bcd,
    /// Text rendered with the node's format string.
    Ascii,
    /// Seconds since 1970-01-01 as an unsigned integer.
    Epoch,
}

#[derive(Debug, Clone)]
pub struct FileCache {
    pub bytes: Vec<u8>,
    pub modified: Option<SystemTime>,
}

/// A failure recorded while loading, raised only if the bytes are requested.
#[derive(Debug, Clone)]
pub struct LazyError {
    pub kind: io::ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct FileSource {
    pub path: String,
    pub cache: Option<FileCache>,
    pub error: Option<LazyError>,
}

impl FileSource {
    pub fn invalidate(&mut self) {
        self.cache = None;
        self.error = None;
    }
}

#[derive(Debug, Clone)]
pub struct Repetition {
    /// Detached prototype cloned for every entry.
    pub template: Option<NodeId>,
    pub count: Option<Formula>,
    pub rows: Vec<serde_json::Map<String, Json>>,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Int { signed: bool },
    Str { terminated: bool },
    Date { encoding: DateEncoding, format: String },
    Version { field_bytes: usize },
    Bytes,
    File(FileSource),
    Bit { position: u32 },
    BitField { low: u32, high: u32 },
    BitRegister,
    Group,
    Table(Repetition),
    Iterable(Repetition),
    Function(FunctionSpec),
}

pub const COMMON_PROPERTIES: &[&str] = &[
    "name", "kind", "offset", "size", "enabled", "visible", "save", "value", "data", "plain",
    "index",
];

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Int { .. } => "int",
            Self::Str { .. } => "string",
            Self::Date { .. } => "date",
            Self::Version { .. } => "version",
            Self::Bytes => "bytes",
            Self::File(_) => "file",
            Self::Bit { .. } => "bit",
            Self::BitField { .. } => "bitfield",
            Self::BitRegister => "bitregister",
            Self::Group => "group",
            Self::Table(_) => "table",
            Self::Iterable(_) => "iterable",
            Self::Function(_) => "function",
        }
    }

    /// Kind-specific properties beyond [`COMMON_PROPERTIES`].
    pub fn extra_properties(&self) -> &'static [&'static str] {
        match self {
            Self::Int { .. } | Self::BitRegister => &["signed", "min", "max"],
            Self::Str { .. } | Self::Bytes => &["length"],
            Self::Date { .. } => &["year", "month", "day"],
            Self::Version { .. } => &["major", "minor", "patch"],
            Self::File(_) => &["path", "mtime", "length"],
            Self::Bit { .. } => &["position", "mask", "width"],
            Self::BitField { .. } => &["bit_low", "bit_high", "mask", "width"],
            Self::Group | Self::Table(_) | Self::Iterable(_) => &["count"],
            Self::Function(_) => &["algorithm", "length"],
        }
    }

    pub fn is_repetition(&self) -> bool {
        matches!(self, Self::Table(_) | Self::Iterable(_))
    }

    pub fn repetition(&self) -> Option<&Repetition> {
        match self {
            Self::Table(r) | Self::Iterable(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Self::Group | Self::Table(_) | Self::Iterable(_))
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Self::Function(_))
    }

    /// Inclusive bit range of a bit-level child.
    pub fn bit_range(&self) -> Option<(u32, u32)> {
        match self {
            Self::Bit { position } => Some((*position, *position)),
            Self::BitField { low, high } => Some((*low, *high)),
            _ => None,
        }
    }

    /// Kinds whose children are bit fields rather than byte ranges.
    pub fn holds_bits(&self) -> bool {
        matches!(self, Self::Int { .. } | Self::BitRegister)
    }

    pub fn default_byte_order(&self) -> ByteOrder {
        match self {
            Self::Int { .. } | Self::BitRegister | Self::Bit { .. } | Self::BitField { .. } => {
                ByteOrder::Little
            }
            Self::Date { encoding: DateEncoding::Epoch, .. } => ByteOrder::Little,
            _ => ByteOrder::Big,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Encryption {
    pub key: String,
    pub iv: Option<String>,
    pub mode: EncryptMode,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub size: Option<Formula>,
    /// Literal value; takes precedence over `calculate`.
    pub value: Option<Value>,
    pub calculate: Option<Formula>,
    pub offset: Option<Formula>,
    pub align: Option<Formula>,
    pub pad_align: Option<Formula>,
    pub pad: Option<u8>,
    pub align_end: bool,
    pub byte_order: ByteOrder,
    pub enabled: Option<Formula>,
    pub visible: bool,
    pub save: bool,
    pub encrypt: Option<Encryption>,
    pub validations: Vec<ValidationSpec>,
    pub constraints: Constraints,
    pub dependencies: Vec<Dependency>,
    pub id_setting: Option<String>,
    /// Setting written by a decomposition-section node.
    pub target: Option<String>,
    /// Position inside the enclosing repetition.
    pub index: Option<usize>,
    pub state: NodeState,
}

fn formula(node: &str, scalar: &Option<Scalar>) -> Result<Option<Formula>> {
    scalar
        .as_ref()
        .map(|s| Formula::parse(&s.to_formula()).map_err(|e| BuildError::parse(node, e.to_string())))
        .transpose()
}

fn json_int(node: &str, json: &Json) -> Result<i128> {
    match json {
        Json::Number(n) => n
            .as_i64()
            .map(i128::from)
            .or_else(|| n.as_u64().map(i128::from))
            .ok_or_else(|| BuildError::parse(node, format!("{n} is not an integer"))),
        Json::String(s) => convert::parse_int(s).map_err(|e| BuildError::parse(node, e.to_string())),
        Json::Bool(b) => Ok(i128::from(*b)),
        other => Err(BuildError::parse(node, format!("expected integer, got {other}"))),
    }
}

/// A declared literal converted to the value type of `kind`.
pub fn literal_for(kind: &NodeKind, node: &str, json: &Json) -> Result<Value> {
    Ok(match kind {
        NodeKind::Int { .. } | NodeKind::BitRegister | NodeKind::Bit { .. } | NodeKind::BitField { .. } => {
            Value::Int(json_int(node, json)?)
        }
        NodeKind::Str { .. } => match json {
            Json::String(s) => Value::Str(s.clone()),
            other => Value::Str(other.to_string()),
        },
        NodeKind::Date { .. } | NodeKind::Version { .. } => match json {
            Json::String(s) => Value::Str(s.clone()),
            other => return Err(BuildError::parse(node, format!("expected text, got {other}"))),
        },
        NodeKind::Bytes
        | NodeKind::Group
        | NodeKind::Table(_)
        | NodeKind::Iterable(_)
        | NodeKind::File(_)
        | NodeKind::Function(_) => match json {
            Json::String(s) => Value::Bytes(
                convert::parse_hex_bytes(s).map_err(|e| BuildError::parse(node, e.to_string()))?,
            ),
            Json::Array(items) => Value::Bytes(
                items
                    .iter()
                    .map(|item| {
                        json_int(node, item).and_then(|v| {
                            u8::try_from(v).map_err(|_| BuildError::parse(node, format!("{v} is not a byte")))
                        })
                    })
                    .collect::<Result<Vec<u8>>>()?,
            ),
            other => return Err(BuildError::parse(node, format!("expected hex bytes, got {other}"))),
        },
    })
}

fn parse_kind(decl: &NodeDecl, params: &Params, ctx: &BuildContext) -> Result<NodeKind> {
    let name = decl.name.as_str();
    let kind = decl.kind.to_ascii_lowercase();
    let bits = |params: &Params| -> Result<(u32, u32)> {
        let [low, high] = params
            .bits
            .ok_or_else(|| BuildError::parse(name, "bitfield requires params.bits [low, high]"))?;
        if low > high {
            return Err(BuildError::parse(name, format!("bit range [{low}, {high}] is reversed")));
        }
        Ok((low, high))
    };
    let repetition = |params: &Params| -> Result<Repetition> {
        Ok(Repetition {
            template: None,
            count: formula(name, &params.count)?,
            rows: params.rows.clone().unwrap_or_default(),
        })
    };

    Ok(match kind.as_str() {
        "int" | "integer" | "uint" => NodeKind::Int {
            signed: params.signed.unwrap_or(false),
        },
        "string" | "str" => NodeKind::Str {
            terminated: params.terminated,
        },
        "date" => {
            let encoding = match params.encoding.as_deref().unwrap_or("bcd") {
                "bcd" => DateEncoding::Bcd,
                "ascii" => DateEncoding::Ascii,
                "epoch" => DateEncoding::Epoch,
                other => return Err(BuildError::parse(name, format!("unknown date encoding {other:?}"))),
            };
            NodeKind::Date {
                encoding,
                format: params.format.clone().unwrap_or_else(|| "%Y-%m-%d".to_string()),
            }
        }
        "version" => NodeKind::Version {
            field_bytes: params.field_bytes.unwrap_or(1),
        },
        "bytes" | "bytearray" | "byte_array" => NodeKind::Bytes,
        "file" => {
            let path = match &decl.value {
                Some(Json::String(p)) => p.clone(),
                _ => return Err(BuildError::parse(name, "file node requires a path value")),
            };
            NodeKind::File(FileSource {
                path,
                cache: None,
                error: None,
            })
        }
        "bit" => NodeKind::Bit {
            position: params
                .bit
                .or(params.bits.map(|[low, _]| low))
                .ok_or_else(|| BuildError::parse(name, "bit requires params.bit"))?,
        },
        "bitfield" | "bit_field" => {
            let (low, high) = bits(params)?;
            NodeKind::BitField { low, high }
        }
        "bitregister" | "bit_register" => NodeKind::BitRegister,
        "group" => NodeKind::Group,
        "table" => NodeKind::Table(repetition(params)?),
        "iterable" => {
            let rep = repetition(params)?;
            if rep.count.is_none() {
                return Err(BuildError::parse(name, "iterable requires params.count"));
            }
            NodeKind::Iterable(rep)
        }
        "function" | "hash" | "crc" | "checksum" | "sign" | "verify" => {
            NodeKind::Function(FunctionSpec::parse(&kind, params, name)?)
        }
        _ if ctx.is_decompose_only() => NodeKind::Bytes,
        other => return Err(BuildError::parse(name, format!("unknown node kind {other:?}"))),
    })
}

impl Node {
    /// Parse one declaration (children are attached by the tree).
    pub fn parse(decl: &NodeDecl, ctx: &BuildContext) -> Result<Self> {
        let name = decl.name.as_str();
        if name.is_empty() {
            return Err(BuildError::parse(
                &format!("<{}>", decl.kind),
                "node requires a name",
            ));
        }
        if decl.kind.is_empty() {
            return Err(BuildError::parse(name, "node requires a kind"));
        }
        let params = match &decl.params {
            Some(p) => p
                .resolve()
                .map_err(|e| BuildError::parse(name, format!("invalid params: {e}")))?,
            None => Params::default(),
        };
        let kind = parse_kind(decl, &params, ctx)?;

        if decl.value.is_some() && decl.calculate.is_some() && !matches!(kind, NodeKind::File(_)) {
            return Err(BuildError::parse(name, "value and calculate are mutually exclusive"));
        }
        if decl.offset.is_some() && decl.align.is_some() {
            return Err(BuildError::parse(name, "offset and align are mutually exclusive"));
        }
        if matches!(kind, NodeKind::Int { .. } | NodeKind::BitRegister) && decl.size.is_none() {
            return Err(BuildError::parse(name, format!("{} requires a size", kind.name())));
        }

        let value = match (&kind, &decl.value) {
            (NodeKind::File(_), _) | (_, None) => None,
            (NodeKind::Function(_), Some(_)) => {
                return Err(BuildError::parse(name, "function nodes compute their own value"))
            }
            (_, Some(json)) => Some(literal_for(&kind, name, json)?),
        };
        let calculate = decl
            .calculate
            .as_deref()
            .map(|src| Formula::parse(src).map_err(|e| BuildError::parse(name, e.to_string())))
            .transpose()?;

        let dependencies = match &decl.dependency {
            Some(deps) => deps
                .resolve()
                .map_err(|e| BuildError::parse(name, format!("invalid dependency list: {e}")))?
                .iter()
                .map(|d| Dependency::parse(d, name))
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        let byte_order = decl.byte_order.unwrap_or_else(|| kind.default_byte_order());
        let node = Self {
            name: name.to_string(),
            size: formula(name, &decl.size)?,
            value,
            calculate,
            offset: formula(name, &decl.offset)?,
            align: formula(name, &decl.align)?,
            pad_align: formula(name, &decl.pad_align)?,
            pad: decl.pad,
            align_end: decl.align_end,
            byte_order,
            enabled: formula(name, &decl.enabled)?,
            visible: decl.visible.unwrap_or(true),
            save: decl.save.unwrap_or(true),
            encrypt: decl.encrypt.as_ref().map(|e| Encryption {
                key: e.key.clone(),
                iv: e.iv.clone(),
                mode: e.mode,
            }),
            validations: ValidationSpec::from_decl(decl.validate.as_ref(), name)?,
            constraints: Constraints::from_params(&params, &kind, name)?,
            dependencies,
            id_setting: params.id_setting.clone(),
            target: params.target.clone(),
            index: None,
            parent: None,
            children: Vec::new(),
            kind,
            state: NodeState::default(),
        };
        Ok(node)
    }

    /// A plain node, used for section roots and generated fillers.
    pub fn synthetic(name: &str, kind: NodeKind) -> Self {
        Self {
            name: name.to_string(),
            byte_order: kind.default_byte_order(),
            kind,
            parent: None,
            children: Vec::new(),
            size: None,
            value: None,
            calculate: None,
            offset: None,
            align: None,
            pad_align: None,
            pad: None,
            align_end: false,
            enabled: None,
            visible: true,
            save: true,
            encrypt: None,
            validations: Vec::new(),
            constraints: Constraints::default(),
            dependencies: Vec::new(),
            id_setting: None,
            target: None,
            index: None,
            state: NodeState::default(),
        }
    }

    pub fn has_property(&self, name: &str) -> bool {
        COMMON_PROPERTIES.contains(&name) || self.kind.extra_properties().contains(&name)
    }

    pub fn has_own_value(&self) -> bool {
        self.value.is_some() || self.calculate.is_some()
    }

    /// Size known from the declaration alone.
    pub fn literal_size(&self) -> Option<usize> {
        self.size
            .as_ref()
            .and_then(Formula::as_literal)
            .and_then(|v| v.as_int().ok())
            .and_then(|v| usize::try_from(v).ok())
    }

    /// Size implied by the kind when no size is declared.
    pub fn natural_size(&self, ctx: &BuildContext) -> Option<usize> {
        match &self.kind {
            NodeKind::Date { encoding: DateEncoding::Bcd | DateEncoding::Epoch, .. } => Some(4),
            NodeKind::Version { field_bytes } => Some(3 * field_bytes),
            NodeKind::Function(spec) => Some(spec.output_len(ctx)),
            _ => None,
        }
    }

    /// Value a disabled node reports.
    pub fn default_value(&self) -> Value {
        match &self.kind {
            NodeKind::Int { .. }
            | NodeKind::BitRegister
            | NodeKind::Bit { .. }
            | NodeKind::BitField { .. } => Value::Int(0),
            NodeKind::Str { .. } | NodeKind::Date { .. } | NodeKind::Version { .. } => {
                Value::Str(String::new())
            }
            _ => Value::Bytes(Vec::new()),
        }
    }

    fn conv(&self, e: ConvertError) -> BuildError {
        BuildError::convert(&self.name, e)
    }

    /// Convert an incoming value to this kind's value type.
    pub fn coerce(&self, value: &Value) -> Result<Value> {
        Ok(match &self.kind {
            NodeKind::Int { .. }
            | NodeKind::BitRegister
            | NodeKind::Bit { .. }
            | NodeKind::BitField { .. } => Value::Int(value.as_int().map_err(|e| self.conv(e))?),
            NodeKind::Str { .. } | NodeKind::Date { .. } | NodeKind::Version { .. } => {
                Value::Str(value.as_string().map_err(|e| self.conv(e))?)
            }
            NodeKind::Function(_) => {
                return Err(BuildError::component(&self.name, "function nodes compute their own value"))
            }
            _ => Value::Bytes(value.as_bytes().map_err(|e| self.conv(e))?),
        })
    }

    /// Serialize `value` for this kind. `size` is the resolved size if known.
    pub fn encode(&self, value: &Value, size: Option<usize>, pad: u8) -> Result<Vec<u8>> {
        let order = self.byte_order;
        let fit = |bytes: Vec<u8>| -> Result<Vec<u8>> {
            match size {
                Some(size) => convert::pad_to(&bytes, size, pad, self.align_end).map_err(|e| self.conv(e)),
                None => Ok(bytes),
            }
        };
        match &self.kind {
            NodeKind::Int { signed } => {
                let size = size.ok_or_else(|| BuildError::component(&self.name, "unknown size"))?;
                let v = value.as_int().map_err(|e| self.conv(e))?;
                convert::int_to_bytes(v, size, *signed, order).map_err(|e| self.conv(e))
            }
            NodeKind::BitRegister => {
                let size = size.ok_or_else(|| BuildError::component(&self.name, "unknown size"))?;
                let v = value.as_int().map_err(|e| self.conv(e))?;
                convert::int_to_bytes(v, size, false, order).map_err(|e| self.conv(e))
            }
            NodeKind::Str { terminated } => {
                let mut bytes = value.as_string().map_err(|e| self.conv(e))?.into_bytes();
                if *terminated {
                    bytes.push(0);
                }
                fit(bytes)
            }
            NodeKind::Date { encoding, format } => {
                let text = value.as_string().map_err(|e| self.conv(e))?;
                let date = NaiveDate::parse_from_str(&text, format).map_err(|e| {
                    BuildError::component(&self.name, format!("invalid date {text:?} for {format:?}: {e}"))
                })?;
                match encoding {
                    DateEncoding::Bcd => fit(encode_bcd_date(date).ok_or_else(|| {
                        BuildError::component(&self.name, format!("year {} does not fit in 4 BCD digits", date.year()))
                    })?),
                    DateEncoding::Ascii => fit(date.format(format).to_string().into_bytes()),
                    DateEncoding::Epoch => {
                        let secs = date
                            .and_hms_opt(0, 0, 0)
                            .map(|dt| dt.and_utc().timestamp())
                            .ok_or_else(|| BuildError::component(&self.name, "date out of range"))?;
                        convert::int_to_bytes(i128::from(secs), size.unwrap_or(4), false, order)
                            .map_err(|e| self.conv(e))
                    }
                }
            }
            NodeKind::Version { field_bytes } => {
                let text = value.as_string().map_err(|e| self.conv(e))?;
                let version = semver::Version::parse(text.trim()).map_err(|e| {
                    BuildError::component(&self.name, format!("invalid version {text:?}: {e}"))
                })?;
                let mut out = Vec::with_capacity(3 * field_bytes);
                for part in [version.major, version.minor, version.patch] {
                    out.extend(
                        convert::int_to_bytes(i128::from(part), *field_bytes, false, order)
                            .map_err(|e| self.conv(e))?,
                    );
                }
                fit(out)
            }
            NodeKind::Bit { .. } | NodeKind::BitField { .. } => {
                let v = value.as_int().map_err(|e| self.conv(e))?;
                Ok(convert::uint_to_min_be_bytes(v))
            }
            _ => fit(value.as_bytes().map_err(|e| self.conv(e))?),
        }
    }

    /// Recover a value of this kind from its bytes.
    pub fn decode(&self, bytes: &[u8]) -> Result<Value> {
        let order = self.byte_order;
        match &self.kind {
            NodeKind::Int { signed } => convert::bytes_to_int(bytes, *signed, order)
                .map(Value::Int)
                .map_err(|e| self.conv(e)),
            NodeKind::BitRegister => convert::bytes_to_int(bytes, false, order)
                .map(Value::Int)
                .map_err(|e| self.conv(e)),
            NodeKind::Str { .. } => {
                let pad = self.pad.unwrap_or(0);
                let end = bytes
                    .iter()
                    .position(|b| *b == 0)
                    .unwrap_or(bytes.len());
                let mut text = &bytes[..end];
                while let Some((last, rest)) = text.split_last() {
                    if *last != pad {
                        break;
                    }
                    text = rest;
                }
                String::from_utf8(text.to_vec())
                    .map(Value::Str)
                    .map_err(|_| self.conv(ConvertError::InvalidUtf8))
            }
            NodeKind::Date { encoding, format } => {
                let date = match encoding {
                    DateEncoding::Bcd => decode_bcd_date(bytes),
                    DateEncoding::Ascii => std::str::from_utf8(bytes)
                        .ok()
                        .and_then(|t| NaiveDate::parse_from_str(t.trim_end_matches('\0'), format).ok()),
                    DateEncoding::Epoch => convert::bytes_to_int(bytes, false, order)
                        .ok()
                        .and_then(|secs| i64::try_from(secs).ok())
                        .and_then(|secs| DateTime::from_timestamp(secs, 0))
                        .map(|dt| dt.date_naive()),
                };
                date.map(|d| Value::Str(d.format(format).to_string()))
                    .ok_or_else(|| BuildError::component(&self.name, "bytes do not hold a valid date"))
            }
            NodeKind::Version { field_bytes } => {
                let fb = *field_bytes;
                if bytes.len() < 3 * fb {
                    return Err(BuildError::component(&self.name, "version field too short"));
                }
                let mut parts = Vec::with_capacity(3);
                for i in 0..3 {
                    let part = convert::bytes_to_int(&bytes[i * fb..(i + 1) * fb], false, order)
                        .map_err(|e| self.conv(e))?;
                    parts.push(part.to_string());
                }
                Ok(Value::Str(parts.join(".")))
            }
            _ => Ok(Value::Bytes(bytes.to_vec())),
        }
    }

    /// Kind-specific part of a property read that needs only the value.
    pub fn value_facet(&self, property: &str, value: &Value) -> Result<Option<Value>> {
        Ok(Some(match (&self.kind, property) {
            (NodeKind::Date { format, .. }, "year" | "month" | "day") => {
                let text = value.as_string().map_err(|e| self.conv(e))?;
                let date = NaiveDate::parse_from_str(&text, format)
                    .map_err(|e| BuildError::component(&self.name, format!("invalid date: {e}")))?;
                Value::Int(i128::from(match property {
                    "year" => date.year(),
                    "month" => date.month() as i32,
                    _ => date.day() as i32,
                }))
            }
            (NodeKind::Version { .. }, "major" | "minor" | "patch") => {
                let text = value.as_string().map_err(|e| self.conv(e))?;
                let v = semver::Version::parse(text.trim())
                    .map_err(|e| BuildError::component(&self.name, format!("invalid version: {e}")))?;
                Value::Int(i128::from(match property {
                    "major" => v.major,
                    "minor" => v.minor,
                    _ => v.patch,
                }))
            }
            (NodeKind::Str { .. }, "length") => {
                Value::Int(value.as_string().map_err(|e| self.conv(e))?.len() as i128)
            }
            (NodeKind::Bytes | NodeKind::File(_) | NodeKind::Function(_), "length") => {
                Value::Int(value.as_bytes().map_err(|e| self.conv(e))?.len() as i128)
            }
            _ => return Ok(None),
        }))
    }
}

/// `YYYYMMDD` as packed BCD; `None` for years outside 0..=9999.
fn encode_bcd_date(date: NaiveDate) -> Option<Vec<u8>> {
    let year = u32::try_from(date.year()).ok().filter(|y| *y <= 9999)?;
    let bcd = |n: u32| ((n / 10) << 4 | n % 10) as u8;
    Some(vec![bcd(year / 100), bcd(year % 100), bcd(date.month()), bcd(date.day())])
}

fn decode_bcd_date(bytes: &[u8]) -> Option<NaiveDate> {
    let mut digits = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let (hi, lo) = (b >> 4, b & 0x0F);
        if hi > 9 || lo > 9 {
            return None;
        }
        digits.push(char::from(b'0' + hi));
        digits.push(char::from(b'0' + lo));
    }
    NaiveDate::parse_from_str(&digits, "%Y%m%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(decl: Json) -> Result<Node> {
        let decl: NodeDecl = serde_json::from_value(decl).unwrap();
        Node::parse(&decl, &BuildContext::default())
    }

    #[test]
    fn test_missing_required_attributes() {
        assert!(matches!(node(json!({"kind": "int", "name": "x"})), Err(BuildError::Parse { .. })));
        assert!(matches!(node(json!({"kind": "int", "size": 1})), Err(BuildError::Parse { .. })));
        assert!(matches!(node(json!({"kind": "bitfield", "name": "f"})), Err(BuildError::Parse { .. })));
        assert!(matches!(node(json!({"kind": "file", "name": "f"})), Err(BuildError::Parse { .. })));
        assert!(matches!(
            node(json!({"kind": "int", "name": "x", "size": 1, "offset": 4, "align": 4})),
            Err(BuildError::Parse { .. })
        ));
    }

    #[test]
    fn test_unknown_kind_coerced_only_when_decomposing() {
        let decl: NodeDecl = serde_json::from_value(json!({"kind": "widget", "name": "w"})).unwrap();
        assert!(Node::parse(&decl, &BuildContext::default()).is_err());
        let ctx = BuildContext::default().with_mode(crate::config::ToolMode::Decompose);
        assert!(matches!(Node::parse(&decl, &ctx).unwrap().kind, NodeKind::Bytes));
    }

    #[test]
    fn test_byte_order_defaults() {
        let int = node(json!({"kind": "int", "name": "x", "size": 2})).unwrap();
        assert_eq!(int.byte_order, ByteOrder::Little);
        let group = node(json!({"kind": "group", "name": "g"})).unwrap();
        assert_eq!(group.byte_order, ByteOrder::Big);
    }

    #[test]
    fn test_int_encode_decode() {
        let n = node(json!({"kind": "int", "name": "x", "size": 2, "params": {"signed": true}})).unwrap();
        let bytes = n.encode(&Value::Int(-2), Some(2), 0).unwrap();
        assert_eq!(bytes, vec![0xFE, 0xFF]);
        assert_eq!(n.decode(&bytes).unwrap(), Value::Int(-2));
        assert!(n.encode(&Value::Int(40000), Some(2), 0).is_err());
    }

    #[test]
    fn test_string_padding_and_overflow() {
        let n = node(json!({"kind": "string", "name": "s", "size": 6, "params": {"terminated": true}})).unwrap();
        assert_eq!(n.encode(&Value::Str("abc".into()), Some(6), 0xFF).unwrap(), b"abc\0\xFF\xFF".to_vec());
        assert!(n.encode(&Value::Str("abcdef".into()), Some(6), 0).is_err());
        assert_eq!(n.decode(b"abc\0\0\0").unwrap(), Value::Str("abc".into()));
    }

    #[test]
    fn test_date_encodings() {
        let bcd = node(json!({"kind": "date", "name": "d"})).unwrap();
        let bytes = bcd.encode(&Value::Str("2024-01-31".into()), Some(4), 0).unwrap();
        assert_eq!(bytes, vec![0x20, 0x24, 0x01, 0x31]);
        assert_eq!(bcd.decode(&bytes).unwrap(), Value::Str("2024-01-31".into()));
        let bytes = bcd.encode(&Value::Str("9999-12-31".into()), Some(4), 0).unwrap();
        assert_eq!(bytes, vec![0x99, 0x99, 0x12, 0x31]);
        let bytes = bcd.encode(&Value::Str("0000-01-01".into()), Some(4), 0).unwrap();
        assert_eq!(bytes, vec![0x00, 0x00, 0x01, 0x01]);
        for out_of_range in ["+12345-01-01", "-0001-01-01"] {
            assert!(matches!(
                bcd.encode(&Value::Str(out_of_range.into()), Some(4), 0),
                Err(BuildError::Component { .. })
            ));
        }

        let epoch = node(json!({"kind": "date", "name": "d", "params": {"encoding": "epoch"}})).unwrap();
        let bytes = epoch.encode(&Value::Str("1970-01-02".into()), Some(4), 0).unwrap();
        assert_eq!(bytes, vec![0x80, 0x51, 0x01, 0x00]);
        assert_eq!(epoch.decode(&bytes).unwrap(), Value::Str("1970-01-02".into()));
    }

    #[test]
    fn test_version_encoding() {
        let n = node(json!({"kind": "version", "name": "v", "params": {"field_bytes": 2}})).unwrap();
        assert_eq!(n.natural_size(&BuildContext::default()), Some(6));
        let bytes = n.encode(&Value::Str("1.2.3".into()), Some(6), 0).unwrap();
        assert_eq!(bytes, vec![0, 1, 0, 2, 0, 3]);
        assert_eq!(n.decode(&bytes).unwrap(), Value::Str("1.2.3".into()));
        assert_eq!(n.value_facet("minor", &Value::Str("1.2.3".into())).unwrap(), Some(Value::Int(2)));
    }

    #[test]
    fn test_bytes_literal_forms() {
        let hex = node(json!({"kind": "bytes", "name": "b", "value": "DEADBEEF"})).unwrap();
        assert_eq!(hex.value, Some(Value::Bytes(vec![0xde, 0xad, 0xbe, 0xef])));
        let arr = node(json!({"kind": "bytes", "name": "b", "value": [1, 2, 255]})).unwrap();
        assert_eq!(arr.value, Some(Value::Bytes(vec![1, 2, 255])));
        assert!(node(json!({"kind": "bytes", "name": "b", "value": [256]})).is_err());
    }

    #[test]
    fn test_closed_property_table() {
        let n = node(json!({"kind": "version", "name": "v"})).unwrap();
        assert!(n.has_property("offset"));
        assert!(n.has_property("major"));
        assert!(!n.has_property("bit_low"));
    }
}
