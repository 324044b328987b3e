//! Phase 2 - bytes
//!
//! Every laid-out node gets its final bytes written at its offset. Function
//! nodes hash or sign other nodes' bytes, and those only count once built, so
//! nodes are swept repeatedly until everything is built. A sweep that builds
//! nothing means a node waits on itself.
//!
//! CRITICAL: nothing leaves this module unless the whole tree built; the
//! image is copied out of the buffer only at the very end.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::buffer::Buffer;
use crate::config::BuildContext;
use crate::convert;
use crate::crypto::CryptoProvider;
use crate::error::{BuildError, Result};
use crate::expr::Resolution;
use crate::function;
use crate::hashing::{compute_manifest_hash, sha256_hex};
use crate::node::{NodeKind, Phase};
use crate::scope::Evaluator;
use crate::store::FileStore;
use crate::tree::{NodeId, Section, Tree};
use crate::validation::Validator;

/// One named byte range of the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapEntry {
    pub path: String,
    pub offset: usize,
    pub size: usize,
    /// Nesting below the layout section; top-level nodes are 0.
    pub depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildOutput {
    pub id: String,
    pub declaration: String,
    pub declaration_version: String,
    pub engine_version: String,
    pub created_at: DateTime<Utc>,
    pub image_size: usize,
    pub image_hash: String,
    pub map_hash: String,
    pub build_hash: String,
    pub map: Vec<MapEntry>,
    #[serde(skip)]
    pub image: Vec<u8>,
}

impl BuildOutput {
    pub fn new(image: Vec<u8>, map: Vec<MapEntry>, build_hash: String, declaration: (&str, &str)) -> Result<Self> {
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            declaration: declaration.0.to_string(),
            declaration_version: declaration.1.to_string(),
            engine_version: crate::ENGINE_VERSION.to_string(),
            created_at: Utc::now(),
            image_size: image.len(),
            image_hash: sha256_hex(&image),
            map_hash: compute_manifest_hash(&map)?,
            build_hash,
            map,
            image,
        })
    }

    pub fn entry(&self, path: &str) -> Option<&MapEntry> {
        self.map.iter().find(|e| e.path == path)
    }
}

pub struct Builder<'a> {
    ctx: &'a BuildContext,
    crypto: &'a dyn CryptoProvider,
    store: &'a dyn FileStore,
    validator: Validator,
}

impl<'a> Builder<'a> {
    pub fn new(ctx: &'a BuildContext, crypto: &'a dyn CryptoProvider, store: &'a dyn FileStore) -> Self {
        Self {
            ctx,
            crypto,
            store,
            validator: Validator::new(),
        }
    }

    /// Build every laid-out node. Returns how many nodes were written.
    pub fn run(&self, tree: &mut Tree, buffer: &mut Buffer) -> Result<usize> {
        let layout = tree.section(Section::Layout);
        // Children come before their parents.
        let order: Vec<NodeId> = tree.preorder(layout).into_iter().rev().collect();
        let mut written = 0;
        let mut sweeps = 0;

        loop {
            sweeps += 1;
            let mut progressed = 0;
            let mut waiting: Option<(NodeId, String)> = None;
            for &id in &order {
                if tree.node(id).state.phase == Phase::Built {
                    continue;
                }
                match self.build_node(tree, buffer, id)? {
                    Resolution::Resolved(wrote) => {
                        progressed += 1;
                        written += usize::from(wrote);
                    }
                    Resolution::Deferred(reason) => {
                        waiting.get_or_insert((id, reason));
                    }
                }
            }
            match waiting {
                None => break,
                Some((id, reason)) if progressed == 0 => {
                    return Err(BuildError::component(
                        &tree.path_of(id),
                        format!("cannot be built: {reason}"),
                    ));
                }
                Some(_) => debug!(sweep = sweeps, progressed, "build sweep incomplete"),
            }
        }
        info!(nodes = written, sweeps, "build complete");
        Ok(written)
    }

    /// Try to build one node. Resolves to whether bytes were written.
    fn build_node(&self, tree: &mut Tree, buffer: &mut Buffer, id: NodeId) -> Result<Resolution<bool>> {
        let node = tree.node(id);
        if node.state.phase == Phase::Unbuilt {
            return Err(BuildError::component(&tree.path_of(id), "node was not laid out"));
        }
        if node.state.enabled == Some(false) || tree.is_bit_field(id) || id == tree.section(Section::Layout) {
            let ready = node.children.iter().all(|c| tree.node(*c).state.phase == Phase::Built);
            if !ready {
                return Ok(Resolution::Deferred(format!("children of '{}' are not built", node.name)));
            }
            tree.node_mut(id).state.phase = Phase::Built;
            return Ok(Resolution::Resolved(false));
        }

        let name = node.name.clone();
        let pad = tree.pad_byte(id, self.ctx);
        let content_size = node
            .state
            .content_size
            .ok_or_else(|| BuildError::component(&name, "content size was not laid out"))?;
        let is_container = node.value.is_none()
            && node.calculate.is_none()
            && !node.kind.holds_bits()
            && (!node.children.is_empty() || node.kind.is_repetition());

        let content = if is_container {
            if let Some(child) = node.children.iter().find(|c| tree.node(**c).state.phase != Phase::Built) {
                return Ok(Resolution::Deferred(format!("'{}' is not built", tree.node(*child).name)));
            }
            let offset = node.state.offset.unwrap_or(0);
            buffer.read(offset, content_size)?.to_vec()
        } else {
            let ev = Evaluator::for_build(tree, self.ctx);
            match self.leaf_bytes(&ev, id, content_size, pad)? {
                Resolution::Resolved(bytes) => bytes,
                Resolution::Deferred(reason) => return Ok(Resolution::Deferred(reason)),
            }
        };

        let violations = self.validator.validate_node(&Evaluator::for_build(tree, self.ctx), id)?;
        Validator::enforce(&violations, self.ctx, true)?;

        self.commit(tree, buffer, id, content, pad)?;
        Ok(Resolution::Resolved(true))
    }

    fn leaf_bytes(&self, ev: &Evaluator<'_>, id: NodeId, content_size: usize, pad: u8) -> Result<Resolution<Vec<u8>>> {
        let node = ev.tree().node(id);
        if let NodeKind::Function(spec) = &node.kind {
            let inputs = match function::gather(ev, id, spec)? {
                Resolution::Resolved(inputs) => inputs,
                Resolution::Deferred(reason) => return Ok(Resolution::Deferred(reason)),
            };
            let out = function::compute(spec, &inputs, node.byte_order, self.crypto, self.store, self.ctx)?;
            debug!(node = %node.name, algorithm = spec.algorithm.name(), len = out.len(), "computed");
            return convert::pad_to(&out, content_size, pad, node.align_end)
                .map(Resolution::Resolved)
                .map_err(|e| BuildError::convert(&node.name, e));
        }

        let has_source = node.value.is_some()
            || node.calculate.is_some()
            || matches!(node.kind, NodeKind::File(_))
            || (node.kind.holds_bits() && !node.children.is_empty());
        if !has_source {
            return Ok(Resolution::Resolved(vec![pad; content_size]));
        }
        match ev.value(id)? {
            Resolution::Resolved(value) => node.encode(&value, Some(content_size), pad).map(Resolution::Resolved),
            Resolution::Deferred(reason) => Ok(Resolution::Deferred(reason)),
        }
    }

    /// Pad, encrypt and write a node's bytes, then mark it built.
    fn commit(&self, tree: &mut Tree, buffer: &mut Buffer, id: NodeId, content: Vec<u8>, pad: u8) -> Result<()> {
        let node = tree.node(id);
        let path = tree.path_of(id);
        let state = &node.state;
        let (Some(offset), Some(plain_size), Some(size)) = (state.offset, state.plain_size, state.size) else {
            return Err(BuildError::component(&path, "node was not laid out"));
        };
        if Some(content.len()) != state.content_size {
            return Err(BuildError::component(
                &path,
                format!("invalid final size: produced {} bytes for {:?}", content.len(), state.content_size),
            ));
        }
        let mut plain = content;
        plain.resize(plain_size, pad);

        let (bytes, kept_plain) = match &node.encrypt {
            Some(encryption) => {
                let key = self
                    .store
                    .read_file(Path::new(&encryption.key))
                    .map_err(|e| BuildError::file(&encryption.key, e))?;
                let iv = encryption
                    .iv
                    .as_deref()
                    .map(convert::parse_hex_bytes)
                    .transpose()
                    .map_err(|e| BuildError::convert(&node.name, e))?;
                crate::crypto::check_aes_key(&key, iv.as_deref(), encryption.mode)?;
                plain.resize(size, pad);
                let cipher = self.crypto.aes_encrypt(&plain, encryption.mode, &key, iv.as_deref())?;
                (cipher, Some(plain))
            }
            None => (plain, None),
        };
        if bytes.len() != size {
            return Err(BuildError::component(
                &path,
                format!("invalid final size: wrote {} bytes, laid out {size}", bytes.len()),
            ));
        }

        buffer.write_at(offset, &bytes)?;
        debug!(node = %path, offset, size, "built");

        let children = node.children.clone();
        let state = &mut tree.node_mut(id).state;
        state.bytes = Some(bytes);
        state.plain = kept_plain;
        state.phase = Phase::Built;
        for child in children {
            if tree.is_bit_field(child) {
                tree.node_mut(child).state.phase = Phase::Built;
            }
        }
        Ok(())
    }
}

/// Byte ranges of every enabled, non-empty layout node.
pub fn byte_map(tree: &Tree) -> Vec<MapEntry> {
    let layout = tree.section(Section::Layout);
    let base = tree.depth(layout) + 1;
    tree.preorder(layout)
        .into_iter()
        .filter(|id| *id != layout)
        .filter_map(|id| {
            let state = &tree.node(id).state;
            match (state.enabled, state.offset, state.size) {
                (Some(true), Some(offset), Some(size)) if size > 0 => Some(MapEntry {
                    path: tree.path_of(id),
                    offset,
                    size,
                    depth: tree.depth(id) - base,
                }),
                _ => None,
            }
        })
        .collect()
}
