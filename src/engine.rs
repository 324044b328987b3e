//! Build Engine - Single Entry Point
//!
//! Owns the node tree of one declaration and runs every operation against
//! it: reads and edits with dependency propagation, validation, layout,
//! build and decomposition.
//!
//! CRITICAL: `build` always propagates and validates first. No bypass.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use semver::Version;
use tracing::{debug, info, warn};

use crate::buffer::Buffer;
use crate::build::{byte_map, BuildOutput, Builder};
use crate::change::{self, PropertyChangeRecord};
use crate::config::{BuildContext, RangePolicy};
use crate::crypto::{CryptoProvider, SoftwareCrypto};
use crate::declaration::Declaration;
use crate::decompose::{DecomposeReport, Decomposer};
use crate::error::{BuildError, Result};
use crate::expr::{Formula, Resolution};
use crate::hashing::compute_build_hash;
use crate::layout::{LayoutReport, Layouter};
use crate::node::{FileCache, LazyError, NodeKind};
use crate::repeat;
use crate::scope::Evaluator;
use crate::store::{FileStore, FsStore};
use crate::tree::{NodeId, Section, Tree};
use crate::validation::{ValidationResult, Validator};
use crate::value::Value;
use crate::ENGINE_VERSION;

#[cfg(feature = "test-hooks")]
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "test-hooks")]
static VALIDATION_CALL_COUNT: AtomicU32 = AtomicU32::new(0);

#[cfg(feature = "test-hooks")]
pub fn get_validation_call_count() -> u32 {
    VALIDATION_CALL_COUNT.load(Ordering::SeqCst)
}

#[cfg(feature = "test-hooks")]
pub fn reset_validation_call_count() {
    VALIDATION_CALL_COUNT.store(0, Ordering::SeqCst);
}

/// The image a decomposition last read, for change detection.
#[derive(Debug, Clone)]
struct DecomposeSource {
    path: PathBuf,
    modified: Option<SystemTime>,
}

pub struct Engine {
    name: String,
    version: String,
    tree: Tree,
    ctx: BuildContext,
    crypto: Box<dyn CryptoProvider>,
    store: Box<dyn FileStore>,
    validator: Validator,
    source: Option<DecomposeSource>,
}

fn check_engine_version(decl: &Declaration) -> Result<()> {
    let mismatch = || {
        BuildError::EngineVersionMismatch(
            decl.name.clone(),
            decl.engine_min_version.clone(),
            ENGINE_VERSION.to_string(),
        )
    };
    let required = Version::parse(&decl.engine_min_version).map_err(|_| mismatch())?;
    let current = Version::parse(ENGINE_VERSION).map_err(|_| mismatch())?;
    if current < required {
        return Err(mismatch());
    }
    Ok(())
}

impl Engine {
    pub fn new(decl: &Declaration, ctx: BuildContext) -> Result<Self> {
        Self::with_store(decl, ctx, Box::new(FsStore::new()))
    }

    /// Load a declaration file; relative file paths inside it resolve
    /// against its directory.
    pub fn from_path(path: &Path, ctx: BuildContext) -> Result<Self> {
        let decl = Declaration::load(path)?;
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self::with_store(&decl, ctx, Box::new(FsStore::rooted(base)))
    }

    pub fn with_store(decl: &Declaration, ctx: BuildContext, store: Box<dyn FileStore>) -> Result<Self> {
        check_engine_version(decl)?;
        let tree = Tree::from_declaration(decl, &ctx)?;
        let mut engine = Self {
            name: decl.name.clone(),
            version: decl.version.clone(),
            tree,
            ctx,
            crypto: Box::new(SoftwareCrypto),
            store,
            validator: Validator::new(),
            source: None,
        };
        engine.load_files();
        repeat::refresh_all(&mut engine.tree, &engine.ctx)?;
        engine.propagate()?;
        info!(declaration = %engine.name, nodes = engine.tree.preorder(engine.tree.root()).len(), "declaration loaded");
        Ok(engine)
    }

    pub fn with_crypto(mut self, crypto: Box<dyn CryptoProvider>) -> Self {
        self.crypto = crypto;
        self
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn ctx(&self) -> &BuildContext {
        &self.ctx
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn resolve(&self, path: &str) -> Result<(NodeId, String)> {
        let (id, property) = self.tree.locate(self.tree.root(), path)?;
        Ok((id, property.unwrap_or_else(|| "value".to_string())))
    }

    /// Read `path` or `path.property`.
    pub fn get(&self, path: &str) -> Result<Value> {
        let (id, property) = self.resolve(path)?;
        Evaluator::new(&self.tree, &self.ctx)
            .property(id, &property)?
            .require(&self.tree.path_of(id), &property)
    }

    /// Evaluate a formula in the scope of the settings section.
    pub fn evaluate(&self, source: &str) -> Result<Value> {
        let settings = self.tree.section(Section::Settings);
        let formula = Formula::parse(source).map_err(|e| BuildError::parse("formula", e.to_string()))?;
        Evaluator::new(&self.tree, &self.ctx)
            .formula(settings, &formula)?
            .require("formula", source)
    }

    /// Every setting's current value, by path.
    pub fn settings(&self) -> Result<BTreeMap<String, Value>> {
        let ev = Evaluator::new(&self.tree, &self.ctx);
        let section = self.tree.section(Section::Settings);
        let mut out = BTreeMap::new();
        for id in self.tree.preorder(section) {
            let node = self.tree.node(id);
            if id == section || !node.save || self.tree.is_bit_field(id) {
                continue;
            }
            if let NodeKind::File(file) = &node.kind {
                out.insert(self.tree.path_of(id), Value::Str(file.path.clone()));
                continue;
            }
            if let Resolution::Resolved(value) = ev.value(id)? {
                out.insert(self.tree.path_of(id), value);
            }
        }
        Ok(out)
    }

    /// Edit one property, then bring the rest of the configuration along.
    /// Returns every change, the edit itself first. A rejected edit leaves
    /// the tree as it was.
    pub fn set(&mut self, path: &str, value: Value) -> Result<Vec<PropertyChangeRecord>> {
        let snapshot = self.tree.clone();
        let result = self.apply(path, value);
        if result.is_err() {
            self.tree = snapshot;
        }
        result
    }

    fn apply(&mut self, path: &str, value: Value) -> Result<Vec<PropertyChangeRecord>> {
        let (id, property) = self.resolve(path)?;
        let mut changes = self.tree.set_property(id, &property, value, &self.ctx)?;
        if changes.is_empty() {
            return Ok(changes);
        }
        if property == "path" {
            self.load_files();
        }
        repeat::refresh_all(&mut self.tree, &self.ctx)?;
        change::merge(&mut changes, self.propagate()?);
        // Entries dropped by a shrinking repetition are gone from the tree.
        changes.retain(|record| self.tree.path_of(record.node) == record.path);

        let ev = Evaluator::new(&self.tree, &self.ctx);
        let mut violations = Vec::new();
        for record in &changes {
            violations.extend(self.validator.validate_node(&ev, record.node)?);
        }
        Validator::enforce(&violations, &self.ctx, false)?;
        debug!(path, changes = changes.len(), "property set");
        Ok(changes)
    }

    /// Run every dependency until nothing changes.
    pub fn propagate(&mut self) -> Result<Vec<PropertyChangeRecord>> {
        let mut all = Vec::new();
        for round in 1..=self.ctx.max_propagation_rounds.max(1) {
            let mut changed = Vec::new();
            let owners: Vec<NodeId> = self
                .tree
                .preorder(self.tree.root())
                .into_iter()
                .filter(|id| !self.tree.node(*id).dependencies.is_empty())
                .collect();
            for owner in owners {
                let dependencies = self.tree.node(owner).dependencies.clone();
                for dependency in dependencies {
                    match dependency.execute(&mut self.tree, owner, &self.ctx) {
                        Ok(records) => change::merge(&mut changed, records),
                        Err(err @ BuildError::RangeExceeded { .. }) if self.ctx.range_policy == RangePolicy::Skip => {
                            warn!(error = %err, "skipping out-of-range dependency");
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
            let resized = repeat::refresh_all(&mut self.tree, &self.ctx)?;
            if changed.is_empty() && !resized {
                debug!(rounds = round, changes = all.len(), "propagation settled");
                return Ok(all);
            }
            change::merge(&mut all, changed);
        }
        Err(BuildError::dependency(
            &self.name,
            format!("dependencies did not settle after {} rounds", self.ctx.max_propagation_rounds),
        ))
    }

    pub fn validate(&self) -> Result<ValidationResult> {
        #[cfg(feature = "test-hooks")]
        VALIDATION_CALL_COUNT.fetch_add(1, Ordering::SeqCst);

        self.validator.validate_tree(&Evaluator::new(&self.tree, &self.ctx))
    }

    /// (Re)load every file-backed node whose file changed. Failures are kept
    /// on the node and raised only when its bytes are requested.
    pub fn load_files(&mut self) -> bool {
        let mut changed = false;
        for id in self.tree.preorder(self.tree.root()) {
            let NodeKind::File(file) = &self.tree.node(id).kind else {
                continue;
            };
            let path = PathBuf::from(&file.path);
            let stat = self.store.stat(&path);
            if let (Some(cache), Ok(stat)) = (&file.cache, &stat) {
                if cache.modified.is_some() && cache.modified == stat.modified {
                    continue;
                }
            }
            let loaded = stat.and_then(|stat| Ok((self.store.read_file(&path)?, stat.modified)));
            let NodeKind::File(file) = &mut self.tree.node_mut(id).kind else {
                continue;
            };
            match loaded {
                Ok((bytes, modified)) => {
                    file.cache = Some(FileCache { bytes, modified });
                    file.error = None;
                }
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "file not loaded");
                    file.cache = None;
                    file.error = Some(LazyError {
                        kind: err.kind(),
                        message: err.to_string(),
                    });
                }
            }
            changed = true;
        }
        changed
    }

    fn prepare(&mut self) -> Result<Buffer> {
        self.load_files();
        repeat::refresh_all(&mut self.tree, &self.ctx)?;
        self.tree.reset();
        Ok(Buffer::with_capacity(self.ctx.capacity, self.ctx.pad_byte))
    }

    pub fn build_layout(&mut self) -> Result<LayoutReport> {
        let mut buffer = self.prepare()?;
        Layouter::new(&self.ctx).run(&mut self.tree, &mut buffer)
    }

    /// Propagate, validate, lay out and build. The image is only returned
    /// when every step succeeded.
    pub fn build(&mut self) -> Result<BuildOutput> {
        self.propagate()?;

        #[cfg(feature = "test-hooks")]
        VALIDATION_CALL_COUNT.fetch_add(1, Ordering::SeqCst);

        let ev = Evaluator::new(&self.tree, &self.ctx);
        let settings = self.tree.section(Section::Settings);
        let mut violations = Vec::new();
        for id in self.tree.preorder(settings) {
            violations.extend(self.validator.validate_node(&ev, id)?);
        }
        Validator::enforce(&violations, &self.ctx, true)?;

        let mut buffer = self.prepare()?;
        let layout = Layouter::new(&self.ctx).run(&mut self.tree, &mut buffer)?;
        Builder::new(&self.ctx, self.crypto.as_ref(), self.store.as_ref()).run(&mut self.tree, &mut buffer)?;

        let image = buffer.image();
        let build_hash = compute_build_hash(&self.name, &self.version, &self.settings()?, ENGINE_VERSION)?;
        let output = BuildOutput::new(image, byte_map(&self.tree), build_hash, (&self.name, &self.version))?;
        info!(
            declaration = %self.name,
            size = output.image_size,
            passes = layout.passes,
            hash = %output.image_hash,
            "image built"
        );
        Ok(output)
    }

    /// Build and write the image through the file store.
    pub fn build_to(&mut self, path: &Path) -> Result<BuildOutput> {
        let output = self.build()?;
        self.store
            .write_file(path, &output.image)
            .map_err(|e| BuildError::file(path, e))?;
        Ok(output)
    }

    /// Recover settings from an image file, read through a memory mapping.
    pub fn decompose(&mut self, path: &Path) -> Result<DecomposeReport> {
        let full = self.store.locate(path);
        let image = Buffer::map_file(&full).map_err(|e| BuildError::file(&full, e))?;
        let modified = self.store.stat(path).map_err(|e| BuildError::file(&full, e))?.modified;
        let report = self.decompose_buffer(&image)?;
        self.source = Some(DecomposeSource {
            path: path.to_path_buf(),
            modified,
        });
        Ok(report)
    }

    pub fn decompose_bytes(&mut self, bytes: Vec<u8>) -> Result<DecomposeReport> {
        self.decompose_buffer(&Buffer::from_bytes(bytes))
    }

    fn decompose_buffer(&mut self, image: &Buffer) -> Result<DecomposeReport> {
        self.load_files();
        let mut report = Decomposer::new(&self.ctx).run(&mut self.tree, image)?;
        change::merge(&mut report.changes, self.propagate()?);
        Ok(report)
    }

    /// Decompose again if the last decomposed image changed on disk.
    pub fn refresh_if_changed(&mut self) -> Result<Option<DecomposeReport>> {
        let Some(source) = self.source.clone() else {
            return Ok(None);
        };
        let stat = self
            .store
            .stat(&source.path)
            .map_err(|e| BuildError::file(&source.path, e))?;
        if stat.modified == source.modified {
            return Ok(None);
        }
        info!(path = %source.path.display(), "decomposition source changed");
        self.decompose(&source.path).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn engine(decl: serde_json::Value) -> Result<Engine> {
        let decl: Declaration = serde_json::from_value(decl).unwrap();
        Engine::with_store(&decl, BuildContext::default(), Box::new(MemoryStore::new()))
    }

    #[test]
    fn test_newer_engine_required() {
        let err = engine(json!({"name": "fw", "engine_min_version": "99.0.0"})).err().unwrap();
        assert!(matches!(err, BuildError::EngineVersionMismatch(..)));
    }

    #[test]
    fn test_set_propagates_through_chain() {
        let mut e = engine(json!({"name": "fw", "settings": [
            {"kind": "int", "name": "a", "size": 1, "value": 1},
            {"kind": "int", "name": "b", "size": 1, "value": 0,
             "dependency": [{"type": "get", "source": "a"}]},
            {"kind": "int", "name": "c", "size": 1, "value": 0,
             "dependency": [{"type": "get", "source": "b"}]}
        ]}))
        .unwrap();
        assert_eq!(e.get("/settings/c").unwrap(), Value::Int(1));

        let changes = e.set("/settings/a", Value::Int(7)).unwrap();
        let paths: Vec<&str> = changes.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["/settings/a", "/settings/b", "/settings/c"]);
        assert_eq!(e.get("/settings/c").unwrap(), Value::Int(7));
        assert!(e.set("/settings/a", Value::Int(7)).unwrap().is_empty());
    }

    #[test]
    fn test_range_policy() {
        let decl = json!({"name": "fw", "settings": [
            {"kind": "int", "name": "src", "size": 2, "value": 1,
             "dependency": [{"type": "set", "target": "dst", "duplicate": true}]},
            {"kind": "int", "name": "dst", "size": 1, "value": 0}
        ]});
        let mut e = engine(decl.clone()).unwrap();
        e.set("/settings/src", Value::Int(300)).unwrap();
        assert_eq!(e.get("/settings/dst").unwrap(), Value::Int(1));

        let parsed: Declaration = serde_json::from_value(decl).unwrap();
        let ctx = BuildContext {
            range_policy: RangePolicy::Fail,
            ..BuildContext::default()
        };
        let mut strict = Engine::with_store(&parsed, ctx, Box::new(MemoryStore::new())).unwrap();
        assert!(matches!(
            strict.set("/settings/src", Value::Int(300)),
            Err(BuildError::RangeExceeded { .. })
        ));
        assert_eq!(strict.get("/settings/src").unwrap(), Value::Int(1));
        assert_eq!(strict.get("/settings/dst").unwrap(), Value::Int(1));
    }

    #[test]
    fn test_rejected_set_is_rolled_back() {
        let mut e = engine(json!({"name": "fw", "settings": [
            {"kind": "int", "name": "s", "size": 1, "value": 1, "params": {"value_list": [1, 2]}},
            {"kind": "int", "name": "mirror", "size": 1, "value": 0,
             "dependency": [{"type": "get", "source": "s"}]}
        ]}))
        .unwrap();
        assert!(matches!(e.set("/settings/s", Value::Int(5)), Err(BuildError::Validate { .. })));
        assert_eq!(e.get("/settings/s").unwrap(), Value::Int(1));
        assert_eq!(e.get("/settings/mirror").unwrap(), Value::Int(1));

        e.set("/settings/s", Value::Int(2)).unwrap();
        assert_eq!(e.get("/settings/mirror").unwrap(), Value::Int(2));
    }

    #[test]
    fn test_missing_file_fails_only_when_read() {
        let store = MemoryStore::new();
        store.insert("blob.bin", vec![1, 2, 3]);
        let decl: Declaration = serde_json::from_value(json!({"name": "fw",
            "settings": [{"kind": "file", "name": "unused", "value": "missing.bin"}],
            "layout": [{"kind": "file", "name": "blob", "value": "blob.bin"}]
        }))
        .unwrap();
        let mut e = Engine::with_store(&decl, BuildContext::default(), Box::new(store)).unwrap();
        assert_eq!(e.build().unwrap().image, vec![1, 2, 3]);
        assert!(matches!(e.get("/settings/unused"), Err(BuildError::FileAccess { .. })));
    }

    #[test]
    fn test_evaluate_in_settings_scope() {
        let e = engine(json!({"name": "fw", "settings": [
            {"kind": "int", "name": "n", "size": 1, "value": 3}
        ]}))
        .unwrap();
        assert_eq!(e.evaluate("n * 2 + 1").unwrap(), Value::Int(7));
        assert_eq!(e.evaluate("1 == 1 ? 0xA : 0xB").unwrap(), Value::Int(10));
    }
}
