//! BinForge Core - Declarative Binary Image Builder
//!
//! A declaration describes settings, the layout of a binary image in terms
//! of those settings, and how to read settings back out of an image. The
//! engine turns it into bytes and back:
//!
//! 1. Layout fixes every offset and size, iterating until forward
//!    references settle.
//! 2. Build computes bytes in dependency order (checksums, signatures and
//!    copies of later nodes included) and encrypts where asked.
//! 3. Decomposition decodes an existing image and recovers the settings.
//!
//! Edits to a setting propagate through declared dependencies and are
//! validated before they stick.

pub mod bitpack;
pub mod buffer;
pub mod build;
pub mod change;
pub mod config;
pub mod convert;
pub mod crypto;
pub mod declaration;
pub mod decompose;
pub mod dependency;
pub mod engine;
pub mod error;
pub mod expr;
pub mod function;
pub mod hashing;
pub mod layout;
pub mod node;
pub mod repeat;
pub mod scope;
pub mod store;
pub mod tree;
pub mod validation;
pub mod value;

pub use build::{BuildOutput, MapEntry};
pub use change::PropertyChangeRecord;
pub use config::{BuildContext, RangePolicy, ToolMode};
pub use crypto::{CryptoProvider, ProcessSigner, SoftwareCrypto};
pub use declaration::Declaration;
pub use decompose::DecomposeReport;
pub use engine::Engine;
pub use error::{BuildError, Result};
pub use expr::{Formula, Resolution};
pub use hashing::{canonical_json, compute_build_hash, compute_manifest_hash};
pub use layout::LayoutReport;
pub use store::{FileStore, FsStore, MemoryStore};
pub use tree::{NodeId, Section, Tree};
pub use validation::{ValidationResult, ValidationRule, ValidationViolation, ViolationSeverity};
pub use value::Value;

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
