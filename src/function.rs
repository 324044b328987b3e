//! Function Nodes - values computed from other nodes' bytes
//!
//! Hashes, CRCs, checksums, signatures and signature checks. A function node
//! consumes the final bytes of its inputs, so it can only be computed during
//! the build phase once every input is built.

use std::path::Path;

use crate::config::BuildContext;
use crate::convert::{self, ByteOrder};
use crate::crypto::{self, CryptoProvider, HashAlgorithm, SignPadding};
use crate::declaration::Params;
use crate::error::{BuildError, Result};
use crate::expr::{Formula, Resolution};
use crate::resolved;
use crate::scope::Evaluator;
use crate::store::FileStore;
use crate::tree::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Hash(HashAlgorithm),
    /// CRC-16/CCITT-FALSE.
    Crc16,
    /// CRC-32/ISO-HDLC.
    Crc32,
    Sum8,
    Sum16,
    Sum32,
    /// Byte that makes the 8-bit sum of the inputs zero.
    Twos8,
    Sign,
    Verify,
}

impl Algorithm {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().replace('-', "").as_str() {
            "sha256" => Self::Hash(HashAlgorithm::Sha256),
            "sha384" => Self::Hash(HashAlgorithm::Sha384),
            "sha512" => Self::Hash(HashAlgorithm::Sha512),
            "crc16" => Self::Crc16,
            "crc32" => Self::Crc32,
            "sum8" => Self::Sum8,
            "sum16" => Self::Sum16,
            "sum32" => Self::Sum32,
            "twos8" => Self::Twos8,
            "sign" => Self::Sign,
            "verify" => Self::Verify,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Hash(HashAlgorithm::Sha256) => "sha256",
            Self::Hash(HashAlgorithm::Sha384) => "sha384",
            Self::Hash(HashAlgorithm::Sha512) => "sha512",
            Self::Crc16 => "crc16",
            Self::Crc32 => "crc32",
            Self::Sum8 => "sum8",
            Self::Sum16 => "sum16",
            Self::Sum32 => "sum32",
            Self::Twos8 => "twos8",
            Self::Sign => "sign",
            Self::Verify => "verify",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FunctionSpec {
    pub algorithm: Algorithm,
    /// Formulas whose bytes are concatenated; empty means every preceding sibling.
    pub inputs: Vec<Formula>,
    /// Read inputs before encryption.
    pub decrypted: bool,
    /// File Store path of the signing or verification key.
    pub key: Option<String>,
    /// Formula yielding the signature to verify.
    pub signature: Option<Formula>,
    pub padding: SignPadding,
    pub key_bits: Option<u32>,
}

impl FunctionSpec {
    /// `kind` is the declared kind; shorthand kinds imply an algorithm.
    pub fn parse(kind: &str, params: &Params, node: &str) -> Result<Self> {
        let default = match kind {
            "hash" => Some("sha256"),
            "crc" => Some("crc32"),
            "checksum" => Some("sum8"),
            "sign" => Some("sign"),
            "verify" => Some("verify"),
            _ => None,
        };
        let name = params
            .algorithm
            .as_deref()
            .or(default)
            .ok_or_else(|| BuildError::parse(node, "function requires params.algorithm"))?;
        let algorithm = Algorithm::parse(name)
            .ok_or_else(|| BuildError::parse(node, format!("unknown algorithm {name:?}")))?;

        let parse = |src: &str| Formula::parse(src).map_err(|e| BuildError::parse(node, e.to_string()));
        let inputs = params.inputs.iter().map(|s| parse(s.as_str())).collect::<Result<Vec<_>>>()?;
        let signature = params.signature.as_deref().map(parse).transpose()?;

        if matches!(algorithm, Algorithm::Sign | Algorithm::Verify) && params.key.is_none() {
            return Err(BuildError::parse(node, format!("{name} requires params.key")));
        }
        if algorithm == Algorithm::Verify && signature.is_none() {
            return Err(BuildError::parse(node, "verify requires params.signature"));
        }

        Ok(Self {
            algorithm,
            inputs,
            decrypted: params.decrypted,
            key: params.key.clone(),
            signature,
            padding: params.padding.unwrap_or_default(),
            key_bits: params.key_bits,
        })
    }

    /// Bytes produced before any declared size is applied.
    pub fn output_len(&self, ctx: &BuildContext) -> usize {
        match self.algorithm {
            Algorithm::Hash(h) => h.digest_len(),
            Algorithm::Crc16 | Algorithm::Sum16 => 2,
            Algorithm::Crc32 | Algorithm::Sum32 => 4,
            Algorithm::Sum8 | Algorithm::Twos8 | Algorithm::Verify => 1,
            Algorithm::Sign => crypto::signature_len(ctx.key_policy, self.key_bits),
        }
    }
}

/// CRC-16/CCITT-FALSE: poly 0x1021, init 0xFFFF, no reflection, no final xor.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= u16::from(*byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

fn byte_sum(data: &[u8]) -> u64 {
    data.iter().map(|b| u64::from(*b)).sum()
}

/// Resolved inputs of a function node.
#[derive(Debug, Clone)]
pub struct Inputs {
    pub data: Vec<u8>,
    pub signature: Option<Vec<u8>>,
}

fn formula_bytes(ev: &Evaluator<'_>, id: NodeId, formula: &Formula) -> Result<Resolution<Vec<u8>>> {
    let value = resolved!(ev.formula(id, formula));
    value
        .as_bytes()
        .map(Resolution::Resolved)
        .map_err(|e| BuildError::convert(&ev.tree().node(id).name, e))
}

/// Collect input bytes; defers while any input is not yet built.
pub fn gather(ev: &Evaluator<'_>, id: NodeId, spec: &FunctionSpec) -> Result<Resolution<Inputs>> {
    let tree = ev.tree();
    let property = if spec.decrypted { "plain" } else { "data" };
    let mut data = Vec::new();

    if spec.inputs.is_empty() {
        let parent = tree
            .parent(id)
            .ok_or_else(|| BuildError::component(&tree.node(id).name, "function node without parent"))?;
        for &sibling in tree.children(parent).iter().take_while(|s| **s != id) {
            let value = resolved!(ev.property(sibling, property));
            data.extend(value.as_bytes().map_err(|e| BuildError::convert(&tree.node(sibling).name, e))?);
        }
    } else {
        for formula in &spec.inputs {
            // A bare path reads the chosen byte view of that node.
            let bytes = match formula.as_path() {
                Some(path) if !path.contains(|c| matches!(c, '.' | '[' | '{')) => {
                    let (target, _) = tree.locate(id, path)?;
                    let value = resolved!(ev.property(target, property));
                    value.as_bytes().map_err(|e| BuildError::convert(&tree.node(target).name, e))?
                }
                _ => resolved!(formula_bytes(ev, id, formula)),
            };
            data.extend(bytes);
        }
    }

    let signature = match &spec.signature {
        Some(formula) => Some(resolved!(formula_bytes(ev, id, formula))),
        None => None,
    };
    Ok(Resolution::Resolved(Inputs { data, signature }))
}

/// Compute the function output over gathered inputs.
pub fn compute(
    spec: &FunctionSpec,
    inputs: &Inputs,
    order: ByteOrder,
    crypto: &dyn CryptoProvider,
    store: &dyn FileStore,
    ctx: &BuildContext,
) -> Result<Vec<u8>> {
    let number = |value: u64, size: usize| {
        convert::int_to_bytes(i128::from(value), size, false, order)
            .map_err(|e| BuildError::convert(spec.algorithm.name(), e))
    };
    let data = inputs.data.as_slice();
    match spec.algorithm {
        Algorithm::Hash(h) => Ok(crypto.hash(data, h)?),
        Algorithm::Crc16 => number(u64::from(crc16_ccitt(data)), 2),
        Algorithm::Crc32 => number(u64::from(crc32fast::hash(data)), 4),
        Algorithm::Sum8 => number(byte_sum(data) & 0xFF, 1),
        Algorithm::Sum16 => number(byte_sum(data) & 0xFFFF, 2),
        Algorithm::Sum32 => number(byte_sum(data) & 0xFFFF_FFFF, 4),
        Algorithm::Twos8 => number((0x100 - (byte_sum(data) & 0xFF)) & 0xFF, 1),
        Algorithm::Sign => {
            let key = load_key(spec, store)?;
            let digest = crypto.hash(data, HashAlgorithm::Sha256)?;
            let signature = crypto.sign(&digest, spec.padding, &key)?;
            let expected = spec.output_len(ctx);
            if signature.len() != expected {
                return Err(crypto::CryptoError::SignatureLength {
                    expected,
                    actual: signature.len(),
                }
                .into());
            }
            Ok(signature)
        }
        Algorithm::Verify => {
            let key = load_key(spec, store)?;
            let digest = crypto.hash(data, HashAlgorithm::Sha256)?;
            let signature = inputs.signature.as_deref().unwrap_or_default();
            let valid = crypto.verify(signature, &digest, spec.padding, &key)?;
            Ok(vec![u8::from(valid)])
        }
    }
}

/// Keys are read on every use so a replaced key file is never stale.
fn load_key(spec: &FunctionSpec, store: &dyn FileStore) -> Result<Vec<u8>> {
    let path = spec
        .key
        .as_deref()
        .ok_or_else(|| BuildError::component(spec.algorithm.name(), "no key configured"))?;
    store
        .read_file(Path::new(path))
        .map_err(|e| BuildError::file(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SoftwareCrypto;
    use crate::store::MemoryStore;

    fn spec(algorithm: &str) -> FunctionSpec {
        let params = Params {
            algorithm: Some(algorithm.to_string()),
            ..Params::default()
        };
        FunctionSpec::parse("function", &params, "f").unwrap()
    }

    fn run(algorithm: &str, data: &[u8]) -> Vec<u8> {
        let inputs = Inputs {
            data: data.to_vec(),
            signature: None,
        };
        compute(
            &spec(algorithm),
            &inputs,
            ByteOrder::Big,
            &SoftwareCrypto,
            &MemoryStore::new(),
            &BuildContext::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16_ccitt(b"123456789"), 0x29B1);
        assert_eq!(run("crc16", b"123456789"), vec![0x29, 0xB1]);
    }

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(run("crc32", b"123456789"), vec![0xCB, 0xF4, 0x39, 0x26]);
    }

    #[test]
    fn test_checksums() {
        assert_eq!(run("sum8", &[0xFF, 0x02]), vec![0x01]);
        assert_eq!(run("sum16", &[0xFF, 0x02]), vec![0x01, 0x01]);
        let twos = run("twos8", &[0x10, 0x20]);
        assert_eq!(twos, vec![0xD0]);
        assert_eq!((0x10u8.wrapping_add(0x20)).wrapping_add(twos[0]), 0);
    }

    #[test]
    fn test_shorthand_kinds_and_sizes() {
        let ctx = BuildContext::default();
        let hash = FunctionSpec::parse("hash", &Params::default(), "h").unwrap();
        assert_eq!(hash.output_len(&ctx), 32);
        let params = Params {
            key: Some("key.pem".into()),
            ..Params::default()
        };
        let sign = FunctionSpec::parse("sign", &params, "s").unwrap();
        assert_eq!(sign.output_len(&ctx), 384);
        let legacy = BuildContext {
            key_policy: crate::config::KeyPolicy::Legacy,
            ..BuildContext::default()
        };
        assert_eq!(sign.output_len(&legacy), 256);
        assert!(FunctionSpec::parse("sign", &Params::default(), "s").is_err());
        assert!(FunctionSpec::parse("function", &Params::default(), "f").is_err());
    }

    #[test]
    fn test_signing_without_provider_is_a_crypto_error() {
        let store = MemoryStore::new();
        store.insert("key.pem", b"secret".to_vec());
        let params = Params {
            key: Some("key.pem".into()),
            ..Params::default()
        };
        let sign = FunctionSpec::parse("sign", &params, "s").unwrap();
        let inputs = Inputs {
            data: vec![1, 2, 3],
            signature: None,
        };
        let result = compute(&sign, &inputs, ByteOrder::Big, &SoftwareCrypto, &store, &BuildContext::default());
        assert!(matches!(result, Err(BuildError::Crypto(_))));
    }
}
