//! Crypto Provider - the boundary to cryptographic primitives
//!
//! The engine owns padding-scheme and key-size policy; a provider only runs
//! the primitive. [`SoftwareCrypto`] covers hashing with `sha2`;
//! [`ProcessSigner`] delegates signing to an external program under a timeout.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};
use thiserror::Error;
use tracing::debug;

use crate::config::KeyPolicy;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("{0} is not supported by this crypto provider")]
    Unsupported(&'static str),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Signer {program} timed out after {seconds}s")]
    Timeout { program: String, seconds: u64 },

    #[error("Signer {program} exited with {status}: {stderr}")]
    ExitStatus {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("Signer {program} produced unreadable output: {message}")]
    SignerOutput { program: String, message: String },

    #[error("Signature length {actual} does not match expected {expected}")]
    SignatureLength { expected: usize, actual: usize },

    #[error("Signer I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn digest_len(self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignPadding {
    #[default]
    Pkcs1v15,
    Pss,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptMode {
    Ecb,
    #[default]
    Cbc,
    Ctr,
}

pub const AES_BLOCK: usize = 16;

/// Size class of `len` plaintext bytes once encrypted with `mode`.
pub fn encrypted_size(len: usize, mode: EncryptMode) -> usize {
    match mode {
        EncryptMode::Ctr => len,
        EncryptMode::Ecb | EncryptMode::Cbc => len.div_ceil(AES_BLOCK).max(1) * AES_BLOCK,
    }
}

/// Check an AES key length and IV against the mode.
pub fn check_aes_key(key: &[u8], iv: Option<&[u8]>, mode: EncryptMode) -> Result<(), CryptoError> {
    if !matches!(key.len(), 16 | 24 | 32) {
        return Err(CryptoError::InvalidKey(format!(
            "AES key must be 16, 24 or 32 bytes, got {}",
            key.len()
        )));
    }
    match (mode, iv) {
        (EncryptMode::Ecb, _) => Ok(()),
        (_, Some(iv)) if iv.len() == AES_BLOCK => Ok(()),
        (_, Some(iv)) => Err(CryptoError::InvalidKey(format!(
            "IV must be {AES_BLOCK} bytes, got {}",
            iv.len()
        ))),
        (_, None) => Err(CryptoError::InvalidKey("mode requires an IV".into())),
    }
}

/// Signature length in bytes for the key-size policy.
pub fn signature_len(policy: KeyPolicy, key_bits: Option<u32>) -> usize {
    let bits = key_bits.unwrap_or(match policy {
        KeyPolicy::Legacy => 2048,
        KeyPolicy::Current => 3072,
    });
    (bits as usize).div_ceil(8)
}

pub trait CryptoProvider {
    fn hash(&self, data: &[u8], algorithm: HashAlgorithm) -> Result<Vec<u8>, CryptoError>;

    fn sign(&self, hash: &[u8], padding: SignPadding, key: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn verify(
        &self,
        signature: &[u8],
        hash: &[u8],
        padding: SignPadding,
        key: &[u8],
    ) -> Result<bool, CryptoError>;

    fn aes_encrypt(
        &self,
        data: &[u8],
        mode: EncryptMode,
        key: &[u8],
        iv: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError>;
}

pub fn sha_digest(data: &[u8], algorithm: HashAlgorithm) -> Vec<u8> {
    match algorithm {
        HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        HashAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
        HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
    }
}

/// Hash-only provider; signing and encryption need an external provider.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareCrypto;

impl CryptoProvider for SoftwareCrypto {
    fn hash(&self, data: &[u8], algorithm: HashAlgorithm) -> Result<Vec<u8>, CryptoError> {
        Ok(sha_digest(data, algorithm))
    }

    fn sign(&self, _hash: &[u8], _padding: SignPadding, _key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Err(CryptoError::Unsupported("signing"))
    }

    fn verify(
        &self,
        _signature: &[u8],
        _hash: &[u8],
        _padding: SignPadding,
        _key: &[u8],
    ) -> Result<bool, CryptoError> {
        Err(CryptoError::Unsupported("signature verification"))
    }

    fn aes_encrypt(
        &self,
        _data: &[u8],
        _mode: EncryptMode,
        _key: &[u8],
        _iv: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError> {
        Err(CryptoError::Unsupported("AES encryption"))
    }
}

/// Signs by running an external program.
///
/// The program receives one JSON line on stdin
/// (`{"operation","hash","padding","key"}` with hex-encoded bytes) and must
/// print the hex-encoded result on stdout. A timeout or non-zero exit aborts
/// the build. Everything else is delegated to `inner`.
pub struct ProcessSigner {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    inner: Box<dyn CryptoProvider>,
}

impl ProcessSigner {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
            inner: Box::new(SoftwareCrypto),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_inner(mut self, inner: Box<dyn CryptoProvider>) -> Self {
        self.inner = inner;
        self
    }

    fn run(&self, request: &serde_json::Value) -> Result<Vec<u8>, CryptoError> {
        let program = self.program.display().to_string();
        debug!(program = %program, "invoking external signer");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Fed from its own thread so a child that never reads stdin is still
        // bounded by the timeout. A child that exits early is judged by its
        // exit status.
        let stdin = child.stdin.take();
        let payload = request.to_string();
        thread::spawn(move || {
            if let Some(mut stdin) = stdin {
                let _ = writeln!(stdin, "{payload}");
            }
        });

        // Drain pipes on their own threads so a chatty child cannot block.
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let out_reader = thread::spawn(move || {
            let mut buf = String::new();
            if let Some(s) = stdout.as_mut() {
                let _ = s.read_to_string(&mut buf);
            }
            buf
        });
        let err_reader = thread::spawn(move || {
            let mut buf = String::new();
            if let Some(s) = stderr.as_mut() {
                let _ = s.read_to_string(&mut buf);
            }
            buf
        });

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if started.elapsed() >= self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CryptoError::Timeout {
                    program,
                    seconds: self.timeout.as_secs(),
                });
            }
            thread::sleep(Duration::from_millis(10));
        };

        let output = out_reader.join().unwrap_or_default();
        let errors = err_reader.join().unwrap_or_default();
        if !status.success() {
            return Err(CryptoError::ExitStatus {
                program,
                status: status.to_string(),
                stderr: errors.trim().to_string(),
            });
        }
        hex::decode(output.trim()).map_err(|e| CryptoError::SignerOutput {
            program,
            message: format!("expected hex: {e}"),
        })
    }
}

impl CryptoProvider for ProcessSigner {
    fn hash(&self, data: &[u8], algorithm: HashAlgorithm) -> Result<Vec<u8>, CryptoError> {
        self.inner.hash(data, algorithm)
    }

    fn sign(&self, hash: &[u8], padding: SignPadding, key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.run(&serde_json::json!({
            "operation": "sign",
            "hash": hex::encode(hash),
            "padding": padding,
            "key": hex::encode(key),
        }))
    }

    fn verify(
        &self,
        signature: &[u8],
        hash: &[u8],
        padding: SignPadding,
        key: &[u8],
    ) -> Result<bool, CryptoError> {
        let out = self.run(&serde_json::json!({
            "operation": "verify",
            "signature": hex::encode(signature),
            "hash": hex::encode(hash),
            "padding": padding,
            "key": hex::encode(key),
        }))?;
        Ok(out.first().copied() == Some(1))
    }

    fn aes_encrypt(
        &self,
        data: &[u8],
        mode: EncryptMode,
        key: &[u8],
        iv: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError> {
        self.inner.aes_encrypt(data, mode, key, iv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypted_size_classes() {
        assert_eq!(encrypted_size(0, EncryptMode::Cbc), 16);
        assert_eq!(encrypted_size(16, EncryptMode::Cbc), 16);
        assert_eq!(encrypted_size(17, EncryptMode::Ecb), 32);
        assert_eq!(encrypted_size(17, EncryptMode::Ctr), 17);
    }

    #[test]
    fn test_signature_len_policy() {
        assert_eq!(signature_len(KeyPolicy::Legacy, None), 256);
        assert_eq!(signature_len(KeyPolicy::Current, None), 384);
        assert_eq!(signature_len(KeyPolicy::Current, Some(4096)), 512);
    }

    #[test]
    fn test_key_checks() {
        assert!(check_aes_key(&[0; 16], None, EncryptMode::Ecb).is_ok());
        assert!(check_aes_key(&[0; 15], None, EncryptMode::Ecb).is_err());
        assert!(check_aes_key(&[0; 32], None, EncryptMode::Cbc).is_err());
        assert!(check_aes_key(&[0; 32], Some(&[0; 16]), EncryptMode::Cbc).is_ok());
    }

    #[test]
    fn test_software_hash_is_deterministic() {
        let a = SoftwareCrypto.hash(b"abc", HashAlgorithm::Sha256).unwrap();
        let b = SoftwareCrypto.hash(b"abc", HashAlgorithm::Sha256).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(SoftwareCrypto.sign(&a, SignPadding::Pss, &[]).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_process_signer_nonzero_exit_is_fatal() {
        let signer = ProcessSigner::new("false", Duration::from_secs(5));
        let err = signer.sign(&[0; 32], SignPadding::Pkcs1v15, &[1]).unwrap_err();
        assert!(matches!(err, CryptoError::ExitStatus { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_process_signer_timeout() {
        let signer = ProcessSigner::new("sleep", Duration::from_millis(100))
            .with_args(vec!["5".to_string()]);
        let err = signer.sign(&[0; 32], SignPadding::Pkcs1v15, &[1]).unwrap_err();
        assert!(matches!(err, CryptoError::Timeout { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_process_signer_timeout_when_input_is_never_read() {
        // Far larger than a pipe buffer, so a blocking write would never return.
        let key = vec![0xA5; 1 << 20];
        let signer = ProcessSigner::new("sleep", Duration::from_millis(200))
            .with_args(vec!["5".to_string()]);
        let started = Instant::now();
        let err = signer.sign(&[0; 32], SignPadding::Pkcs1v15, &key).unwrap_err();
        assert!(matches!(err, CryptoError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn test_process_signer_rejects_non_hex_output() {
        let signer = ProcessSigner::new("sh", Duration::from_secs(5))
            .with_args(vec!["-c".to_string(), "cat > /dev/null; echo not-hex".to_string()]);
        let err = signer.sign(&[0; 32], SignPadding::Pss, &[1]).unwrap_err();
        assert!(matches!(err, CryptoError::SignerOutput { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_process_signer_reads_hex_output() {
        let signer = ProcessSigner::new("sh", Duration::from_secs(5))
            .with_args(vec!["-c".to_string(), "cat > /dev/null; echo 0a0b".to_string()]);
        assert_eq!(signer.sign(&[0; 32], SignPadding::Pss, &[1]).unwrap(), vec![0x0a, 0x0b]);
    }
}
