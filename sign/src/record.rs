//! The fixed-size signature envelope bound to a content digest: a SHA-256
//! digest, an RSA public key (raw big-endian exponent/modulus), and a
//! signature over that digest, serialized into a constant-size record so it
//! can be appended to an image without perturbing any other offset.

use std::path::{Path, PathBuf};
use std::process::Command;

use cvmboot_core::{CvmbootError, Result};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256};

pub const RECORD_SIZE: usize = 4096;
const MAGIC: u64 = 0x9d2d_3be9_07d3_4589;
const VERSION: u64 = 1;

const DIGEST_SIZE: usize = 32;
const SIGNER_SIZE: usize = 32;
const MAX_SIGNATURE_SIZE: usize = 1024;
const MAX_EXPONENT_SIZE: usize = 32;
const MAX_MODULUS_SIZE: usize = 1024;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 8;
const OFF_DIGEST: usize = 16;
const OFF_SIGNER: usize = 48;
const OFF_SIGNATURE: usize = 80;
const OFF_SIGNATURE_SIZE: usize = OFF_SIGNATURE + MAX_SIGNATURE_SIZE;
const OFF_EXPONENT: usize = OFF_SIGNATURE_SIZE + 8;
const OFF_EXPONENT_SIZE: usize = OFF_EXPONENT + MAX_EXPONENT_SIZE;
const OFF_MODULUS: usize = OFF_EXPONENT_SIZE + 8;
const OFF_MODULUS_SIZE: usize = OFF_MODULUS + MAX_MODULUS_SIZE;

/// Signs raw bytes, returning the signature plus the signing key's public
/// half as big-endian exponent/modulus byte strings. Implemented by an
/// external `signtool`-equivalent collaborator in `platform`; a fake is used
/// in tests.
pub trait SignTool: Send + Sync {
    fn sign(&self, data: &[u8]) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>)>;
}

/// Shells out to an external signing tool the way the original toolchain
/// does: write `data` to a scratch file, invoke `signtool_path <file>`, then
/// read back `<file>.sig` (raw signature bytes) and `<file>.pub` (a PKCS#8
/// PEM-encoded RSA public key).
pub struct ExternalSignTool {
    pub signtool_path: PathBuf,
}

impl ExternalSignTool {
    pub fn new(signtool_path: impl Into<PathBuf>) -> Self {
        Self {
            signtool_path: signtool_path.into(),
        }
    }
}

impl SignTool for ExternalSignTool {
    fn sign(&self, data: &[u8]) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>)> {
        let dir = tempfile::tempdir()?;
        let data_path = dir.path().join("data.bin");
        std::fs::write(&data_path, data)?;

        let status = Command::new(&self.signtool_path)
            .arg(&data_path)
            .status()
            .map_err(|e| CvmbootError::ExternalToolFailure(format!("failed to run signtool: {e}")))?;
        if !status.success() {
            return Err(CvmbootError::ExternalToolFailure(format!(
                "signtool exited with {status}"
            )));
        }

        let signature = std::fs::read(sibling(&data_path, "sig"))?;
        let pub_pem = std::fs::read_to_string(sibling(&data_path, "pub"))?;
        let public_key = decode_public_key_pem(&pub_pem)?;

        Ok((
            signature,
            public_key.e().to_bytes_be(),
            public_key.n().to_bytes_be(),
        ))
    }
}

fn sibling(path: &Path, ext: &str) -> PathBuf {
    path.with_extension(ext)
}

fn decode_public_key_pem(pem: &str) -> Result<RsaPublicKey> {
    use rsa::pkcs8::DecodePublicKey;
    RsaPublicKey::from_public_key_pem(pem)
        .map_err(|e| CvmbootError::CorruptFormat(format!("bad public key PEM: {e}")))
}

/// A parsed signature record: a digest bound to a signature and the public
/// key that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRecord {
    pub digest: [u8; DIGEST_SIZE],
    pub signer: [u8; SIGNER_SIZE],
    pub signature: Vec<u8>,
    pub exponent: Vec<u8>,
    pub modulus: Vec<u8>,
}

impl SignatureRecord {
    /// Computes the record's public key in reconstructible form and verifies
    /// `signature` over `digest` under it.
    pub fn public_key(&self) -> Result<RsaPublicKey> {
        let n = BigUint::from_bytes_be(&self.modulus);
        let e = BigUint::from_bytes_be(&self.exponent);
        RsaPublicKey::new(n, e).map_err(|e| CvmbootError::CorruptFormat(format!("bad RSA public key: {e}")))
    }

    pub fn to_bytes(&self) -> Result<[u8; RECORD_SIZE]> {
        if self.signature.len() > MAX_SIGNATURE_SIZE {
            return Err(CvmbootError::InvalidArgument("signature too large".into()));
        }
        if self.exponent.len() > MAX_EXPONENT_SIZE {
            return Err(CvmbootError::InvalidArgument("exponent too large".into()));
        }
        if self.modulus.len() > MAX_MODULUS_SIZE {
            return Err(CvmbootError::InvalidArgument("modulus too large".into()));
        }

        let mut buf = [0u8; RECORD_SIZE];
        buf[OFF_MAGIC..OFF_MAGIC + 8].copy_from_slice(&MAGIC.to_le_bytes());
        buf[OFF_VERSION..OFF_VERSION + 8].copy_from_slice(&VERSION.to_le_bytes());
        buf[OFF_DIGEST..OFF_DIGEST + DIGEST_SIZE].copy_from_slice(&self.digest);
        buf[OFF_SIGNER..OFF_SIGNER + SIGNER_SIZE].copy_from_slice(&self.signer);
        buf[OFF_SIGNATURE..OFF_SIGNATURE + self.signature.len()].copy_from_slice(&self.signature);
        buf[OFF_SIGNATURE_SIZE..OFF_SIGNATURE_SIZE + 8]
            .copy_from_slice(&(self.signature.len() as u64).to_le_bytes());
        buf[OFF_EXPONENT..OFF_EXPONENT + self.exponent.len()].copy_from_slice(&self.exponent);
        buf[OFF_EXPONENT_SIZE..OFF_EXPONENT_SIZE + 8]
            .copy_from_slice(&(self.exponent.len() as u64).to_le_bytes());
        buf[OFF_MODULUS..OFF_MODULUS + self.modulus.len()].copy_from_slice(&self.modulus);
        buf[OFF_MODULUS_SIZE..OFF_MODULUS_SIZE + 8]
            .copy_from_slice(&(self.modulus.len() as u64).to_le_bytes());
        Ok(buf)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != RECORD_SIZE {
            return Err(CvmbootError::CorruptFormat(format!(
                "signature record must be {RECORD_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        let magic = u64::from_le_bytes(buf[OFF_MAGIC..OFF_MAGIC + 8].try_into().unwrap());
        if magic != MAGIC {
            return Err(CvmbootError::CorruptFormat("bad signature record magic".into()));
        }
        let version = u64::from_le_bytes(buf[OFF_VERSION..OFF_VERSION + 8].try_into().unwrap());
        if version != VERSION {
            return Err(CvmbootError::CorruptFormat(format!(
                "unsupported signature record version {version}"
            )));
        }

        let signature_size = read_size(buf, OFF_SIGNATURE_SIZE, MAX_SIGNATURE_SIZE)?;
        let exponent_size = read_size(buf, OFF_EXPONENT_SIZE, MAX_EXPONENT_SIZE)?;
        let modulus_size = read_size(buf, OFF_MODULUS_SIZE, MAX_MODULUS_SIZE)?;

        let mut digest = [0u8; DIGEST_SIZE];
        digest.copy_from_slice(&buf[OFF_DIGEST..OFF_DIGEST + DIGEST_SIZE]);
        let mut signer = [0u8; SIGNER_SIZE];
        signer.copy_from_slice(&buf[OFF_SIGNER..OFF_SIGNER + SIGNER_SIZE]);

        Ok(Self {
            digest,
            signer,
            signature: buf[OFF_SIGNATURE..OFF_SIGNATURE + signature_size].to_vec(),
            exponent: buf[OFF_EXPONENT..OFF_EXPONENT + exponent_size].to_vec(),
            modulus: buf[OFF_MODULUS..OFF_MODULUS + modulus_size].to_vec(),
        })
    }
}

fn read_size(buf: &[u8], off: usize, max: usize) -> Result<usize> {
    let size = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap()) as usize;
    if size > max {
        return Err(CvmbootError::CorruptFormat(format!(
            "signature record field at offset {off} exceeds its {max}-byte bound"
        )));
    }
    Ok(size)
}

/// Signs `data` with `tool`, binding the resulting signature and public key
/// into a [`SignatureRecord`], and self-checks the signature before
/// returning it.
pub fn create(data: &[u8], tool: &dyn SignTool) -> Result<SignatureRecord> {
    let digest: [u8; DIGEST_SIZE] = Sha256::digest(data).into();
    let (signature, exponent, modulus) = tool.sign(data)?;

    if signature.len() > MAX_SIGNATURE_SIZE {
        return Err(CvmbootError::InvalidArgument("signtool returned an oversized signature".into()));
    }
    if exponent.len() > MAX_EXPONENT_SIZE {
        return Err(CvmbootError::InvalidArgument("signtool returned an oversized exponent".into()));
    }
    if modulus.len() > MAX_MODULUS_SIZE {
        return Err(CvmbootError::InvalidArgument("signtool returned an oversized modulus".into()));
    }

    let mut hasher = Sha256::new();
    hasher.update(&modulus);
    hasher.update(&exponent);
    let signer: [u8; SIGNER_SIZE] = hasher.finalize().into();

    let record = SignatureRecord {
        digest,
        signer,
        signature,
        exponent,
        modulus,
    };

    verify_signature(&record)?;
    Ok(record)
}

/// Verifies that `record.signature` validates `record.digest` under the
/// embedded public key, and that `data` hashes to `record.digest`.
pub fn verify(record: &SignatureRecord, data: &[u8]) -> Result<()> {
    let digest: [u8; DIGEST_SIZE] = Sha256::digest(data).into();
    if digest != record.digest {
        return Err(CvmbootError::HashMismatch(
            "data digest does not match signature record".into(),
        ));
    }
    verify_signature(record)
}

fn verify_signature(record: &SignatureRecord) -> Result<()> {
    let public_key = record.public_key()?;
    public_key
        .verify(Pkcs1v15Sign::new::<Sha256>(), &record.digest, &record.signature)
        .map_err(|_| CvmbootError::HashMismatch("signature does not verify under the embedded public key".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::EncodePublicKey;
    use rsa::{Pkcs1v15Sign, RsaPrivateKey};

    struct FakeSignTool {
        key: RsaPrivateKey,
    }

    impl SignTool for FakeSignTool {
        fn sign(&self, data: &[u8]) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>)> {
            let digest: [u8; 32] = Sha256::digest(data).into();
            let signature = self
                .key
                .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
                .map_err(|e| CvmbootError::ExternalToolFailure(e.to_string()))?;
            let public = self.key.to_public_key();
            Ok((signature, public.e().to_bytes_be(), public.n().to_bytes_be()))
        }
    }

    fn fake_tool() -> FakeSignTool {
        let mut rng = rand::thread_rng();
        FakeSignTool {
            key: RsaPrivateKey::new(&mut rng, 2048).unwrap(),
        }
    }

    #[test]
    fn create_then_verify_round_trips() {
        let tool = fake_tool();
        let data = b"an image digest worth signing";
        let record = create(data, &tool).unwrap();
        verify(&record, data).unwrap();
    }

    #[test]
    fn byte_round_trip_preserves_fields() {
        let tool = fake_tool();
        let record = create(b"payload", &tool).unwrap();
        let bytes = record.to_bytes().unwrap();
        assert_eq!(bytes.len(), RECORD_SIZE);
        let parsed = SignatureRecord::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn verify_rejects_tampered_data() {
        let tool = fake_tool();
        let record = create(b"original", &tool).unwrap();
        assert!(verify(&record, b"tampered").is_err());
    }

    #[test]
    fn verify_rejects_corrupted_signature() {
        let tool = fake_tool();
        let mut record = create(b"payload", &tool).unwrap();
        record.signature[0] ^= 0xff;
        assert!(verify(&record, b"payload").is_err());
    }

    #[test]
    fn from_bytes_rejects_bad_magic() {
        let buf = [0u8; RECORD_SIZE];
        assert!(SignatureRecord::from_bytes(&buf).is_err());
    }

    #[test]
    fn external_public_key_pem_round_trips_through_decode() {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let pem = key
            .to_public_key()
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();
        let decoded = decode_public_key_pem(&pem).unwrap();
        assert_eq!(decoded.n(), key.to_public_key().n());
    }
}
