//! RSA-2048 keypair generation for image signing, written the way the
//! original toolchain's `cvmsign` does it: a private key written with mode
//! `0600` under `~/.cvmsign/`, honoring `SUDO_UID` so a key generated via
//! `sudo cvmboot genkeys` still lands in the invoking user's home rather
//! than root's.

use std::path::{Path, PathBuf};

use cvmboot_core::{CvmbootError, Result};
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::RsaPrivateKey;

const KEY_BITS: usize = 2048;
const KEY_DIR: &str = ".cvmsign";
const PRIVATE_KEY_FILE: &str = "private.pem";
const PUBLIC_KEY_FILE: &str = "public.pem";

pub struct KeyPaths {
    pub private_key: PathBuf,
    pub public_key: PathBuf,
}

/// Generates a fresh RSA-2048 keypair and writes it PKCS#8 PEM-encoded under
/// `~/.cvmsign/`, creating the directory if needed.
pub fn generate() -> Result<KeyPaths> {
    let dir = key_dir()?;
    std::fs::create_dir_all(&dir)?;

    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, KEY_BITS)
        .map_err(|e| CvmbootError::ExternalToolFailure(format!("RSA key generation failed: {e}")))?;
    let public_key = private_key.to_public_key();

    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| CvmbootError::ExternalToolFailure(format!("failed to encode private key: {e}")))?;
    let public_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| CvmbootError::ExternalToolFailure(format!("failed to encode public key: {e}")))?;

    let private_path = dir.join(PRIVATE_KEY_FILE);
    let public_path = dir.join(PUBLIC_KEY_FILE);

    write_private_key(&private_path, private_pem.as_bytes())?;
    std::fs::write(&public_path, public_pem.as_bytes())?;

    Ok(KeyPaths {
        private_key: private_path,
        public_key: public_path,
    })
}

#[cfg(unix)]
fn write_private_key(path: &Path, contents: &[u8]) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, contents)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private_key(path: &Path, contents: &[u8]) -> Result<()> {
    std::fs::write(path, contents)?;
    Ok(())
}

/// Resolves `~/.cvmsign`, preferring the invoking user's home (via
/// `SUDO_UID`) over the current effective user's when run under `sudo`.
fn key_dir() -> Result<PathBuf> {
    Ok(sudo_home().or_else(dirs::home_dir).ok_or_else(|| {
        CvmbootError::NotFound("could not resolve a home directory to write keys into".into())
    })?.join(KEY_DIR))
}

#[cfg(target_os = "linux")]
fn sudo_home() -> Option<PathBuf> {
    let uid: u32 = std::env::var("SUDO_UID").ok()?.parse().ok()?;
    let user = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid)).ok()??;
    Some(user.dir)
}

#[cfg(not(target_os = "linux"))]
fn sudo_home() -> Option<PathBuf> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::DecodePrivateKey;

    #[test]
    fn generated_private_key_parses_back() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("HOME", dir.path());
        std::env::remove_var("SUDO_UID");

        let paths = generate().unwrap();
        assert!(paths.private_key.starts_with(dir.path()));

        let pem = std::fs::read_to_string(&paths.private_key).unwrap();
        RsaPrivateKey::from_pkcs8_pem(&pem).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&paths.private_key).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }
}
