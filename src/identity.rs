//! Throwaway local server identity.
//!
//! The appliance never looks at the server certificate, but OpenSSL refuses to
//! act as a TLS server without one. Each probe therefore mints a fresh RSA key
//! and a self-signed certificate valid for one minute, writes both into a
//! private temporary directory and wipes them again once the probe is over.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::{ProbeError, Result};

/// Default RSA modulus size.
pub const DEFAULT_KEY_BITS: u32 = 2048;

/// Smallest RSA modulus accepted for the local identity.
pub const MIN_KEY_BITS: u32 = 512;

/// Lifetime of the self-signed certificate, in seconds.
pub const VALIDITY_SECS: i64 = 60;

/// Subject CN of the local certificate. The peer does not interpret it.
pub const PLACEHOLDER_CN: &str = "localhost";

const CERT_FILE: &str = "identity.crt";
const KEY_FILE: &str = "identity.key";

/// Key pair and self-signed certificate used as the local TLS server identity
/// for exactly one probe.
///
/// The PEM copies on disk live in a directory namespaced by process id. They
/// are overwritten and removed when the value is dropped or [`erase`]d.
///
/// [`erase`]: EphemeralIdentity::erase
pub struct EphemeralIdentity {
    key: PKey<Private>,
    certificate: X509,
    cert_path: PathBuf,
    key_path: PathBuf,
    dir: Option<TempDir>,
}

impl EphemeralIdentity {
    /// Generates a new RSA key of `key_bits` bits and a self-signed
    /// certificate for it, and stores both as PEM files under the system
    /// temporary directory.
    pub fn issue(key_bits: u32) -> Result<Self> {
        Self::issue_in(key_bits, &std::env::temp_dir())
    }

    /// Same as [`issue`](EphemeralIdentity::issue), with the per-identity
    /// directory created inside `parent`.
    pub fn issue_in(key_bits: u32, parent: &Path) -> Result<Self> {
        if key_bits < MIN_KEY_BITS {
            return Err(ProbeError::InvalidInput {
                field: "key_bits",
                reason: format!("must be at least {}", MIN_KEY_BITS),
            });
        }

        let rsa = Rsa::generate(key_bits).map_err(ProbeError::identity)?;
        let key = PKey::from_rsa(rsa).map_err(ProbeError::identity)?;
        let certificate = self_signed(&key).map_err(ProbeError::identity)?;

        let dir = tempfile::Builder::new()
            .prefix(&format!("fortiprobe-{}-", std::process::id()))
            .tempdir_in(parent)
            .map_err(ProbeError::identity)?;
        let cert_path = dir.path().join(CERT_FILE);
        let key_path = dir.path().join(KEY_FILE);

        let cert_pem = certificate.to_pem().map_err(ProbeError::identity)?;
        let key_pem = key
            .private_key_to_pem_pkcs8()
            .map_err(ProbeError::identity)?;
        write_private(&cert_path, &cert_pem).map_err(ProbeError::identity)?;
        write_private(&key_path, &key_pem).map_err(ProbeError::identity)?;

        debug!(
            bits = key_bits,
            dir = %dir.path().display(),
            "issued ephemeral identity"
        );

        Ok(EphemeralIdentity {
            key,
            certificate,
            cert_path,
            key_path,
            dir: Some(dir),
        })
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    pub fn private_key(&self) -> &PKey<Private> {
        &self.key
    }

    /// Path of the PEM certificate file.
    pub fn certificate_path(&self) -> &Path {
        &self.cert_path
    }

    /// Path of the PEM (PKCS#8) private key file.
    pub fn private_key_path(&self) -> &Path {
        &self.key_path
    }

    /// Overwrites and removes the on-disk copies now, reporting I/O failures.
    ///
    /// Dropping the identity does the same but can only log failures.
    pub fn erase(mut self) -> Result<()> {
        self.wipe().map_err(ProbeError::identity)
    }

    fn wipe(&mut self) -> io::Result<()> {
        let dir = match self.dir.take() {
            Some(dir) => dir,
            None => return Ok(()),
        };
        let zeroed = zero_file(&self.key_path).and(zero_file(&self.cert_path));
        let removed = dir.close();
        debug!("erased ephemeral identity");
        zeroed.and(removed)
    }
}

impl Drop for EphemeralIdentity {
    fn drop(&mut self) {
        if let Err(e) = self.wipe() {
            warn!(error = %e, "failed to erase ephemeral identity");
        }
    }
}

impl std::fmt::Debug for EphemeralIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralIdentity")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .finish_non_exhaustive()
    }
}

fn self_signed(key: &PKey<Private>) -> std::result::Result<X509, openssl::error::ErrorStack> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, PLACEHOLDER_CN)?;
    let name = name.build();

    let mut serial = BigNum::new()?;
    serial.rand(128, MsbOption::MAYBE_ZERO, false)?;
    let serial = serial.to_asn1_integer()?;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();
    let not_before = Asn1Time::from_unix(now as _)?;
    let not_after = Asn1Time::from_unix((now + VALIDITY_SECS) as _)?;

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(key)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}

fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

fn zero_file(path: &Path) -> io::Result<()> {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len() as usize,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let mut file: File = OpenOptions::new().write(true).open(path)?;
    file.write_all(&vec![0u8; len])?;
    file.sync_all()?;
    drop(file);
    fs::remove_file(path)
}
