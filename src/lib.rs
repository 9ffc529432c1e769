//! Reveal the model and serial number of a FortiGate appliance.
//!
//! FortiGate devices answer on TCP 541 as the TLS *client* of a management
//! session. By connecting to that port and taking the TLS *server* role, we
//! make the device present its factory certificate, whose subject common name
//! holds the model and serial number.
//!
//! A probe runs strictly in sequence and is never retried:
//!
//! ```text
//! Start -> IdentityIssued -> Connected -> HandshakeEstablished -> FieldsExtracted
//! ```
//!
//! Any failure ends the run with a [`ProbeError`] naming the failed phase.
//!
//! ```no_run
//! use fortiprobe::{run, ProbeSettings};
//!
//! let report = run("192.0.2.10", &ProbeSettings::default())?;
//! println!("{}", report.device.summary_line());
//! # Ok::<(), fortiprobe::ProbeError>(())
//! ```

pub mod config;
pub mod error;
pub mod extract;
pub mod handshake;
pub mod identity;
pub mod trust;

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use strum_macros::Display;
use tracing::{debug, info, warn};

pub use error::{ErrorKind, ProbeError, Result};
pub use extract::{extract, DeviceCertificate};
pub use handshake::{
    probe, CipherPolicy, PeerCertificateView, PeerVerification, ServerPolicy, Target,
    DEFAULT_PORT, DEFAULT_TIMEOUT,
};
pub use identity::EphemeralIdentity;
pub use trust::TrustAnchorSet;

/// Runtime settings of one probe.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub port: u16,
    /// One deadline shared by connect and handshake
    pub timeout: Duration,
    pub key_bits: u32,
    pub ciphers: CipherPolicy,
    /// Replaces the embedded trust anchors when set
    pub ca_file: Option<PathBuf>,
    /// Parent of the ephemeral identity directory; system temp dir when unset
    pub identity_dir: Option<PathBuf>,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        ProbeSettings {
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
            key_bits: identity::DEFAULT_KEY_BITS,
            ciphers: CipherPolicy::default(),
            ca_file: None,
            identity_dir: None,
        }
    }
}

/// Pipeline states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Stage {
    Start,
    IdentityIssued,
    Connected,
    HandshakeEstablished,
    FieldsExtracted,
}

/// Outcome of a successful probe.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub target: String,
    pub port: u16,
    #[serde(flatten)]
    pub device: DeviceCertificate,
    pub protocol: String,
    pub cipher: Option<String>,
}

/// Probes `target` once with `settings`.
///
/// The ephemeral identity and the TLS session are both released before this
/// returns, whatever the outcome.
pub fn run(target: &str, settings: &ProbeSettings) -> Result<ProbeReport> {
    let target = Target::new(target, settings.port)?;
    let anchors = match &settings.ca_file {
        Some(path) => TrustAnchorSet::from_file(path)?,
        None => TrustAnchorSet::load()?,
    };
    run_with_anchors(&target, settings, anchors)
}

/// Same as [`run`] with explicit trust anchors.
pub fn run_with_anchors(
    target: &Target,
    settings: &ProbeSettings,
    anchors: TrustAnchorSet,
) -> Result<ProbeReport> {
    enter(Stage::Start, target);
    debug!(anchors = anchors.len(), "trust anchors loaded");
    let policy = ServerPolicy::new(anchors).with_ciphers(settings.ciphers.clone());

    let identity = match &settings.identity_dir {
        Some(parent) => EphemeralIdentity::issue_in(settings.key_bits, parent)?,
        None => EphemeralIdentity::issue(settings.key_bits)?,
    };
    enter(Stage::IdentityIssued, target);

    let view = probe(target, settings.timeout, &identity, &policy)?;
    enter(Stage::HandshakeEstablished, target);

    let device = extract(&view)?;
    enter(Stage::FieldsExtracted, target);

    let report = ProbeReport {
        target: target.host().to_string(),
        port: target.port(),
        device,
        protocol: view.protocol().to_string(),
        cipher: view.cipher().map(str::to_string),
    };
    view.close();
    release(identity);
    info!(common_name = %report.device.common_name, "probe complete");
    Ok(report)
}

fn enter(stage: Stage, target: &Target) {
    debug!(%stage, target = %target.address(), "stage");
}

/// Erases the identity after a successful run. The device fields are already
/// in hand, so a cleanup failure is logged and does not fail the run.
fn release(identity: EphemeralIdentity) -> bool {
    match identity.erase() {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "ephemeral identity not fully erased");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_release_erases_identity() {
        let parent = tempfile::tempdir().unwrap();
        let identity = EphemeralIdentity::issue_in(1024, parent.path()).unwrap();
        assert!(release(identity));
        assert_eq!(fs::read_dir(parent.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_release_survives_cleanup_failure() {
        let parent = tempfile::tempdir().unwrap();
        let identity = EphemeralIdentity::issue_in(1024, parent.path()).unwrap();
        let dir = identity.certificate_path().parent().unwrap().to_path_buf();
        fs::remove_dir_all(&dir).unwrap();

        assert!(!release(identity));
        assert!(!dir.exists());
    }

    #[test]
    fn test_default_settings_use_system_temp_dir() {
        assert!(ProbeSettings::default().identity_dir.is_none());
    }
}
