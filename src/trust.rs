//! Fortinet CA certificates used to validate the appliance's client
//! certificate.
//!
//! The bundle was downloaded from a Fortinet demo appliance and holds the
//! `support` root, the `fortinet-ca2` root and the `fortinet-subca2001`
//! sub-CA issued by it.

use std::fs;
use std::path::Path;

use openssl::x509::store::{X509Store, X509StoreBuilder};
use openssl::x509::X509;

use crate::error::{ProbeError, Result};
use crate::extract::asn1_text;

/// Embedded PEM bundle, three concatenated certificates.
pub const FORTINET_CA_PEM: &[u8] = include_bytes!("../certs/fortinet-ca.pem");

/// Immutable, ordered set of CA certificates a peer certificate must chain to.
#[derive(Clone)]
pub struct TrustAnchorSet {
    anchors: Vec<X509>,
}

impl TrustAnchorSet {
    /// Loads the embedded Fortinet anchors.
    pub fn load() -> Result<Self> {
        Self::from_pem(FORTINET_CA_PEM)
    }

    /// Parses every certificate of a concatenated PEM bundle.
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let anchors = X509::stack_from_pem(pem).map_err(ProbeError::trust)?;
        if anchors.is_empty() {
            return Err(ProbeError::TrustStore {
                reason: "bundle contains no certificate".to_string(),
            });
        }
        Ok(TrustAnchorSet { anchors })
    }

    /// Reads a PEM bundle from disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let pem = fs::read(path.as_ref()).map_err(|e| ProbeError::TrustStore {
            reason: format!("{}: {}", path.as_ref().display(), e),
        })?;
        Self::from_pem(&pem)
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &X509> {
        self.anchors.iter()
    }

    /// Subject common names of the anchors, in bundle order.
    pub fn subjects(&self) -> Vec<String> {
        self.anchors
            .iter()
            .map(|cert| {
                cert.subject_name()
                    .entries_by_nid(openssl::nid::Nid::COMMONNAME)
                    .last()
                    .map(|entry| asn1_text(entry.data()))
                    .unwrap_or_default()
            })
            .collect()
    }

    /// Builds a fresh verification store holding every anchor.
    pub fn to_store(&self) -> Result<X509Store> {
        let mut builder = X509StoreBuilder::new().map_err(ProbeError::trust)?;
        for anchor in &self.anchors {
            builder
                .add_cert(anchor.clone())
                .map_err(ProbeError::trust)?;
        }
        Ok(builder.build())
    }
}

impl std::fmt::Debug for TrustAnchorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustAnchorSet")
            .field("subjects", &self.subjects())
            .finish()
    }
}
