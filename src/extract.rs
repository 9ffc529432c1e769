//! Reads the two fields we care about from a validated device certificate.

use openssl::asn1::Asn1StringRef;
use openssl::nid::Nid;
use openssl::x509::X509Ref;
use serde::{Deserialize, Serialize};

use crate::error::{ProbeError, Result};
use crate::handshake::PeerCertificateView;

/// Fields taken from the appliance certificate, verbatim.
///
/// On FortiGate devices the common name encodes model and serial number
/// (e.g. `FGT60E4Q16000000`); the layout varies per product family and is not
/// interpreted here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCertificate {
    pub common_name: String,
    /// `notAfter` in OpenSSL text form, e.g. `Dec 31 23:59:59 2030 GMT`
    pub not_after: String,
}

impl DeviceCertificate {
    pub fn summary_line(&self) -> String {
        format!(
            "Fortigate model and s/n: {}, device certificate expiry: {}",
            self.common_name, self.not_after
        )
    }
}

/// Extracts the subject CN and expiry from an established session.
pub fn extract(view: &PeerCertificateView) -> Result<DeviceCertificate> {
    extract_from_certificate(view.certificate())
}

pub fn extract_from_certificate(cert: &X509Ref) -> Result<DeviceCertificate> {
    // The device CN is the last commonName RDN of the subject.
    let common_name = cert
        .subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .last()
        .map(|entry| asn1_text(entry.data()))
        .unwrap_or_default();
    if common_name.trim().is_empty() {
        return Err(ProbeError::IncompleteCertificate {
            field: "commonName",
        });
    }

    let not_after = cert.not_after().to_string();
    if not_after.trim().is_empty() {
        return Err(ProbeError::IncompleteCertificate { field: "notAfter" });
    }

    Ok(DeviceCertificate {
        common_name,
        not_after,
    })
}

/// Content bytes of an ASN.1 string as text, interior NULs included.
///
/// UTF8String, PrintableString and IA5String contents are already UTF-8;
/// anything else is decoded lossily rather than truncated.
pub(crate) fn asn1_text(value: &Asn1StringRef) -> String {
    String::from_utf8_lossy(value.as_slice()).into_owned()
}
