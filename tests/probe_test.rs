//! Loopback tests of the reversed-role handshake.
//!
//! A local thread plays the appliance: it accepts the probe's TCP connection
//! and then speaks TLS as the *client*, presenting a certificate minted by a
//! test CA.

use std::fs;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use openssl::x509::extension::{BasicConstraints, ExtendedKeyUsage, KeyUsage};
use openssl::x509::{X509Builder, X509NameBuilder, X509NameRef, X509};

use fortiprobe::{
    extract, probe, run_with_anchors, CipherPolicy, EphemeralIdentity, ProbeError,
    ProbeSettings, ServerPolicy, Target, TrustAnchorSet,
};

struct Issuer {
    key: PKey<Private>,
    cert: X509,
}

struct DeviceCert {
    key: PKey<Private>,
    cert: X509,
}

fn rsa_key(bits: u32) -> PKey<Private> {
    PKey::from_rsa(Rsa::generate(bits).unwrap()).unwrap()
}

fn serial() -> openssl::asn1::Asn1Integer {
    let mut bn = BigNum::new().unwrap();
    bn.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
    bn.to_asn1_integer().unwrap()
}

fn name(entries: &[(Nid, &str)]) -> openssl::x509::X509Name {
    let mut builder = X509NameBuilder::new().unwrap();
    for (nid, value) in entries {
        builder.append_entry_by_nid(*nid, value).unwrap();
    }
    builder.build()
}

fn ca_builder(subject: &X509NameRef, issuer: &X509NameRef, key: &PKey<Private>) -> X509Builder {
    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(&serial()).unwrap();
    builder.set_subject_name(subject).unwrap();
    builder.set_issuer_name(issuer).unwrap();
    builder.set_pubkey(key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(3650).unwrap())
        .unwrap();
    builder
        .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
        .unwrap();
    builder
        .append_extension(
            KeyUsage::new()
                .critical()
                .key_cert_sign()
                .crl_sign()
                .build()
                .unwrap(),
        )
        .unwrap();
    builder
}

impl Issuer {
    fn root(cn: &str) -> Self {
        let key = rsa_key(2048);
        let subject = name(&[(Nid::ORGANIZATIONNAME, "Fortinet"), (Nid::COMMONNAME, cn)]);
        let mut builder = ca_builder(&subject, &subject, &key);
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        Issuer {
            key,
            cert: builder.build(),
        }
    }

    fn sub_ca(&self, cn: &str) -> Self {
        let key = rsa_key(2048);
        let subject = name(&[(Nid::ORGANIZATIONNAME, "Fortinet"), (Nid::COMMONNAME, cn)]);
        let mut builder = ca_builder(&subject, self.cert.subject_name(), &key);
        builder.sign(&self.key, MessageDigest::sha256()).unwrap();
        Issuer {
            key,
            cert: builder.build(),
        }
    }

    fn device(&self, subject: &[(Nid, &str)], not_after: &str) -> DeviceCert {
        self.device_with(subject, not_after, 2048, MessageDigest::sha256())
    }

    fn device_with(
        &self,
        subject: &[(Nid, &str)],
        not_after: &str,
        bits: u32,
        digest: MessageDigest,
    ) -> DeviceCert {
        let key = rsa_key(bits);
        let subject = name(subject);
        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        builder.set_serial_number(&serial()).unwrap();
        builder.set_subject_name(&subject).unwrap();
        builder.set_issuer_name(self.cert.subject_name()).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::from_str(not_after).unwrap())
            .unwrap();
        builder
            .append_extension(BasicConstraints::new().build().unwrap())
            .unwrap();
        builder
            .append_extension(ExtendedKeyUsage::new().client_auth().build().unwrap())
            .unwrap();
        builder.sign(&self.key, digest).unwrap();
        DeviceCert {
            key,
            cert: builder.build(),
        }
    }

    fn anchors(&self) -> TrustAnchorSet {
        TrustAnchorSet::from_pem(&self.cert.to_pem().unwrap()).unwrap()
    }
}

fn fgt_subject(cn: &str) -> Vec<(Nid, &str)> {
    vec![
        (Nid::COUNTRYNAME, "US"),
        (Nid::STATEORPROVINCENAME, "California"),
        (Nid::LOCALITYNAME, "Sunnyvale"),
        (Nid::ORGANIZATIONNAME, "Fortinet"),
        (Nid::ORGANIZATIONALUNITNAME, "FortiGate"),
        (Nid::COMMONNAME, cn),
    ]
}

/// Waits up to ten seconds for one inbound connection, so a client that never
/// dials cannot hang the test thread.
fn accept_within(listener: &TcpListener) -> Option<TcpStream> {
    listener.set_nonblocking(true).unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        match listener.accept() {
            Ok((tcp, _)) => {
                tcp.set_nonblocking(false).unwrap();
                return Some(tcp);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(10))
            }
            Err(_) => return None,
        }
    }
    None
}

/// Accepts one connection and dials back as a TLS client.
fn spawn_appliance(listener: TcpListener, device: Option<DeviceCert>) -> JoinHandle<()> {
    thread::spawn(move || {
        let tcp = match accept_within(&listener) {
            Some(tcp) => tcp,
            None => return,
        };
        tcp.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let mut builder = SslConnector::builder(SslMethod::tls_client()).unwrap();
        builder.set_verify(SslVerifyMode::NONE);
        builder.set_security_level(0);
        builder.set_cipher_list("ALL:@SECLEVEL=0").unwrap();
        if let Some(device) = &device {
            builder.set_certificate(&device.cert).unwrap();
            builder.set_private_key(&device.key).unwrap();
        }
        let connector = builder.build();
        let config = connector
            .configure()
            .unwrap()
            .verify_hostname(false)
            .use_server_name_indication(false);

        if let Ok(mut stream) = config.connect("fortimanager", tcp) {
            // Hold the session until the probe closes it.
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf);
        }
    })
}

fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn settings(port: u16) -> ProbeSettings {
    ProbeSettings {
        port,
        timeout: Duration::from_secs(3),
        key_bits: 1024,
        ..ProbeSettings::default()
    }
}

fn local(port: u16) -> Target {
    Target::new("127.0.0.1", port).unwrap()
}

/// Settings whose identity files go under `scratch`.
fn settings_in(port: u16, scratch: &Path) -> ProbeSettings {
    ProbeSettings {
        identity_dir: Some(scratch.to_path_buf()),
        ..settings(port)
    }
}

fn assert_no_identity_left(scratch: &Path) {
    let left: Vec<_> = fs::read_dir(scratch)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert!(left.is_empty(), "left behind: {:?}", left);
}

#[test]
fn test_round_trip_fields_verbatim() {
    let ca = Issuer::root("fortinet-ca2");
    let device = ca.device(&fgt_subject("FGT-100-SN12345"), "20301231235959Z");
    let (listener, port) = listener();
    let appliance = spawn_appliance(listener, Some(device));
    let scratch = tempfile::tempdir().unwrap();

    let report =
        run_with_anchors(&local(port), &settings_in(port, scratch.path()), ca.anchors()).unwrap();
    appliance.join().unwrap();

    assert_eq!(report.device.common_name, "FGT-100-SN12345");
    assert_eq!(report.device.not_after, "Dec 31 23:59:59 2030 GMT");
    assert_eq!(report.port, port);
    assert!(report.protocol.starts_with("TLS"));
    assert_no_identity_left(scratch.path());
}

#[test]
fn test_chain_through_second_bundle_entry() {
    let root = Issuer::root("fortinet-ca2");
    let sub = root.sub_ca("fortinet-subca2001");
    let device = sub.device(&fgt_subject("FG100F3G19000000"), "20381231235959Z");

    let mut bundle = root.cert.to_pem().unwrap();
    bundle.extend(sub.cert.to_pem().unwrap());
    let anchors = TrustAnchorSet::from_pem(&bundle).unwrap();
    assert_eq!(anchors.len(), 2);

    let (listener, port) = listener();
    let appliance = spawn_appliance(listener, Some(device));
    let report = run_with_anchors(&local(port), &settings(port), anchors).unwrap();
    appliance.join().unwrap();

    assert_eq!(report.device.common_name, "FG100F3G19000000");
}

#[test]
fn test_weak_device_certificate_accepted() {
    let ca = Issuer::root("support");
    let device = ca.device_with(
        &fgt_subject("FGT60D4615000000"),
        "20380119031407Z",
        1024,
        MessageDigest::sha1(),
    );
    let (listener, port) = listener();
    let appliance = spawn_appliance(listener, Some(device));

    let report = run_with_anchors(&local(port), &settings(port), ca.anchors()).unwrap();
    appliance.join().unwrap();
    assert_eq!(report.device.common_name, "FGT60D4615000000");
}

#[test]
fn test_weak_device_certificate_rejected_with_modern_floor() {
    let ca = Issuer::root("support");
    let device = ca.device_with(
        &fgt_subject("FGT60D4615000000"),
        "20380119031407Z",
        1024,
        MessageDigest::sha1(),
    );
    let (listener, port) = listener();
    let appliance = spawn_appliance(listener, Some(device));

    let strict = ProbeSettings {
        ciphers: CipherPolicy {
            cipher_list: "DEFAULT".to_string(),
            security_level: 2,
        },
        key_bits: 2048,
        ..settings(port)
    };
    let err = run_with_anchors(&local(port), &strict, ca.anchors()).unwrap_err();
    appliance.join().unwrap();
    assert!(matches!(err, ProbeError::PeerValidation { .. }), "got {:?}", err);
}

#[test]
fn test_no_client_certificate_is_peer_validation_error() {
    let ca = Issuer::root("fortinet-ca2");
    let (listener, port) = listener();
    let appliance = spawn_appliance(listener, None);

    let identity = EphemeralIdentity::issue(1024).unwrap();
    let key_path = identity.private_key_path().to_path_buf();
    let policy = ServerPolicy::new(ca.anchors());
    let err = probe(&local(port), Duration::from_secs(3), &identity, &policy).unwrap_err();
    appliance.join().unwrap();

    assert!(matches!(err, ProbeError::PeerValidation { .. }), "got {:?}", err);
    drop(identity);
    assert!(!key_path.exists());
}

#[test]
fn test_untrusted_certificate_is_peer_validation_error() {
    let trusted = Issuer::root("fortinet-ca2");
    let rogue = Issuer::root("fortinet-ca2");
    let device = rogue.device(&fgt_subject("FGT-100-SN12345"), "20301231235959Z");
    let (listener, port) = listener();
    let appliance = spawn_appliance(listener, Some(device));
    let scratch = tempfile::tempdir().unwrap();

    let err = run_with_anchors(
        &local(port),
        &settings_in(port, scratch.path()),
        trusted.anchors(),
    )
    .unwrap_err();
    appliance.join().unwrap();

    assert!(matches!(err, ProbeError::PeerValidation { .. }), "got {:?}", err);
    assert_no_identity_left(scratch.path());
}

#[test]
fn test_embedded_anchors_reject_test_device() {
    let ca = Issuer::root("fortinet-ca2");
    let device = ca.device(&fgt_subject("FGT-100-SN12345"), "20301231235959Z");
    let (listener, port) = listener();
    let appliance = spawn_appliance(listener, Some(device));

    let anchors = TrustAnchorSet::load().unwrap();
    let err = run_with_anchors(&local(port), &settings(port), anchors).unwrap_err();
    appliance.join().unwrap();

    assert!(matches!(err, ProbeError::PeerValidation { .. }), "got {:?}", err);
}

#[test]
fn test_missing_common_name_is_incomplete() {
    let ca = Issuer::root("fortinet-ca2");
    let device = ca.device(
        &[(Nid::COUNTRYNAME, "US"), (Nid::ORGANIZATIONNAME, "Fortinet")],
        "20301231235959Z",
    );
    let (listener, port) = listener();
    let appliance = spawn_appliance(listener, Some(device));

    let identity = EphemeralIdentity::issue(1024).unwrap();
    let policy = ServerPolicy::new(ca.anchors());
    let view = probe(&local(port), Duration::from_secs(3), &identity, &policy).unwrap();
    let err = extract(&view).unwrap_err();
    view.close();
    appliance.join().unwrap();

    assert!(matches!(
        err,
        ProbeError::IncompleteCertificate {
            field: "commonName"
        }
    ));
    identity.erase().unwrap();
}

#[test]
fn test_missing_common_name_leaves_no_identity_files() {
    let ca = Issuer::root("fortinet-ca2");
    let device = ca.device(&[(Nid::ORGANIZATIONNAME, "Fortinet")], "20301231235959Z");
    let (listener, port) = listener();
    let appliance = spawn_appliance(listener, Some(device));
    let scratch = tempfile::tempdir().unwrap();

    let err = run_with_anchors(&local(port), &settings_in(port, scratch.path()), ca.anchors())
        .unwrap_err();
    appliance.join().unwrap();

    assert!(
        matches!(err, ProbeError::IncompleteCertificate { .. }),
        "got {:?}",
        err
    );
    assert_no_identity_left(scratch.path());
}

#[test]
fn test_refused_connection_is_connect_error() {
    let (listener, port) = listener();
    drop(listener);
    let scratch = tempfile::tempdir().unwrap();

    let started = Instant::now();
    let err = run_with_anchors(
        &local(port),
        &settings_in(port, scratch.path()),
        TrustAnchorSet::load().unwrap(),
    )
    .unwrap_err();
    assert!(matches!(err, ProbeError::Connect { .. }), "got {:?}", err);
    assert!(started.elapsed() < Duration::from_secs(3) + Duration::from_secs(2));
    assert_no_identity_left(scratch.path());
}

#[test]
fn test_repeated_probes_fail_independently() {
    let (listener, port) = listener();
    drop(listener);

    for _ in 0..2 {
        let identity = EphemeralIdentity::issue(1024).unwrap();
        let cert_path = identity.certificate_path().to_path_buf();
        let policy = ServerPolicy::new(TrustAnchorSet::load().unwrap());
        let err = probe(&local(port), Duration::from_secs(1), &identity, &policy).unwrap_err();
        assert!(matches!(err, ProbeError::Connect { .. }));
        drop(identity);
        assert!(!cert_path.exists());
    }
}

#[test]
fn test_silent_peer_is_handshake_timeout() {
    let (listener, port) = listener();
    let silent = thread::spawn(move || {
        let tcp = accept_within(&listener);
        thread::sleep(Duration::from_secs(2));
        drop(tcp);
    });

    let identity = EphemeralIdentity::issue(1024).unwrap();
    let policy = ServerPolicy::new(TrustAnchorSet::load().unwrap());
    let timeout = Duration::from_millis(500);
    let started = Instant::now();
    let err = probe(&local(port), timeout, &identity, &policy).unwrap_err();
    let elapsed = started.elapsed();
    silent.join().unwrap();

    assert!(matches!(err, ProbeError::HandshakeTimeout { .. }), "got {:?}", err);
    assert!(elapsed < timeout + Duration::from_secs(1), "took {:?}", elapsed);
}

#[test]
fn test_non_tls_peer_is_handshake_error() {
    let (listener, port) = listener();
    let chatty = thread::spawn(move || {
        if let Some(mut tcp) = accept_within(&listener) {
            let _ = tcp.write_all(b"GET / HTTP/1.0\r\n\r\n");
            thread::sleep(Duration::from_millis(200));
        }
    });

    let identity = EphemeralIdentity::issue(1024).unwrap();
    let policy = ServerPolicy::new(TrustAnchorSet::load().unwrap());
    let err = probe(&local(port), Duration::from_secs(3), &identity, &policy).unwrap_err();
    chatty.join().unwrap();

    assert!(matches!(err, ProbeError::HandshakeFailed { .. }), "got {:?}", err);
}

#[test]
fn test_silent_peer_leaves_no_identity_files() {
    let (listener, port) = listener();
    let silent = thread::spawn(move || {
        let tcp = accept_within(&listener);
        thread::sleep(Duration::from_secs(2));
        drop(tcp);
    });
    let scratch = tempfile::tempdir().unwrap();

    let quick = ProbeSettings {
        timeout: Duration::from_millis(500),
        ..settings_in(port, scratch.path())
    };
    let err = run_with_anchors(&local(port), &quick, TrustAnchorSet::load().unwrap())
        .unwrap_err();
    silent.join().unwrap();

    assert!(matches!(err, ProbeError::HandshakeTimeout { .. }), "got {:?}", err);
    assert_no_identity_left(scratch.path());
}

#[test]
fn test_trickling_peer_is_bounded_by_overall_timeout() {
    let (listener, port) = listener();
    let trickle = thread::spawn(move || {
        let mut tcp = match accept_within(&listener) {
            Some(tcp) => tcp,
            None => return,
        };
        // A TLS record header announcing 255 bytes, then one byte at a time.
        let mut bytes = vec![0x16, 0x03, 0x01, 0x00, 0xff];
        bytes.resize(20, 0);
        for byte in bytes {
            if tcp.write_all(&[byte]).is_err() {
                return;
            }
            thread::sleep(Duration::from_millis(300));
        }
    });

    let identity = EphemeralIdentity::issue(1024).unwrap();
    let policy = ServerPolicy::new(TrustAnchorSet::load().unwrap());
    let timeout = Duration::from_millis(500);
    let started = Instant::now();
    let err = probe(&local(port), timeout, &identity, &policy).unwrap_err();
    let elapsed = started.elapsed();
    trickle.join().unwrap();

    assert!(matches!(err, ProbeError::HandshakeTimeout { .. }), "got {:?}", err);
    assert!(elapsed < timeout + Duration::from_secs(1), "took {:?}", elapsed);
}
