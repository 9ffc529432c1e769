//! Basic device identification example.
//!
//! This example reads the model and serial number of one FortiGate using the
//! default settings: port 541, a three second budget and the embedded
//! Fortinet CA certificates.
//!
//! Run with: cargo run --example basic_probe -- 192.0.2.10

use fortiprobe::{run, ProbeSettings};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== FortiGate Identification ===\n");

    let target = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "192.0.2.10".to_string());
    let report = run(&target, &ProbeSettings::default())?;

    println!("Target: {}:{}", report.target, report.port);
    println!("Common name: {}", report.device.common_name);
    println!("Certificate expiry: {}", report.device.not_after);
    println!("Protocol: {}", report.protocol);
    if let Some(cipher) = &report.cipher {
        println!("Cipher: {}", cipher);
    }
    println!();
    println!("{}", report.device.summary_line());

    Ok(())
}
