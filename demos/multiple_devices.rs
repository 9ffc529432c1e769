//! Multiple devices example.
//!
//! This example identifies several appliances in sequence with a shorter
//! timeout and prints one JSON document per device. Failures are reported by
//! error kind and do not stop the loop.
//!
//! Run with: cargo run --example multiple_devices -- 192.0.2.10 192.0.2.11

use std::time::Duration;

use fortiprobe::{run, ProbeSettings};
use serde_json::json;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let targets: Vec<String> = std::env::args().skip(1).collect();
    if targets.is_empty() {
        eprintln!("usage: multiple_devices <TARGET>...");
        return Ok(());
    }

    let settings = ProbeSettings {
        timeout: Duration::from_secs(2),
        ..ProbeSettings::default()
    };

    for target in &targets {
        match run(target, &settings) {
            Ok(report) => println!("{}", serde_json::to_string(&report)?),
            Err(err) => println!(
                "{}",
                json!({
                    "target": target,
                    "error": err.kind(),
                    "message": err.to_string(),
                })
            ),
        }
    }

    Ok(())
}
