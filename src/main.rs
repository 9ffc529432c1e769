use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use fortiprobe::config::{Config, OutputFormat};
use fortiprobe::run;
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// Reveal FortiGate model and serial number through a role-reversed TLS
/// handshake on port 541.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Target IP address or FQDN
    #[arg(value_name = "TARGET", required_unless_present = "generate_config")]
    target: Option<String>,

    /// Management port of the appliance
    #[arg(short, long)]
    port: Option<u16>,

    /// Connect and handshake timeout, in seconds
    #[arg(short, long, value_name = "SECS")]
    timeout: Option<u64>,

    /// RSA key size of the throwaway server identity
    #[arg(long, value_name = "BITS")]
    key_bits: Option<u32>,

    /// PEM bundle replacing the embedded Fortinet CA certificates
    #[arg(long, value_name = "PEM")]
    ca_file: Option<PathBuf>,

    /// Directory in which the throwaway identity files are created
    #[arg(long, value_name = "DIR")]
    identity_dir: Option<PathBuf>,

    /// Output format: text, json
    #[arg(short, long)]
    output: Option<String>,

    /// Path to a TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print an example configuration file and exit
    #[arg(long)]
    generate_config: bool,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if cli.generate_config {
        println!("{}", Config::example_toml());
        exit(0);
    }

    let file_config = match &cli.config {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load config {}: {}", path.display(), e);
                exit(1);
            }
        },
        None => Config::default(),
    };
    let cli_config = Config::from_cli_args(
        cli.port,
        cli.timeout,
        cli.key_bits,
        cli.output.clone(),
        cli.ca_file.clone(),
        cli.identity_dir.clone(),
    );
    let (settings, output) = match file_config.merge_with(cli_config).resolve() {
        Ok(resolved) => resolved,
        Err(e) => {
            eprintln!("{}", e);
            exit(1);
        }
    };

    let target = cli.target.unwrap_or_default();
    match run(&target, &settings) {
        Ok(report) => match output {
            OutputFormat::Text => println!("{}", report.device.summary_line()),
            OutputFormat::Json => match serde_json::to_string_pretty(&report) {
                Ok(body) => println!("{}", body),
                Err(e) => {
                    eprintln!("Failed to encode report: {}", e);
                    exit(1);
                }
            },
        },
        Err(err) => {
            match output {
                OutputFormat::Text => eprintln!("{}: {}", target, err),
                OutputFormat::Json => eprintln!(
                    "{}",
                    json!({
                        "target": target,
                        "port": settings.port,
                        "error": err.kind(),
                        "message": err.to_string(),
                    })
                ),
            }
            exit(1);
        }
    }
}
