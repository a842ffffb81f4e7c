//! uplink-decode: inspect a captured uplink frame
//!
//! Usage:
//!   uplink-decode frame.bin                         # decode with the dynamic generation
//!   uplink-decode --hex "00 00 05 02 ..."           # decode a hex dump
//!   uplink-decode --generation fixed frame.bin      # legacy 47-byte frames
//!   uplink-decode --encrypted body.bin              # body is IV ‖ ciphertext
//!   uplink-decode --config relay.yaml frame.bin     # take the generation and gains from a deployment

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use uplink_relay::codec::ProtocolGeneration;
use uplink_relay::security::BodyCipher;
use uplink_relay::storage::RegisterGains;
use uplink_relay::IngestConfig;

#[derive(Parser)]
#[command(name = "uplink-decode")]
#[command(about = "Decode a captured uplink frame", long_about = None)]
struct Cli {
    /// Frame file; omit when using --hex
    input: Option<PathBuf>,

    /// Frame bytes as hex, whitespace allowed
    #[arg(long, conflicts_with = "input")]
    hex: Option<String>,

    /// Protocol generation: dynamic, fixed or dynamic_ccitt
    #[arg(short, long)]
    generation: Option<ProtocolGeneration>,

    /// Deployment configuration supplying generation and gains
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Decrypt the body with the device key before decoding
    #[arg(short, long)]
    encrypted: bool,

    #[arg(short, long, value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Table,
    Json,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let yaml = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            IngestConfig::from_yaml_str(&yaml)?
        }
        None => IngestConfig::default(),
    };
    let generation = cli.generation.unwrap_or(config.protocol);
    let gains = config.register_gains();

    let raw = match (&cli.input, &cli.hex) {
        (Some(path), None) => std::fs::read(path).with_context(|| format!("reading {}", path.display()))?,
        (None, Some(text)) => {
            let digits: String = text.split_whitespace().collect();
            hex::decode(&digits).context("--hex is not valid hex")?
        }
        _ => bail!("pass a frame file or --hex"),
    };
    debug!("Read {} bytes", raw.len());

    let frame = if cli.encrypted { BodyCipher::from_psk().decrypt(&raw)? } else { raw };
    let decoded = generation.codec().decode(&frame)?;
    info!("Decoded {} byte {} frame", frame.len(), generation);

    match cli.format {
        Format::Json => {
            let output = serde_json::json!({
                "generation": generation,
                "header": decoded.header,
                "values": decoded.samples.as_slice(),
                "scaled": gains.scale_rows(&decoded.samples),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Format::Table => print_table(&decoded.samples, &gains),
    }
    Ok(())
}

fn print_table(samples: &uplink_relay::SampleMatrix, gains: &RegisterGains) {
    let names: Vec<String> = (0..samples.register_count()).map(|index| gains.name(index)).collect();
    println!("sample  {}", names.iter().map(|name| format!("{:>12}", name)).collect::<String>());
    for (index, row) in samples.rows().enumerate() {
        let cells: String = row
            .iter()
            .enumerate()
            .map(|(register, raw)| format!("{:>12}", gains.scale(register, *raw)))
            .collect();
        println!("{:>6}  {}", index, cells);
    }
}
