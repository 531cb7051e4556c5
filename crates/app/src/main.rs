mod cli;
mod summary;
mod telemetry;

use std::io::{self, Read};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use webm_ingest::{Decoder, DecoderConfig};

use crate::{cli::CliArgs, summary::Summary};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = CliArgs::parse();
    telemetry::init(args.verbose);

    let config = DecoderConfig::try_from(&args)?;
    let decoder = Decoder::new(config)?;

    let mut buffer = Vec::new();
    io::stdin()
        .lock()
        .read_to_end(&mut buffer)
        .context("failed to read video from stdin")?;
    info!(bytes = buffer.len(), "read input");

    let summary = if args.probe_only {
        let info = decoder.probe(&buffer).context("probe failed")?;
        Summary::from_probe(&info)
    } else {
        let video = decoder.decode(&buffer).context("decode failed")?;
        Summary::from_decoded(&video)
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{summary}");
    }
    Ok(())
}
