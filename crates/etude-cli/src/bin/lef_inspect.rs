//! LEF container inspector
//!
//! Dumps the header, model metadata, and layer index of a container
//! file. With `--verify`, fetches every layer so decompression and the
//! per-layer CRC-32 checks actually run.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use etude_lef::LefReader;

#[derive(Parser)]
#[command(name = "lef-inspect", about = "Inspect a LEF model container")]
struct Args {
    /// Path to the .lef file.
    path: PathBuf,

    /// Fetch every layer and verify its checksum.
    #[arg(long)]
    verify: bool,
}

fn main() -> Result<ExitCode> {
    env_logger::init();
    let args = Args::parse();

    let reader = LefReader::open(&args.path)?;
    let header = reader.header();
    let meta = reader.metadata();

    println!("file:      {}", args.path.display());
    println!(
        "version:   {}.{}  flags: {:#x}  codec: {:?}",
        header.version_major,
        header.version_minor,
        header.flags.bits(),
        header.compression,
    );
    println!(
        "size:      {} bytes  hash: 0x{:08X}  timestamp: {}",
        header.file_size, header.model_hash, header.timestamp
    );
    println!();
    println!("model:     {} v{} by {}", meta.name, meta.version, meta.author);
    if !meta.description.is_empty() {
        println!("           {}", meta.description);
    }
    println!(
        "dims:      in={} out={} hidden={} heads={} vocab={}",
        meta.input_dim, meta.output_dim, meta.hidden_dim, meta.num_heads, meta.vocab_size
    );
    println!(
        "audio:     {} Hz, {} mel channels, hop {}, win {}",
        meta.sample_rate, meta.mel_channels, meta.hop_length, meta.win_length
    );
    println!();
    println!("layers:    {}", reader.num_layers());
    println!(
        "  {:>5} {:<10} {:<6} {:>10} {:>10} {:>12}",
        "id", "kind", "quant", "raw", "stored", "checksum"
    );

    let mut corrupt = 0usize;
    for id in reader.layer_ids() {
        let layer = reader.get_layer_header(id)?;
        let status = if args.verify {
            match reader.get_layer_data(id) {
                Ok(_) => "  ok",
                Err(err) => {
                    corrupt += 1;
                    log::error!("layer {id}: {err}");
                    "  CORRUPT"
                }
            }
        } else {
            ""
        };
        println!(
            "  {:>5} {:<10} {:<6} {:>10} {:>10}   0x{:08X}{status}",
            layer.layer_id,
            format!("{:?}", layer.kind).to_lowercase(),
            layer.quantization.to_u8(),
            layer.data_size,
            layer.compressed_size,
            layer.checksum,
        );
    }

    if args.verify {
        println!();
        if corrupt == 0 {
            println!("all layers verified");
        } else {
            println!("{corrupt} corrupt layer(s)");
            return Ok(ExitCode::FAILURE);
        }
    }
    Ok(ExitCode::SUCCESS)
}
