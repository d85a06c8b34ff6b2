//! Kernel registry micro-benchmark tool
//!
//! Detects the host, initializes the registry, runs the self-benchmark,
//! and prints every registered kernel with its ISA requirement and
//! measured score (iterations per second of its fixed-shape workload).

use anyhow::Result;
use clap::Parser;
use etude_core::{isa_names, isa_supports, HardwareProfile};
use etude_kernels::KernelRegistry;

#[derive(Parser)]
#[command(name = "etude-bench", about = "Benchmark the registered kernels on this host")]
struct Args {
    /// Only show kernels whose name contains this substring.
    #[arg(long)]
    filter: Option<String>,

    /// Print seed scores without running the measurement pass.
    #[arg(long)]
    no_measure: bool,

    /// Emit a JSON report instead of a table.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let profile = HardwareProfile::detect();
    let mut registry = KernelRegistry::new();
    registry.init(profile)?;
    if !args.no_measure {
        registry.benchmark()?;
    }

    let mut entries: Vec<_> = registry
        .entries()
        .iter()
        .filter(|e| {
            args.filter
                .as_deref()
                .map(|f| e.name.contains(f))
                .unwrap_or(true)
        })
        .collect();
    entries.sort_by(|a, b| b.performance_score.total_cmp(&a.performance_score));

    if args.json {
        let report = serde_json::json!({
            "isa": isa_names(profile.isa),
            "physical_cores": profile.num_physical_cores,
            "logical_cores": profile.num_logical_cores,
            "kernels": entries.iter().map(|e| serde_json::json!({
                "name": e.name,
                "required_isa": isa_names(e.required_isa),
                "optimal_size": e.optimal_size,
                "score": e.performance_score,
                "selectable": isa_supports(profile.isa, e.required_isa),
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("host ISA: {}", isa_names(profile.isa));
    println!(
        "cores: {} physical / {} logical",
        profile.num_physical_cores, profile.num_logical_cores
    );
    println!();
    println!(
        "{:<36} {:<18} {:>12} {:>14}",
        "kernel", "requires", "optimal", "score"
    );
    for entry in entries {
        let marker = if isa_supports(profile.isa, entry.required_isa) {
            ' '
        } else {
            '!'
        };
        println!(
            "{:<36} {:<18} {:>12} {:>14.0}{marker}",
            entry.name,
            isa_names(entry.required_isa),
            entry.optimal_size,
            entry.performance_score,
        );
    }
    println!();
    println!("('!' marks kernels the current ISA mask cannot select)");
    Ok(())
}
