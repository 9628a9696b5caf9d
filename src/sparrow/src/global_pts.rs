//! Global points-to driver: dump the environment seeded by the global
//! prepass together with the type layouts.

use anyhow::{Context, Error};
use clap::Parser;
use sparrow_lib::annotation::ExternalPointerTable;
use sparrow_lib::pipeline::{load_module, AnalysisResults};
use sparrow_lib::AnalysisConfig;

mod cli;

#[derive(Debug, Parser)]
#[command(version, about)]
/// Dump the points-to information of global values.
struct CmdlineArgs {
    /// The serialized IR module to analyze.
    #[arg(value_parser = cli::check_file_existence)]
    ir_file: String,

    /// Write the dump to a file instead of stdout.
    #[arg(long, short)]
    out: Option<String>,

    /// Context sensitivity policy (no-context, uniform-k, selective-kcfa).
    #[arg(long, default_value = "uniform-k")]
    context_policy: String,

    /// Context sensitivity k limit.
    #[arg(long, short, default_value_t = 1)]
    k: u32,

    /// Also print the type layouts of the module.
    #[arg(long)]
    print_type: bool,
}

fn main() {
    cli::exit_with(run(&CmdlineArgs::parse()));
}

fn run(args: &CmdlineArgs) -> Result<(), Error> {
    let module = load_module(&args.ir_file)?;
    let policy = cli::parse_policy(&args.context_policy, args.k)?;
    let config = AnalysisConfig::new(policy);
    let ptr_table = ExternalPointerTable::new();

    let results = AnalysisResults::compute_pointer_analysis(module, &config, &ptr_table)
        .context("pointer analysis failed")?;
    cli::print_logs(&results.logs, false);

    let mut dump = results.dump_pts();
    if args.print_type {
        dump += &results.dump_types();
    }
    if let Some(path) = &args.out {
        std::fs::write(path, dump).with_context(|| format!("cannot write to {path}"))?;
    } else {
        print!("{dump}");
    }
    Ok(())
}
