//! Points-to analysis driver: run the pointer analysis and dump the
//! solution.

use anyhow::{Context, Error};
use clap::Parser;
use sparrow_lib::annotation::ExternalPointerTable;
use sparrow_lib::pipeline::{load_module, AnalysisResults};
use sparrow_lib::AnalysisConfig;

mod cli;

#[derive(Debug, Parser)]
#[command(version, about)]
/// Run the semi-sparse pointer analysis and dump points-to sets.
struct CmdlineArgs {
    /// The serialized IR module to analyze.
    #[arg(value_parser = cli::check_file_existence)]
    ir_file: String,

    /// Annotation file for external library points-to effects.
    #[arg(long, default_value = "ptr.config")]
    ptr_config: String,

    /// Context sensitivity policy (no-context, uniform-k, selective-kcfa).
    #[arg(long, default_value = "uniform-k")]
    context_policy: String,

    /// Context sensitivity k limit.
    #[arg(long, short, default_value_t = 1)]
    k: u32,

    /// Print the points-to sets of all pointers.
    #[arg(long)]
    dump_pts: bool,

    /// Do not print log messages.
    #[arg(long, short)]
    quiet: bool,
}

fn main() {
    cli::exit_with(run(&CmdlineArgs::parse()));
}

fn run(args: &CmdlineArgs) -> Result<(), Error> {
    let module = load_module(&args.ir_file)?;
    let policy = cli::parse_policy(&args.context_policy, args.k)?;
    let config = AnalysisConfig::new(policy.clone());
    let ptr_table = ExternalPointerTable::load_from_file(&args.ptr_config)?;

    let results = AnalysisResults::compute_pointer_analysis(module, &config, &ptr_table)
        .context("pointer analysis failed")?;
    cli::print_logs(&results.logs, args.quiet);

    if args.dump_pts {
        print!("{}", results.dump_pts());
    }
    print!("{}", results.dump_context_stats(&policy));
    Ok(())
}
