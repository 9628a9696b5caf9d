//! The all-in-one driver: run the whole pipeline and emit the report.

use anyhow::{Context, Error};
use clap::Parser;
use sparrow_lib::annotation::{ExternalModRefTable, ExternalPointerTable, ExternalTaintTable};
use sparrow_lib::pipeline::{load_module, AnalysisResults};
use sparrow_lib::utils::log::add_debug_log_statistics;
use sparrow_lib::AnalysisConfig;

mod cli;

#[derive(Debug, Parser)]
#[command(version, about)]
/// Find tainted data flowing into sensitive call arguments.
struct CmdlineArgs {
    /// The serialized IR module to analyze.
    #[arg(value_parser = cli::check_file_existence)]
    ir_file: String,

    /// Annotation file for external library points-to effects.
    #[arg(long, default_value = "ptr.config")]
    ptr_config: String,

    /// Annotation file for external library mod/ref effects.
    #[arg(long, default_value = "modref.config")]
    modref_config: String,

    /// Annotation file for external library taint effects.
    #[arg(long, default_value = "taint.config")]
    taint_config: String,

    /// Context sensitivity policy (no-context, uniform-k, selective-kcfa).
    #[arg(long, default_value = "selective-kcfa")]
    context_policy: String,

    /// Context sensitivity k limit.
    #[arg(long, short, default_value_t = 1)]
    k: u32,

    /// Dump the loaded IR module before analysis.
    #[arg(long)]
    dump_ir: bool,

    /// Dump the full report (points-to sets and context statistics) in
    /// addition to the violations.
    #[arg(long)]
    dump_report: bool,

    /// Write the results to a file instead of stdout.
    #[arg(long, short)]
    out: Option<String>,

    /// Generate JSON output.
    #[arg(long, short)]
    json: bool,

    /// Do not print log messages.
    #[arg(long, short)]
    quiet: bool,

    /// Print additional debug log messages.
    #[arg(long, short, conflicts_with("quiet"))]
    verbose: bool,
}

fn main() {
    cli::exit_with(run(&CmdlineArgs::parse()));
}

fn run(args: &CmdlineArgs) -> Result<(), Error> {
    let module = load_module(&args.ir_file)?;
    if args.dump_ir {
        eprintln!("{}", serde_json::to_string_pretty(&module)?);
    }

    let policy = cli::parse_policy(&args.context_policy, args.k)?;
    let config = AnalysisConfig::new(policy.clone());
    let ptr_table = ExternalPointerTable::load_from_file(&args.ptr_config)?;
    let modref_table = ExternalModRefTable::load_from_file(&args.modref_config)?;
    let taint_table = ExternalTaintTable::load_from_file(&args.taint_config)?;

    let mut results =
        AnalysisResults::compute_all(module, &config, &ptr_table, &modref_table, &taint_table)
            .context("analysis failed")?;

    if args.verbose {
        add_debug_log_statistics(&mut results.logs);
    } else {
        results
            .logs
            .retain(|log| log.level != sparrow_lib::utils::log::LogLevel::Debug);
    }
    cli::print_logs(&results.logs, args.quiet);

    let mut report = results.violation_report();
    if args.dump_report {
        report += &results.dump_pts();
        report += &results.dump_context_stats(&policy);
    }
    let json = results.violation_json();
    sparrow_lib::utils::log::print_all_messages(
        &[],
        &report,
        Some(&json),
        args.out.as_deref(),
        args.json,
    )?;
    Ok(())
}
