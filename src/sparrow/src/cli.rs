//! Helpers shared by the driver binaries.

use anyhow::{bail, Error, Result};
use sparrow_lib::context::policies::{ContextPolicy, SelectiveKcfa};

/// Return `Ok(file_path)` only if `file_path` points to an existing file.
pub fn check_file_existence(file_path: &str) -> std::result::Result<String, String> {
    if std::fs::metadata(file_path)
        .map_err(|err| format!("{err}"))?
        .is_file()
    {
        Ok(file_path.to_string())
    } else {
        Err(format!("{file_path} is not a file."))
    }
}

/// Build the context policy from the `--context-policy` and `--k` flags.
pub fn parse_policy(name: &str, k: u32) -> Result<ContextPolicy> {
    match name {
        "no-context" => Ok(ContextPolicy::NoContext),
        "uniform-k" => Ok(ContextPolicy::UniformKLimit { k }),
        "selective-kcfa" => Ok(ContextPolicy::SelectiveKcfa(SelectiveKcfa::new(k))),
        other => bail!(
            "unknown context policy `{other}` \
             (expected no-context, uniform-k or selective-kcfa)"
        ),
    }
}

/// Print collected log messages to stderr.
pub fn print_logs(logs: &[sparrow_lib::utils::log::LogMessage], quiet: bool) {
    if quiet {
        return;
    }
    for log in logs {
        eprintln!("{log}");
    }
}

/// Exit with a non-zero code on error, printing the error chain.
pub fn exit_with(result: Result<(), Error>) {
    if let Err(error) = result {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}
