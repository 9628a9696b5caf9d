//! Structs and functions for generating log messages and analysis reports.
//!
//! The analyses never print directly: non-fatal conditions (missing external
//! annotations, out-of-range argument indices, unmodeled instruction kinds)
//! become [`LogMessage`]s collected alongside the analysis result, and the
//! driver decides where they go. Fatal conditions use `anyhow::Error` instead.

use crate::prelude::*;
use std::collections::BTreeMap;

/// A generic log message.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub struct LogMessage {
    /// The log message.
    pub text: String,
    /// The severity/type of the log message.
    pub level: LogLevel,
    /// The program location the message is related to, already rendered.
    pub location: Option<String>,
    /// The analysis where the message originated.
    pub source: Option<&'static str>,
}

impl LogMessage {
    /// Create a new `Info`-level log message.
    pub fn new_info(text: impl Into<String>) -> LogMessage {
        LogMessage {
            text: text.into(),
            level: LogLevel::Info,
            location: None,
            source: None,
        }
    }

    /// Create a new `Debug`-level log message.
    pub fn new_debug(text: impl Into<String>) -> LogMessage {
        LogMessage {
            text: text.into(),
            level: LogLevel::Debug,
            location: None,
            source: None,
        }
    }

    /// Create a new `Error`-level log message.
    pub fn new_error(text: impl Into<String>) -> LogMessage {
        LogMessage {
            text: text.into(),
            level: LogLevel::Error,
            location: None,
            source: None,
        }
    }

    /// Associate a specific location to the log message.
    pub fn location(mut self, location: impl Into<String>) -> LogMessage {
        self.location = Some(location.into());
        self
    }

    /// Set the name of the source analysis for the log message.
    pub fn source(mut self, source: &'static str) -> LogMessage {
        self.source = Some(source);
        self
    }
}

/// The severity/type of a log message.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub enum LogLevel {
    /// Messages intended for debugging.
    Debug,
    /// Errors encountered during analysis.
    Error,
    /// Non-error messages intended for the user.
    Info,
}

impl std::fmt::Display for LogMessage {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.level {
            LogLevel::Debug => write!(formatter, "DEBUG: ")?,
            LogLevel::Error => write!(formatter, "ERROR: ")?,
            LogLevel::Info => write!(formatter, "INFO: ")?,
        };
        match (&self.source, &self.location) {
            (Some(source), Some(location)) => write!(formatter, "{source} @ {location}: ")?,
            (Some(source), None) => write!(formatter, "{source}: ")?,
            (None, Some(location)) => write!(formatter, "{location}: ")?,
            (None, None) => (),
        };
        write!(formatter, "{}", self.text)
    }
}

/// Print all provided log messages and the report.
///
/// Log messages will always be printed to `stderr`. The report will either be
/// printed to `stdout` or to the file path provided in `out_path`. If
/// `emit_json` is set, `json_report` is used for the output instead of the
/// plain-text `report`.
pub fn print_all_messages(
    logs: &[LogMessage],
    report: &str,
    json_report: Option<&serde_json::Value>,
    out_path: Option<&str>,
    emit_json: bool,
) -> Result<()> {
    for log in logs {
        eprintln!("{log}");
    }
    let output = if emit_json {
        let json = json_report.ok_or_else(|| anyhow!("no JSON report available"))?;
        serde_json::to_string_pretty(json)? + "\n"
    } else {
        report.to_string()
    };
    if let Some(file_path) = out_path {
        std::fs::write(file_path, output)
            .with_context(|| format!("writing to output path {file_path} failed"))?;
    } else {
        print!("{output}");
    }
    Ok(())
}

/// For each analysis count the number of debug log messages in `all_logs`
/// and add an `Info`-level log message with the resulting number to
/// `all_logs`.
pub fn add_debug_log_statistics(all_logs: &mut Vec<LogMessage>) {
    let mut per_analysis: BTreeMap<&'static str, u64> = BTreeMap::new();
    let mut general = 0u64;
    for log in all_logs.iter().filter(|log| log.level == LogLevel::Debug) {
        match log.source {
            Some(analysis) => *per_analysis.entry(analysis).or_insert(0) += 1,
            None => general += 1,
        }
    }
    for (analysis, count) in per_analysis {
        all_logs.push(LogMessage::new_info(format!("Logged {count} debug log messages.")).source(analysis));
    }
    if general > 0 {
        all_logs.push(LogMessage::new_info(format!(
            "Logged {general} general debug log messages."
        )));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_format() {
        let msg = LogMessage::new_error("annotation missing")
            .source("taint")
            .location("main:fn0:bb0:i2");
        assert_eq!(
            format!("{msg}"),
            "ERROR: taint @ main:fn0:bb0:i2: annotation missing"
        );
    }

    #[test]
    fn debug_statistics() {
        let mut logs = vec![
            LogMessage::new_debug("a").source("pointer"),
            LogMessage::new_debug("b").source("pointer"),
            LogMessage::new_debug("c"),
        ];
        add_debug_log_statistics(&mut logs);
        assert!(logs
            .iter()
            .any(|l| l.level == LogLevel::Info && l.text.contains("2 debug log messages")));
        assert!(logs
            .iter()
            .any(|l| l.level == LogLevel::Info && l.text.contains("1 general debug log")));
    }
}
