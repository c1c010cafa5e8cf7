pub mod apply;
pub mod completions;
pub mod env;
pub mod plan;
pub mod verify_store;

use indicatif::{ProgressBar, ProgressStyle};
use stackgate_core::Engine;
use stackgate_runtime::{OutputSink, PrefixedSink};
use stackgate_schema::{Change, ChangeStatus, EnvironmentId};
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;

/// How a command reports progress and results.
#[derive(Debug, Clone, Copy)]
pub struct OutputMode {
    pub json: bool,
    pub quiet: bool,
}

impl OutputMode {
    pub fn new(json: bool, quiet: bool) -> Self {
        Self { json, quiet }
    }

    /// Engine output is streamed only for interactive, non-quiet runs.
    pub fn streams(self) -> bool {
        !self.json && !self.quiet
    }

    pub fn spinner(self, msg: &str) -> Option<ProgressBar> {
        (self.quiet && !self.json).then(|| spinner(msg))
    }
}

/// Discards engine output; results are reported once the run finishes.
struct SilentSink;

impl OutputSink for SilentSink {
    fn header(&mut self, _msg: &str) {}
    fn message(&mut self, _msg: &str) {}
    fn output(&mut self, _line: &str) {}
    fn error(&mut self, msg: &str) {
        tracing::debug!("{msg}");
    }
}

pub fn sink_for(mode: OutputMode) -> Box<dyn OutputSink> {
    if mode.streams() {
        Box::new(PrefixedSink::stdout())
    } else {
        Box::new(SilentSink)
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        pb.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn finish(pb: &ProgressBar, msg: String) {
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        pb.set_style(style);
    }
    pb.finish_with_message(msg);
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✗ {msg}"));
}

pub fn colorize_status(status: ChangeStatus) -> String {
    use console::Style;
    let text = status.to_string();
    match status {
        ChangeStatus::Pending => Style::new().yellow().apply_to(text).to_string(),
        ChangeStatus::Planned => Style::new().cyan().apply_to(text).to_string(),
        ChangeStatus::Applied => Style::new().green().apply_to(text).to_string(),
        ChangeStatus::PlanFailed | ChangeStatus::ApplyFailed => {
            Style::new().red().bold().apply_to(text).to_string()
        }
        ChangeStatus::SourceUnavailable => Style::new().magenta().apply_to(text).to_string(),
    }
}

/// Accepts a numeric id or an environment name.
pub fn resolve_env(engine: &Engine, input: &str) -> Result<EnvironmentId, String> {
    if let Ok(id) = input.parse::<EnvironmentId>() {
        if engine.get(id).is_ok() {
            return Ok(id);
        }
    }
    let envs = engine.list().map_err(|e| e.to_string())?;
    envs.iter()
        .find(|e| e.name == input)
        .map(|e| e.id)
        .ok_or_else(|| format!("no environment matching '{input}'"))
}

/// `KEY=VALUE` argument parser for `--var`.
pub fn parse_var(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{raw}'"));
    }
    Ok((key.to_owned(), value.to_owned()))
}

/// Print the outcome of a plan or apply and pick the exit code.
pub fn report_change(change: &Change, mode: OutputMode) -> Result<u8, String> {
    if mode.json {
        println!("{}", json_pretty(change)?);
    } else {
        println!(
            "change {} ({}): {}",
            change.id,
            change.revision,
            colorize_status(change.status)
        );
        if let Some(ref failure) = change.failure {
            println!("reason: {failure}");
        }
        if mode.quiet && !change.plan_output.is_empty() {
            println!();
            print!("{}", change.plan_output);
            if !change.plan_output.ends_with('\n') {
                println!();
            }
        }
    }
    if change.status.is_failure() {
        Ok(EXIT_FAILURE)
    } else {
        Ok(EXIT_SUCCESS)
    }
}
