use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use appsweep_core::{
    AggregateResult, Checkpoint, CheckpointOutcome, OperationKind, OperationOutcome,
};
use appsweep_engine::{PackageStatus, ProgressSink, UnusedPackage};
use indicatif::{HumanCount, ProgressBar, ProgressStyle};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn resolve_output_style(stdout_is_terminal: bool, no_color: bool) -> OutputStyle {
    if stdout_is_terminal && !no_color {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub(crate) fn current_output_style() -> OutputStyle {
    let no_color = std::env::var_os("NO_COLOR").is_some_and(|value| !value.is_empty());
    resolve_output_style(std::io::stdout().is_terminal(), no_color)
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "fail" => "[ERR]",
        _ => "[..]",
    }
}

pub(crate) fn print_section(style: OutputStyle, title: &str) {
    if style == OutputStyle::Plain {
        return;
    }
    println!();
    println!("{}", colorize(section_style(), &format!("== {title} ==")));
}

pub(crate) fn format_checkpoint_line(style: OutputStyle, checkpoint: &Checkpoint) -> String {
    match &checkpoint.outcome {
        CheckpointOutcome::Created => render_status_line(
            style,
            "ok",
            &format!("restore point created: {}", checkpoint.description),
        ),
        CheckpointOutcome::SkippedServiceUnavailable => render_status_line(
            style,
            "warn",
            "restore point skipped: the restore service is unavailable",
        ),
        CheckpointOutcome::Failed(failure) => render_status_line(
            style,
            "warn",
            &format!("restore point failed: {failure} ({})", failure.advice()),
        ),
    }
}

fn success_verb(operation: OperationKind) -> &'static str {
    match operation {
        OperationKind::Remove => "removed",
        OperationKind::Reinstall => "reinstalled",
        OperationKind::RestoreDefaults => "restored",
    }
}

fn format_outcome_lines(
    style: OutputStyle,
    operation: OperationKind,
    outcome: &OperationOutcome,
) -> Vec<String> {
    let mut lines = Vec::new();
    if outcome.is_success() {
        let message = if outcome.already_present {
            format!("{}: already installed", outcome.package_id)
        } else if let Some(strategy) = outcome.strategy_used {
            format!(
                "{}: {} via {strategy}",
                outcome.package_id,
                success_verb(operation)
            )
        } else {
            format!("{}: {}", outcome.package_id, success_verb(operation))
        };
        lines.push(render_status_line(style, "ok", &message));
        for target in &outcome.cleanup_failures {
            lines.push(render_status_line(
                style,
                "warn",
                &format!("{}: could not purge {target}", outcome.package_id),
            ));
        }
        return lines;
    }

    let reason = outcome
        .failure
        .map(|failure| failure.as_str())
        .unwrap_or("failed");
    let message = match outcome.diagnostic.as_deref() {
        Some(diagnostic) => format!("{}: {reason} ({diagnostic})", outcome.package_id),
        None => format!("{}: {reason}", outcome.package_id),
    };
    lines.push(render_status_line(style, "fail", &message));
    lines
}

pub(crate) fn format_aggregate_lines(style: OutputStyle, result: &AggregateResult) -> Vec<String> {
    let mut lines = Vec::new();
    if result.aborted.is_some() {
        lines.push(render_status_line(
            style,
            "fail",
            &format!(
                "{} requires administrator rights; rerun elevated or pass --elevate",
                result.operation.as_str()
            ),
        ));
        lines.push(result.summary_line());
        return lines;
    }

    if let Some(checkpoint) = &result.checkpoint {
        lines.push(format_checkpoint_line(style, checkpoint));
    }
    for outcome in &result.per_package {
        lines.extend(format_outcome_lines(style, result.operation, outcome));
    }
    for tweak in &result.tweaks {
        lines.push(if tweak.applied {
            render_status_line(style, "ok", &format!("applied {}", tweak.tweak_id))
        } else {
            render_status_line(
                style,
                "warn",
                &format!(
                    "could not apply {}: {}",
                    tweak.tweak_id,
                    tweak.diagnostic.as_deref().unwrap_or("unknown error")
                ),
            )
        });
    }
    if result.cancelled {
        lines.push(render_status_line(style, "warn", "cancelled before every package was processed"));
    }
    lines.push(result.summary_line());
    if let Some(advisory) = result.advisory() {
        lines.push(render_status_line(style, "warn", advisory));
    }
    lines
}

pub(crate) fn format_status_lines(statuses: &[PackageStatus]) -> Vec<String> {
    let width = statuses
        .iter()
        .map(|status| status.id.len())
        .max()
        .unwrap_or(0);
    statuses
        .iter()
        .map(|status| {
            let state = if status.installed {
                "installed"
            } else {
                "missing"
            };
            format!("{:<width$}  {state:<9}  {}", status.id, status.description)
        })
        .collect()
}

pub(crate) fn format_unused_lines(packages: &[UnusedPackage], days: u32) -> Vec<String> {
    if packages.is_empty() {
        return vec![format!("No packages unused for {days}+ days")];
    }
    packages
        .iter()
        .map(|package| match package.last_used {
            Some(last_used) => format!(
                "{}  {} days  last used {}  launches {}",
                package.name,
                package.days_since_used,
                last_used.format("%Y-%m-%d %H:%M:%S"),
                package.launch_count
            ),
            None => format!("{}  never used or unknown", package.name),
        })
        .collect()
}

/// Progress bar for one sweep. Inert in plain mode.
pub(crate) struct TerminalProgress {
    style: OutputStyle,
    label: String,
    total: u64,
    current: u64,
    progress_bar: Option<ProgressBar>,
    started_at: Instant,
}

impl TerminalProgress {
    pub(crate) fn new(style: OutputStyle, label: &str) -> Self {
        Self {
            style,
            label: label.to_string(),
            total: 0,
            current: 0,
            progress_bar: None,
            started_at: Instant::now(),
        }
    }

    pub(crate) fn finish(mut self) {
        let Some(progress_bar) = self.progress_bar.take() else {
            return;
        };
        progress_bar.finish_and_clear();
        if let Some(line) = render_progress_line(
            self.style,
            &self.label,
            self.current,
            self.total,
            Some(self.started_at.elapsed()),
        ) {
            println!("{line}");
        }
    }
}

impl ProgressSink for TerminalProgress {
    fn sweep_started(&mut self, _operation: OperationKind, total: usize) {
        self.total = total as u64;
        self.started_at = Instant::now();
        if self.style != OutputStyle::Rich {
            return;
        }
        let progress_bar = ProgressBar::new(self.total.max(1));
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.cyan.bold} {prefix:<16} [{bar:20.cyan/blue}] {pos:>3}/{len:3} {msg}",
        ) {
            progress_bar.set_style(style.tick_chars("\\|/- ").progress_chars("=>-"));
        }
        progress_bar.set_prefix(self.label.clone());
        progress_bar.enable_steady_tick(Duration::from_millis(80));
        self.progress_bar = Some(progress_bar);
    }

    fn package_started(&mut self, id: &str) {
        if let Some(progress_bar) = &self.progress_bar {
            progress_bar.set_message(id.to_string());
        }
    }

    fn package_finished(&mut self, _outcome: &OperationOutcome) {
        self.current = (self.current + 1).min(self.total);
        if let Some(progress_bar) = &self.progress_bar {
            progress_bar.set_position(self.current);
        }
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn progress_label_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

fn progress_bar_style() -> Style {
    Style::new().fg_color(Some(AnsiColor::BrightBlue.into()))
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

pub(crate) fn render_progress_line(
    style: OutputStyle,
    label: &str,
    current: u64,
    total: u64,
    elapsed: Option<Duration>,
) -> Option<String> {
    if style == OutputStyle::Plain {
        return None;
    }

    let width = 18_usize;
    let safe_total = total.max(1);
    let bounded_current = current.min(safe_total);
    let filled = ((bounded_current as usize) * width) / (safe_total as usize);
    let bar = format!(
        "{}{}",
        "=".repeat(filled),
        "-".repeat(width.saturating_sub(filled))
    );
    let percent = (bounded_current * 100) / safe_total;
    let counts = format!("{}/{}", HumanCount(current), HumanCount(total));
    let suffix = elapsed
        .map(|value| format!(" complete in {}", format_elapsed(value)))
        .unwrap_or_default();

    Some(format!(
        "{} [{}] {:>3}% {}{}",
        colorize(progress_label_style(), label),
        colorize(progress_bar_style(), &bar),
        percent,
        counts,
        suffix
    ))
}
