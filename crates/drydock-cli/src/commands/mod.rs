pub mod apply;
pub mod completions;
pub mod destroy;
pub mod plan;
pub mod status;
pub mod taint;

use console::Style;
use drydock_core::{CoreError, Event, EventKind, Subscription};
use drydock_schema::VariableSet;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use drydock_core::{EXIT_CANCELLED, EXIT_FAILURE, EXIT_INVALID_CONFIG, EXIT_SUCCESS};

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    pb.set_style(style);
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn plain_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_status(status: &str) -> String {
    match status {
        "created" => Style::new().green().apply_to(status).to_string(),
        "tainted" => Style::new().yellow().apply_to(status).to_string(),
        "failed" => Style::new().red().bold().apply_to(status).to_string(),
        "disabled" => Style::new().dim().apply_to(status).to_string(),
        other => other.to_owned(),
    }
}

/// Parse repeated `--var name=value` flags.
pub fn parse_vars(raw: &[String]) -> Result<VariableSet, CoreError> {
    let mut vars = VariableSet::new();
    for entry in raw {
        let Some((name, value)) = entry.split_once('=') else {
            return Err(CoreError::Config(format!(
                "invalid variable '{entry}': expected NAME=VALUE"
            )));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(CoreError::Config(format!(
                "invalid variable '{entry}': empty name"
            )));
        }
        vars.set(name, serde_json::Value::String(value.to_owned()));
    }
    Ok(vars)
}

/// Print an engine error and return the exit status it maps to.
pub fn report_error(error: &CoreError, json: bool) -> u8 {
    if json {
        let payload = serde_json::json!({
            "error": error.to_string(),
            "exit_code": error.exit_code(),
        });
        if let Ok(s) = json_pretty(&payload) {
            println!("{s}");
        }
    } else if let CoreError::Failed(report) = error {
        eprintln!("error: {report}");
        for failure in report.failures() {
            eprintln!("  {} {failure}", Style::new().red().apply_to("✗"));
        }
    } else {
        eprintln!("error: {error}");
    }
    error.exit_code()
}

fn render_event(pb: &ProgressBar, event: &Event) {
    let id = &event.id;
    match event.event {
        EventKind::Parsed => {}
        EventKind::Creating | EventKind::Destroying | EventKind::Refreshing => {
            pb.set_message(format!("{} {id}", event.event));
        }
        EventKind::Created => {
            pb.println(format!("{} created {id}", Style::new().green().apply_to("✓")));
        }
        EventKind::Destroyed => {
            pb.println(format!("{} destroyed {id}", Style::new().green().apply_to("✓")));
        }
        EventKind::Refreshed => {
            pb.println(Style::new().dim().apply_to(format!("  refreshed {id}")).to_string());
        }
        EventKind::CreateFailed | EventKind::DestroyFailed | EventKind::RefreshFailed => {
            pb.println(format!(
                "{} {} {id}: {}",
                Style::new().red().apply_to("✗"),
                event.event,
                event.error.as_deref().unwrap_or("unknown error")
            ));
        }
    }
}

/// Renders lifecycle events above a spinner until finished.
pub struct EventPrinter {
    done: CancellationToken,
    task: JoinHandle<()>,
}

impl EventPrinter {
    pub fn start(mut events: Subscription, pb: ProgressBar) -> Self {
        let done = CancellationToken::new();
        let stop = done.clone();
        let task = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    event = events.recv() => event,
                    () = stop.cancelled() => break,
                };
                let Some(event) = next else { break };
                render_event(&pb, &event);
            }
            for event in events.drain() {
                render_event(&pb, &event);
            }
        });
        Self { done, task }
    }

    pub async fn finish(self) {
        self.done.cancel();
        if let Err(e) = self.task.await {
            tracing::debug!("event printer stopped abnormally: {e}");
        }
    }
}
