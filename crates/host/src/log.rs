// crates/host/src/log.rs

//! Colored console output for pipeline events.

use std::fmt::Display;

use capgate_core::{GateVerdict, TaskRun};

// ANSI color codes
const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";

const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const BLUE: &str = "\x1b[34m";
const MAGENTA: &str = "\x1b[35m";
const CYAN: &str = "\x1b[36m";

/// Component for colored prefixes.
#[derive(Clone, Copy)]
pub enum Component {
    Runtime,
    Gate,
    Oracle,
}

impl Component {
    fn color(&self) -> &'static str {
        match self {
            Component::Runtime => BLUE,
            Component::Gate => CYAN,
            Component::Oracle => MAGENTA,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Component::Runtime => "Runtime",
            Component::Gate => "Gate",
            Component::Oracle => "Oracle",
        }
    }
}

fn prefix(component: Component) -> String {
    format!("{}{BOLD}[{}]{RESET}", component.color(), component.name())
}

/// Log a gate verdict with one line per failed case.
pub fn verdict(name: &str, verdict: &GateVerdict) {
    let (symbol, color) = if verdict.passed {
        ("✓", GREEN)
    } else {
        ("✗", RED)
    };
    eprintln!(
        "{} {color}{symbol} {}{RESET} {DIM}pass rate {:.0}% ({}/{}), need {:.0}%{RESET}",
        prefix(Component::Gate),
        name,
        verdict.pass_rate * 100.0,
        verdict.passed_count,
        verdict.total_count,
        verdict.threshold * 100.0
    );
    if let Some(err) = &verdict.error {
        eprintln!("    {RED}{}{RESET}", truncate(err, 200));
    }
    for outcome in verdict.results.iter().filter(|r| !r.passed) {
        let detail = outcome
            .error
            .clone()
            .or_else(|| outcome.output.as_ref().map(|v| v.to_string()))
            .unwrap_or_default();
        eprintln!(
            "    {YELLOW}- {}{RESET} {DIM}expected {}, got {}: {}{RESET}",
            outcome.label,
            outcome.expected_success,
            outcome.actual_success,
            truncate(&detail, 150)
        );
    }
}

/// Log which capability handled a task and how it went.
pub fn task_run(run: &TaskRun) {
    let Some(cap) = &run.capability else {
        eprintln!(
            "{} {YELLOW}no capability matched{RESET} {DIM}{}{RESET}",
            prefix(Component::Runtime),
            truncate(&run.task, 100)
        );
        return;
    };
    let elapsed = run
        .result
        .as_ref()
        .map(|r| r.elapsed.as_millis())
        .unwrap_or_default();
    let (symbol, color) = if run.success {
        ("✓", GREEN)
    } else {
        ("✗", RED)
    };
    eprintln!(
        "{} {CYAN}→ {} v{}{RESET} {color}{symbol}{RESET} {DIM}({} ms){RESET}",
        prefix(Component::Runtime),
        cap.name,
        cap.version,
        elapsed
    );
}

/// Log an oracle attempt.
pub fn attempt(attempt: usize, max: usize, description: &str) {
    eprintln!(
        "{} {DIM}attempt {}/{}{RESET} {}",
        prefix(Component::Oracle),
        attempt,
        max,
        truncate(description, 100)
    );
}

/// Log an error.
pub fn error(component: Component, message: impl Display) {
    eprintln!("{} {RED}✗ Error:{RESET} {}", prefix(component), message);
}

/// Log info message.
pub fn info(message: impl Display) {
    eprintln!("{DIM}[info]{RESET} {}", message);
}

/// Log a warning.
pub fn warn(message: impl Display) {
    eprintln!("{YELLOW}[warn]{RESET} {}", message);
}

/// Log success.
pub fn success(message: impl Display) {
    eprintln!("{GREEN}[ok]{RESET} {}", message);
}

/// Truncate and clean string for display.
fn truncate(s: &str, max: usize) -> String {
    let clean: String = s
        .chars()
        .filter(|c| !c.is_control() || *c == ' ')
        .collect();
    let trimmed = clean.trim();
    if trimmed.chars().count() > max {
        let cut: String = trimmed.chars().take(max).collect();
        format!("{}...", cut)
    } else {
        trimmed.to_string()
    }
}
