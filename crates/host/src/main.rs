mod learn;
mod log;

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use capgate_core::foundry_client::FoundryClient;
use capgate_core::synthesis::OracleSynthesizer;
use capgate_core::{Arguments, Pipeline, PipelineConfig};

use crate::log::Component;

const HELP: &str = "\
Commands:
  <task> [{json args}]   run the best matching capability
  :list                  list stored capabilities
  :show <name>           show a capability's definition
  :history <name>        list archived versions
  :delete <name>         archive and remove a capability
  :recall <text>         past experiences related to <text>
  :learn <description>   synthesize, test and store a new capability
  quit                   exit";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let config = PipelineConfig::from_env()?;
    let pipeline = Pipeline::open(config)?;
    let installed = pipeline
        .install_builtins()
        .context("failed to install built-in capabilities")?;
    if installed > 0 {
        log::info(format!("installed {} built-in capabilities", installed));
    }

    let oracle = match FoundryClient::from_env() {
        Ok(client) => Some(OracleSynthesizer::new(client)),
        Err(e) => {
            log::warn(format!("learning disabled: {}", e));
            None
        }
    };

    println!("Loaded {} capabilities.", pipeline.store().len());
    println!("\nCapability Gate");
    println!("Type a task, or :help for commands. Type 'quit' to exit.\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut input = String::new();
        if stdin.lock().read_line(&mut input)? == 0 {
            break;
        }
        let line = input.trim();

        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("quit") || line.eq_ignore_ascii_case("exit") {
            println!("Goodbye!");
            break;
        }

        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        let outcome = match command {
            ":help" => {
                println!("{}", HELP);
                Ok(())
            }
            ":list" => {
                list(&pipeline);
                Ok(())
            }
            ":show" => show(&pipeline, rest),
            ":history" => {
                history(&pipeline, rest);
                Ok(())
            }
            ":delete" => delete(&pipeline, rest),
            ":recall" => {
                recall(&pipeline, rest);
                Ok(())
            }
            ":learn" => match &oracle {
                Some(oracle) => {
                    learn::learn(&pipeline, oracle, rest, "requested from the console").map(
                        |committed| match committed {
                            Some(cap) => log::success(format!(
                                "learned {} v{}: {}",
                                cap.name, cap.version, cap.description
                            )),
                            None => log::warn("nothing learned"),
                        },
                    )
                }
                None => {
                    log::warn("set FOUNDRY_ENDPOINT, FOUNDRY_DEPLOYMENT and FOUNDRY_API_KEY to learn");
                    Ok(())
                }
            },
            _ if command.starts_with(':') => {
                log::warn(format!("unknown command {}, try :help", command));
                Ok(())
            }
            _ => run_task(&pipeline, line),
        };

        if let Err(e) = outcome {
            log::error(Component::Runtime, format!("{:#}", e));
        }
    }

    Ok(())
}

fn list(pipeline: &Pipeline) {
    for cap in pipeline.store().list() {
        println!(
            "  - {} v{} [{:?}] {}",
            cap.name, cap.version, cap.provenance, cap.description
        );
    }
}

fn show(pipeline: &Pipeline, name: &str) -> Result<()> {
    match pipeline.store().get(name) {
        Some(cap) => {
            println!("{}", serde_json::to_string_pretty(cap.as_ref())?);
        }
        None => log::warn(format!("no capability named '{}'", name)),
    }
    Ok(())
}

fn history(pipeline: &Pipeline, name: &str) {
    let entries = pipeline.store().history(name);
    if entries.is_empty() {
        println!("  (no archived versions)");
    }
    for entry in entries {
        println!(
            "  - {} v{} archived {}",
            entry.stamp,
            entry.capability.version,
            entry.archived_at.to_rfc3339()
        );
    }
}

fn delete(pipeline: &Pipeline, name: &str) -> Result<()> {
    match pipeline.store().delete(name)? {
        Some(cap) => log::success(format!("deleted {} v{} (archived)", cap.name, cap.version)),
        None => log::warn(format!("no capability named '{}'", name)),
    }
    Ok(())
}

fn recall(pipeline: &Pipeline, text: &str) {
    for exp in pipeline.recall(text, 5) {
        let mark = if exp.success { "✓" } else { "✗" };
        println!(
            "  {} [{}] {} {}",
            mark,
            exp.timestamp.format("%Y-%m-%d %H:%M"),
            exp.task,
            exp.learned.join("; ")
        );
    }
}

fn run_task(pipeline: &Pipeline, line: &str) -> Result<()> {
    let (task, arguments) = split_task(line);

    let nearest = pipeline.rank(task, 3);
    if !nearest.is_empty() {
        println!("\nNearest capabilities:");
        for (cap, score) in &nearest {
            println!("  - {} (score = {})", cap.name, score);
        }
    }

    let run = pipeline.run_task(task, &arguments)?;
    log::task_run(&run);
    if let Some(result) = &run.result {
        match (&result.output, &result.error) {
            (Some(output), _) => println!("\n{}\n", serde_json::to_string_pretty(output)?),
            (None, Some(error)) => println!("\n[ERROR] {}\n", error),
            (None, None) => println!(),
        }
    }
    Ok(())
}

/// Split a console line into task text and a trailing JSON object of arguments.
fn split_task(line: &str) -> (&str, Arguments) {
    for (idx, _) in line.match_indices('{') {
        if let Ok(Value::Object(arguments)) = serde_json::from_str(&line[idx..]) {
            return (line[..idx].trim(), arguments);
        }
    }
    (line, Arguments::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trailing_json_becomes_arguments() {
        let (task, args) = split_task(r#"evaluate math {"expression": "1 + {2}"}"#);
        assert_eq!(task, "evaluate math");
        assert_eq!(args.get("expression"), Some(&json!("1 + {2}")));
    }

    #[test]
    fn plain_line_has_no_arguments() {
        let (task, args) = split_task("analyze text {broken");
        assert_eq!(task, "analyze text {broken");
        assert!(args.is_empty());
    }
}
