// crates/core/src/capability_runner.rs

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::syntax_check;
use crate::types::{Arguments, ExecutionResult, FailureKind};

const POLL_INTERVAL: Duration = Duration::from_millis(5);
/// How long to wait for pipe readers once the child has been reaped.
const READER_GRACE: Duration = Duration::from_millis(250);
const NO_OUTPUT: &str = "no output";
const REPORTED_FAILURE: &str = "capability reported failure";
const LOST_ENVELOPE: &str = "output exceeded capture limit without a result envelope";
const ELISION: &str = "\n...\n";

/// Something that can statically check and run capability source.
pub trait Executor {
    /// Static check of `source` without running it.
    fn check_syntax(&self, entry_point: &str, source: &str) -> Result<(), String>;

    /// Run `entry_point(**arguments)` defined in `source`. Never fails; every
    /// problem is folded into the returned result.
    fn execute(
        &self,
        entry_point: &str,
        source: &str,
        arguments: &Arguments,
        deadline: Duration,
    ) -> ExecutionResult;
}

impl<E: Executor + ?Sized> Executor for &E {
    fn check_syntax(&self, entry_point: &str, source: &str) -> Result<(), String> {
        (**self).check_syntax(entry_point, source)
    }

    fn execute(
        &self,
        entry_point: &str,
        source: &str,
        arguments: &Arguments,
        deadline: Duration,
    ) -> ExecutionResult {
        (**self).execute(entry_point, source, arguments, deadline)
    }
}

/// Runs Python capabilities in a fresh child process per call.
///
/// Contract:
/// - The capability source plus a small harness is written to a temp file
/// - Keyword arguments are passed as JSON via stdin
/// - The harness prints `{"ok", "output", "error"}` as the last stdout line
/// - The child is killed when the deadline expires
/// - Each stream keeps its first and last `max_output_bytes`; the middle of a
///   larger stream is dropped
///
/// The process boundary is the only isolation: it contains crashes, hangs and
/// runaway memory, not a hostile author.
#[derive(Debug, Clone)]
pub struct CapabilityRunner {
    interpreter: String,
    max_output_bytes: usize,
    work_dir: Option<PathBuf>,
}

impl CapabilityRunner {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            max_output_bytes: crate::config::DEFAULT_MAX_OUTPUT_BYTES,
            work_dir: None,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            max_output_bytes: config.max_output_bytes,
            work_dir: None,
        }
    }

    /// Place harness files in `dir` instead of the system temp directory.
    pub fn with_work_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn interpreter(&self) -> &str {
        &self.interpreter
    }

    fn write_script(&self, script: &str) -> std::io::Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("capgate-").suffix(".py");
        let mut file = match &self.work_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.write_all(script.as_bytes())?;
        file.flush()?;
        Ok(file)
    }

    fn run_script(&self, script: &Path, input: Vec<u8>, deadline: Duration) -> ExecutionResult {
        let start = Instant::now();
        let mut child = match Command::new(&self.interpreter)
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return ExecutionResult::failure(
                    FailureKind::EngineFault,
                    format!("failed to spawn '{}': {}", self.interpreter, e),
                    start.elapsed(),
                );
            }
        };
        debug!(pid = child.id(), script = %script.display(), "spawned capability process");

        // Feed stdin from its own thread so a child that never reads cannot block us.
        if let Some(mut stdin) = child.stdin.take() {
            thread::spawn(move || {
                if let Err(e) = stdin.write_all(&input) {
                    debug!(error = %e, "capability process did not consume its input");
                }
            });
        }
        let stdout = child
            .stdout
            .take()
            .map(|s| Reader::spawn(s, self.max_output_bytes));
        let stderr = child
            .stderr
            .take()
            .map(|s| Reader::spawn(s, self.max_output_bytes));

        let waited = wait_with_deadline(&mut child, start, deadline);
        let elapsed = start.elapsed();

        match waited {
            Wait::Exited(status) => {
                let stdout = stdout.map(Reader::finish).unwrap_or_default();
                let stderr = stderr.map(Reader::finish).unwrap_or_default();
                debug!(?status, elapsed_ms = elapsed.as_millis() as u64, "capability process exited");
                interpret_captured(&stdout, &stderr, elapsed)
            }
            Wait::TimedOut => ExecutionResult::failure(
                FailureKind::Timeout,
                format!("timed out after {}s", deadline.as_secs_f64()),
                elapsed,
            ),
            Wait::Failed(e) => ExecutionResult::failure(
                FailureKind::EngineFault,
                format!("failed to wait on capability process: {}", e),
                elapsed,
            ),
        }
    }
}

impl Executor for CapabilityRunner {
    fn check_syntax(&self, entry_point: &str, source: &str) -> Result<(), String> {
        validate_entry_point(entry_point)?;
        syntax_check::check_module(source)
    }

    fn execute(
        &self,
        entry_point: &str,
        source: &str,
        arguments: &Arguments,
        deadline: Duration,
    ) -> ExecutionResult {
        if let Err(e) = validate_entry_point(entry_point) {
            return ExecutionResult::failure(FailureKind::EngineFault, e, Duration::ZERO);
        }
        let input = match serde_json::to_vec(arguments) {
            Ok(bytes) => bytes,
            Err(e) => {
                return ExecutionResult::failure(
                    FailureKind::EngineFault,
                    format!("failed to encode arguments: {}", e),
                    Duration::ZERO,
                );
            }
        };
        let file = match self.write_script(&build_script(entry_point, source)) {
            Ok(file) => file,
            Err(e) => {
                return ExecutionResult::failure(
                    FailureKind::EngineFault,
                    format!("failed to write harness file: {}", e),
                    Duration::ZERO,
                );
            }
        };

        let result = self.run_script(file.path(), input, deadline);

        let path = file.path().to_path_buf();
        if let Err(e) = file.close() {
            warn!(path = %path.display(), error = %e, "failed to remove harness file");
        }
        result
    }
}

enum Wait {
    Exited(ExitStatus),
    TimedOut,
    Failed(std::io::Error),
}

fn wait_with_deadline(child: &mut Child, start: Instant, deadline: Duration) -> Wait {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Wait::Exited(status),
            Ok(None) => {}
            Err(e) => {
                terminate(child);
                return Wait::Failed(e);
            }
        }
        let waited = start.elapsed();
        if waited >= deadline {
            terminate(child);
            return Wait::TimedOut;
        }
        thread::sleep(POLL_INTERVAL.min(deadline - waited));
    }
}

/// Kill and reap the child. A failed kill is logged and we move on without
/// blocking on a process we could not stop.
fn terminate(child: &mut Child) {
    let pid = child.id();
    if let Err(e) = child.kill() {
        warn!(pid, error = %e, "failed to kill capability process");
        if let Err(e) = child.try_wait() {
            warn!(pid, error = %e, "failed to reap capability process");
        }
        return;
    }
    if let Err(e) = child.wait() {
        warn!(pid, error = %e, "failed to reap capability process");
    }
}

/// Bytes kept from one output stream.
#[derive(Debug, Default)]
struct Captured {
    head: Vec<u8>,
    tail: VecDeque<u8>,
    /// Bytes between head and tail were discarded.
    dropped: bool,
}

impl Captured {
    fn push(&mut self, mut chunk: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.head.len());
        if room > 0 {
            let take = chunk.len().min(room);
            self.head.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];
        }
        self.tail.extend(chunk);
        if self.tail.len() > limit {
            let excess = self.tail.len() - limit;
            self.tail.drain(..excess);
            self.dropped = true;
        }
    }

    fn tail_text(&self) -> String {
        let (a, b) = self.tail.as_slices();
        let mut bytes = Vec::with_capacity(a.len() + b.len());
        bytes.extend_from_slice(a);
        bytes.extend_from_slice(b);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn text(&self) -> String {
        let head = String::from_utf8_lossy(&self.head);
        if self.dropped {
            format!("{}{}{}", head, ELISION, self.tail_text())
        } else {
            format!("{}{}", head, self.tail_text())
        }
    }
}

/// Drains a pipe on its own thread into a shared bounded buffer.
struct Reader {
    captured: Arc<Mutex<Captured>>,
    done: Receiver<()>,
}

impl Reader {
    fn spawn<R: Read + Send + 'static>(mut stream: R, limit: usize) -> Self {
        let captured = Arc::new(Mutex::new(Captured::default()));
        let (tx, done) = mpsc::channel();
        let sink = Arc::clone(&captured);
        thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => sink.lock().push(&buf[..n], limit),
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            // Receiver may already be gone if the grace period elapsed.
            let _ = tx.send(());
        });
        Self { captured, done }
    }

    /// Take what was read so far. A descendant that inherited the pipe can keep
    /// it open past the child's exit, so waiting for EOF is bounded.
    fn finish(self) -> Captured {
        if self.done.recv_timeout(READER_GRACE).is_err() {
            debug!("output pipe still open after exit, keeping what was read");
        }
        std::mem::take(&mut *self.captured.lock())
    }
}

/// Shape of the line the harness prints.
#[derive(Debug, Deserialize)]
struct WireEnvelope {
    ok: bool,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

impl WireEnvelope {
    fn into_result(self, elapsed: Duration) -> ExecutionResult {
        if self.ok {
            return ExecutionResult::success(self.output, elapsed);
        }
        let error = self
            .error
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| REPORTED_FAILURE.to_string());
        ExecutionResult::failure(FailureKind::RuntimeFailure, error, elapsed)
    }
}

fn parse_envelope(text: &str) -> Option<WireEnvelope> {
    serde_json::from_str(text).ok()
}

/// Interpret bounded captures. When stdout lost its middle, only a complete
/// envelope on the last kept line counts; the remains of raw text are not a
/// trustworthy result.
fn interpret_captured(stdout: &Captured, stderr: &Captured, elapsed: Duration) -> ExecutionResult {
    if !stdout.dropped {
        return interpret_output(&stdout.text(), &stderr.text(), elapsed);
    }
    let tail = stdout.tail_text();
    match tail
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .and_then(parse_envelope)
    {
        Some(envelope) => envelope.into_result(elapsed),
        None => ExecutionResult::failure(FailureKind::EngineFault, LOST_ENVELOPE, elapsed),
    }
}

/// Turn the child's captured streams into a result envelope.
fn interpret_output(stdout: &str, stderr: &str, elapsed: Duration) -> ExecutionResult {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        let err = stderr.trim();
        let err = if err.is_empty() { NO_OUTPUT } else { err };
        return ExecutionResult::failure(FailureKind::RuntimeFailure, err, elapsed);
    }

    let envelope = parse_envelope(trimmed).or_else(|| {
        trimmed
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .and_then(parse_envelope)
    });

    match envelope {
        Some(envelope) => envelope.into_result(elapsed),
        // A capability that prints plain text still ran to completion.
        None => ExecutionResult::success(Some(Value::String(trimmed.to_string())), elapsed),
    }
}

/// The entry point is spliced into the harness, so it must be a bare identifier.
fn validate_entry_point(entry_point: &str) -> Result<(), String> {
    let mut chars = entry_point.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(format!("invalid entry point '{}'", entry_point))
    }
}

fn build_script(entry_point: &str, source: &str) -> String {
    format!(
        r#"{source}


def __capgate_main():
    import json as _json
    import sys as _sys
    try:
        _kwargs = _json.loads(_sys.stdin.read() or "{{}}")
        _result = {entry_point}(**_kwargs)
    except Exception as _exc:
        _line = _json.dumps({{"ok": False, "output": None, "error": "%s: %s" % (type(_exc).__name__, _exc)}})
    else:
        try:
            _line = _json.dumps({{"ok": True, "output": _result, "error": None}}, default=str, allow_nan=False)
        except ValueError as _exc:
            _line = _json.dumps({{"ok": False, "output": None, "error": "output is not valid JSON: %s" % _exc}})
    _sys.stdout.write("\n" + _line + "\n")
    _sys.stdout.flush()


__capgate_main()
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn python_available() -> bool {
        let ok = Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if !ok {
            eprintln!("python3 not found on PATH, skipping");
        }
        ok
    }

    fn args(value: Value) -> Arguments {
        value.as_object().cloned().unwrap_or_default()
    }

    const ADD: &str = "def add(a, b):\n    return {\"ok\": True, \"output\": a + b}\n";

    #[test]
    fn interprets_envelope_line() {
        let r = interpret_output(
            "debug line\n{\"ok\": true, \"output\": 5, \"error\": null}\n",
            "",
            Duration::from_millis(3),
        );
        assert!(r.ok);
        assert_eq!(r.output, Some(json!(5)));
        assert_eq!(r.elapsed, Duration::from_millis(3));
    }

    #[test]
    fn plain_text_output_is_success() {
        let r = interpret_output("hello there\n", "", Duration::ZERO);
        assert!(r.ok);
        assert_eq!(r.output, Some(json!("hello there")));
    }

    #[test]
    fn empty_stdout_reports_stderr_or_marker() {
        let r = interpret_output("", "Traceback: boom\n", Duration::ZERO);
        assert!(!r.ok);
        assert_eq!(r.error.as_deref(), Some("Traceback: boom"));
        assert_eq!(r.failure, Some(FailureKind::RuntimeFailure));

        let r = interpret_output("  \n", "", Duration::ZERO);
        assert_eq!(r.error.as_deref(), Some(NO_OUTPUT));
    }

    #[test]
    fn failed_envelope_always_carries_error() {
        let r = interpret_output("{\"ok\": false, \"output\": 3}", "", Duration::ZERO);
        assert!(!r.ok);
        assert_eq!(r.output, None);
        assert_eq!(r.error.as_deref(), Some(REPORTED_FAILURE));
    }

    #[test]
    fn entry_point_must_be_identifier() {
        assert!(validate_entry_point("add_two").is_ok());
        assert!(validate_entry_point("_private").is_ok());
        assert!(validate_entry_point("").is_err());
        assert!(validate_entry_point("1add").is_err());
        assert!(validate_entry_point("add(); import os").is_err());
    }

    #[test]
    fn syntax_check_does_not_execute() {
        let runner = CapabilityRunner::new("definitely-not-an-interpreter");
        assert!(runner.check_syntax("add", ADD).is_ok());
        let err = runner
            .check_syntax("add", "def add(a, b)\n    return a + b\n")
            .unwrap_err();
        assert!(err.starts_with("SyntaxError"));

        let err = runner.check_syntax("add", "return 1\n").unwrap_err();
        assert!(err.contains("'return' outside function"), "{}", err);
    }

    #[test]
    fn capture_keeps_head_and_tail() {
        let mut captured = Captured::default();
        captured.push(b"abcd", 4);
        captured.push(b"efgh", 4);
        assert!(!captured.dropped);
        assert_eq!(captured.text(), "abcdefgh");

        captured.push(b"ijkl\n", 4);
        assert!(captured.dropped);
        assert_eq!(captured.text(), "abcd\n...\njkl\n");
    }

    #[test]
    fn truncated_output_needs_a_complete_envelope() {
        let limit = 64;
        let mut stdout = Captured::default();
        stdout.push("x".repeat(500).as_bytes(), limit);
        stdout.push(b"\n{\"ok\": false, \"output\": null, \"error\": \"E: no\"}\n", limit);
        let r = interpret_captured(&stdout, &Captured::default(), Duration::ZERO);
        assert!(!r.ok);
        assert_eq!(r.error.as_deref(), Some("E: no"));

        let mut stdout = Captured::default();
        stdout.push("y".repeat(500).as_bytes(), limit);
        let r = interpret_captured(&stdout, &Captured::default(), Duration::ZERO);
        assert!(!r.ok);
        assert_eq!(r.failure, Some(FailureKind::EngineFault));
        assert_eq!(r.error.as_deref(), Some(LOST_ENVELOPE));
    }

    #[test]
    fn missing_interpreter_is_engine_fault() {
        let runner = CapabilityRunner::new("definitely-not-an-interpreter");
        let r = runner.execute("add", ADD, &args(json!({"a": 1, "b": 2})), Duration::from_secs(5));
        assert!(!r.ok);
        assert_eq!(r.failure, Some(FailureKind::EngineFault));
    }

    #[test]
    fn runs_entry_point_with_keyword_arguments() {
        if !python_available() {
            return;
        }
        let runner = CapabilityRunner::new("python3");
        let r = runner.execute("add", ADD, &args(json!({"a": 2, "b": 3})), Duration::from_secs(10));
        assert!(r.ok, "{:?}", r.error);
        assert_eq!(r.output, Some(json!({"ok": true, "output": 5})));
        assert!(r.reported_success());
    }

    #[test]
    fn exception_is_captured() {
        if !python_available() {
            return;
        }
        let source = "def boom(**kw):\n    raise ValueError('bad input')\n";
        let r = CapabilityRunner::new("python3").execute(
            "boom",
            source,
            &Arguments::new(),
            Duration::from_secs(10),
        );
        assert!(!r.ok);
        assert_eq!(r.failure, Some(FailureKind::RuntimeFailure));
        assert_eq!(r.error.as_deref(), Some("ValueError: bad input"));
    }

    #[test]
    fn hung_process_is_killed_at_deadline() {
        if !python_available() {
            return;
        }
        let source = "def spin(**kw):\n    while True:\n        pass\n";
        let deadline = Duration::from_millis(500);
        let started = Instant::now();
        let r = CapabilityRunner::new("python3").execute("spin", source, &Arguments::new(), deadline);
        assert!(!r.ok);
        assert_eq!(r.failure, Some(FailureKind::Timeout));
        assert_eq!(r.error.as_deref(), Some("timed out after 0.5s"));
        assert!(started.elapsed() < deadline + Duration::from_secs(3));
    }

    #[test]
    fn harness_file_is_removed_on_every_path() {
        if !python_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let runner = CapabilityRunner::new("python3").with_work_dir(dir.path());

        runner.execute("add", ADD, &args(json!({"a": 1, "b": 1})), Duration::from_secs(10));
        runner.execute(
            "spin",
            "def spin(**kw):\n    while True:\n        pass\n",
            &Arguments::new(),
            Duration::from_millis(300),
        );
        runner.execute("missing", ADD, &Arguments::new(), Duration::from_secs(10));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "leftover harness files: {:?}", leftovers);
    }

    #[test]
    fn printed_noise_before_envelope_is_ignored() {
        if !python_available() {
            return;
        }
        let source = "def chatty(**kw):\n    print('working...')\n    return {'success': False, 'output': None}\n";
        let r = CapabilityRunner::new("python3").execute(
            "chatty",
            source,
            &Arguments::new(),
            Duration::from_secs(10),
        );
        assert!(r.ok);
        assert!(!r.reported_success());
    }

    #[test]
    fn large_output_keeps_the_envelope() {
        if !python_available() {
            return;
        }
        let runner = CapabilityRunner::new("python3").with_max_output_bytes(1024);

        let raising = "def noisy(**kw):\n    print('x' * 4000)\n    raise ValueError('boom')\n";
        let r = runner.execute("noisy", raising, &Arguments::new(), Duration::from_secs(10));
        assert!(!r.ok);
        assert_eq!(r.failure, Some(FailureKind::RuntimeFailure));
        assert_eq!(r.error.as_deref(), Some("ValueError: boom"));

        let reporting = "def noisy(**kw):\n    print('x' * 4000)\n    return {'success': False}\n";
        let r = runner.execute("noisy", reporting, &Arguments::new(), Duration::from_secs(10));
        assert!(r.ok, "{:?}", r.error);
        assert!(!r.reported_success());
    }

    #[test]
    fn oversized_result_is_engine_fault() {
        if !python_available() {
            return;
        }
        let source = "def big(**kw):\n    return 'z' * 5000\n";
        let r = CapabilityRunner::new("python3")
            .with_max_output_bytes(1024)
            .execute("big", source, &Arguments::new(), Duration::from_secs(10));
        assert!(!r.ok);
        assert_eq!(r.failure, Some(FailureKind::EngineFault));
    }

    #[test]
    fn descendant_holding_stdout_does_not_stall_result() {
        if !python_available() {
            return;
        }
        let source = "\
import subprocess
import sys

def spawn(**kw):
    subprocess.Popen([sys.executable, '-c', 'import time; time.sleep(4)'])
    return {'success': True, 'output': 'spawned'}
";
        let started = Instant::now();
        let r = CapabilityRunner::new("python3").execute(
            "spawn",
            source,
            &Arguments::new(),
            Duration::from_secs(10),
        );
        assert!(r.ok, "{:?}", r.error);
        assert_eq!(r.output, Some(json!({"success": true, "output": "spawned"})));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn non_finite_output_is_failure() {
        if !python_available() {
            return;
        }
        let source = "def nan(**kw):\n    return {'value': float('nan')}\n";
        let r = CapabilityRunner::new("python3").execute(
            "nan",
            source,
            &Arguments::new(),
            Duration::from_secs(10),
        );
        assert!(!r.ok);
        assert_eq!(r.failure, Some(FailureKind::RuntimeFailure));
        assert!(r
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("output is not valid JSON")));
    }
}
