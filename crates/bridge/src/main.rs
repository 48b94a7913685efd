//! Stdio bridge to the sandbox for replay and probing tools: one JSON
//! request per stdin line, one JSON response per stdout line, flushed after
//! each. `--replay` re-executes a transcript's repl turns against a fresh
//! session and exits 1 on the first divergence.

mod protocol;

use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use rlm::sandbox::{Sandbox, SandboxConfig};
use rlm::transcript::{self, Event};

use crate::protocol::{StepRequest, StepResponse};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("--replay") => {
            let Some(transcript_path) = args.get(1) else {
                eprintln!("usage: rlm-bridge [--replay <transcript.jsonl> [context-file]]");
                return ExitCode::from(2);
            };
            replay(transcript_path, args.get(2).map(String::as_str))
        }
        Some(other) => {
            eprintln!("unknown argument: {other}");
            eprintln!("usage: rlm-bridge [--replay <transcript.jsonl> [context-file]]");
            ExitCode::from(2)
        }
        None => serve(),
    }
}

fn serve() -> ExitCode {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                eprintln!("stdin read failed: {err}");
                return ExitCode::from(2);
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<StepRequest>(&line) {
            Ok(request) => run_step(request),
            Err(err) => StepResponse::failure(
                format!("invalid request: {err}"),
                serde_json::Value::Object(Default::default()),
            ),
        };
        if let Err(err) = emit(&mut stdout, &response) {
            eprintln!("stdout write failed: {err}");
            return ExitCode::from(2);
        }
    }
    ExitCode::SUCCESS
}

/// One step is one fresh sandbox: seed the capability surface, restore the
/// carried state, run, and export the next state.
fn run_step(request: StepRequest) -> StepResponse {
    let config = SandboxConfig {
        max_output_chars: request.max_output_chars.max(1),
        ..SandboxConfig::default()
    };
    let mut sandbox = Sandbox::new(&request.context, &request.query, config, None);
    if let Some(state) = &request.state {
        sandbox.import_state(state);
    }
    match sandbox.execute(&request.code) {
        Ok(output) => StepResponse {
            ok: true,
            output,
            error: None,
            state: sandbox.export_state(),
        },
        Err(err) => StepResponse::failure(err.to_string(), sandbox.export_state()),
    }
}

fn emit(stdout: &mut impl Write, response: &StepResponse) -> anyhow::Result<()> {
    let payload = serde_json::to_string(response)?;
    stdout.write_all(payload.as_bytes())?;
    stdout.write_all(b"\n")?;
    stdout.flush()?;
    Ok(())
}

/// Re-runs every `repl_input` of a recorded task against one persistent
/// session and compares with the recorded `repl_output`/`repl_error`.
fn replay(transcript_path: &str, context_path: Option<&str>) -> ExitCode {
    let records = match transcript::read_records(transcript_path) {
        Ok(records) => records,
        Err(err) => {
            eprintln!("cannot read transcript {transcript_path}: {err}");
            return ExitCode::from(2);
        }
    };
    let context = match context_path {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(context) => context,
            Err(err) => {
                eprintln!("cannot read context {path}: {err}");
                return ExitCode::from(2);
            }
        },
        None => String::new(),
    };
    let query = records
        .iter()
        .find_map(|record| match &record.event {
            Event::TaskStart { query, .. } => Some(query.clone()),
            _ => None,
        })
        .unwrap_or_default();

    let mut sandbox = Sandbox::new(&context, &query, SandboxConfig::default(), None);
    let mut step = 0usize;
    let mut events = records.iter().peekable();
    while let Some(record) = events.next() {
        let Event::ReplInput { code, .. } = &record.event else {
            continue;
        };
        step += 1;
        let outcome = sandbox.execute(code);
        let expected = events.peek().map(|next| &next.event);
        match (outcome, expected) {
            (Ok(output), Some(Event::ReplOutput { output: recorded, .. })) => {
                if &output != recorded {
                    eprintln!("step {step}: output mismatch");
                    eprintln!("  recorded: {recorded:?}");
                    eprintln!("  replayed: {output:?}");
                    return ExitCode::from(1);
                }
            }
            (Err(err), Some(Event::ReplError { error: recorded, .. })) => {
                let replayed = err.to_string();
                if &replayed != recorded {
                    eprintln!("step {step}: error mismatch");
                    eprintln!("  recorded: {recorded:?}");
                    eprintln!("  replayed: {replayed:?}");
                    return ExitCode::from(1);
                }
            }
            (outcome, expected) => {
                eprintln!(
                    "step {step}: outcome kind mismatch (replay {}, transcript {})",
                    if outcome.is_ok() { "output" } else { "error" },
                    match expected {
                        Some(Event::ReplOutput { .. }) => "output",
                        Some(Event::ReplError { .. }) => "error",
                        _ => "missing",
                    }
                );
                return ExitCode::from(1);
            }
        }
    }
    eprintln!("replayed {step} repl steps with no divergence");
    ExitCode::SUCCESS
}
