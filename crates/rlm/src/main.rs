use std::io::Read;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use rlm::prompts::DEFAULT_QUERY;
use rlm::rlm::{RlmConfig, RlmRuntime, Task};
use rlm::transcript::TranscriptWriter;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn usage() -> ExitCode {
    eprintln!("usage: rlm-runtime <context-file | -> [query...]");
    eprintln!();
    eprintln!("Runs one task over the given context. Configuration comes from");
    eprintln!("RLM_* environment variables (and .env); RLM_TRANSCRIPT selects");
    eprintln!("the transcript JSONL path.");
    ExitCode::from(2)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let mut args = std::env::args().skip(1);
    let Some(context_path) = args.next() else {
        return usage();
    };
    let query: String = {
        let rest: Vec<String> = args.collect();
        if rest.is_empty() {
            std::env::var("RLM_QUERY").unwrap_or_else(|_| DEFAULT_QUERY.to_owned())
        } else {
            rest.join(" ")
        }
    };

    let context = match read_context(&context_path) {
        Ok(context) => context,
        Err(err) => {
            eprintln!("failed to read context from {context_path}: {err}");
            return ExitCode::from(2);
        }
    };

    let config = match RlmConfig::from_env().and_then(|config| {
        config.validate()?;
        Ok(config)
    }) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(2);
        }
    };

    let transcript = match std::env::var("RLM_TRANSCRIPT") {
        Ok(path) => match TranscriptWriter::to_file(&path) {
            Ok(writer) => Arc::new(writer),
            Err(err) => {
                eprintln!("cannot open transcript {path}: {err}");
                return ExitCode::from(2);
            }
        },
        Err(_) => Arc::new(TranscriptWriter::disabled()),
    };

    let runtime = match RlmRuntime::new(config, transcript) {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(2);
        }
    };

    let task = Task {
        dataset: std::env::var("RLM_DATASET").unwrap_or_else(|_| "cli".to_owned()),
        task_id: std::env::var("RLM_TASK_ID").unwrap_or_else(|_| "task-0".to_owned()),
        query,
        context: context.into(),
    };

    let started = Instant::now();
    match runtime.run_task(&task).await {
        Ok(result) => {
            let elapsed = started.elapsed().as_secs_f64();
            if let Some(error) = &result.error {
                eprintln!("task did not resolve cleanly: {error}");
            }
            match result.answer {
                Some(answer) => {
                    println!("{answer}");
                    eprintln!("done in {elapsed:.1}s");
                    ExitCode::SUCCESS
                }
                None => ExitCode::from(2),
            }
        }
        Err(err) => {
            eprintln!("runtime failure: {err}");
            ExitCode::from(2)
        }
    }
}

fn read_context(path: &str) -> std::io::Result<String> {
    if path == "-" {
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        std::fs::read_to_string(path)
    }
}
