//! End-to-end agent-loop tests with scripted transports: the loop, the
//! sandbox, the recursion bridge and the transcript are all real; only the
//! LLM is canned.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rlm::llm::{LlmClient, LlmError, Message};
use rlm::rlm::{RlmConfig, RlmRuntime, Task};
use rlm::transcript::{Event, Record, TranscriptWriter};

#[derive(Clone)]
enum Reply {
    Text(&'static str),
    Fail,
}

struct ScriptedClient {
    model: String,
    replies: Mutex<VecDeque<Reply>>,
}

impl ScriptedClient {
    fn new(model: &str, replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            model: model.to_owned(),
            replies: Mutex::new(replies.into()),
        })
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn completion(
        &self,
        _messages: &[Message],
        _max_completion_tokens: Option<u32>,
    ) -> Result<String, LlmError> {
        let reply = self
            .replies
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or(Reply::Fail);
        match reply {
            Reply::Text(text) => Ok(text.to_owned()),
            Reply::Fail => Err(LlmError::InvalidResponse),
        }
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SharedBuf {
    fn records(&self) -> Vec<Record> {
        let raw = String::from_utf8(self.0.lock().unwrap().clone()).unwrap();
        raw.lines()
            .map(|line| serde_json::from_str(line).expect("transcript line parses"))
            .collect()
    }
}

fn test_config() -> RlmConfig {
    RlmConfig {
        retries: 1,
        retry_backoff_s: 0.01,
        enable_logging: false,
        ..RlmConfig::default()
    }
}

fn make_task(context: &str, query: &str) -> Task {
    Task {
        dataset: "testset".to_owned(),
        task_id: "t-1".to_owned(),
        query: query.to_owned(),
        context: context.into(),
    }
}

fn runtime_with(
    config: RlmConfig,
    root: Arc<ScriptedClient>,
    recursive: Arc<ScriptedClient>,
) -> (RlmRuntime, SharedBuf) {
    let buf = SharedBuf::default();
    let transcript = Arc::new(TranscriptWriter::to_sink(Box::new(buf.clone())));
    let runtime = RlmRuntime::with_clients(config, root, recursive, transcript).unwrap();
    (runtime, buf)
}

fn event_types(records: &[Record]) -> Vec<&'static str> {
    records
        .iter()
        .map(|record| match &record.event {
            Event::TaskStart { .. } => "task_start",
            Event::LlmResponse { .. } => "llm_response",
            Event::LlmError { .. } => "llm_error",
            Event::ReplInput { .. } => "repl_input",
            Event::ReplOutput { .. } => "repl_output",
            Event::ReplError { .. } => "repl_error",
            Event::FinalParsed { .. } => "final_parsed",
            Event::TaskEnd { .. } => "task_end",
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn needle_task_resolves_with_final_var() {
    let mut context = "filler text without anything interesting. ".repeat(5000);
    context.push_str("One of the special magic numbers for key-7 is: 123456789.");
    context.push_str(&" more trailing filler.".repeat(1000));

    let root = ScriptedClient::new(
        "big-model",
        vec![
            Reply::Text(
                "answer = re.findall(r'magic numbers for key-7 is: (\\d+)', context)[0]\nprint(answer)",
            ),
            Reply::Text("FINAL_VAR(answer)"),
        ],
    );
    let recursive = ScriptedClient::new("small-model", vec![]);
    let (runtime, buf) = runtime_with(test_config(), root, recursive);

    let task = make_task(&context, "What is the special magic number for key-7?");
    let result = runtime.run_task(&task).await.unwrap();
    assert!(result.ok);
    assert!(result.answer.unwrap().contains("123456789"));

    let records = buf.records();
    let types = event_types(&records);
    assert_eq!(
        types,
        vec![
            "task_start",
            "llm_response",
            "repl_input",
            "repl_output",
            "llm_response",
            "final_parsed",
            "task_end",
        ]
    );
    let uses_regex = records.iter().any(|record| matches!(
        &record.event,
        Event::ReplInput { code, .. } if code.contains("re.findall")
    ));
    assert!(uses_regex);
    assert!(records.iter().any(|record| matches!(
        &record.event,
        Event::TaskEnd { ok: true, .. }
    )));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn import_refusal_feeds_error_back() {
    let root = ScriptedClient::new(
        "big-model",
        vec![
            Reply::Text("import re\nprint(re.findall(r'\\d+', context)[:3])"),
            Reply::Text("print(re.findall(r'\\d+', context)[:3])"),
            Reply::Text("FINAL(\"done\")"),
        ],
    );
    let recursive = ScriptedClient::new("small-model", vec![]);
    let (runtime, buf) = runtime_with(test_config(), root, recursive);

    let task = make_task("numbers 11 22 33 44", "list the numbers");
    let result = runtime.run_task(&task).await.unwrap();
    assert!(result.ok);

    let records = buf.records();
    let error_idx = records
        .iter()
        .position(|record| matches!(
            &record.event,
            Event::ReplError { error, .. } if error.contains("__import__ not found")
        ))
        .expect("repl_error with import message");
    let followup = records[error_idx + 1..]
        .iter()
        .find_map(|record| match &record.event {
            Event::ReplInput { code, .. } => Some(code.clone()),
            _ => None,
        })
        .expect("a follow-up repl_input");
    assert!(!followup.contains("import"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recursion_runs_child_on_cheap_model() {
    let root = ScriptedClient::new(
        "big-model",
        vec![
            Reply::Text("print(recursive_llm('count digits', context[:5000]))"),
            Reply::Text("FINAL(\"forwarded\")"),
        ],
    );
    let recursive = ScriptedClient::new(
        "small-model",
        vec![Reply::Text("FINAL(\"sub-answer: nine digits\")")],
    );
    let config = RlmConfig {
        max_depth: 3,
        ..test_config()
    };
    let (runtime, buf) = runtime_with(config, root, recursive);

    let task = make_task(&"4".repeat(9), "how many digits?");
    let result = runtime.run_task(&task).await.unwrap();
    assert!(result.ok);

    let records = buf.records();
    // the child call is observable at depth 1 on the recursive model
    assert!(records.iter().any(|record| matches!(
        &record.event,
        Event::LlmResponse { depth: 1, model_selected, .. } if model_selected == "small-model"
    )));
    // and its answer flowed back into the parent's print output
    assert!(records.iter().any(|record| matches!(
        &record.event,
        Event::ReplOutput { output, .. } if output.contains("sub-answer: nine digits")
    )));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn depth_cap_is_observable_from_depth_one() {
    let root = ScriptedClient::new(
        "big-model",
        vec![
            Reply::Text("print(recursive_llm('outer', context))"),
            Reply::Text("FINAL(\"ok\")"),
        ],
    );
    // the depth-1 child immediately recurses again, which must hit the cap
    let recursive = ScriptedClient::new(
        "small-model",
        vec![
            Reply::Text("print(recursive_llm('p', 'q'))"),
            Reply::Text("FINAL_VAR(missing)"),
            Reply::Text("FINAL(\"child done\")"),
        ],
    );
    let config = RlmConfig {
        max_depth: 2,
        ..test_config()
    };
    let (runtime, buf) = runtime_with(config, root, recursive);

    let task = make_task("ctx", "q");
    let result = runtime.run_task(&task).await.unwrap();
    assert!(result.ok);

    let records = buf.records();
    assert!(records.iter().any(|record| matches!(
        &record.event,
        Event::ReplOutput { output, .. } if output.contains("Max recursion depth (2) reached")
    )));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn final_var_binding_across_turns() {
    let root = ScriptedClient::new(
        "big-model",
        vec![Reply::Text("answer = 42"), Reply::Text("FINAL_VAR(answer)")],
    );
    let recursive = ScriptedClient::new("small-model", vec![]);
    let (runtime, _buf) = runtime_with(test_config(), root, recursive);

    let result = runtime.run_task(&make_task("ctx", "q")).await.unwrap();
    assert!(result.ok);
    assert_eq!(result.answer.as_deref(), Some("42"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn prose_final_payload_is_answered_raw() {
    let root = ScriptedClient::new(
        "big-model",
        vec![Reply::Text("FINAL(The answer is 42)")],
    );
    let recursive = ScriptedClient::new("small-model", vec![]);
    let (runtime, _buf) = runtime_with(test_config(), root, recursive);

    let result = runtime.run_task(&make_task("ctx", "q")).await.unwrap();
    assert!(result.ok);
    assert_eq!(result.answer.as_deref(), Some("The answer is 42"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausted_iterations_return_last_output() {
    let root = ScriptedClient::new(
        "big-model",
        vec![
            Reply::Text("print('first probe')"),
            Reply::Text("print('second probe')"),
        ],
    );
    let recursive = ScriptedClient::new("small-model", vec![]);
    let config = RlmConfig {
        max_iterations: 2,
        ..test_config()
    };
    let (runtime, buf) = runtime_with(config, root, recursive);

    let result = runtime.run_task(&make_task("ctx", "q")).await.unwrap();
    assert!(!result.ok);
    assert_eq!(result.answer.as_deref(), Some("second probe\n"));
    assert!(result.error.unwrap().contains("no final answer"));

    let records = buf.records();
    assert!(records.iter().any(|record| matches!(
        &record.event,
        Event::TaskEnd { ok: false, .. }
    )));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transport_failure_exhausts_retries_and_fails_task() {
    let root = ScriptedClient::new("big-model", vec![Reply::Fail, Reply::Fail]);
    let recursive = ScriptedClient::new("small-model", vec![]);
    let config = RlmConfig {
        retries: 1,
        retry_backoff_s: 0.01,
        ..test_config()
    };
    let (runtime, buf) = runtime_with(config, root, recursive);

    let result = runtime.run_task(&make_task("ctx", "q")).await.unwrap();
    assert!(!result.ok);
    assert!(result.answer.is_none());
    assert!(result.error.is_some());

    let records = buf.records();
    let llm_errors = records
        .iter()
        .filter(|record| matches!(&record.event, Event::LlmError { .. }))
        .count();
    assert_eq!(llm_errors, 2);
    assert!(matches!(
        &records.last().unwrap().event,
        Event::TaskEnd { ok: false, error: Some(_), .. }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transcript_sequence_is_well_formed() {
    let root = ScriptedClient::new(
        "big-model",
        vec![
            Reply::Text("x = 1"),
            Reply::Text("print(x + 1)"),
            Reply::Text("FINAL_VAR(x)"),
        ],
    );
    let recursive = ScriptedClient::new("small-model", vec![]);
    let (runtime, buf) = runtime_with(test_config(), root, recursive);

    runtime.run_task(&make_task("ctx", "q")).await.unwrap();
    let records = buf.records();
    let types = event_types(&records);
    assert_eq!(types.first(), Some(&"task_start"));
    assert_eq!(types.last(), Some(&"task_end"));
    // every repl_input is immediately followed by its output or error
    for (idx, ty) in types.iter().enumerate() {
        if *ty == "repl_input" {
            assert!(matches!(types[idx + 1], "repl_output" | "repl_error"));
        }
    }
    assert_eq!(types.iter().filter(|t| **t == "final_parsed").count(), 1);
}
