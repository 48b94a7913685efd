//! The agent loop: per-task driver that alternates between the LLM
//! transport and the sandboxed REPL until a final sentinel appears, the
//! iteration budget runs out, or the transport gives up. Recursion re-enters
//! the same loop at depth+1 on the cheaper model.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;

use crate::llm::{LlmClient, LlmClientImpl, Message};
use crate::logger::Logger;
use crate::prompts::{build_system_prompt, execution_result_message, initial_user_message, prose_reminder};
use crate::repl::{RecursiveRunner, ReplHandle};
use crate::sandbox::SandboxConfig;
use crate::transcript::{Event, TranscriptWriter};
use crate::utils::{FinalSentinel, ModelReply, classify_reply, truncate_context};

#[derive(Clone, Debug)]
pub struct RlmConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub recursive_model: String,
    pub max_depth: usize,
    pub max_iterations: usize,
    pub llm_timeout_s: f64,
    pub llm_max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub retries: u32,
    pub retry_backoff_s: f64,
    pub max_context_chars: usize,
    pub max_output_chars: usize,
    pub zlib_max_output_bytes: usize,
    pub strict_code: bool,
    pub inject_b64zlib: bool,
    pub enable_logging: bool,
    pub exec_timeout_s: f64,
    pub max_steps: u64,
    pub max_frames: usize,
    pub max_alloc_bytes: usize,
}

impl Default for RlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_owned(),
            model: "gpt-5".to_owned(),
            recursive_model: "gpt-5-mini".to_owned(),
            max_depth: 3,
            max_iterations: 10,
            llm_timeout_s: 300.0,
            llm_max_tokens: None,
            temperature: None,
            retries: 3,
            retry_backoff_s: 1.0,
            max_context_chars: 1_000_000,
            max_output_chars: 2000,
            zlib_max_output_bytes: 1024 * 1024,
            strict_code: true,
            inject_b64zlib: true,
            enable_logging: false,
            exec_timeout_s: 2.0,
            max_steps: 1_000_000,
            max_frames: 64,
            max_alloc_bytes: 64 * 1024 * 1024,
        }
    }
}

impl RlmConfig {
    /// Reads overrides from `RLM_*` environment variables on top of the
    /// defaults. Invalid numbers are configuration errors, fatal before any
    /// task runs.
    pub fn from_env() -> anyhow::Result<Self> {
        fn parse<T: std::str::FromStr>(name: &str, into: &mut T) -> anyhow::Result<()> {
            if let Ok(raw) = std::env::var(name) {
                *into = raw
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid value for {name}: {raw:?}"))?;
            }
            Ok(())
        }
        let mut config = Self {
            api_key: std::env::var("RLM_API_KEY")
                .or_else(|_| std::env::var("OPENAI_API_KEY"))
                .ok(),
            ..Self::default()
        };
        if let Ok(base_url) = std::env::var("RLM_BASE_URL") {
            config.base_url = base_url;
        }
        if let Ok(model) = std::env::var("RLM_MODEL") {
            config.model = model;
        }
        if let Ok(model) = std::env::var("RLM_RECURSIVE_MODEL") {
            config.recursive_model = model;
        }
        if let Ok(raw) = std::env::var("RLM_MAX_TOKENS") {
            config.llm_max_tokens = Some(
                raw.parse()
                    .map_err(|_| anyhow::anyhow!("invalid value for RLM_MAX_TOKENS: {raw:?}"))?,
            );
        }
        if let Ok(raw) = std::env::var("RLM_TEMPERATURE") {
            config.temperature = Some(
                raw.parse()
                    .map_err(|_| anyhow::anyhow!("invalid value for RLM_TEMPERATURE: {raw:?}"))?,
            );
        }
        parse("RLM_MAX_DEPTH", &mut config.max_depth)?;
        parse("RLM_MAX_ITERATIONS", &mut config.max_iterations)?;
        parse("RLM_LLM_TIMEOUT_S", &mut config.llm_timeout_s)?;
        parse("RLM_RETRIES", &mut config.retries)?;
        parse("RLM_RETRY_BACKOFF_S", &mut config.retry_backoff_s)?;
        parse("RLM_MAX_CONTEXT_CHARS", &mut config.max_context_chars)?;
        parse("RLM_MAX_OUTPUT_CHARS", &mut config.max_output_chars)?;
        parse("RLM_ZLIB_MAX_OUTPUT_BYTES", &mut config.zlib_max_output_bytes)?;
        parse("RLM_STRICT_CODE", &mut config.strict_code)?;
        parse("RLM_INJECT_B64ZLIB", &mut config.inject_b64zlib)?;
        parse("RLM_ENABLE_LOGGING", &mut config.enable_logging)?;
        parse("RLM_EXEC_TIMEOUT_S", &mut config.exec_timeout_s)?;
        parse("RLM_MAX_STEPS", &mut config.max_steps)?;
        parse("RLM_MAX_FRAMES", &mut config.max_frames)?;
        parse("RLM_MAX_ALLOC_BYTES", &mut config.max_alloc_bytes)?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_depth < 1 {
            anyhow::bail!("max_depth must be >= 1");
        }
        if self.max_iterations < 1 {
            anyhow::bail!("max_iterations must be >= 1");
        }
        if self.max_output_chars < 1 {
            anyhow::bail!("max_output_chars must be >= 1");
        }
        if self.llm_timeout_s <= 0.0 || self.exec_timeout_s <= 0.0 {
            anyhow::bail!("timeouts must be positive");
        }
        Ok(())
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            limits: crate::interp::Limits {
                timeout: Duration::from_secs_f64(self.exec_timeout_s),
                max_steps: self.max_steps,
                max_frames: self.max_frames,
                max_alloc: self.max_alloc_bytes,
            },
            max_output_chars: self.max_output_chars,
            zlib_max_output_bytes: self.zlib_max_output_bytes,
            inject_b64zlib: self.inject_b64zlib,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Task {
    pub dataset: String,
    pub task_id: String,
    pub query: String,
    pub context: Arc<str>,
}

#[derive(Clone, Debug)]
pub struct TaskResult {
    pub ok: bool,
    pub answer: Option<String>,
    pub error: Option<String>,
}

/// Everything a loop at any depth needs, shared between the root task and
/// the recursion runners it spawns.
struct LoopShared {
    config: RlmConfig,
    recursive_client: Arc<dyn LlmClient>,
    transcript: Arc<TranscriptWriter>,
    dataset: String,
    task_id: String,
}

struct LoopOutcome {
    answer: String,
    resolved: bool,
}

pub struct RlmRuntime {
    config: RlmConfig,
    llm: Arc<dyn LlmClient>,
    recursive_llm: Arc<dyn LlmClient>,
    transcript: Arc<TranscriptWriter>,
}

impl RlmRuntime {
    pub fn new(config: RlmConfig, transcript: Arc<TranscriptWriter>) -> anyhow::Result<Self> {
        config.validate()?;
        let llm = make_client(&config, &config.model)?;
        let recursive_llm = make_client(&config, &config.recursive_model)?;
        Ok(Self {
            config,
            llm,
            recursive_llm,
            transcript,
        })
    }

    /// Injection seam for tests and alternative transports.
    pub fn with_clients(
        config: RlmConfig,
        llm: Arc<dyn LlmClient>,
        recursive_llm: Arc<dyn LlmClient>,
        transcript: Arc<TranscriptWriter>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            llm,
            recursive_llm,
            transcript,
        })
    }

    /// Runs a single task to a terminal state. Transport failure after all
    /// retries is a task failure, not a process failure; transcript I/O
    /// errors propagate.
    pub async fn run_task(&self, task: &Task) -> anyhow::Result<TaskResult> {
        let context = truncate_context(&task.context, self.config.max_context_chars);
        self.transcript.append(Event::TaskStart {
            dataset: task.dataset.clone(),
            task_id: task.task_id.clone(),
            query: task.query.clone(),
            query_len: task.query.chars().count(),
            context_len: context.chars().count(),
            model: self.llm.model().to_owned(),
            recursive_model: self.recursive_llm.model().to_owned(),
        })?;

        let shared = Arc::new(LoopShared {
            config: self.config.clone(),
            recursive_client: self.recursive_llm.clone(),
            transcript: self.transcript.clone(),
            dataset: task.dataset.clone(),
            task_id: task.task_id.clone(),
        });

        let outcome = run_loop(self.llm.clone(), shared, 0, &task.query, &context).await;
        match outcome {
            Ok(LoopOutcome { answer, resolved }) => {
                let error = (!resolved).then(|| {
                    format!(
                        "no final answer within {} iterations",
                        self.config.max_iterations
                    )
                });
                self.transcript.append(Event::TaskEnd {
                    dataset: task.dataset.clone(),
                    task_id: task.task_id.clone(),
                    ok: resolved,
                    error: error.clone(),
                })?;
                Ok(TaskResult {
                    ok: resolved,
                    answer: Some(answer),
                    error,
                })
            }
            Err(err) => {
                let message = err.to_string();
                self.transcript.append(Event::TaskEnd {
                    dataset: task.dataset.clone(),
                    task_id: task.task_id.clone(),
                    ok: false,
                    error: Some(message.clone()),
                })?;
                Ok(TaskResult {
                    ok: false,
                    answer: None,
                    error: Some(message),
                })
            }
        }
    }
}

fn make_client(config: &RlmConfig, model: &str) -> anyhow::Result<Arc<dyn LlmClient>> {
    let api_key = config
        .api_key
        .clone()
        .ok_or_else(|| anyhow::anyhow!("api key is required (set RLM_API_KEY)"))?;
    let client = LlmClientImpl::new(
        api_key,
        config.base_url.clone(),
        model.to_owned(),
        config.llm_timeout_s,
        config.temperature,
    )?;
    Ok(Arc::new(client))
}

/// Recursion bridge: runs a child loop at `child_depth` on the cheaper
/// model. Shared by every depth; the depth cap itself lives in the REPL
/// worker's hook.
struct LoopRunner {
    shared: Arc<LoopShared>,
    child_depth: usize,
}

#[async_trait]
impl RecursiveRunner for LoopRunner {
    async fn completion(&self, sub_query: String, sub_context: String) -> anyhow::Result<String> {
        let sub_context = truncate_context(&sub_context, self.shared.config.max_context_chars);
        let outcome = run_loop(
            self.shared.recursive_client.clone(),
            self.shared.clone(),
            self.child_depth,
            &sub_query,
            &sub_context,
        )
        .await?;
        Ok(outcome.answer)
    }
}

async fn run_loop(
    client: Arc<dyn LlmClient>,
    shared: Arc<LoopShared>,
    depth: usize,
    query: &str,
    context: &str,
) -> anyhow::Result<LoopOutcome> {
    let config = &shared.config;
    let mut logger = Logger::new(config.enable_logging && depth == 0);
    logger.log_task_start(query, depth, context.chars().count());

    let runner = Arc::new(LoopRunner {
        shared: shared.clone(),
        child_depth: depth + 1,
    });
    let repl = ReplHandle::new(
        config.sandbox_config(),
        Some(runner),
        depth,
        config.max_depth,
    )?;
    repl.init(context.to_owned(), query.to_owned()).await?;

    let mut messages = vec![
        build_system_prompt(config.inject_b64zlib, config.strict_code),
        initial_user_message(query, context),
    ];
    logger.log_initial_messages(&messages);

    let mut last_output = String::new();
    for iteration in 0..config.max_iterations {
        let content = match call_with_retry(&client, &shared, depth, iteration, &messages, &mut logger)
            .await
        {
            Ok(content) => content,
            Err(err) => {
                repl.shutdown().await.ok();
                return Err(err);
            }
        };

        match classify_reply(&content) {
            ModelReply::Final(sentinel) => {
                logger.log_model_response(&content, true);
                let answer = resolve_final(&repl, &sentinel).await?;
                match answer {
                    Some(answer) => {
                        shared.transcript.append(Event::FinalParsed {
                            dataset: shared.dataset.clone(),
                            task_id: shared.task_id.clone(),
                            answer: answer.clone(),
                        })?;
                        logger.log_final_response(&answer);
                        repl.shutdown().await.ok();
                        return Ok(LoopOutcome {
                            answer,
                            resolved: true,
                        });
                    }
                    None => {
                        // FINAL_VAR over an unbound name: tell the model and
                        // keep iterating
                        let FinalSentinel::Var(name) = &sentinel else {
                            unreachable!("only FINAL_VAR can fail to resolve")
                        };
                        messages.push(Message::assistant(content.clone()));
                        messages.push(Message::user(format!(
                            "Variable '{name}' is not defined in the REPL environment. Bind it first or answer with FINAL(...)."
                        )));
                    }
                }
            }
            ModelReply::Code(code) if code.is_empty() => {
                logger.log_model_response(&content, false);
                messages.push(Message::assistant(content.clone()));
                messages.push(prose_reminder());
            }
            ModelReply::Code(code) => {
                logger.log_model_response(&content, false);
                shared.transcript.append(Event::ReplInput {
                    dataset: shared.dataset.clone(),
                    task_id: shared.task_id.clone(),
                    code: code.clone(),
                })?;
                let started = Instant::now();
                let outcome = repl.execute(code.clone()).await?;
                let result_text = match outcome {
                    Ok(output) => {
                        shared.transcript.append(Event::ReplOutput {
                            dataset: shared.dataset.clone(),
                            task_id: shared.task_id.clone(),
                            output: output.clone(),
                        })?;
                        if !output.is_empty() {
                            last_output = output.clone();
                        }
                        output
                    }
                    Err(err) => {
                        let error = err.to_string();
                        shared.transcript.append(Event::ReplError {
                            dataset: shared.dataset.clone(),
                            task_id: shared.task_id.clone(),
                            error: error.clone(),
                        })?;
                        error
                    }
                };
                logger.log_execution(&code, &result_text, started.elapsed().as_secs_f64());
                messages.push(Message::assistant(content.clone()));
                messages.push(execution_result_message(&result_text));
            }
        }
    }

    repl.shutdown().await.ok();
    Ok(LoopOutcome {
        answer: last_output,
        resolved: false,
    })
}

async fn resolve_final(
    repl: &ReplHandle,
    sentinel: &FinalSentinel,
) -> anyhow::Result<Option<String>> {
    match sentinel {
        FinalSentinel::Expr(source) => match repl.eval_final(source.clone()).await? {
            Ok(answer) => Ok(Some(answer)),
            // not evaluable in-subset: the payload is prose, answer with it
            // as-is
            Err(_) => Ok(Some(source.clone())),
        },
        FinalSentinel::Var(name) => Ok(repl.get_variable(name.clone()).await?),
    }
}

async fn call_with_retry(
    client: &Arc<dyn LlmClient>,
    shared: &Arc<LoopShared>,
    depth: usize,
    iteration: usize,
    messages: &[Message],
    logger: &mut Logger,
) -> anyhow::Result<String> {
    let config = &shared.config;
    for attempt in 0..=config.retries {
        let started = Instant::now();
        match client.completion(messages, config.llm_max_tokens).await {
            Ok(content) => {
                shared.transcript.append(Event::LlmResponse {
                    dataset: shared.dataset.clone(),
                    task_id: shared.task_id.clone(),
                    depth,
                    iteration,
                    model_selected: client.model().to_owned(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    content: content.clone(),
                })?;
                return Ok(content);
            }
            Err(err) => {
                let error = err.to_string();
                shared.transcript.append(Event::LlmError {
                    dataset: shared.dataset.clone(),
                    task_id: shared.task_id.clone(),
                    depth,
                    iteration,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    error: error.clone(),
                })?;
                logger.log_llm_error(attempt + 1, &error);
                if attempt == config.retries {
                    return Err(anyhow::anyhow!(
                        "llm transport failed after {} attempts: {error}",
                        config.retries + 1
                    ));
                }
                let backoff = config.retry_backoff_s * 2f64.powi(attempt as i32);
                let jitter = rand::rng().random_range(0.0..=backoff * 0.25);
                tokio::time::sleep(Duration::from_secs_f64(backoff + jitter)).await;
            }
        }
    }
    unreachable!("retry loop returns or errors")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        RlmConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_depth_and_iterations_are_rejected() {
        let mut config = RlmConfig::default();
        config.max_depth = 0;
        assert!(config.validate().is_err());
        let mut config = RlmConfig::default();
        config.max_iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn sandbox_config_mirrors_caps() {
        let mut config = RlmConfig::default();
        config.max_output_chars = 123;
        config.zlib_max_output_bytes = 456;
        config.inject_b64zlib = false;
        let sandbox = config.sandbox_config();
        assert_eq!(sandbox.max_output_chars, 123);
        assert_eq!(sandbox.zlib_max_output_bytes, 456);
        assert!(!sandbox.inject_b64zlib);
    }
}
