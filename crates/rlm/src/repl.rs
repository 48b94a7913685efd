//! REPL session plumbing. The sandbox is not `Send` (its value graph is
//! `Rc`-based), so each session owns a dedicated worker thread and the agent
//! loop talks to it over a command channel. The worker also hosts the
//! synchronous bridge behind `recursive_llm`: it captures the tokio runtime
//! handle and drives the child loop to completion with `block_on`.

use std::rc::Rc;
use std::sync::Arc;
use std::thread;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crate::error::ExecutionError;
use crate::interp::RecursionHook;
use crate::sandbox::{Sandbox, SandboxConfig};

/// Runs a child agent loop for one `recursive_llm(sub_query, sub_context)`
/// call. Implementations must capture failures and fold them into the
/// returned string; the sandbox never sees an exception from recursion.
#[async_trait]
pub trait RecursiveRunner: Send + Sync {
    async fn completion(&self, sub_query: String, sub_context: String) -> anyhow::Result<String>;
}

/// Turn outcome as seen by the agent loop: printed output or a sandbox
/// error, both non-fatal to the task.
pub type ExecOutcome = Result<String, ExecutionError>;

enum ReplCommand {
    Init {
        context: String,
        query: String,
        response: oneshot::Sender<anyhow::Result<()>>,
    },
    Execute {
        code: String,
        response: oneshot::Sender<anyhow::Result<ExecOutcome>>,
    },
    EvalFinal {
        expr: String,
        response: oneshot::Sender<anyhow::Result<ExecOutcome>>,
    },
    GetVariable {
        name: String,
        response: oneshot::Sender<anyhow::Result<Option<String>>>,
    },
    ExportState {
        response: oneshot::Sender<anyhow::Result<serde_json::Value>>,
    },
    ImportState {
        state: serde_json::Value,
        response: oneshot::Sender<anyhow::Result<()>>,
    },
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct ReplHandle {
    sender: mpsc::UnboundedSender<ReplCommand>,
}

struct ReplCore {
    sandbox_config: SandboxConfig,
    runtime_handle: Handle,
    recursive_runner: Option<Arc<dyn RecursiveRunner>>,
    depth: usize,
    max_depth: usize,
    sandbox: Option<Sandbox>,
}

impl ReplCore {
    fn recursion_hook(&self) -> Rc<RecursionHook> {
        let runner = self.recursive_runner.clone();
        let handle = self.runtime_handle.clone();
        let depth = self.depth;
        let max_depth = self.max_depth;
        Rc::new(move |sub_query: &str, sub_context: &str| -> String {
            if depth + 1 >= max_depth {
                return format!("Max recursion depth ({max_depth}) reached");
            }
            let Some(runner) = runner.clone() else {
                return "Error: recursive_llm is unavailable in this session".to_owned();
            };
            let sub_query = sub_query.to_owned();
            let sub_context = sub_context.to_owned();
            handle
                .block_on(async move { runner.completion(sub_query, sub_context).await })
                .unwrap_or_else(|err| format!("Error running recursive_llm: {err}"))
        })
    }

    fn init(&mut self, context: String, query: String) -> anyhow::Result<()> {
        let hook = self.recursion_hook();
        self.sandbox = Some(Sandbox::new(
            &context,
            &query,
            self.sandbox_config,
            Some(hook),
        ));
        Ok(())
    }

    fn sandbox_mut(&mut self) -> anyhow::Result<&mut Sandbox> {
        self.sandbox
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("repl session not initialized"))
    }

    fn execute(&mut self, code: String) -> anyhow::Result<ExecOutcome> {
        Ok(self.sandbox_mut()?.execute(&code))
    }

    fn eval_final(&mut self, expr: String) -> anyhow::Result<ExecOutcome> {
        Ok(self.sandbox_mut()?.eval_expression(&expr))
    }

    fn get_variable(&self, name: &str) -> anyhow::Result<Option<String>> {
        let sandbox = self
            .sandbox
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("repl session not initialized"))?;
        Ok(sandbox.get_variable(name))
    }
}

impl ReplHandle {
    /// Spawns the worker thread for one session. Must be called from inside
    /// a tokio runtime; the captured handle is what `recursive_llm` blocks
    /// on.
    pub fn new(
        sandbox_config: SandboxConfig,
        recursive_runner: Option<Arc<dyn RecursiveRunner>>,
        depth: usize,
        max_depth: usize,
    ) -> anyhow::Result<Self> {
        let runtime_handle = Handle::try_current()
            .map_err(|err| anyhow::anyhow!("tokio runtime handle unavailable: {err}"))?;
        let (sender, mut receiver) = mpsc::unbounded_channel();

        thread::Builder::new()
            .name("rlm-repl-worker".to_owned())
            .spawn(move || {
                let mut core = ReplCore {
                    sandbox_config,
                    runtime_handle,
                    recursive_runner,
                    depth,
                    max_depth,
                    sandbox: None,
                };
                while let Some(command) = receiver.blocking_recv() {
                    match command {
                        ReplCommand::Init {
                            context,
                            query,
                            response,
                        } => {
                            let _ = response.send(core.init(context, query));
                        }
                        ReplCommand::Execute { code, response } => {
                            let _ = response.send(core.execute(code));
                        }
                        ReplCommand::EvalFinal { expr, response } => {
                            let _ = response.send(core.eval_final(expr));
                        }
                        ReplCommand::GetVariable { name, response } => {
                            let _ = response.send(core.get_variable(&name));
                        }
                        ReplCommand::ExportState { response } => {
                            let state = core
                                .sandbox
                                .as_ref()
                                .map(Sandbox::export_state)
                                .ok_or_else(|| anyhow::anyhow!("repl session not initialized"));
                            let _ = response.send(state);
                        }
                        ReplCommand::ImportState { state, response } => {
                            let result = core
                                .sandbox_mut()
                                .map(|sandbox| sandbox.import_state(&state));
                            let _ = response.send(result);
                        }
                        ReplCommand::Shutdown { response } => {
                            let _ = response.send(());
                            break;
                        }
                    }
                }
            })?;

        Ok(Self { sender })
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ReplCommand,
        what: &str,
    ) -> anyhow::Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.sender
            .send(make(response_tx))
            .map_err(|_| anyhow::anyhow!("failed to send {what} command to repl worker"))?;
        response_rx
            .await
            .map_err(|_| anyhow::anyhow!("repl worker dropped {what} response"))
    }

    pub async fn init(&self, context: String, query: String) -> anyhow::Result<()> {
        self.request(
            |response| ReplCommand::Init {
                context,
                query,
                response,
            },
            "init",
        )
        .await?
    }

    pub async fn execute(&self, code: String) -> anyhow::Result<ExecOutcome> {
        self.request(|response| ReplCommand::Execute { code, response }, "execute")
            .await?
    }

    pub async fn eval_final(&self, expr: String) -> anyhow::Result<ExecOutcome> {
        self.request(
            |response| ReplCommand::EvalFinal { expr, response },
            "eval_final",
        )
        .await?
    }

    pub async fn get_variable(&self, name: String) -> anyhow::Result<Option<String>> {
        self.request(
            |response| ReplCommand::GetVariable { name, response },
            "get_variable",
        )
        .await?
    }

    pub async fn export_state(&self) -> anyhow::Result<serde_json::Value> {
        self.request(
            |response| ReplCommand::ExportState { response },
            "export_state",
        )
        .await?
    }

    pub async fn import_state(&self, state: serde_json::Value) -> anyhow::Result<()> {
        self.request(
            |response| ReplCommand::ImportState { state, response },
            "import_state",
        )
        .await?
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.request(|response| ReplCommand::Shutdown { response }, "shutdown")
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn execute_and_state_flow() {
        let repl = ReplHandle::new(SandboxConfig::default(), None, 0, 3).unwrap();
        repl.init("some context".to_owned(), "q".to_owned())
            .await
            .unwrap();
        let out = repl.execute("x = 2\nprint(x * 21)".to_owned()).await.unwrap();
        assert_eq!(out.unwrap(), "42\n");
        assert_eq!(
            repl.get_variable("x".to_owned()).await.unwrap().as_deref(),
            Some("2")
        );
        let out = repl.eval_final("x * 3".to_owned()).await.unwrap();
        assert_eq!(out.unwrap(), "6");
        repl.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn depth_cap_returns_fixed_string() {
        struct Panicker;
        #[async_trait]
        impl RecursiveRunner for Panicker {
            async fn completion(&self, _q: String, _c: String) -> anyhow::Result<String> {
                panic!("child loop must not run past the depth cap");
            }
        }
        // depth 1 with max_depth 2: the cap fires before the runner
        let repl =
            ReplHandle::new(SandboxConfig::default(), Some(Arc::new(Panicker)), 1, 2).unwrap();
        repl.init(String::new(), String::new()).await.unwrap();
        let out = repl
            .execute("print(recursive_llm('p', 'q'))".to_owned())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out, "Max recursion depth (2) reached\n");
        repl.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn recursion_bridge_runs_child() {
        struct Echo;
        #[async_trait]
        impl RecursiveRunner for Echo {
            async fn completion(&self, q: String, c: String) -> anyhow::Result<String> {
                Ok(format!("child({q}, {} chars)", c.len()))
            }
        }
        let repl = ReplHandle::new(SandboxConfig::default(), Some(Arc::new(Echo)), 0, 3).unwrap();
        repl.init("abcdef".to_owned(), "q".to_owned()).await.unwrap();
        let out = repl
            .execute("print(recursive_llm('sub', context[:4]))".to_owned())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out, "child(sub, 4 chars)\n");
        repl.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn child_errors_fold_into_answer_string() {
        struct Failing;
        #[async_trait]
        impl RecursiveRunner for Failing {
            async fn completion(&self, _q: String, _c: String) -> anyhow::Result<String> {
                anyhow::bail!("transport down")
            }
        }
        let repl =
            ReplHandle::new(SandboxConfig::default(), Some(Arc::new(Failing)), 0, 3).unwrap();
        repl.init(String::new(), String::new()).await.unwrap();
        let out = repl
            .execute("print(recursive_llm('p', 'q'))".to_owned())
            .await
            .unwrap()
            .unwrap();
        assert!(out.contains("Error running recursive_llm"), "{out}");
        repl.shutdown().await.unwrap();
    }
}
