use crate::caps;
use crate::llm::Message;
use crate::utils::context_preview;

pub const DEFAULT_QUERY: &str = "Please read through the context and answer any queries or respond to any instructions contained within it.";

/// How much of the context the first user message shows inline before
/// falling back to a head snippet plus a length summary.
pub const CONTEXT_INLINE_THRESHOLD: usize = 4000;

const STRICT_CODE_NOTE: &str = "Reply with plain Python code only: no markdown fences, no prose around the code, ASCII characters only.";

/// Builds the system prompt for one loop: the REPL surface, statefulness,
/// the no-import rule, the FINAL contract, and the recursion primitive.
pub fn build_system_prompt(inject_b64zlib: bool, strict_code: bool) -> Message {
    let names = caps::bound_names(inject_b64zlib).join(", ");
    let b64_note = if inject_b64zlib {
        " `base64` and `zlib.decompress` are also pre-bound for encoded payloads."
    } else {
        ""
    };
    let strict_note = if strict_code {
        format!("\n{STRICT_CODE_NOTE}")
    } else {
        String::new()
    };
    Message::system(format!(
        r#"You are answering a query over a large context through a restricted, stateful Python REPL. You will be queried iteratively until you provide a final answer.

The REPL environment is initialized with:
1. A `context` string variable holding the full context and a `query` string variable holding the question. Inspect `context` through the REPL; only truncated output is shown back to you, so sample, target, then summarize instead of dumping everything.
2. A `recursive_llm(sub_query, sub_context)` function that runs a fresh sub-agent over a smaller piece of the context and returns its answer as a string. Use it for targeted semantic questions over chunks; avoid exhaustive or repetitive sub-calls.
3. `print()` to observe intermediate results and continue your reasoning. Variables persist across turns, so build up buffers as you go.

The following names are pre-bound and are the ONLY reachable surface: {names}.
The modules `re`, `json` and `binascii` are already bound; do NOT use import statements, they are disabled and will fail.{b64_note} There is no filesystem, network or attribute access beyond the documented methods.

Each reply must be either Python code for the REPL or a final answer. When you are done, finish with one of these on its own line:
1. FINAL(your final answer) to answer directly
2. FINAL_VAR(variable_name) to return a variable you built in the REPL

Do not emit FINAL until you have actually looked at the context. Think step by step, plan briefly, then act in the same reply.{strict_note}"#
    ))
}

/// The first user message: the query plus the context itself or a head
/// snippet with a length summary.
pub fn initial_user_message(query: &str, context: &str) -> Message {
    let preview = context_preview(context, CONTEXT_INLINE_THRESHOLD);
    Message::user(format!(
        "Query: {query}\n\nContext (also bound to the `context` variable):\n{preview}\n\nInspect the context in the REPL before answering. Your next action:"
    ))
}

/// Nudges the model after a reply that was neither code nor a final.
pub fn prose_reminder() -> Message {
    Message::user(
        "Your last reply was neither runnable code nor a FINAL(...) line. Reply with Python code for the REPL, or finish with FINAL(answer) or FINAL_VAR(name) on its own line.",
    )
}

/// Wraps a turn's executor result for the next user message. Errors arrive
/// verbatim, single-line, with no stack trace.
pub fn execution_result_message(output: &str) -> Message {
    let body = if output.is_empty() { "No output" } else { output };
    Message::user(format!("REPL output:\n{body}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_enumerates_surface() {
        let prompt = build_system_prompt(true, false);
        for name in ["context", "query", "recursive_llm", "re", "json", "zlib"] {
            assert!(prompt.content.contains(name), "missing {name}");
        }
        assert!(prompt.content.contains("FINAL_VAR"));
        assert!(!prompt.content.contains(STRICT_CODE_NOTE));
    }

    #[test]
    fn strict_code_note_is_optional() {
        let prompt = build_system_prompt(true, true);
        assert!(prompt.content.contains("ASCII"));
    }

    #[test]
    fn b64zlib_can_be_hidden() {
        let prompt = build_system_prompt(false, false);
        assert!(!prompt.content.contains("zlib"));
    }

    #[test]
    fn long_context_is_summarized_in_first_message() {
        let message = initial_user_message("q?", &"x".repeat(10_000));
        assert!(message.content.contains("total length 10000 chars"));
    }
}
