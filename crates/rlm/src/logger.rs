use crate::llm::Message;

/// Console progress logger for interactive runs. Structured history goes to
/// the transcript writer; this is the human-readable view, off by default.
#[derive(Clone, Debug)]
pub struct Logger {
    enabled: bool,
    step: usize,
    execution_count: usize,
}

impl Logger {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            step: 0,
            execution_count: 0,
        }
    }

    fn print_separator(&self, ch: char) {
        if self.enabled {
            let line: String = std::iter::repeat_n(ch, 80).collect();
            println!("{line}");
        }
    }

    pub fn log_task_start(&mut self, query: &str, depth: usize, context_len: usize) {
        if !self.enabled {
            return;
        }
        self.step = 0;
        self.execution_count = 0;
        self.print_separator('=');
        println!("STARTING TASK (depth {depth})");
        self.print_separator('=');
        println!("QUERY: {query}");
        println!("CONTEXT: {context_len} chars");
        println!();
    }

    pub fn log_initial_messages(&self, messages: &[Message]) {
        if !self.enabled {
            return;
        }
        println!("INITIAL MESSAGES:");
        for (idx, msg) in messages.iter().enumerate() {
            let content = truncate(msg.content.as_str(), 2000);
            println!("  [{}] {}: {}", idx + 1, msg.role.to_uppercase(), content);
        }
        println!();
    }

    pub fn log_model_response(&mut self, response: &str, is_final: bool) {
        if !self.enabled {
            return;
        }
        self.step += 1;
        println!("MODEL RESPONSE (step {}):", self.step);
        println!("  {}", truncate(response, 500));
        if is_final {
            println!("  Final sentinel detected");
        }
        println!();
    }

    pub fn log_llm_error(&self, attempt: u32, error: &str) {
        if !self.enabled {
            return;
        }
        println!("LLM ERROR (attempt {attempt}): {}", truncate(error, 300));
        println!();
    }

    pub fn log_execution(&mut self, code: &str, result: &str, elapsed_secs: f64) {
        if !self.enabled {
            return;
        }
        self.execution_count += 1;
        println!("REPL EXECUTION [{}]:", self.execution_count);
        println!("  Code:\n{}", truncate(code, 2000));
        if result.is_empty() {
            println!("  Output: No output");
        } else {
            println!("  Output:\n{}", truncate(result, 2000));
        }
        println!("  Execution time: {elapsed_secs:.4}s");
        println!();
    }

    pub fn log_final_response(&self, answer: &str) {
        if !self.enabled {
            return;
        }
        self.print_separator('=');
        println!("FINAL ANSWER:");
        self.print_separator('=');
        println!("{answer}");
        self.print_separator('=');
        println!();
    }
}

fn truncate(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_owned();
    }
    format!("{}...", slice_to_boundary(text, max_len))
}

fn slice_to_boundary(text: &str, max_len: usize) -> &str {
    let mut end = max_len.min(text.len());
    while !text.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "héllo wörld";
        let out = truncate(text, 3);
        assert!(out.ends_with("..."));
        assert!(out.len() <= 6);
    }
}
