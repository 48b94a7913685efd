/// Captured `print` output for one `execute` call. The buffer grows freely
/// (allocation is charged against the memory cap by the interpreter) and is
/// clipped once at flush time.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    buf: String,
}

/// The machine-detectable truncation marker; `{L}` is the pre-clip length in
/// chars and `{N}` the cap.
pub fn truncation_suffix(pre_clip: usize, cap: usize) -> String {
    format!("\n\n[truncated {pre_clip} chars -> {cap}]")
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_str(&mut self, text: &str) {
        self.buf.push_str(text);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Clips to `max_chars` and appends the deterministic suffix when the
    /// buffer exceeded the cap.
    pub fn finish(self, max_chars: usize) -> String {
        let total = self.buf.chars().count();
        if total <= max_chars {
            return self.buf;
        }
        let mut clipped: String = self.buf.chars().take(max_chars).collect();
        clipped.push_str(&truncation_suffix(total, max_chars));
        clipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_output_passes_through() {
        let mut out = OutputBuffer::new();
        out.push_str("hello\n");
        assert_eq!(out.finish(2000), "hello\n");
    }

    #[test]
    fn long_output_gets_exact_suffix() {
        let mut out = OutputBuffer::new();
        out.push_str(&"x".repeat(10_000));
        out.push_str("\n");
        let result = out.finish(2000);
        let suffix = "\n\n[truncated 10001 chars -> 2000]";
        assert!(result.ends_with(suffix));
        assert_eq!(result.chars().count(), 2000 + suffix.chars().count());
    }

    #[test]
    fn boundary_is_not_truncated() {
        let mut out = OutputBuffer::new();
        out.push_str(&"y".repeat(2000));
        let result = out.finish(2000);
        assert_eq!(result.len(), 2000);
        assert!(!result.contains("[truncated"));
    }
}
