//! Parsing of raw model output: the `FINAL(...)` / `FINAL_VAR(name)`
//! sentinel scan and fence-tolerant code extraction. Classification is
//! deterministic: the same content always produces the same result.

use regex::Regex;

/// What a model reply turned out to be.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelReply {
    Final(FinalSentinel),
    Code(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinalSentinel {
    /// The source text between the parens of `FINAL(...)`, to be evaluated
    /// in the session environment (or answered raw if not evaluable).
    Expr(String),
    /// The identifier from `FINAL_VAR(name)`.
    Var(String),
}

pub fn classify_reply(content: &str) -> ModelReply {
    match find_final(content) {
        Some(sentinel) => ModelReply::Final(sentinel),
        None => ModelReply::Code(extract_code(content)),
    }
}

/// Scans line by line for a final sentinel. Leading whitespace and backtick
/// fence artifacts are ignorable; whitespace inside the payload is kept
/// verbatim. An unbalanced `FINAL(` is not a sentinel.
pub fn find_final(content: &str) -> Option<FinalSentinel> {
    let mut offset = 0;
    for line in content.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let stripped = line.trim_start().trim_start_matches('`').trim_start();
        let strip_len = line.len() - stripped.len();
        if let Some(rest) = stripped.strip_prefix("FINAL_VAR(") {
            let payload = match balanced_payload(rest) {
                Some(payload) => payload,
                None => continue,
            };
            let name = payload
                .trim()
                .trim_matches('"')
                .trim_matches('\'')
                .trim()
                .to_owned();
            if is_identifier(&name) {
                return Some(FinalSentinel::Var(name));
            }
            continue;
        }
        if stripped.starts_with("FINAL(") {
            // scan from the full content so triple-quoted payloads may span
            // lines
            let payload_start = line_start + strip_len + "FINAL(".len();
            if let Some(payload) = balanced_payload(&content[payload_start..]) {
                return Some(FinalSentinel::Expr(payload));
            }
        }
    }
    None
}

/// Text up to the paren balancing an already-consumed `(`. Parens inside
/// string literals do not count; backslash escapes are honored.
fn balanced_payload(rest: &str) -> Option<String> {
    let mut depth = 1usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (idx, c) in rest.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(rest[..idx].to_owned());
                }
            }
            _ => {}
        }
    }
    None
}

pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

/// Pulls code out of a reply. Fenced blocks win (``` with an optional
/// `python`/`py`/`repl` tag, all blocks joined); bare replies are taken as
/// code wholesale.
pub fn extract_code(content: &str) -> String {
    let pattern = Regex::new(r"```(?:repl|python|py)?[ \t]*\n(?s:(.*?))\n?```").expect("regex");
    let blocks: Vec<String> = pattern
        .captures_iter(content)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().trim().to_owned()))
        .filter(|block| !block.is_empty())
        .collect();
    if blocks.is_empty() {
        content.trim().to_owned()
    } else {
        blocks.join("\n")
    }
}

/// Clips `context` to at most `max_chars` characters before it enters the
/// sandbox.
pub fn truncate_context(context: &str, max_chars: usize) -> String {
    if context.chars().count() <= max_chars {
        context.to_owned()
    } else {
        context.chars().take(max_chars).collect()
    }
}

/// The first user message shows the context inline when it is small, or a
/// head snippet plus a length summary when it is not.
pub fn context_preview(context: &str, inline_threshold: usize) -> String {
    let total = context.chars().count();
    if total <= inline_threshold {
        return context.to_owned();
    }
    let head: String = context.chars().take(inline_threshold).collect();
    format!("{head}\n...[context continues; total length {total} chars; read it via the `context` variable]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_final_is_detected() {
        assert_eq!(
            find_final("FINAL(\"the answer\")"),
            Some(FinalSentinel::Expr("\"the answer\"".to_owned()))
        );
    }

    #[test]
    fn final_with_leading_whitespace_and_fences() {
        let content = "```\n  FINAL('x')\n```";
        assert_eq!(
            find_final(content),
            Some(FinalSentinel::Expr("'x'".to_owned()))
        );
    }

    #[test]
    fn parens_inside_strings_do_not_close() {
        assert_eq!(
            find_final("FINAL(\"a (nested) paren :)\")"),
            Some(FinalSentinel::Expr("\"a (nested) paren :)\"".to_owned()))
        );
        assert_eq!(
            find_final("FINAL(str((1, 2)))"),
            Some(FinalSentinel::Expr("str((1, 2))".to_owned()))
        );
    }

    #[test]
    fn trailing_prose_after_final_is_ignored() {
        assert_eq!(
            find_final("FINAL('done') and that is my answer"),
            Some(FinalSentinel::Expr("'done'".to_owned()))
        );
    }

    #[test]
    fn whitespace_inside_payload_is_preserved() {
        assert_eq!(
            find_final("FINAL('  padded  ')"),
            Some(FinalSentinel::Expr("'  padded  '".to_owned()))
        );
    }

    #[test]
    fn unbalanced_final_is_code() {
        assert_eq!(find_final("FINAL(oops"), None);
        assert!(matches!(
            classify_reply("FINAL(oops"),
            ModelReply::Code(_)
        ));
    }

    #[test]
    fn mid_line_final_is_not_a_sentinel() {
        assert_eq!(find_final("x = FINAL('no')"), None);
    }

    #[test]
    fn final_var_forms() {
        assert_eq!(
            find_final("FINAL_VAR(answer)"),
            Some(FinalSentinel::Var("answer".to_owned()))
        );
        assert_eq!(
            find_final("FINAL_VAR('answer')"),
            Some(FinalSentinel::Var("answer".to_owned()))
        );
        assert_eq!(
            find_final("  FINAL_VAR( result_2 )"),
            Some(FinalSentinel::Var("result_2".to_owned()))
        );
    }

    #[test]
    fn final_var_wins_over_later_code() {
        let content = "some thoughts\nFINAL_VAR(buf)\nprint('ignored')";
        assert_eq!(
            find_final(content),
            Some(FinalSentinel::Var("buf".to_owned()))
        );
    }

    #[test]
    fn multiline_final_payload() {
        let content = "FINAL('''first\nsecond''')";
        assert_eq!(
            find_final(content),
            Some(FinalSentinel::Expr("'''first\nsecond'''".to_owned()))
        );
    }

    #[test]
    fn code_extraction_variants() {
        assert_eq!(extract_code("x = 1\nprint(x)"), "x = 1\nprint(x)");
        assert_eq!(extract_code("```python\nx = 1\n```"), "x = 1");
        assert_eq!(extract_code("```repl\nx = 1\n```"), "x = 1");
        assert_eq!(
            extract_code("first\n```\na = 1\n```\nthen\n```\nb = 2\n```"),
            "a = 1\nb = 2"
        );
    }

    #[test]
    fn classification_is_deterministic() {
        let content = "```repl\nprint(1)\n```";
        assert_eq!(classify_reply(content), classify_reply(content));
    }

    #[test]
    fn context_truncation_boundary() {
        let context = "a".repeat(100);
        assert_eq!(truncate_context(&context, 100).len(), 100);
        let longer = "a".repeat(101);
        assert_eq!(truncate_context(&longer, 100).len(), 100);
    }

    #[test]
    fn context_preview_summarizes_long_contexts() {
        let short = context_preview("tiny", 100);
        assert_eq!(short, "tiny");
        let long = context_preview(&"z".repeat(500), 100);
        assert!(long.contains("total length 500 chars"));
    }
}
