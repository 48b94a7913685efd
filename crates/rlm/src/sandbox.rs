//! The sandbox facade: one persistent environment, turn-atomic `execute`,
//! expression evaluation for final sentinels, and a JSON-safe state
//! snapshot used by the stdio bridge.

use std::collections::HashMap;
use std::rc::Rc;

use crate::caps;
use crate::error::ExecutionError;
use crate::interp::{Interp, Limits, RecursionHook};
use crate::output::OutputBuffer;
use crate::parser;
use crate::value::{CopyCache, Key, ScopeRef, Value, deep_copy, new_scope, to_display};

#[derive(Clone, Copy, Debug)]
pub struct SandboxConfig {
    pub limits: Limits,
    pub max_output_chars: usize,
    pub zlib_max_output_bytes: usize,
    pub inject_b64zlib: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            max_output_chars: 2000,
            zlib_max_output_bytes: 1024 * 1024,
            inject_b64zlib: true,
        }
    }
}

pub struct Sandbox {
    globals: ScopeRef,
    config: SandboxConfig,
    recursion: Option<Rc<RecursionHook>>,
}

impl Sandbox {
    pub fn new(
        context: &str,
        query: &str,
        config: SandboxConfig,
        recursion: Option<Rc<RecursionHook>>,
    ) -> Self {
        let globals = new_scope();
        caps::seed_globals(&globals, context, query, config.inject_b64zlib);
        Self {
            globals,
            config,
            recursion,
        }
    }

    /// Identity-preserving deep copy of every binding. The globals cell
    /// itself is seeded into the cache so closures keep pointing at it.
    fn snapshot(&self) -> HashMap<String, Value> {
        let mut cache = CopyCache::new();
        cache.seed_scope(&self.globals, self.globals.clone());
        self.globals
            .borrow()
            .iter()
            .map(|(name, value)| (name.clone(), deep_copy(value, &mut cache)))
            .collect()
    }

    /// Runs one turn. On success the mutations stay committed and the
    /// truncated print buffer is returned; on any failure the environment is
    /// rolled back to its pre-call state.
    pub fn execute(&mut self, code: &str) -> Result<String, ExecutionError> {
        let stmts = parser::parse_program(code)?;
        let snapshot = self.snapshot();
        let mut output = OutputBuffer::new();
        let result = {
            let mut interp = Interp::new(
                self.globals.clone(),
                &mut output,
                self.config.limits,
                self.recursion.clone(),
                self.config.zlib_max_output_bytes,
            );
            interp.run(&stmts)
        };
        match result {
            Ok(()) => Ok(output.finish(self.config.max_output_chars)),
            Err(err) => {
                *self.globals.borrow_mut() = snapshot;
                Err(err)
            }
        }
    }

    /// Evaluates a single expression against the current environment, e.g. a
    /// `FINAL(...)` payload, coerced to its `str()` form. Mutations made by
    /// the expression are always discarded.
    pub fn eval_expression(&mut self, source: &str) -> Result<String, ExecutionError> {
        let expr = parser::parse_expression(source)?;
        let snapshot = self.snapshot();
        let mut output = OutputBuffer::new();
        let result = {
            let mut interp = Interp::new(
                self.globals.clone(),
                &mut output,
                self.config.limits,
                self.recursion.clone(),
                self.config.zlib_max_output_bytes,
            );
            interp.eval(&expr)
        };
        *self.globals.borrow_mut() = snapshot;
        result.map(|value| to_display(&value))
    }

    /// The `str()` form of a bound variable, for `FINAL_VAR(name)`.
    pub fn get_variable(&self, name: &str) -> Option<String> {
        self.globals.borrow().get(name).map(to_display)
    }

    /// JSON-safe user bindings. `context` and `query` are omitted (they are
    /// re-seeded per step) and non-JSON values are dropped.
    pub fn export_state(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (name, value) in self.globals.borrow().iter() {
            if name == "context" || name == "query" {
                continue;
            }
            if let Some(json) = value_to_json(value) {
                map.insert(name.clone(), json);
            }
        }
        serde_json::Value::Object(map)
    }

    pub fn import_state(&mut self, state: &serde_json::Value) {
        if let serde_json::Value::Object(map) = state {
            let mut scope = self.globals.borrow_mut();
            for (name, json) in map {
                scope.insert(name.clone(), caps::json_to_value(json));
            }
        }
    }
}

fn value_to_json(value: &Value) -> Option<serde_json::Value> {
    match value {
        Value::None => Some(serde_json::Value::Null),
        Value::Bool(b) => Some(serde_json::Value::Bool(*b)),
        Value::Int(i) => Some(serde_json::Value::Number((*i).into())),
        Value::Float(f) => serde_json::Number::from_f64(*f).map(serde_json::Value::Number),
        Value::Str(s) => Some(serde_json::Value::String(s.to_string())),
        Value::List(items) => {
            let out: Option<Vec<_>> = items.borrow().iter().map(value_to_json).collect();
            Some(serde_json::Value::Array(out?))
        }
        Value::Tuple(items) => {
            let out: Option<Vec<_>> = items.iter().map(value_to_json).collect();
            Some(serde_json::Value::Array(out?))
        }
        Value::Dict(dict) => {
            let mut map = serde_json::Map::new();
            for (key, item) in dict.borrow().entries() {
                let Key::Str(name) = key else {
                    return None;
                };
                map.insert(name.to_string(), value_to_json(item)?);
            }
            Some(serde_json::Value::Object(map))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::time::Duration;

    fn sandbox() -> Sandbox {
        Sandbox::new("the quick brown fox", "what animal?", SandboxConfig::default(), None)
    }

    fn run(sb: &mut Sandbox, code: &str) -> String {
        sb.execute(code).expect(code)
    }

    #[test]
    fn arithmetic_and_echo() {
        let mut sb = sandbox();
        assert_eq!(run(&mut sb, "1 + 2 * 3"), "7\n");
        assert_eq!(run(&mut sb, "7 // 2, 7 % 2, -7 // 2, -7 % 2"), "(3, 1, -4, 1)\n");
        assert_eq!(run(&mut sb, "2 ** 10"), "1024\n");
        assert_eq!(run(&mut sb, "7 / 2"), "3.5\n");
    }

    #[test]
    fn state_persists_across_turns() {
        let mut sb = sandbox();
        run(&mut sb, "x = 41");
        assert_eq!(run(&mut sb, "x + 1"), "42\n");
    }

    #[test]
    fn print_forms() {
        let mut sb = sandbox();
        assert_eq!(run(&mut sb, "print('a', 'b')"), "a b\n");
        assert_eq!(run(&mut sb, "print('a', 'b', sep='-', end='!')"), "a-b!");
        // print() with no arguments emits exactly one newline
        assert_eq!(run(&mut sb, "print()"), "\n");
    }

    #[test]
    fn failed_turn_rolls_back_bindings() {
        let mut sb = sandbox();
        run(&mut sb, "x = 1\nxs = [1, 2]");
        let err = sb.execute("x = 99\nxs.append(3)\n1 / 0").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ZeroDivision);
        assert_eq!(run(&mut sb, "x"), "1\n");
        assert_eq!(run(&mut sb, "xs"), "[1, 2]\n");
    }

    #[test]
    fn failed_turn_rolls_back_closure_state() {
        let mut sb = sandbox();
        run(
            &mut sb,
            "def make_counter():\n    state = [0]\n    def bump():\n        state[0] = state[0] + 1\n        return state[0]\n    return bump\ncounter = make_counter()\ncounter()",
        );
        assert!(sb.execute("counter()\nraise ValueError('boom')").is_err());
        assert_eq!(run(&mut sb, "counter()"), "2\n");
    }

    #[test]
    fn import_forms_refused_with_contract_message() {
        let mut sb = sandbox();
        for code in [
            "import re",
            "from json import loads",
            "__import__('os')",
        ] {
            let err = sb.execute(code).unwrap_err();
            assert!(
                err.to_string().contains("__import__ not found"),
                "{code}: {err}"
            );
        }
    }

    #[test]
    fn prebound_modules_work_without_import() {
        let mut sb = sandbox();
        assert_eq!(run(&mut sb, "re.findall(r'\\w+', 'a b c')"), "['a', 'b', 'c']\n");
        assert_eq!(run(&mut sb, "json.dumps({'a': 1})"), "'{\"a\": 1}'\n");
        assert_eq!(
            run(&mut sb, "base64.b64encode(b'hi')"),
            "b'aGk='\n"
        );
        assert_eq!(run(&mut sb, "binascii.hexlify(b'\\x01\\xff')"), "b'01ff'\n");
    }

    #[test]
    fn regex_backreferences_work() {
        let mut sb = sandbox();
        assert_eq!(
            run(&mut sb, "re.findall(r'(\\w)\\1', 'aa bc dd')"),
            "['a', 'd']\n"
        );
    }

    #[test]
    fn regex_pattern_size_is_capped() {
        let mut sb = sandbox();
        let err = sb.execute("re.compile('a' * 5000)").unwrap_err();
        assert!(err.message.contains("pattern too large"));
    }

    #[test]
    fn regex_match_objects() {
        let mut sb = sandbox();
        run(&mut sb, "m = re.search(r'(\\d+)-(\\d+)', 'id 12-34 end')");
        assert_eq!(run(&mut sb, "m.group(0)"), "'12-34'\n");
        assert_eq!(run(&mut sb, "m.group(1), m.group(2)"), "('12', '34')\n");
        assert_eq!(run(&mut sb, "m.span()"), "(3, 8)\n");
        assert_eq!(run(&mut sb, "m.groups()"), "('12', '34')\n");
    }

    #[test]
    fn regex_sub_and_split() {
        let mut sb = sandbox();
        assert_eq!(
            run(&mut sb, "re.sub(r'(\\d+)', r'<\\1>', 'a1 b22')"),
            "'a<1> b<22>'\n"
        );
        assert_eq!(
            run(&mut sb, "re.split(r',\\s*', 'a, b,c')"),
            "['a', 'b', 'c']\n"
        );
    }

    #[test]
    fn json_round_trip() {
        let mut sb = sandbox();
        run(
            &mut sb,
            "x = {'a': [1, 2.5, None, True], 'b': 'text'}\ny = json.loads(json.dumps(x))",
        );
        assert_eq!(run(&mut sb, "x == y"), "True\n");
        let err = sb.execute("json.dumps(b'raw')").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Type);
    }

    #[test]
    fn json_dumps_options() {
        let mut sb = sandbox();
        assert_eq!(
            run(&mut sb, "json.dumps({'k': 'é'})"),
            "'{\"k\": \"\\\\u00e9\"}'\n"
        );
        assert_eq!(
            run(&mut sb, "print(json.dumps({'k': 'é'}, ensure_ascii=False))"),
            "{\"k\": \"é\"}\n"
        );
        assert_eq!(
            run(&mut sb, "print(json.dumps([1], indent=2))"),
            "[\n  1\n]\n"
        );
    }

    #[test]
    fn truncation_suffix_is_exact() {
        let mut sb = sandbox();
        let out = run(&mut sb, "print('x' * 10000)");
        let suffix = "\n\n[truncated 10001 chars -> 2000]";
        assert!(out.ends_with(suffix));
        assert_eq!(out.chars().count(), 2000 + suffix.chars().count());
    }

    #[test]
    fn output_at_cap_is_untouched() {
        let mut sb = sandbox();
        let out = run(&mut sb, "print('x' * 1999)");
        assert_eq!(out.len(), 2000);
        assert!(!out.contains("[truncated"));
    }

    #[test]
    fn step_limit_fires() {
        let mut sb = Sandbox::new(
            "",
            "",
            SandboxConfig {
                limits: Limits {
                    max_steps: 10_000,
                    ..Limits::default()
                },
                ..SandboxConfig::default()
            },
            None,
        );
        let err = sb.execute("i = 0\nwhile True:\n    i = i + 1").unwrap_err();
        assert_eq!(err.kind, ErrorKind::StepLimit);
    }

    #[test]
    fn wall_clock_timeout_fires() {
        let mut sb = Sandbox::new(
            "",
            "",
            SandboxConfig {
                limits: Limits {
                    timeout: Duration::from_millis(50),
                    max_steps: u64::MAX,
                    ..Limits::default()
                },
                ..SandboxConfig::default()
            },
            None,
        );
        let start = std::time::Instant::now();
        let err = sb.execute("while True:\n    pass").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn memory_limit_fires_before_allocation() {
        let mut sb = sandbox();
        let err = sb.execute("s = 'x' * 100_000_000").unwrap_err();
        assert_eq!(err.kind, ErrorKind::MemoryLimit);
    }

    #[test]
    fn recursion_limit_fires() {
        let mut sb = sandbox();
        let err = sb
            .execute("def f():\n    return f()\nf()")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RecursionLimit);
    }

    #[test]
    fn resource_errors_are_not_catchable() {
        let mut sb = Sandbox::new(
            "",
            "",
            SandboxConfig {
                limits: Limits {
                    max_steps: 5_000,
                    ..Limits::default()
                },
                ..SandboxConfig::default()
            },
            None,
        );
        let err = sb
            .execute("try:\n    while True:\n        pass\nexcept Exception:\n    print('caught')")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::StepLimit);
    }

    #[test]
    fn try_except_finally() {
        let mut sb = sandbox();
        let out = run(
            &mut sb,
            "try:\n    raise ValueError('bad input')\nexcept ValueError as e:\n    print('caught', e)\nfinally:\n    print('done')",
        );
        assert_eq!(out, "caught bad input\ndone\n");
        let out = run(
            &mut sb,
            "try:\n    x = {}['missing']\nexcept (KeyError, IndexError):\n    print('mapped')",
        );
        assert_eq!(out, "mapped\n");
    }

    #[test]
    fn dunder_access_is_refused() {
        let mut sb = sandbox();
        let err = sb.execute("context.__class__").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Attribute);
        let err = sb.execute("getattr(context, 'upper')").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Name);
    }

    #[test]
    fn slicing_and_negative_indices() {
        let mut sb = sandbox();
        assert_eq!(run(&mut sb, "'hello'[-1]"), "'o'\n");
        assert_eq!(run(&mut sb, "'hello'[1:4]"), "'ell'\n");
        assert_eq!(run(&mut sb, "'hello'[::-1]"), "'olleh'\n");
        assert_eq!(run(&mut sb, "[1, 2, 3, 4][::2]"), "[1, 3]\n");
        assert_eq!(run(&mut sb, "context[4:9]"), "'quick'\n");
    }

    #[test]
    fn comprehensions_do_not_leak_scope() {
        let mut sb = sandbox();
        assert_eq!(run(&mut sb, "[i * i for i in range(4)]"), "[0, 1, 4, 9]\n");
        assert_eq!(
            run(&mut sb, "{k: v for k, v in [('a', 1), ('b', 2)]}"),
            "{'a': 1, 'b': 2}\n"
        );
        let err = sb.execute("[j for j in range(3)]\nj").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Name);
    }

    #[test]
    fn generator_expressions_feed_aggregates() {
        let mut sb = sandbox();
        assert_eq!(run(&mut sb, "sum(i for i in range(5))"), "10\n");
        assert_eq!(run(&mut sb, "max(len(w) for w in ['a', 'abc'])"), "3\n");
    }

    #[test]
    fn functions_closures_and_defaults() {
        let mut sb = sandbox();
        run(
            &mut sb,
            "def power(base, exp=2):\n    return base ** exp\nsquare = lambda n: power(n)",
        );
        assert_eq!(run(&mut sb, "power(3), power(2, 10), square(5)"), "(9, 1024, 25)\n");
        run(
            &mut sb,
            "def tag(*args, **kwargs):\n    return (args, sorted(kwargs.keys()))",
        );
        assert_eq!(
            run(&mut sb, "tag(1, 2, a=3, b=4)"),
            "((1, 2), ['a', 'b'])\n"
        );
    }

    #[test]
    fn fstrings_render() {
        let mut sb = sandbox();
        run(&mut sb, "n = 7\nword = 'ok'");
        assert_eq!(run(&mut sb, "f'{n} is {word}!'"), "'7 is ok!'\n");
        assert_eq!(run(&mut sb, "f'{n:>4}'"), "'   7'\n");
        assert_eq!(run(&mut sb, "f'{3.14159:.2f}'"), "'3.14'\n");
        assert_eq!(run(&mut sb, "f'{word!r}'"), "\"'ok'\"\n");
    }

    #[test]
    fn builtin_coverage() {
        let mut sb = sandbox();
        assert_eq!(run(&mut sb, "sorted([3, 1, 2], reverse=True)"), "[3, 2, 1]\n");
        assert_eq!(
            run(&mut sb, "sorted(['bb', 'a'], key=len)"),
            "['a', 'bb']\n"
        );
        assert_eq!(run(&mut sb, "list(zip([1, 2], 'ab'))"), "[(1, 'a'), (2, 'b')]\n");
        assert_eq!(run(&mut sb, "list(enumerate('ab', 1))"), "[(1, 'a'), (2, 'b')]\n");
        assert_eq!(run(&mut sb, "list(map(str, [1, 2]))"), "['1', '2']\n");
        assert_eq!(
            run(&mut sb, "list(filter(lambda x: x % 2, range(5)))"),
            "[1, 3]\n"
        );
        assert_eq!(run(&mut sb, "divmod(7, 2)"), "(3, 1)\n");
        assert_eq!(run(&mut sb, "pow(2, 10, 1000)"), "24\n");
        assert_eq!(run(&mut sb, "round(2.5), round(3.5)"), "(2, 4)\n");
        assert_eq!(run(&mut sb, "int('ff', 16), hex(255)"), "(255, '0xff')\n");
        assert_eq!(run(&mut sb, "isinstance(True, int)"), "True\n");
        assert_eq!(run(&mut sb, "it = iter([1, 2])\nprint(next(it), next(it), next(it, 'end'))"), "1 2 end\n");
    }

    #[test]
    fn string_methods() {
        let mut sb = sandbox();
        assert_eq!(run(&mut sb, "' pad '.strip()"), "'pad'\n");
        assert_eq!(run(&mut sb, "'a,b,,c'.split(',')"), "['a', 'b', '', 'c']\n");
        assert_eq!(run(&mut sb, "'a b  c'.split()"), "['a', 'b', 'c']\n");
        assert_eq!(run(&mut sb, "'-'.join(['a', 'b'])"), "'a-b'\n");
        assert_eq!(run(&mut sb, "'hello'.find('ll'), 'hello'.find('zz')"), "(2, -1)\n");
        assert_eq!(run(&mut sb, "'abcabc'.count('bc')"), "2\n");
        assert_eq!(run(&mut sb, "'a-b'.replace('-', '+')"), "'a+b'\n");
        assert_eq!(run(&mut sb, "'ok'.upper().lower()"), "'ok'\n");
        assert_eq!(run(&mut sb, "'x=1'.partition('=')"), "('x', '=', '1')\n");
        assert_eq!(run(&mut sb, "'5'.zfill(3)"), "'005'\n");
        assert_eq!(run(&mut sb, "'prefix_x'.removeprefix('prefix_')"), "'x'\n");
    }

    #[test]
    fn container_methods() {
        let mut sb = sandbox();
        run(&mut sb, "xs = [3, 1]\nxs.append(2)\nxs.sort()");
        assert_eq!(run(&mut sb, "xs"), "[1, 2, 3]\n");
        run(&mut sb, "d = {'a': 1}\nd.update({'b': 2})");
        assert_eq!(run(&mut sb, "d.get('b'), d.get('zz', 0)"), "(2, 0)\n");
        assert_eq!(run(&mut sb, "sorted(d.items())"), "[('a', 1), ('b', 2)]\n");
        run(&mut sb, "s = {1, 2}\ns.add(3)");
        assert_eq!(run(&mut sb, "sorted(s | {4})"), "[1, 2, 3, 4]\n");
        assert_eq!(run(&mut sb, "sorted({1, 2, 3} & {2, 3, 4})"), "[2, 3]\n");
    }

    #[test]
    fn dict_iteration_is_insertion_ordered() {
        let mut sb = sandbox();
        run(&mut sb, "d = {}\nd['z'] = 1\nd['a'] = 2\nd['m'] = 3");
        assert_eq!(run(&mut sb, "list(d)"), "['z', 'a', 'm']\n");
        assert_eq!(run(&mut sb, "list(d.values())"), "[1, 2, 3]\n");
    }

    #[test]
    fn zlib_cap_boundary() {
        use flate2::Compression;
        use flate2::write::ZlibEncoder;
        use std::io::Write;

        let cap = 1024 * 1024;
        let make_code = |size: usize| {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&vec![0u8; size]).expect("compress");
            let compressed = encoder.finish().expect("finish");
            format!(
                "data = binascii.unhexlify('{}')\nprint(len(zlib.decompress(data)))",
                hex::encode(compressed)
            )
        };
        let mut sb = sandbox();
        assert_eq!(run(&mut sb, &make_code(cap)), format!("{cap}\n"));
        let err = sb.execute(&make_code(cap + 1)).unwrap_err();
        assert!(err.message.contains("zlib output exceeds limit"), "{err}");
    }

    #[test]
    fn base64_round_trip() {
        let mut sb = sandbox();
        assert_eq!(
            run(&mut sb, "base64.b64decode(base64.b64encode(b'\\x00\\x01data')) == b'\\x00\\x01data'"),
            "True\n"
        );
    }

    #[test]
    fn recursive_llm_uses_hook() {
        let hook: Rc<RecursionHook> =
            Rc::new(|q: &str, c: &str| format!("echo:{q}:{}", c.len()));
        let mut sb = Sandbox::new("ctx", "q", SandboxConfig::default(), Some(hook));
        assert_eq!(
            run(&mut sb, "print(recursive_llm('count', context))"),
            "echo:count:3\n"
        );
    }

    #[test]
    fn recursive_llm_without_hook_degrades() {
        let mut sb = sandbox();
        let out = run(&mut sb, "print(recursive_llm('q', 'c'))");
        assert!(out.contains("unavailable"));
    }

    #[test]
    fn eval_expression_for_finals() {
        let mut sb = sandbox();
        run(&mut sb, "answer = 42");
        assert_eq!(sb.eval_expression("answer").unwrap(), "42");
        assert_eq!(sb.eval_expression("'v=' + str(answer)").unwrap(), "v=42");
        assert!(sb.eval_expression("missing_name").is_err());
        // mutations from a final expression are discarded
        run(&mut sb, "xs = []");
        let _ = sb.eval_expression("xs.append(1) or str(xs)");
        assert_eq!(run(&mut sb, "xs"), "[]\n");
    }

    #[test]
    fn get_variable_str_coerces() {
        let mut sb = sandbox();
        run(&mut sb, "answer = 42");
        assert_eq!(sb.get_variable("answer").as_deref(), Some("42"));
        assert_eq!(sb.get_variable("nope"), None);
    }

    #[test]
    fn state_export_import_round_trip() {
        let mut sb = sandbox();
        run(&mut sb, "total = 10\nnames = ['a', 'b']\nmeta = {'k': 1.5}");
        let state = sb.export_state();
        let mut restored =
            Sandbox::new("the quick brown fox", "what animal?", SandboxConfig::default(), None);
        restored.import_state(&state);
        assert_eq!(
            restored.execute("print(total, names, meta)").unwrap(),
            "10 ['a', 'b'] {'k': 1.5}\n"
        );
    }

    #[test]
    fn snapshot_restore_matches_continuous_execution() {
        let mut continuous = sandbox();
        run(&mut continuous, "acc = [1]\nacc.append(2)");
        let expected = run(&mut continuous, "acc.append(3)\nprint(acc)");

        let mut first = sandbox();
        run(&mut first, "acc = [1]\nacc.append(2)");
        let state = first.export_state();
        let mut second =
            Sandbox::new("the quick brown fox", "what animal?", SandboxConfig::default(), None);
        second.import_state(&state);
        assert_eq!(second.execute("acc.append(3)\nprint(acc)").unwrap(), expected);
    }

    #[test]
    fn needle_in_context_is_findable() {
        let mut filler = "lorem ipsum dolor sit amet ".repeat(8000);
        filler.insert_str(
            filler.len() / 2,
            " One of the special magic numbers for key-7 is: 123456789. ",
        );
        let mut sb = Sandbox::new(
            &filler,
            "What is the special magic number for key-7?",
            SandboxConfig::default(),
            None,
        );
        let out = run(
            &mut sb,
            "hits = re.findall(r'magic numbers for key-7 is: (\\d+)', context)\nprint(hits[0])",
        );
        assert_eq!(out, "123456789\n");
    }

    #[test]
    fn timing_invariant_holds() {
        let timeout = Duration::from_millis(100);
        let mut sb = Sandbox::new(
            "",
            "",
            SandboxConfig {
                limits: Limits {
                    timeout,
                    max_steps: u64::MAX,
                    ..Limits::default()
                },
                ..SandboxConfig::default()
            },
            None,
        );
        let start = std::time::Instant::now();
        let _ = sb.execute("while True:\n    pass");
        // timeout plus a small constant slack
        assert!(start.elapsed() < timeout + Duration::from_secs(1));
    }
}
