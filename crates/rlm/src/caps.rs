//! The capability surface: every name bound into a fresh sandbox
//! environment, plus the restricted `re`/`json`/`base64`/`binascii`/`zlib`
//! modules. Bindings mediate host facilities through the value model only.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use flate2::{Decompress, FlushDecompress, Status};

use crate::ast::BinOp;
use crate::error::{ErrorKind, ExecResult, ExecutionError};
use crate::interp::Interp;
use crate::methods::{
    self, BYTES_METHODS, DICT_METHODS, LIST_METHODS, SET_METHODS, SET_MUTATORS, STR_METHODS,
    TUPLE_METHODS,
};
use crate::value::{
    DictValue, ExceptionValue, IterState, IterValue, Key, MatchValue, MethodValue, Module,
    RangeValue, RegexValue, ScopeRef, SetValue, Value, repr, to_display, truthy, type_name,
};

pub const MAX_REGEX_PATTERN_BYTES: usize = 4096;

/// Identifier for every host-implemented callable reachable from the
/// sandbox. Dispatch is a closed match on this enum; nothing is reflected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Builtin {
    Print,
    Len,
    Range,
    Enumerate,
    Zip,
    Map,
    Filter,
    Sorted,
    Reversed,
    Sum,
    Min,
    Max,
    Abs,
    Round,
    Any,
    All,
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    List,
    Tuple,
    Dict,
    Set,
    Frozenset,
    Isinstance,
    Repr,
    Hash,
    Ord,
    Chr,
    Hex,
    Bin,
    Oct,
    Divmod,
    Pow,
    Iter,
    Next,
    ExcValue,
    ExcType,
    ExcKey,
    ExcIndex,
    ExcRuntime,
    ReFindall,
    ReSearch,
    ReMatch,
    ReSplit,
    ReSub,
    ReFinditer,
    ReEscape,
    ReCompile,
    JsonLoads,
    JsonDumps,
    B64Encode,
    B64Decode,
    B64UrlsafeEncode,
    B64UrlsafeDecode,
    Hexlify,
    Unhexlify,
    ZlibDecompress,
    RecursiveLlm,
}

impl Builtin {
    pub fn name(self) -> &'static str {
        use Builtin::*;
        match self {
            Print => "print",
            Len => "len",
            Range => "range",
            Enumerate => "enumerate",
            Zip => "zip",
            Map => "map",
            Filter => "filter",
            Sorted => "sorted",
            Reversed => "reversed",
            Sum => "sum",
            Min => "min",
            Max => "max",
            Abs => "abs",
            Round => "round",
            Any => "any",
            All => "all",
            Bool => "bool",
            Int => "int",
            Float => "float",
            Str => "str",
            Bytes => "bytes",
            List => "list",
            Tuple => "tuple",
            Dict => "dict",
            Set => "set",
            Frozenset => "frozenset",
            Isinstance => "isinstance",
            Repr => "repr",
            Hash => "hash",
            Ord => "ord",
            Chr => "chr",
            Hex => "hex",
            Bin => "bin",
            Oct => "oct",
            Divmod => "divmod",
            Pow => "pow",
            Iter => "iter",
            Next => "next",
            ExcValue => "ValueError",
            ExcType => "TypeError",
            ExcKey => "KeyError",
            ExcIndex => "IndexError",
            ExcRuntime => "RuntimeError",
            ReFindall => "findall",
            ReSearch => "search",
            ReMatch => "match",
            ReSplit => "split",
            ReSub => "sub",
            ReFinditer => "finditer",
            ReEscape => "escape",
            ReCompile => "compile",
            JsonLoads => "loads",
            JsonDumps => "dumps",
            B64Encode => "b64encode",
            B64Decode => "b64decode",
            B64UrlsafeEncode => "urlsafe_b64encode",
            B64UrlsafeDecode => "urlsafe_b64decode",
            Hexlify => "hexlify",
            Unhexlify => "unhexlify",
            ZlibDecompress => "decompress",
            RecursiveLlm => "recursive_llm",
        }
    }

    pub fn exception_kind(self) -> Option<ErrorKind> {
        match self {
            Builtin::ExcValue => Some(ErrorKind::Value),
            Builtin::ExcType => Some(ErrorKind::Type),
            Builtin::ExcKey => Some(ErrorKind::Key),
            Builtin::ExcIndex => Some(ErrorKind::Index),
            Builtin::ExcRuntime => Some(ErrorKind::Other),
            _ => None,
        }
    }
}

const GLOBAL_BUILTINS: &[Builtin] = &[
    Builtin::Print,
    Builtin::Len,
    Builtin::Range,
    Builtin::Enumerate,
    Builtin::Zip,
    Builtin::Map,
    Builtin::Filter,
    Builtin::Sorted,
    Builtin::Reversed,
    Builtin::Sum,
    Builtin::Min,
    Builtin::Max,
    Builtin::Abs,
    Builtin::Round,
    Builtin::Any,
    Builtin::All,
    Builtin::Bool,
    Builtin::Int,
    Builtin::Float,
    Builtin::Str,
    Builtin::Bytes,
    Builtin::List,
    Builtin::Tuple,
    Builtin::Dict,
    Builtin::Set,
    Builtin::Frozenset,
    Builtin::Isinstance,
    Builtin::Repr,
    Builtin::Hash,
    Builtin::Ord,
    Builtin::Chr,
    Builtin::Hex,
    Builtin::Bin,
    Builtin::Oct,
    Builtin::Divmod,
    Builtin::Pow,
    Builtin::Iter,
    Builtin::Next,
    Builtin::ExcValue,
    Builtin::ExcType,
    Builtin::ExcKey,
    Builtin::ExcIndex,
    Builtin::ExcRuntime,
];

/// Binds the whole capability surface plus `context`/`query` into a scope.
pub fn seed_globals(globals: &ScopeRef, context: &str, query: &str, inject_b64zlib: bool) {
    let mut scope = globals.borrow_mut();
    scope.insert("context".to_owned(), Value::Str(context.into()));
    scope.insert("query".to_owned(), Value::Str(query.into()));
    for builtin in GLOBAL_BUILTINS {
        scope.insert(builtin.name().to_owned(), Value::Builtin(*builtin));
    }
    scope.insert("re".to_owned(), Value::Module(Module::Re));
    scope.insert("json".to_owned(), Value::Module(Module::Json));
    scope.insert("binascii".to_owned(), Value::Module(Module::Binascii));
    if inject_b64zlib {
        scope.insert("base64".to_owned(), Value::Module(Module::Base64));
        scope.insert("zlib".to_owned(), Value::Module(Module::Zlib));
    }
    scope.insert(
        "recursive_llm".to_owned(),
        Value::Builtin(Builtin::RecursiveLlm),
    );
}

/// The names the system prompt advertises, in binding order.
pub fn bound_names(inject_b64zlib: bool) -> Vec<&'static str> {
    let mut names = vec!["context", "query"];
    names.extend(GLOBAL_BUILTINS.iter().map(|b| b.name()));
    names.extend(["re", "json", "binascii"]);
    if inject_b64zlib {
        names.extend(["base64", "zlib"]);
    }
    names.push("recursive_llm");
    names
}

/// Attribute lookup over the value model. Dunder access is rejected
/// everywhere; unknown names surface as `AttributeError` before any call.
pub fn get_attr(obj: &Value, name: &str) -> ExecResult<Value> {
    if name.starts_with("__") && name.ends_with("__") {
        return Err(ExecutionError::new(
            ErrorKind::Attribute,
            format!("access to dunder attribute '{name}' is forbidden"),
        ));
    }
    let missing = |owner: &str| {
        ExecutionError::new(
            ErrorKind::Attribute,
            format!("'{owner}' object has no attribute '{name}'"),
        )
    };
    let method = |recv: &Value| {
        Ok(Value::Method(Rc::new(MethodValue {
            recv: recv.clone(),
            name: name.into(),
        })))
    };
    match obj {
        Value::Module(module) => {
            let builtin = module_attr(*module, name).ok_or_else(|| {
                ExecutionError::new(
                    ErrorKind::Attribute,
                    format!("module '{}' has no attribute '{name}'", module.name()),
                )
            })?;
            Ok(Value::Builtin(builtin))
        }
        Value::Str(_) if STR_METHODS.contains(&name) => method(obj),
        Value::Str(_) => Err(missing("str")),
        Value::Bytes(_) if BYTES_METHODS.contains(&name) => method(obj),
        Value::Bytes(_) => Err(missing("bytes")),
        Value::List(_) if LIST_METHODS.contains(&name) => method(obj),
        Value::List(_) => Err(missing("list")),
        Value::Dict(_) if DICT_METHODS.contains(&name) => method(obj),
        Value::Dict(_) => Err(missing("dict")),
        Value::Set(set) => {
            let frozen = set.borrow().frozen;
            if SET_METHODS.contains(&name) && !(frozen && SET_MUTATORS.contains(&name)) {
                method(obj)
            } else {
                Err(missing(if frozen { "frozenset" } else { "set" }))
            }
        }
        Value::Tuple(_) if TUPLE_METHODS.contains(&name) => method(obj),
        Value::Tuple(_) => Err(missing("tuple")),
        Value::Regex(_)
            if matches!(
                name,
                "findall" | "search" | "match" | "split" | "sub" | "finditer"
            ) =>
        {
            method(obj)
        }
        Value::Regex(_) => Err(missing("re.Pattern")),
        Value::Match(_) if matches!(name, "group" | "groups" | "start" | "end" | "span") => {
            method(obj)
        }
        Value::Match(_) => Err(missing("re.Match")),
        other => Err(missing(type_name(other))),
    }
}

fn module_attr(module: Module, name: &str) -> Option<Builtin> {
    Some(match (module, name) {
        (Module::Re, "findall") => Builtin::ReFindall,
        (Module::Re, "search") => Builtin::ReSearch,
        (Module::Re, "match") => Builtin::ReMatch,
        (Module::Re, "split") => Builtin::ReSplit,
        (Module::Re, "sub") => Builtin::ReSub,
        (Module::Re, "finditer") => Builtin::ReFinditer,
        (Module::Re, "escape") => Builtin::ReEscape,
        (Module::Re, "compile") => Builtin::ReCompile,
        (Module::Json, "loads") => Builtin::JsonLoads,
        (Module::Json, "dumps") => Builtin::JsonDumps,
        (Module::Base64, "b64encode") => Builtin::B64Encode,
        (Module::Base64, "b64decode") => Builtin::B64Decode,
        (Module::Base64, "urlsafe_b64encode") => Builtin::B64UrlsafeEncode,
        (Module::Base64, "urlsafe_b64decode") => Builtin::B64UrlsafeDecode,
        (Module::Binascii, "hexlify") => Builtin::Hexlify,
        (Module::Binascii, "unhexlify") => Builtin::Unhexlify,
        (Module::Zlib, "decompress") => Builtin::ZlibDecompress,
        _ => return None,
    })
}

pub fn call_builtin(
    interp: &mut Interp,
    builtin: Builtin,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> ExecResult<Value> {
    use Builtin::*;
    let name = builtin.name();
    match builtin {
        Print => builtin_print(interp, args, kwargs),
        Len => {
            methods::arity(name, &args, 1, 1)?;
            builtin_len(&args[0])
        }
        Range => {
            methods::arity(name, &args, 1, 3)?;
            let ints: ExecResult<Vec<i64>> = args
                .iter()
                .map(|v| interp.expect_int(v, "range argument"))
                .collect();
            let ints = ints?;
            let (start, stop, step) = match ints.len() {
                1 => (0, ints[0], 1),
                2 => (ints[0], ints[1], 1),
                _ => (ints[0], ints[1], ints[2]),
            };
            if step == 0 {
                return Err(ExecutionError::value_err("range() arg 3 must not be zero"));
            }
            Ok(Value::Range(Rc::new(RangeValue { start, stop, step })))
        }
        Enumerate => {
            methods::arity(name, &args, 1, 2)?;
            let start = match args.get(1) {
                Some(v) => interp.expect_int(v, "start")?,
                None => 0,
            };
            let items = interp.materialize(&args[0])?;
            let out: Vec<Value> = items
                .into_iter()
                .enumerate()
                .map(|(idx, item)| {
                    Value::Tuple(vec![Value::Int(start + idx as i64), item].into())
                })
                .collect();
            Ok(IterValue::from_values(out))
        }
        Zip => {
            let mut cursors = Vec::with_capacity(args.len());
            for arg in &args {
                cursors.push(interp.cursor(arg)?);
            }
            let mut out = Vec::new();
            if !cursors.is_empty() {
                'rows: loop {
                    interp.tick()?;
                    let mut row = Vec::with_capacity(cursors.len());
                    for cursor in &mut cursors {
                        match cursor.next() {
                            Some(item) => row.push(item),
                            None => break 'rows,
                        }
                    }
                    interp.charge(row.len() * 16)?;
                    out.push(Value::Tuple(row.into()));
                }
            }
            Ok(IterValue::from_values(out))
        }
        Map => {
            methods::arity(name, &args, 2, 8)?;
            let func = args[0].clone();
            let mut cursors = Vec::new();
            for arg in &args[1..] {
                cursors.push(interp.cursor(arg)?);
            }
            let mut out = Vec::new();
            'rows: loop {
                interp.tick()?;
                let mut row = Vec::with_capacity(cursors.len());
                for cursor in &mut cursors {
                    match cursor.next() {
                        Some(item) => row.push(item),
                        None => break 'rows,
                    }
                }
                interp.charge(16)?;
                out.push(interp.call_value(&func, row, Vec::new())?);
            }
            Ok(IterValue::from_values(out))
        }
        Filter => {
            methods::arity(name, &args, 2, 2)?;
            let func = args[0].clone();
            let mut cursor = interp.cursor(&args[1])?;
            let mut out = Vec::new();
            while let Some(item) = cursor.next() {
                interp.tick()?;
                let keep = match &func {
                    Value::None => truthy(&item),
                    f => truthy(&interp.call_value(f, vec![item.clone()], Vec::new())?),
                };
                if keep {
                    interp.charge(16)?;
                    out.push(item);
                }
            }
            Ok(IterValue::from_values(out))
        }
        Sorted => {
            methods::arity(name, &args, 1, 1)?;
            let mut key_fn = None;
            let mut reverse = false;
            for (key, value) in kwargs {
                match key.as_str() {
                    "key" => {
                        if !matches!(value, Value::None) {
                            key_fn = Some(value);
                        }
                    }
                    "reverse" => reverse = truthy(&value),
                    other => {
                        return Err(ExecutionError::type_err(format!(
                            "sorted() got an unexpected keyword argument '{other}'"
                        )));
                    }
                }
            }
            let items = interp.materialize(&args[0])?;
            let sorted = methods::sort_values(interp, items, key_fn.as_ref(), reverse)?;
            Ok(Value::List(Rc::new(std::cell::RefCell::new(sorted))))
        }
        Reversed => {
            methods::arity(name, &args, 1, 1)?;
            let mut items = interp.materialize(&args[0])?;
            items.reverse();
            Ok(IterValue::from_values(items))
        }
        Sum => {
            methods::arity(name, &args, 1, 2)?;
            let mut acc = args.get(1).cloned().unwrap_or(Value::Int(0));
            let mut cursor = interp.cursor(&args[0])?;
            while let Some(item) = cursor.next() {
                interp.tick()?;
                acc = interp.binary_op(BinOp::Add, acc, item)?;
            }
            Ok(acc)
        }
        Min | Max => builtin_min_max(interp, builtin == Max, args, kwargs),
        Abs => {
            methods::arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Int(i) => i
                    .checked_abs()
                    .map(Value::Int)
                    .ok_or_else(|| ExecutionError::value_err("integer overflow")),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                Value::Bool(b) => Ok(Value::Int(*b as i64)),
                other => Err(ExecutionError::type_err(format!(
                    "bad operand type for abs(): '{}'",
                    type_name(other)
                ))),
            }
        }
        Round => {
            methods::arity(name, &args, 1, 2)?;
            let ndigits = match args.get(1) {
                None | Some(Value::None) => None,
                Some(v) => Some(interp.expect_int(v, "ndigits")?),
            };
            match &args[0] {
                Value::Int(i) => Ok(Value::Int(*i)),
                Value::Bool(b) => Ok(Value::Int(*b as i64)),
                Value::Float(f) => match ndigits {
                    None => {
                        let rounded = f.round_ties_even();
                        if rounded.abs() >= i64::MAX as f64 {
                            return Err(ExecutionError::value_err("float too large to round"));
                        }
                        Ok(Value::Int(rounded as i64))
                    }
                    Some(n) => {
                        let scale = 10f64.powi(n.clamp(-300, 300) as i32);
                        Ok(Value::Float((f * scale).round_ties_even() / scale))
                    }
                },
                other => Err(ExecutionError::type_err(format!(
                    "round() argument must be a number, not '{}'",
                    type_name(other)
                ))),
            }
        }
        Any | All => {
            methods::arity(name, &args, 1, 1)?;
            let mut cursor = interp.cursor(&args[0])?;
            let want_any = builtin == Any;
            while let Some(item) = cursor.next() {
                interp.tick()?;
                if truthy(&item) == want_any {
                    return Ok(Value::Bool(want_any));
                }
            }
            Ok(Value::Bool(!want_any))
        }
        Bool => {
            methods::arity(name, &args, 0, 1)?;
            Ok(Value::Bool(args.first().is_some_and(truthy)))
        }
        Int => builtin_int(interp, args, kwargs),
        Float => {
            methods::arity(name, &args, 0, 1)?;
            match args.first() {
                None => Ok(Value::Float(0.0)),
                Some(Value::Int(i)) => Ok(Value::Float(*i as f64)),
                Some(Value::Bool(b)) => Ok(Value::Float(*b as i64 as f64)),
                Some(Value::Float(f)) => Ok(Value::Float(*f)),
                Some(Value::Str(s)) => {
                    let trimmed = s.trim();
                    let parsed = match trimmed {
                        "inf" | "Infinity" | "+inf" => Some(f64::INFINITY),
                        "-inf" | "-Infinity" => Some(f64::NEG_INFINITY),
                        "nan" | "+nan" | "-nan" => Some(f64::NAN),
                        _ => trimmed.parse().ok(),
                    };
                    parsed.map(Value::Float).ok_or_else(|| {
                        ExecutionError::value_err(format!(
                            "could not convert string to float: {}",
                            repr(&args[0])
                        ))
                    })
                }
                Some(other) => Err(ExecutionError::type_err(format!(
                    "float() argument must be a string or a number, not '{}'",
                    type_name(other)
                ))),
            }
        }
        Str => {
            methods::arity(name, &args, 0, 1)?;
            match args.first() {
                None => Ok(Value::Str("".into())),
                Some(value) => {
                    let text = to_display(value);
                    interp.charge(text.len())?;
                    Ok(Value::Str(text.into()))
                }
            }
        }
        Bytes => builtin_bytes(interp, args),
        List => {
            methods::arity(name, &args, 0, 1)?;
            let items = match args.first() {
                None => Vec::new(),
                Some(value) => interp.materialize(value)?,
            };
            Ok(Value::List(Rc::new(std::cell::RefCell::new(items))))
        }
        Tuple => {
            methods::arity(name, &args, 0, 1)?;
            let items = match args.first() {
                None => Vec::new(),
                Some(value) => interp.materialize(value)?,
            };
            Ok(Value::Tuple(items.into()))
        }
        Dict => builtin_dict(interp, args, kwargs),
        Set | Frozenset => {
            methods::arity(name, &args, 0, 1)?;
            let mut set = SetValue::new(builtin == Frozenset);
            if let Some(value) = args.first() {
                for item in interp.materialize(value)? {
                    set.insert(Key::from_value(&item)?);
                }
            }
            Ok(Value::Set(Rc::new(std::cell::RefCell::new(set))))
        }
        Isinstance => {
            methods::arity(name, &args, 2, 2)?;
            Ok(Value::Bool(isinstance(&args[0], &args[1])?))
        }
        Repr => {
            methods::arity(name, &args, 1, 1)?;
            let text = repr(&args[0]);
            interp.charge(text.len())?;
            Ok(Value::Str(text.into()))
        }
        Hash => {
            methods::arity(name, &args, 1, 1)?;
            let key = Key::from_value(&args[0])?;
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            key.hash(&mut hasher);
            Ok(Value::Int(hasher.finish() as i64))
        }
        Ord => {
            methods::arity(name, &args, 1, 1)?;
            let s = methods::expect_str(&args[0], "ord() argument")?;
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(Value::Int(c as i64)),
                _ => Err(ExecutionError::type_err(
                    "ord() expected a character, but a string of a different length was found",
                )),
            }
        }
        Chr => {
            methods::arity(name, &args, 1, 1)?;
            let code = interp.expect_int(&args[0], "chr() argument")?;
            let c = u32::try_from(code)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| ExecutionError::value_err("chr() arg not in range"))?;
            Ok(Value::Str(c.to_string().into()))
        }
        Hex | Oct | Bin => {
            methods::arity(name, &args, 1, 1)?;
            let i = interp.expect_int(&args[0], "argument")?;
            let sign = if i < 0 { "-" } else { "" };
            let magnitude = i.unsigned_abs();
            let text = match builtin {
                Hex => format!("{sign}0x{magnitude:x}"),
                Oct => format!("{sign}0o{magnitude:o}"),
                _ => format!("{sign}0b{magnitude:b}"),
            };
            Ok(Value::Str(text.into()))
        }
        Divmod => {
            methods::arity(name, &args, 2, 2)?;
            let q = interp.binary_op(BinOp::FloorDiv, args[0].clone(), args[1].clone())?;
            let r = interp.binary_op(BinOp::Mod, args[0].clone(), args[1].clone())?;
            Ok(Value::Tuple(vec![q, r].into()))
        }
        Pow => {
            methods::arity(name, &args, 2, 3)?;
            match args.get(2) {
                None | Some(Value::None) => {
                    interp.binary_op(BinOp::Pow, args[0].clone(), args[1].clone())
                }
                Some(modulus) => {
                    let base = interp.expect_int(&args[0], "base")?;
                    let exp = interp.expect_int(&args[1], "exponent")?;
                    let modulus = interp.expect_int(modulus, "modulus")?;
                    if exp < 0 {
                        return Err(ExecutionError::value_err(
                            "pow() 2nd argument cannot be negative when 3rd argument is given",
                        ));
                    }
                    if modulus == 0 {
                        return Err(ExecutionError::value_err(
                            "pow() 3rd argument cannot be 0",
                        ));
                    }
                    Ok(Value::Int(mod_pow(base, exp as u64, modulus)))
                }
            }
        }
        Iter => {
            methods::arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Iter(_) => Ok(args[0].clone()),
                Value::Range(range) => Ok(Value::Iter(Rc::new(std::cell::RefCell::new(
                    IterValue {
                        state: IterState::Range {
                            cur: range.start,
                            stop: range.stop,
                            step: range.step,
                        },
                    },
                )))),
                other => Ok(IterValue::from_values(interp.materialize(other)?)),
            }
        }
        Next => {
            methods::arity(name, &args, 1, 2)?;
            let Value::Iter(shared) = &args[0] else {
                return Err(ExecutionError::type_err(format!(
                    "'{}' object is not an iterator",
                    type_name(&args[0])
                )));
            };
            match shared.borrow_mut().next() {
                Some(item) => Ok(item),
                None => args.get(1).cloned().ok_or_else(|| {
                    ExecutionError::new(ErrorKind::Other, "StopIteration")
                }),
            }
        }
        ExcValue | ExcType | ExcKey | ExcIndex | ExcRuntime => {
            methods::arity(name, &args, 0, 1)?;
            let kind = builtin.exception_kind().expect("exception builtin");
            let message = args.first().map(to_display).unwrap_or_default();
            Ok(Value::Exception(Rc::new(ExceptionValue { kind, message })))
        }
        ReFindall | ReSearch | ReMatch | ReSplit | ReSub | ReFinditer | ReEscape | ReCompile => {
            re_function(interp, builtin, args, kwargs)
        }
        JsonLoads => {
            methods::arity(name, &args, 1, 1)?;
            let text = methods::expect_str(&args[0], "json.loads() argument")?;
            interp.charge(text.len() * 2)?;
            let parsed: serde_json::Value = serde_json::from_str(&text)
                .map_err(|err| ExecutionError::value_err(format!("invalid JSON: {err}")))?;
            Ok(json_to_value(&parsed))
        }
        JsonDumps => {
            methods::arity(name, &args, 1, 1)?;
            let mut ensure_ascii = true;
            let mut indent = None;
            for (key, value) in &kwargs {
                match key.as_str() {
                    "ensure_ascii" => ensure_ascii = truthy(value),
                    "indent" => {
                        indent = match value {
                            Value::None => None,
                            v => Some(interp.expect_int(v, "indent")?.max(0) as usize),
                        };
                    }
                    other => {
                        return Err(ExecutionError::type_err(format!(
                            "dumps() got an unexpected keyword argument '{other}'"
                        )));
                    }
                }
            }
            let mut out = String::new();
            dumps_value(&args[0], ensure_ascii, indent, 0, &mut out)?;
            interp.charge(out.len())?;
            Ok(Value::Str(out.into()))
        }
        B64Encode | B64UrlsafeEncode => {
            methods::arity(name, &args, 1, 1)?;
            use base64::Engine;
            let data = methods::expect_bytes(&args[0], "argument")?;
            let encoded = if builtin == B64Encode {
                base64::engine::general_purpose::STANDARD.encode(data.as_ref())
            } else {
                base64::engine::general_purpose::URL_SAFE.encode(data.as_ref())
            };
            interp.charge(encoded.len())?;
            Ok(Value::Bytes(encoded.into_bytes().into()))
        }
        B64Decode | B64UrlsafeDecode => {
            methods::arity(name, &args, 1, 1)?;
            use base64::Engine;
            let data = match &args[0] {
                Value::Bytes(b) => b.to_vec(),
                Value::Str(s) => s.as_bytes().to_vec(),
                other => {
                    return Err(ExecutionError::type_err(format!(
                        "argument should be a bytes-like object or ASCII string, not '{}'",
                        type_name(other)
                    )));
                }
            };
            let decoded = if builtin == B64Decode {
                base64::engine::general_purpose::STANDARD.decode(&data)
            } else {
                base64::engine::general_purpose::URL_SAFE.decode(&data)
            };
            let decoded = decoded
                .map_err(|_| ExecutionError::value_err("invalid base64-encoded data"))?;
            interp.charge(decoded.len())?;
            Ok(Value::Bytes(decoded.into()))
        }
        Hexlify => {
            methods::arity(name, &args, 1, 1)?;
            let data = methods::expect_bytes(&args[0], "argument")?;
            interp.charge(data.len() * 2)?;
            Ok(Value::Bytes(hex::encode(data.as_ref()).into_bytes().into()))
        }
        Unhexlify => {
            methods::arity(name, &args, 1, 1)?;
            let text = match &args[0] {
                Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
                Value::Str(s) => s.to_string(),
                other => {
                    return Err(ExecutionError::type_err(format!(
                        "argument should be bytes or a string, not '{}'",
                        type_name(other)
                    )));
                }
            };
            let decoded = hex::decode(text.trim())
                .map_err(|err| ExecutionError::value_err(format!("non-hexadecimal data: {err}")))?;
            interp.charge(decoded.len())?;
            Ok(Value::Bytes(decoded.into()))
        }
        ZlibDecompress => zlib_decompress(interp, args, kwargs),
        RecursiveLlm => {
            methods::arity(name, &args, 2, 2)?;
            let sub_query = to_display(&args[0]);
            let sub_context = to_display(&args[1]);
            let Some(hook) = interp.recursion.clone() else {
                return Ok(Value::Str(
                    "Error: recursive_llm is unavailable in this session".into(),
                ));
            };
            let answer = hook(&sub_query, &sub_context);
            interp.charge(answer.len())?;
            Ok(Value::Str(answer.into()))
        }
    }
}

fn builtin_print(
    interp: &mut Interp,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> ExecResult<Value> {
    let mut sep = " ".to_owned();
    let mut end = "\n".to_owned();
    for (key, value) in &kwargs {
        match key.as_str() {
            "sep" => {
                sep = match value {
                    Value::None => " ".to_owned(),
                    other => methods::expect_str(other, "sep")?.to_string(),
                };
            }
            "end" => {
                end = match value {
                    Value::None => "\n".to_owned(),
                    other => methods::expect_str(other, "end")?.to_string(),
                };
            }
            other => {
                return Err(ExecutionError::type_err(format!(
                    "print() got an unexpected keyword argument '{other}'"
                )));
            }
        }
    }
    let rendered: Vec<String> = args.iter().map(to_display).collect();
    let line = rendered.join(&sep) + &end;
    interp.charge(line.len())?;
    interp.output.push_str(&line);
    Ok(Value::None)
}

fn builtin_len(value: &Value) -> ExecResult<Value> {
    let len = match value {
        Value::Str(s) => s.chars().count() as i64,
        Value::Bytes(b) => b.len() as i64,
        Value::List(items) => items.borrow().len() as i64,
        Value::Tuple(items) => items.len() as i64,
        Value::Dict(dict) => dict.borrow().len() as i64,
        Value::Set(set) => set.borrow().len() as i64,
        Value::Range(range) => range.len(),
        other => {
            return Err(ExecutionError::type_err(format!(
                "object of type '{}' has no len()",
                type_name(other)
            )));
        }
    };
    Ok(Value::Int(len))
}

fn builtin_min_max(
    interp: &mut Interp,
    want_max: bool,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> ExecResult<Value> {
    let name = if want_max { "max" } else { "min" };
    let mut key_fn = None;
    let mut default = None;
    for (key, value) in kwargs {
        match key.as_str() {
            "key" => {
                if !matches!(value, Value::None) {
                    key_fn = Some(value);
                }
            }
            "default" => default = Some(value),
            other => {
                return Err(ExecutionError::type_err(format!(
                    "{name}() got an unexpected keyword argument '{other}'"
                )));
            }
        }
    }
    let items = if args.len() == 1 {
        interp.materialize(&args[0])?
    } else if args.len() > 1 {
        args
    } else {
        return Err(ExecutionError::type_err(format!(
            "{name} expected at least 1 argument, got 0"
        )));
    };
    if items.is_empty() {
        return default.ok_or_else(|| {
            ExecutionError::value_err(format!("{name}() arg is an empty sequence"))
        });
    }
    let mut best: Option<(Value, Value)> = None;
    for item in items {
        interp.tick()?;
        let key = match &key_fn {
            Some(f) => interp.call_value(f, vec![item.clone()], Vec::new())?,
            None => item.clone(),
        };
        best = Some(match best {
            None => (key, item),
            Some((best_key, best_item)) => {
                let ordering = crate::value::compare_values(&key, &best_key)?;
                let replace = if want_max {
                    ordering == std::cmp::Ordering::Greater
                } else {
                    ordering == std::cmp::Ordering::Less
                };
                if replace {
                    (key, item)
                } else {
                    (best_key, best_item)
                }
            }
        });
    }
    Ok(best.expect("non-empty items").1)
}

fn builtin_int(
    interp: &mut Interp,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> ExecResult<Value> {
    methods::arity("int", &args, 0, 2)?;
    let mut base: Option<i64> = match args.get(1) {
        Some(v) => Some(interp.expect_int(v, "base")?),
        None => None,
    };
    for (key, value) in &kwargs {
        if key == "base" {
            base = Some(interp.expect_int(value, "base")?);
        } else {
            return Err(ExecutionError::type_err(format!(
                "int() got an unexpected keyword argument '{key}'"
            )));
        }
    }
    let Some(value) = args.first() else {
        return Ok(Value::Int(0));
    };
    match value {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Bool(b) => Ok(Value::Int(*b as i64)),
        Value::Float(f) => {
            if base.is_some() {
                return Err(ExecutionError::type_err(
                    "int() can't convert non-string with explicit base",
                ));
            }
            Ok(Value::Int(f.trunc() as i64))
        }
        Value::Str(s) => {
            let base = base.unwrap_or(10);
            if base != 0 && !(2..=36).contains(&base) {
                return Err(ExecutionError::value_err("int() base must be >= 2 and <= 36, or 0"));
            }
            parse_int_literal(s.trim(), base).ok_or_else(|| {
                ExecutionError::value_err(format!(
                    "invalid literal for int() with base {base}: {}",
                    repr(value)
                ))
            })
        }
        other => Err(ExecutionError::type_err(format!(
            "int() argument must be a string or a number, not '{}'",
            type_name(other)
        ))),
    }
}

fn parse_int_literal(text: &str, base: i64) -> Option<Value> {
    let (negative, rest) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (radix, digits) = if base == 0 {
        match rest.get(..2).map(str::to_ascii_lowercase).as_deref() {
            Some("0x") => (16, &rest[2..]),
            Some("0o") => (8, &rest[2..]),
            Some("0b") => (2, &rest[2..]),
            _ => (10, rest),
        }
    } else if base == 16 {
        match rest.get(..2).map(str::to_ascii_lowercase).as_deref() {
            Some("0x") => (16, &rest[2..]),
            _ => (16, rest),
        }
    } else {
        (base as u32, rest)
    };
    let digits = digits.replace('_', "");
    if digits.is_empty() {
        return None;
    }
    let magnitude = i64::from_str_radix(&digits, radix).ok()?;
    Some(Value::Int(if negative { -magnitude } else { magnitude }))
}

fn builtin_bytes(interp: &mut Interp, args: Vec<Value>) -> ExecResult<Value> {
    methods::arity("bytes", &args, 0, 2)?;
    match args.first() {
        None => Ok(Value::Bytes(Vec::new().into())),
        Some(Value::Bytes(b)) => Ok(Value::Bytes(b.clone())),
        Some(Value::Str(s)) => {
            let Some(encoding) = args.get(1) else {
                return Err(ExecutionError::type_err(
                    "string argument without an encoding",
                ));
            };
            let encoding = methods::expect_str(encoding, "encoding")?;
            if !matches!(encoding.as_ref(), "utf-8" | "utf8" | "ascii") {
                return Err(ExecutionError::value_err(format!(
                    "unknown encoding: {encoding}"
                )));
            }
            interp.charge(s.len())?;
            Ok(Value::Bytes(s.as_bytes().to_vec().into()))
        }
        Some(Value::Int(n)) => {
            let n = (*n).max(0) as usize;
            interp.charge(n)?;
            Ok(Value::Bytes(vec![0u8; n].into()))
        }
        Some(other @ (Value::List(_) | Value::Tuple(_) | Value::Iter(_) | Value::Range(_))) => {
            let items = interp.materialize(other)?;
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let byte = interp.expect_int(&item, "bytes element")?;
                if !(0..=255).contains(&byte) {
                    return Err(ExecutionError::value_err("bytes must be in range(0, 256)"));
                }
                out.push(byte as u8);
            }
            interp.charge(out.len())?;
            Ok(Value::Bytes(out.into()))
        }
        Some(other) => Err(ExecutionError::type_err(format!(
            "cannot convert '{}' object to bytes",
            type_name(other)
        ))),
    }
}

fn builtin_dict(
    interp: &mut Interp,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> ExecResult<Value> {
    methods::arity("dict", &args, 0, 1)?;
    let mut dict = DictValue::new();
    if let Some(value) = args.first() {
        match value {
            Value::Dict(other) => {
                for (key, item) in other.borrow().entries() {
                    dict.insert(key.clone(), item.clone());
                }
            }
            other => {
                for pair in interp.materialize(other)? {
                    let items = match &pair {
                        Value::Tuple(items) if items.len() == 2 => items.to_vec(),
                        Value::List(items) if items.borrow().len() == 2 => items.borrow().clone(),
                        _ => {
                            return Err(ExecutionError::value_err(
                                "dict update sequence elements must be pairs",
                            ));
                        }
                    };
                    dict.insert(Key::from_value(&items[0])?, items[1].clone());
                }
            }
        }
    }
    for (key, value) in kwargs {
        dict.insert(Key::Str(key.into()), value);
    }
    interp.charge(dict.len() * 32)?;
    Ok(Value::Dict(Rc::new(std::cell::RefCell::new(dict))))
}

fn isinstance(value: &Value, classinfo: &Value) -> ExecResult<bool> {
    match classinfo {
        Value::Tuple(options) => {
            for option in options.iter() {
                if isinstance(value, option)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::Builtin(builtin) => Ok(match builtin {
            Builtin::Bool => matches!(value, Value::Bool(_)),
            // bool is a subtype of int
            Builtin::Int => matches!(value, Value::Int(_) | Value::Bool(_)),
            Builtin::Float => matches!(value, Value::Float(_)),
            Builtin::Str => matches!(value, Value::Str(_)),
            Builtin::Bytes => matches!(value, Value::Bytes(_)),
            Builtin::List => matches!(value, Value::List(_)),
            Builtin::Tuple => matches!(value, Value::Tuple(_)),
            Builtin::Dict => matches!(value, Value::Dict(_)),
            Builtin::Set => matches!(value, Value::Set(s) if !s.borrow().frozen),
            Builtin::Frozenset => matches!(value, Value::Set(s) if s.borrow().frozen),
            Builtin::Range => matches!(value, Value::Range(_)),
            _ => {
                return Err(ExecutionError::type_err(
                    "isinstance() arg 2 must be a type or tuple of types",
                ));
            }
        }),
        _ => Err(ExecutionError::type_err(
            "isinstance() arg 2 must be a type or tuple of types",
        )),
    }
}

fn mod_pow(base: i64, mut exp: u64, modulus: i64) -> i64 {
    let m = modulus.unsigned_abs() as i128;
    if m == 1 {
        return 0;
    }
    let mut result: i128 = 1;
    let mut b = (base as i128).rem_euclid(m);
    while exp > 0 {
        if exp & 1 == 1 {
            result = result * b % m;
        }
        b = b * b % m;
        exp >>= 1;
    }
    let mut out = result as i64;
    if modulus < 0 && out != 0 {
        out -= modulus.abs();
    }
    out
}

// ---- re ----------------------------------------------------------------

fn compile_pattern(value: &Value) -> ExecResult<Rc<RegexValue>> {
    match value {
        Value::Regex(re) => Ok(re.clone()),
        Value::Str(pattern) => {
            if pattern.len() > MAX_REGEX_PATTERN_BYTES {
                return Err(ExecutionError::value_err(format!(
                    "regex pattern too large ({} bytes > {MAX_REGEX_PATTERN_BYTES})",
                    pattern.len()
                )));
            }
            let re = fancy_regex::Regex::new(pattern)
                .map_err(|err| ExecutionError::value_err(format!("invalid regex: {err}")))?;
            Ok(Rc::new(RegexValue {
                pattern: pattern.to_string(),
                re,
            }))
        }
        other => Err(ExecutionError::type_err(format!(
            "first argument must be a string or compiled pattern, not '{}'",
            type_name(other)
        ))),
    }
}

fn make_match(caps: &fancy_regex::Captures, subject: &str) -> Value {
    let mut groups = Vec::new();
    for idx in 0..caps.len() {
        groups.push(caps.get(idx).map(|m| {
            let char_start = subject[..m.start()].chars().count();
            let char_end = char_start + m.as_str().chars().count();
            (char_start, char_end, Rc::<str>::from(m.as_str()))
        }));
    }
    Value::Match(Rc::new(MatchValue {
        groups,
        names: HashMap::new(),
    }))
}

fn make_match_with_names(
    re: &fancy_regex::Regex,
    caps: &fancy_regex::Captures,
    subject: &str,
) -> Value {
    let value = make_match(caps, subject);
    let Value::Match(m) = &value else { unreachable!() };
    let mut names = HashMap::new();
    for (idx, name) in re.capture_names().enumerate() {
        if let Some(name) = name {
            names.insert(name.to_owned(), idx);
        }
    }
    let m = MatchValue {
        groups: m.groups.clone(),
        names,
    };
    Value::Match(Rc::new(m))
}

fn regex_err(err: fancy_regex::Error) -> ExecutionError {
    ExecutionError::value_err(format!("regex error: {err}"))
}

fn re_function(
    interp: &mut Interp,
    builtin: Builtin,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> ExecResult<Value> {
    let name = builtin.name();
    match builtin {
        Builtin::ReEscape => {
            methods::arity(name, &args, 1, 1)?;
            let text = methods::expect_str(&args[0], "re.escape() argument")?;
            let mut out = String::with_capacity(text.len() * 2);
            for c in text.chars() {
                if c.is_alphanumeric() || c == '_' {
                    out.push(c);
                } else {
                    out.push('\\');
                    out.push(c);
                }
            }
            interp.charge(out.len())?;
            Ok(Value::Str(out.into()))
        }
        Builtin::ReCompile => {
            methods::arity(name, &args, 1, 1)?;
            Ok(Value::Regex(compile_pattern(&args[0])?))
        }
        Builtin::ReSub => {
            methods::arity(name, &args, 3, 4)?;
            let re = compile_pattern(&args[0])?;
            let repl = methods::expect_str(&args[1], "replacement")?;
            let subject = methods::expect_str(&args[2], "string")?;
            let count = match args.get(3) {
                Some(v) => interp.expect_int(v, "count")?,
                None => 0,
            };
            regex_sub(interp, &re, &repl, &subject, count)
        }
        _ => {
            methods::arity(name, &args, 2, 2)?;
            no_flag_kwargs(name, &kwargs)?;
            let re = compile_pattern(&args[0])?;
            let subject = methods::expect_str(&args[1], "string")?;
            regex_apply(interp, builtin, &re, &subject)
        }
    }
}

fn no_flag_kwargs(name: &str, kwargs: &[(String, Value)]) -> ExecResult<()> {
    if let Some((key, _)) = kwargs.first() {
        return Err(ExecutionError::type_err(format!(
            "{name}() got an unexpected keyword argument '{key}'"
        )));
    }
    Ok(())
}

/// `re.findall` / `search` / `match` / `split` / `finditer` over an already
/// compiled pattern.
pub fn regex_apply(
    interp: &mut Interp,
    builtin: Builtin,
    re: &Rc<RegexValue>,
    subject: &str,
) -> ExecResult<Value> {
    match builtin {
        Builtin::ReSearch => match re.re.captures(subject).map_err(regex_err)? {
            Some(caps) => Ok(make_match_with_names(&re.re, &caps, subject)),
            None => Ok(Value::None),
        },
        Builtin::ReMatch => match re.re.captures_from_pos(subject, 0).map_err(regex_err)? {
            Some(caps) if caps.get(0).map(|m| m.start()) == Some(0) => {
                Ok(make_match_with_names(&re.re, &caps, subject))
            }
            _ => Ok(Value::None),
        },
        Builtin::ReFindall => {
            let group_count = re.re.capture_names().count();
            let mut out = Vec::new();
            for caps in re.re.captures_iter(subject) {
                interp.tick()?;
                let caps = caps.map_err(regex_err)?;
                let item = match group_count {
                    1 => Value::Str(caps.get(0).map(|m| m.as_str()).unwrap_or("").into()),
                    2 => Value::Str(caps.get(1).map(|m| m.as_str()).unwrap_or("").into()),
                    _ => Value::Tuple(
                        (1..group_count)
                            .map(|idx| {
                                Value::Str(
                                    caps.get(idx).map(|m| m.as_str()).unwrap_or("").into(),
                                )
                            })
                            .collect::<Vec<_>>()
                            .into(),
                    ),
                };
                interp.charge(32)?;
                out.push(item);
            }
            Ok(Value::List(Rc::new(std::cell::RefCell::new(out))))
        }
        Builtin::ReFinditer => {
            let mut out = Vec::new();
            for caps in re.re.captures_iter(subject) {
                interp.tick()?;
                let caps = caps.map_err(regex_err)?;
                interp.charge(64)?;
                out.push(make_match_with_names(&re.re, &caps, subject));
            }
            Ok(IterValue::from_values(out))
        }
        Builtin::ReSplit => {
            let mut out = Vec::new();
            let mut last = 0usize;
            for caps in re.re.captures_iter(subject) {
                interp.tick()?;
                let caps = caps.map_err(regex_err)?;
                let whole = caps.get(0).expect("group 0 is present");
                if whole.start() == whole.end() && whole.start() == last {
                    // zero-width match at the cursor contributes nothing
                    continue;
                }
                interp.charge(whole.start() - last + 16)?;
                out.push(Value::Str(subject[last..whole.start()].into()));
                for idx in 1..caps.len() {
                    out.push(match caps.get(idx) {
                        Some(group) => Value::Str(group.as_str().into()),
                        None => Value::None,
                    });
                }
                last = whole.end();
            }
            interp.charge(subject.len() - last)?;
            out.push(Value::Str(subject[last..].into()));
            Ok(Value::List(Rc::new(std::cell::RefCell::new(out))))
        }
        _ => unreachable!("not a regex application builtin"),
    }
}

pub fn regex_sub(
    interp: &mut Interp,
    re: &Rc<RegexValue>,
    repl: &str,
    subject: &str,
    count: i64,
) -> ExecResult<Value> {
    let mut out = String::new();
    let mut last = 0usize;
    let mut done = 0i64;
    for caps in re.re.captures_iter(subject) {
        if count > 0 && done >= count {
            break;
        }
        interp.tick()?;
        let caps = caps.map_err(regex_err)?;
        let whole = caps.get(0).expect("group 0 is present");
        let before = out.len();
        out.push_str(&subject[last..whole.start()]);
        expand_replacement(repl, &caps, &mut out)?;
        interp.charge(out.len() - before)?;
        last = whole.end();
        done += 1;
        if whole.start() == whole.end() {
            // avoid looping forever on zero-width matches
            if last < subject.len() {
                let next = subject[last..].chars().next().expect("in-bounds char");
                out.push(next);
                last += next.len_utf8();
            } else {
                break;
            }
        }
    }
    out.push_str(&subject[last..]);
    interp.charge(out.len())?;
    Ok(Value::Str(out.into()))
}

fn expand_replacement(
    repl: &str,
    caps: &fancy_regex::Captures,
    out: &mut String,
) -> ExecResult<()> {
    let chars: Vec<char> = repl.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c != '\\' {
            out.push(c);
            i += 1;
            continue;
        }
        match chars.get(i + 1) {
            Some('\\') => {
                out.push('\\');
                i += 2;
            }
            Some('n') => {
                out.push('\n');
                i += 2;
            }
            Some('t') => {
                out.push('\t');
                i += 2;
            }
            Some(d) if d.is_ascii_digit() => {
                let idx = d.to_digit(10).expect("ascii digit") as usize;
                match caps.get(idx) {
                    Some(group) => out.push_str(group.as_str()),
                    None => {
                        return Err(ExecutionError::value_err(format!(
                            "invalid group reference \\{idx}"
                        )));
                    }
                }
                i += 2;
            }
            Some('g') if chars.get(i + 2) == Some(&'<') => {
                let close = chars[i + 3..].iter().position(|c| *c == '>').ok_or_else(|| {
                    ExecutionError::value_err("missing '>' in group reference")
                })?;
                let group_name: String = chars[i + 3..i + 3 + close].iter().collect();
                let group = match group_name.parse::<usize>() {
                    Ok(idx) => caps.get(idx),
                    Err(_) => caps.name(&group_name),
                };
                match group {
                    Some(group) => out.push_str(group.as_str()),
                    None => {
                        return Err(ExecutionError::value_err(format!(
                            "invalid group reference \\g<{group_name}>"
                        )));
                    }
                }
                i += 4 + close;
            }
            Some(other) => {
                out.push('\\');
                out.push(*other);
                i += 2;
            }
            None => {
                out.push('\\');
                i += 1;
            }
        }
    }
    Ok(())
}

/// Methods on compiled patterns: `pat.findall(s)` and friends.
pub fn regex_method(
    interp: &mut Interp,
    re: &Rc<RegexValue>,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> ExecResult<Value> {
    no_flag_kwargs(name, &kwargs)?;
    match name {
        "sub" => {
            methods::arity(name, &args, 2, 3)?;
            let repl = methods::expect_str(&args[0], "replacement")?;
            let subject = methods::expect_str(&args[1], "string")?;
            let count = match args.get(2) {
                Some(v) => interp.expect_int(v, "count")?,
                None => 0,
            };
            regex_sub(interp, re, &repl, &subject, count)
        }
        _ => {
            methods::arity(name, &args, 1, 1)?;
            let subject = methods::expect_str(&args[0], "string")?;
            let builtin = match name {
                "findall" => Builtin::ReFindall,
                "search" => Builtin::ReSearch,
                "match" => Builtin::ReMatch,
                "split" => Builtin::ReSplit,
                "finditer" => Builtin::ReFinditer,
                _ => {
                    return Err(ExecutionError::new(
                        ErrorKind::Attribute,
                        format!("'re.Pattern' object has no attribute '{name}'"),
                    ));
                }
            };
            regex_apply(interp, builtin, re, &subject)
        }
    }
}

/// Methods on match values: `m.group(1)`, `m.span()`, ...
pub fn match_method(m: &Rc<MatchValue>, name: &str, args: Vec<Value>) -> ExecResult<Value> {
    let resolve = |arg: &Value| -> ExecResult<usize> {
        match arg {
            Value::Int(i) if *i >= 0 && (*i as usize) < m.groups.len() => Ok(*i as usize),
            Value::Int(i) => Err(ExecutionError::new(
                ErrorKind::Index,
                format!("no such group: {i}"),
            )),
            Value::Str(s) => m.names.get(s.as_ref()).copied().ok_or_else(|| {
                ExecutionError::new(ErrorKind::Index, format!("no such group: '{s}'"))
            }),
            other => Err(ExecutionError::type_err(format!(
                "group indices must be integers or strings, not '{}'",
                type_name(other)
            ))),
        }
    };
    let group_value = |idx: usize| match &m.groups[idx] {
        Some((_, _, text)) => Value::Str(text.clone()),
        None => Value::None,
    };
    match name {
        "group" => match args.len() {
            0 => Ok(group_value(0)),
            1 => Ok(group_value(resolve(&args[0])?)),
            _ => {
                let groups: ExecResult<Vec<Value>> = args
                    .iter()
                    .map(|arg| Ok(group_value(resolve(arg)?)))
                    .collect();
                Ok(Value::Tuple(groups?.into()))
            }
        },
        "groups" => {
            let default = args.first().cloned().unwrap_or(Value::None);
            let groups: Vec<Value> = (1..m.groups.len())
                .map(|idx| match &m.groups[idx] {
                    Some((_, _, text)) => Value::Str(text.clone()),
                    None => default.clone(),
                })
                .collect();
            Ok(Value::Tuple(groups.into()))
        }
        "start" | "end" | "span" => {
            let idx = match args.first() {
                Some(arg) => resolve(arg)?,
                None => 0,
            };
            let Some((start, end, _)) = &m.groups[idx] else {
                return match name {
                    "span" => Ok(Value::Tuple(
                        vec![Value::Int(-1), Value::Int(-1)].into(),
                    )),
                    _ => Ok(Value::Int(-1)),
                };
            };
            Ok(match name {
                "start" => Value::Int(*start as i64),
                "end" => Value::Int(*end as i64),
                _ => Value::Tuple(
                    vec![Value::Int(*start as i64), Value::Int(*end as i64)].into(),
                ),
            })
        }
        _ => Err(ExecutionError::new(
            ErrorKind::Attribute,
            format!("'re.Match' object has no attribute '{name}'"),
        )),
    }
}

// ---- json --------------------------------------------------------------

pub(crate) fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::None,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::Str(s.as_str().into()),
        serde_json::Value::Array(items) => Value::List(Rc::new(std::cell::RefCell::new(
            items.iter().map(json_to_value).collect(),
        ))),
        serde_json::Value::Object(map) => {
            let mut dict = DictValue::new();
            for (key, value) in map {
                dict.insert(Key::Str(key.as_str().into()), json_to_value(value));
            }
            Value::Dict(Rc::new(std::cell::RefCell::new(dict)))
        }
    }
}

fn dumps_value(
    value: &Value,
    ensure_ascii: bool,
    indent: Option<usize>,
    depth: usize,
    out: &mut String,
) -> ExecResult<()> {
    let newline_indent = |out: &mut String, level: usize| {
        if let Some(step) = indent {
            out.push('\n');
            out.push_str(&" ".repeat(step * level));
        }
    };
    match value {
        Value::None => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Float(f) => {
            if f.is_nan() {
                out.push_str("NaN");
            } else if f.is_infinite() {
                out.push_str(if *f > 0.0 { "Infinity" } else { "-Infinity" });
            } else {
                out.push_str(&crate::value::float_repr(*f));
            }
        }
        Value::Str(s) => dumps_string(s, ensure_ascii, out),
        Value::List(items) => {
            let items = items.borrow();
            dumps_seq(&items, ensure_ascii, indent, depth, out, newline_indent)?;
        }
        Value::Tuple(items) => {
            dumps_seq(items, ensure_ascii, indent, depth, out, newline_indent)?;
        }
        Value::Dict(dict) => {
            let dict = dict.borrow();
            if dict.is_empty() {
                out.push_str("{}");
                return Ok(());
            }
            out.push('{');
            for (idx, (key, item)) in dict.entries().enumerate() {
                if idx > 0 {
                    out.push(',');
                    if indent.is_none() {
                        out.push(' ');
                    }
                }
                newline_indent(out, depth + 1);
                match key {
                    Key::Str(s) => dumps_string(s, ensure_ascii, out),
                    Key::Int(i) => dumps_string(&i.to_string(), ensure_ascii, out),
                    Key::Bool(b) => {
                        dumps_string(if *b { "true" } else { "false" }, ensure_ascii, out)
                    }
                    Key::None => dumps_string("null", ensure_ascii, out),
                    _ => {
                        return Err(ExecutionError::type_err(
                            "keys must be str, int, bool or None",
                        ));
                    }
                }
                out.push_str(": ");
                dumps_value(item, ensure_ascii, indent, depth + 1, out)?;
            }
            newline_indent(out, depth);
            out.push('}');
        }
        other => {
            return Err(ExecutionError::type_err(format!(
                "Object of type {} is not JSON serializable",
                type_name(other)
            )));
        }
    }
    Ok(())
}

fn dumps_seq(
    items: &[Value],
    ensure_ascii: bool,
    indent: Option<usize>,
    depth: usize,
    out: &mut String,
    newline_indent: impl Fn(&mut String, usize),
) -> ExecResult<()> {
    if items.is_empty() {
        out.push_str("[]");
        return Ok(());
    }
    out.push('[');
    for (idx, item) in items.iter().enumerate() {
        if idx > 0 {
            out.push(',');
            if indent.is_none() {
                out.push(' ');
            }
        }
        newline_indent(out, depth + 1);
        dumps_value(item, ensure_ascii, indent, depth + 1, out)?;
    }
    newline_indent(out, depth);
    out.push(']');
    Ok(())
}

fn dumps_string(s: &str, ensure_ascii: bool, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c if ensure_ascii && !c.is_ascii() => {
                let code = c as u32;
                if code > 0xffff {
                    // encode as a UTF-16 surrogate pair
                    let v = code - 0x10000;
                    out.push_str(&format!(
                        "\\u{:04x}\\u{:04x}",
                        0xd800 + (v >> 10),
                        0xdc00 + (v & 0x3ff)
                    ));
                } else {
                    out.push_str(&format!("\\u{code:04x}"));
                }
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

// ---- zlib --------------------------------------------------------------

fn zlib_decompress(
    interp: &mut Interp,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> ExecResult<Value> {
    methods::arity("decompress", &args, 1, 2)?;
    let data = methods::expect_bytes(&args[0], "data")?;
    let mut wbits: i64 = 15;
    if let Some(v) = args.get(1) {
        wbits = interp.expect_int(v, "wbits")?;
    }
    for (key, value) in &kwargs {
        if key == "wbits" {
            wbits = interp.expect_int(value, "wbits")?;
        } else {
            return Err(ExecutionError::type_err(format!(
                "decompress() got an unexpected keyword argument '{key}'"
            )));
        }
    }
    let mut decoder = match wbits {
        9..=15 => Decompress::new_with_window_bits(true, wbits as u8),
        -15..=-9 => Decompress::new_with_window_bits(false, (-wbits) as u8),
        _ => {
            return Err(ExecutionError::value_err(format!(
                "invalid wbits value: {wbits}"
            )));
        }
    };
    let cap = interp.zlib_max_output;
    let mut out: Vec<u8> = Vec::new();
    loop {
        let consumed = decoder.total_in() as usize;
        let space = (cap + 1).saturating_sub(out.len());
        if space == 0 {
            return Err(ExecutionError::value_err("zlib output exceeds limit"));
        }
        out.reserve(space.min(64 * 1024));
        let before_in = decoder.total_in();
        let before_out = out.len();
        let status = decoder
            .decompress_vec(&data[consumed..], &mut out, FlushDecompress::Finish)
            .map_err(|err| ExecutionError::value_err(format!("invalid zlib data: {err}")))?;
        if out.len() > cap {
            return Err(ExecutionError::value_err("zlib output exceeds limit"));
        }
        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                if decoder.total_in() == before_in && out.len() == before_out {
                    return Err(ExecutionError::value_err(
                        "incomplete or truncated zlib data",
                    ));
                }
            }
        }
    }
    interp.charge(out.len())?;
    Ok(Value::Bytes(out.into()))
}
