//! Method dispatch for the value model: string/bytes/container methods and
//! the f-string format mini-language. Every method is implemented against the
//! tagged values; nothing reflects into host types.

use std::rc::Rc;

use crate::caps;
use crate::error::{ErrorKind, ExecResult, ExecutionError};
use crate::interp::Interp;
use crate::value::{
    DictValue, Key, SetValue, Value, compare_values, repr, to_display, type_name, values_equal,
};

pub const STR_METHODS: &[&str] = &[
    "upper",
    "lower",
    "strip",
    "lstrip",
    "rstrip",
    "split",
    "rsplit",
    "splitlines",
    "join",
    "find",
    "rfind",
    "index",
    "count",
    "startswith",
    "endswith",
    "replace",
    "encode",
    "isdigit",
    "isalpha",
    "isalnum",
    "isspace",
    "title",
    "capitalize",
    "zfill",
    "ljust",
    "rjust",
    "partition",
    "rpartition",
    "removeprefix",
    "removesuffix",
];

pub const BYTES_METHODS: &[&str] = &[
    "decode",
    "hex",
    "find",
    "count",
    "split",
    "strip",
    "startswith",
    "endswith",
    "replace",
];

pub const LIST_METHODS: &[&str] = &[
    "append", "extend", "insert", "pop", "remove", "index", "count", "sort", "reverse", "clear",
    "copy",
];

pub const DICT_METHODS: &[&str] = &[
    "get",
    "keys",
    "values",
    "items",
    "pop",
    "update",
    "setdefault",
    "clear",
    "copy",
];

pub const SET_METHODS: &[&str] = &[
    "add",
    "remove",
    "discard",
    "union",
    "intersection",
    "difference",
    "update",
    "copy",
];

pub const SET_MUTATORS: &[&str] = &["add", "remove", "discard", "update"];

pub const TUPLE_METHODS: &[&str] = &["count", "index"];

pub(crate) fn arity(name: &str, args: &[Value], min: usize, max: usize) -> ExecResult<()> {
    if args.len() < min || args.len() > max {
        return Err(ExecutionError::type_err(format!(
            "{name}() takes {min} to {max} arguments but {} were given",
            args.len()
        )));
    }
    Ok(())
}

pub(crate) fn no_kwargs(name: &str, kwargs: &[(String, Value)]) -> ExecResult<()> {
    if let Some((key, _)) = kwargs.first() {
        return Err(ExecutionError::type_err(format!(
            "{name}() got an unexpected keyword argument '{key}'"
        )));
    }
    Ok(())
}

pub(crate) fn expect_str(value: &Value, what: &str) -> ExecResult<Rc<str>> {
    match value {
        Value::Str(s) => Ok(s.clone()),
        other => Err(ExecutionError::type_err(format!(
            "{what} must be a string, not '{}'",
            type_name(other)
        ))),
    }
}

pub(crate) fn expect_bytes(value: &Value, what: &str) -> ExecResult<Rc<[u8]>> {
    match value {
        Value::Bytes(b) => Ok(b.clone()),
        other => Err(ExecutionError::type_err(format!(
            "{what} must be bytes, not '{}'",
            type_name(other)
        ))),
    }
}

pub fn dispatch(
    interp: &mut Interp,
    recv: &Value,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> ExecResult<Value> {
    match recv {
        Value::Str(s) => str_method(interp, s, name, args, kwargs),
        Value::Bytes(b) => bytes_method(interp, b, name, args, kwargs),
        Value::List(_) => list_method(interp, recv, name, args, kwargs),
        Value::Dict(_) => dict_method(interp, recv, name, args, kwargs),
        Value::Set(_) => set_method(interp, recv, name, args, kwargs),
        Value::Tuple(items) => tuple_method(interp, items, name, args),
        Value::Regex(re) => caps::regex_method(interp, re, name, args, kwargs),
        Value::Match(m) => caps::match_method(m, name, args),
        other => Err(ExecutionError::new(
            ErrorKind::Attribute,
            format!("'{}' object has no attribute '{name}'", type_name(other)),
        )),
    }
}

fn str_method(
    interp: &mut Interp,
    s: &Rc<str>,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> ExecResult<Value> {
    let charge_str = |interp: &mut Interp, text: String| -> ExecResult<Value> {
        interp.charge(text.len())?;
        Ok(Value::Str(text.into()))
    };
    match name {
        "upper" => charge_str(interp, s.to_uppercase()),
        "lower" => charge_str(interp, s.to_lowercase()),
        "strip" | "lstrip" | "rstrip" => {
            arity(name, &args, 0, 1)?;
            no_kwargs(name, &kwargs)?;
            let pattern: Option<Vec<char>> = match args.first() {
                None | Some(Value::None) => None,
                Some(other) => Some(expect_str(other, "strip chars")?.chars().collect()),
            };
            let matches = |c: char| match &pattern {
                None => c.is_whitespace(),
                Some(set) => set.contains(&c),
            };
            let out = match name {
                "strip" => s.trim_matches(matches),
                "lstrip" => s.trim_start_matches(matches),
                _ => s.trim_end_matches(matches),
            };
            charge_str(interp, out.to_owned())
        }
        "split" | "rsplit" => {
            arity(name, &args, 0, 2)?;
            let mut sep: Option<Rc<str>> = None;
            let mut maxsplit: i64 = -1;
            if let Some(value) = args.first()
                && !matches!(value, Value::None)
            {
                sep = Some(expect_str(value, "separator")?);
            }
            if let Some(value) = args.get(1) {
                maxsplit = interp.expect_int(value, "maxsplit")?;
            }
            for (key, value) in &kwargs {
                match key.as_str() {
                    "sep" => {
                        if !matches!(value, Value::None) {
                            sep = Some(expect_str(value, "separator")?);
                        }
                    }
                    "maxsplit" => maxsplit = interp.expect_int(value, "maxsplit")?,
                    other => {
                        return Err(ExecutionError::type_err(format!(
                            "{name}() got an unexpected keyword argument '{other}'"
                        )));
                    }
                }
            }
            let pieces = match &sep {
                None => split_whitespace_limited(s, maxsplit, name == "rsplit"),
                Some(sep) => {
                    if sep.is_empty() {
                        return Err(ExecutionError::value_err("empty separator"));
                    }
                    split_limited(s, sep, maxsplit, name == "rsplit")
                }
            };
            interp.charge(s.len() + pieces.len() * 16)?;
            Ok(Value::List(Rc::new(std::cell::RefCell::new(
                pieces
                    .into_iter()
                    .map(|piece| Value::Str(piece.into()))
                    .collect(),
            ))))
        }
        "splitlines" => {
            arity(name, &args, 0, 0)?;
            interp.charge(s.len())?;
            let lines: Vec<Value> = s
                .split_inclusive('\n')
                .map(|line| {
                    let trimmed = line.strip_suffix('\n').unwrap_or(line);
                    let trimmed = trimmed.strip_suffix('\r').unwrap_or(trimmed);
                    Value::Str(trimmed.into())
                })
                .collect();
            Ok(Value::List(Rc::new(std::cell::RefCell::new(lines))))
        }
        "join" => {
            arity(name, &args, 1, 1)?;
            let items = interp.materialize(&args[0])?;
            let mut out = String::new();
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    interp.charge(s.len())?;
                    out.push_str(s);
                }
                match item {
                    Value::Str(piece) => {
                        interp.charge(piece.len())?;
                        out.push_str(piece);
                    }
                    other => {
                        return Err(ExecutionError::type_err(format!(
                            "sequence item {idx}: expected a string, got '{}'",
                            type_name(other)
                        )));
                    }
                }
            }
            Ok(Value::Str(out.into()))
        }
        "find" | "rfind" | "index" => {
            arity(name, &args, 1, 1)?;
            let needle = expect_str(&args[0], "substring")?;
            let byte_pos = if name == "rfind" {
                s.rfind(needle.as_ref())
            } else {
                s.find(needle.as_ref())
            };
            match byte_pos {
                Some(pos) => Ok(Value::Int(s[..pos].chars().count() as i64)),
                None if name == "index" => {
                    Err(ExecutionError::value_err("substring not found"))
                }
                None => Ok(Value::Int(-1)),
            }
        }
        "count" => {
            arity(name, &args, 1, 1)?;
            let needle = expect_str(&args[0], "substring")?;
            if needle.is_empty() {
                return Ok(Value::Int(s.chars().count() as i64 + 1));
            }
            Ok(Value::Int(s.matches(needle.as_ref()).count() as i64))
        }
        "startswith" | "endswith" => {
            arity(name, &args, 1, 1)?;
            let check = |needle: &str| {
                if name == "startswith" {
                    s.starts_with(needle)
                } else {
                    s.ends_with(needle)
                }
            };
            match &args[0] {
                Value::Str(needle) => Ok(Value::Bool(check(needle))),
                Value::Tuple(options) => {
                    for option in options.iter() {
                        let needle = expect_str(option, "prefix")?;
                        if check(&needle) {
                            return Ok(Value::Bool(true));
                        }
                    }
                    Ok(Value::Bool(false))
                }
                other => Err(ExecutionError::type_err(format!(
                    "{name} first arg must be a string or a tuple of strings, not '{}'",
                    type_name(other)
                ))),
            }
        }
        "replace" => {
            arity(name, &args, 2, 3)?;
            let old = expect_str(&args[0], "old")?;
            let new = expect_str(&args[1], "new")?;
            let count = match args.get(2) {
                Some(value) => interp.expect_int(value, "count")?,
                None => -1,
            };
            if old.is_empty() {
                return Err(ExecutionError::value_err("empty pattern in replace"));
            }
            let out = if count < 0 {
                s.replace(old.as_ref(), &new)
            } else {
                s.replacen(old.as_ref(), &new, count as usize)
            };
            charge_str(interp, out)
        }
        "encode" => {
            arity(name, &args, 0, 1)?;
            if let Some(value) = args.first() {
                let encoding = expect_str(value, "encoding")?;
                if !matches!(encoding.as_ref(), "utf-8" | "utf8" | "ascii") {
                    return Err(ExecutionError::value_err(format!(
                        "unknown encoding: {encoding}"
                    )));
                }
                if encoding.as_ref() == "ascii" && !s.is_ascii() {
                    return Err(ExecutionError::value_err(
                        "'ascii' codec can't encode non-ASCII characters",
                    ));
                }
            }
            interp.charge(s.len())?;
            Ok(Value::Bytes(s.as_bytes().to_vec().into()))
        }
        "isdigit" => Ok(Value::Bool(
            !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()),
        )),
        "isalpha" => Ok(Value::Bool(!s.is_empty() && s.chars().all(char::is_alphabetic))),
        "isalnum" => Ok(Value::Bool(
            !s.is_empty() && s.chars().all(char::is_alphanumeric),
        )),
        "isspace" => Ok(Value::Bool(
            !s.is_empty() && s.chars().all(char::is_whitespace),
        )),
        "title" => {
            let mut out = String::with_capacity(s.len());
            let mut at_word_start = true;
            for c in s.chars() {
                if c.is_alphabetic() {
                    if at_word_start {
                        out.extend(c.to_uppercase());
                    } else {
                        out.extend(c.to_lowercase());
                    }
                    at_word_start = false;
                } else {
                    out.push(c);
                    at_word_start = true;
                }
            }
            charge_str(interp, out)
        }
        "capitalize" => {
            let mut chars = s.chars();
            let out = match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            };
            charge_str(interp, out)
        }
        "zfill" => {
            arity(name, &args, 1, 1)?;
            let width = interp.expect_int(&args[0], "width")?.max(0) as usize;
            let count = s.chars().count();
            if count >= width {
                return Ok(Value::Str(s.clone()));
            }
            let pad = "0".repeat(width - count);
            let out = if let Some(rest) = s.strip_prefix('-') {
                format!("-{pad}{rest}")
            } else {
                format!("{pad}{s}")
            };
            charge_str(interp, out)
        }
        "ljust" | "rjust" => {
            arity(name, &args, 1, 2)?;
            let width = interp.expect_int(&args[0], "width")?.max(0) as usize;
            let fill = match args.get(1) {
                Some(value) => {
                    let fill = expect_str(value, "fill")?;
                    fill.chars().next().unwrap_or(' ')
                }
                None => ' ',
            };
            let count = s.chars().count();
            if count >= width {
                return Ok(Value::Str(s.clone()));
            }
            let pad: String = std::iter::repeat_n(fill, width - count).collect();
            let out = if name == "ljust" {
                format!("{s}{pad}")
            } else {
                format!("{pad}{s}")
            };
            charge_str(interp, out)
        }
        "partition" | "rpartition" => {
            arity(name, &args, 1, 1)?;
            let sep = expect_str(&args[0], "separator")?;
            if sep.is_empty() {
                return Err(ExecutionError::value_err("empty separator"));
            }
            interp.charge(s.len())?;
            let found = if name == "partition" {
                s.find(sep.as_ref())
            } else {
                s.rfind(sep.as_ref())
            };
            let (head, mid, tail) = match found {
                Some(pos) => (&s[..pos], sep.as_ref(), &s[pos + sep.len()..]),
                None if name == "partition" => (s.as_ref(), "", ""),
                None => ("", "", s.as_ref()),
            };
            Ok(Value::Tuple(
                vec![
                    Value::Str(head.into()),
                    Value::Str(mid.into()),
                    Value::Str(tail.into()),
                ]
                .into(),
            ))
        }
        "removeprefix" | "removesuffix" => {
            arity(name, &args, 1, 1)?;
            let affix = expect_str(&args[0], "affix")?;
            let out = if name == "removeprefix" {
                s.strip_prefix(affix.as_ref()).unwrap_or(s)
            } else {
                s.strip_suffix(affix.as_ref()).unwrap_or(s)
            };
            charge_str(interp, out.to_owned())
        }
        _ => Err(ExecutionError::new(
            ErrorKind::Attribute,
            format!("'str' object has no attribute '{name}'"),
        )),
    }
}

fn split_limited(s: &str, sep: &str, maxsplit: i64, from_right: bool) -> Vec<String> {
    if maxsplit < 0 {
        return s.split(sep).map(str::to_owned).collect();
    }
    let n = maxsplit as usize + 1;
    if from_right {
        let mut pieces: Vec<String> = s.rsplitn(n, sep).map(str::to_owned).collect();
        pieces.reverse();
        pieces
    } else {
        s.splitn(n, sep).map(str::to_owned).collect()
    }
}

fn split_whitespace_limited(s: &str, maxsplit: i64, from_right: bool) -> Vec<String> {
    let mut pieces: Vec<String> = s.split_whitespace().map(str::to_owned).collect();
    if maxsplit >= 0 && pieces.len() > maxsplit as usize + 1 {
        // re-join the tail that exceeds the split budget
        if from_right {
            let keep = pieces.len() - maxsplit as usize;
            let head = pieces[..keep].join(" ");
            let mut out = vec![head];
            out.extend(pieces.drain(keep..));
            return out;
        }
        let tail = pieces[maxsplit as usize..].join(" ");
        pieces.truncate(maxsplit as usize);
        pieces.push(tail);
    }
    pieces
}

fn bytes_method(
    interp: &mut Interp,
    b: &Rc<[u8]>,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> ExecResult<Value> {
    no_kwargs(name, &kwargs)?;
    match name {
        "decode" => {
            arity(name, &args, 0, 1)?;
            if let Some(value) = args.first() {
                let encoding = expect_str(value, "encoding")?;
                if !matches!(encoding.as_ref(), "utf-8" | "utf8" | "ascii") {
                    return Err(ExecutionError::value_err(format!(
                        "unknown encoding: {encoding}"
                    )));
                }
            }
            let text = std::str::from_utf8(b).map_err(|_| {
                ExecutionError::value_err("'utf-8' codec can't decode bytes")
            })?;
            interp.charge(text.len())?;
            Ok(Value::Str(text.into()))
        }
        "hex" => {
            arity(name, &args, 0, 0)?;
            interp.charge(b.len() * 2)?;
            Ok(Value::Str(hex::encode(b.as_ref()).into()))
        }
        "find" => {
            arity(name, &args, 1, 1)?;
            let needle = expect_bytes(&args[0], "needle")?;
            if needle.is_empty() {
                return Ok(Value::Int(0));
            }
            let pos = b
                .windows(needle.len())
                .position(|window| window == needle.as_ref());
            Ok(Value::Int(pos.map_or(-1, |p| p as i64)))
        }
        "count" => {
            arity(name, &args, 1, 1)?;
            let needle = expect_bytes(&args[0], "needle")?;
            if needle.is_empty() {
                return Ok(Value::Int(b.len() as i64 + 1));
            }
            let mut count = 0i64;
            let mut idx = 0;
            while idx + needle.len() <= b.len() {
                if &b[idx..idx + needle.len()] == needle.as_ref() {
                    count += 1;
                    idx += needle.len();
                } else {
                    idx += 1;
                }
            }
            Ok(Value::Int(count))
        }
        "split" => {
            arity(name, &args, 0, 1)?;
            interp.charge(b.len())?;
            let pieces: Vec<Vec<u8>> = match args.first() {
                None | Some(Value::None) => b
                    .split(|byte| byte.is_ascii_whitespace())
                    .filter(|piece| !piece.is_empty())
                    .map(<[u8]>::to_vec)
                    .collect(),
                Some(value) => {
                    let sep = expect_bytes(value, "separator")?;
                    if sep.is_empty() {
                        return Err(ExecutionError::value_err("empty separator"));
                    }
                    split_bytes(b, &sep)
                }
            };
            Ok(Value::List(Rc::new(std::cell::RefCell::new(
                pieces
                    .into_iter()
                    .map(|piece| Value::Bytes(piece.into()))
                    .collect(),
            ))))
        }
        "strip" => {
            arity(name, &args, 0, 0)?;
            let start = b
                .iter()
                .position(|byte| !byte.is_ascii_whitespace())
                .unwrap_or(b.len());
            let end = b
                .iter()
                .rposition(|byte| !byte.is_ascii_whitespace())
                .map_or(start, |p| p + 1);
            interp.charge(end.saturating_sub(start))?;
            Ok(Value::Bytes(b[start..end].to_vec().into()))
        }
        "startswith" | "endswith" => {
            arity(name, &args, 1, 1)?;
            let needle = expect_bytes(&args[0], "prefix")?;
            let hit = if name == "startswith" {
                b.starts_with(&needle)
            } else {
                b.ends_with(&needle)
            };
            Ok(Value::Bool(hit))
        }
        "replace" => {
            arity(name, &args, 2, 2)?;
            let old = expect_bytes(&args[0], "old")?;
            let new = expect_bytes(&args[1], "new")?;
            if old.is_empty() {
                return Err(ExecutionError::value_err("empty pattern in replace"));
            }
            let mut out = Vec::with_capacity(b.len());
            let mut idx = 0;
            while idx < b.len() {
                if idx + old.len() <= b.len() && &b[idx..idx + old.len()] == old.as_ref() {
                    out.extend_from_slice(&new);
                    idx += old.len();
                } else {
                    out.push(b[idx]);
                    idx += 1;
                }
            }
            interp.charge(out.len())?;
            Ok(Value::Bytes(out.into()))
        }
        _ => Err(ExecutionError::new(
            ErrorKind::Attribute,
            format!("'bytes' object has no attribute '{name}'"),
        )),
    }
}

fn split_bytes(b: &[u8], sep: &[u8]) -> Vec<Vec<u8>> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut idx = 0;
    while idx + sep.len() <= b.len() {
        if &b[idx..idx + sep.len()] == sep {
            pieces.push(b[start..idx].to_vec());
            idx += sep.len();
            start = idx;
        } else {
            idx += 1;
        }
    }
    pieces.push(b[start..].to_vec());
    pieces
}

fn list_method(
    interp: &mut Interp,
    recv: &Value,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> ExecResult<Value> {
    let Value::List(items) = recv else {
        unreachable!()
    };
    match name {
        "append" => {
            arity(name, &args, 1, 1)?;
            interp.charge(16)?;
            items.borrow_mut().push(args.into_iter().next().expect("one arg"));
            Ok(Value::None)
        }
        "extend" => {
            arity(name, &args, 1, 1)?;
            let extra = interp.materialize(&args[0])?;
            interp.charge(extra.len() * 16)?;
            items.borrow_mut().extend(extra);
            Ok(Value::None)
        }
        "insert" => {
            arity(name, &args, 2, 2)?;
            let mut inner = items.borrow_mut();
            let len = inner.len() as i64;
            let mut idx = interp.expect_int(&args[0], "index")?;
            if idx < 0 {
                idx += len;
            }
            let idx = idx.clamp(0, len) as usize;
            interp.charge(16)?;
            inner.insert(idx, args[1].clone());
            Ok(Value::None)
        }
        "pop" => {
            arity(name, &args, 0, 1)?;
            let mut inner = items.borrow_mut();
            if inner.is_empty() {
                return Err(ExecutionError::new(
                    ErrorKind::Index,
                    "pop from empty list",
                ));
            }
            let len = inner.len() as i64;
            let mut idx = match args.first() {
                Some(value) => interp.expect_int(value, "index")?,
                None => -1,
            };
            if idx < 0 {
                idx += len;
            }
            if idx < 0 || idx >= len {
                return Err(ExecutionError::new(
                    ErrorKind::Index,
                    "pop index out of range",
                ));
            }
            Ok(inner.remove(idx as usize))
        }
        "remove" => {
            arity(name, &args, 1, 1)?;
            let mut inner = items.borrow_mut();
            match inner.iter().position(|item| values_equal(item, &args[0])) {
                Some(pos) => {
                    inner.remove(pos);
                    Ok(Value::None)
                }
                None => Err(ExecutionError::value_err("list.remove(x): x not in list")),
            }
        }
        "index" => {
            arity(name, &args, 1, 1)?;
            let inner = items.borrow();
            match inner.iter().position(|item| values_equal(item, &args[0])) {
                Some(pos) => Ok(Value::Int(pos as i64)),
                None => Err(ExecutionError::value_err(format!(
                    "{} is not in list",
                    repr(&args[0])
                ))),
            }
        }
        "count" => {
            arity(name, &args, 1, 1)?;
            let inner = items.borrow();
            Ok(Value::Int(
                inner
                    .iter()
                    .filter(|item| values_equal(item, &args[0]))
                    .count() as i64,
            ))
        }
        "sort" => {
            arity(name, &args, 0, 0)?;
            let mut key_fn = None;
            let mut reverse = false;
            for (key, value) in kwargs {
                match key.as_str() {
                    "key" => {
                        if !matches!(value, Value::None) {
                            key_fn = Some(value);
                        }
                    }
                    "reverse" => reverse = crate::value::truthy(&value),
                    other => {
                        return Err(ExecutionError::type_err(format!(
                            "sort() got an unexpected keyword argument '{other}'"
                        )));
                    }
                }
            }
            let snapshot = items.borrow().clone();
            let sorted = sort_values(interp, snapshot, key_fn.as_ref(), reverse)?;
            *items.borrow_mut() = sorted;
            Ok(Value::None)
        }
        "reverse" => {
            arity(name, &args, 0, 0)?;
            items.borrow_mut().reverse();
            Ok(Value::None)
        }
        "clear" => {
            arity(name, &args, 0, 0)?;
            items.borrow_mut().clear();
            Ok(Value::None)
        }
        "copy" => {
            arity(name, &args, 0, 0)?;
            let inner = items.borrow().clone();
            interp.charge(inner.len() * 16)?;
            Ok(Value::List(Rc::new(std::cell::RefCell::new(inner))))
        }
        _ => Err(ExecutionError::new(
            ErrorKind::Attribute,
            format!("'list' object has no attribute '{name}'"),
        )),
    }
}

/// Stable sort shared by `sorted()` and `list.sort()`: keys are computed
/// first (possibly through a user function), then compared pairwise.
pub fn sort_values(
    interp: &mut Interp,
    items: Vec<Value>,
    key_fn: Option<&Value>,
    reverse: bool,
) -> ExecResult<Vec<Value>> {
    let mut keyed: Vec<(Value, Value)> = Vec::with_capacity(items.len());
    for item in items {
        interp.tick()?;
        let key = match key_fn {
            Some(f) => interp.call_value(f, vec![item.clone()], Vec::new())?,
            None => item.clone(),
        };
        keyed.push((key, item));
    }
    let mut first_err: Option<ExecutionError> = None;
    keyed.sort_by(|a, b| match compare_values(&a.0, &b.0) {
        Ok(ordering) => {
            if reverse {
                ordering.reverse()
            } else {
                ordering
            }
        }
        Err(err) => {
            first_err.get_or_insert(err);
            std::cmp::Ordering::Equal
        }
    });
    if let Some(err) = first_err {
        return Err(err);
    }
    Ok(keyed.into_iter().map(|(_, item)| item).collect())
}

fn dict_method(
    interp: &mut Interp,
    recv: &Value,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> ExecResult<Value> {
    let Value::Dict(dict) = recv else {
        unreachable!()
    };
    no_kwargs(name, &kwargs)?;
    match name {
        "get" => {
            arity(name, &args, 1, 2)?;
            let key = Key::from_value(&args[0])?;
            Ok(dict
                .borrow()
                .get(&key)
                .cloned()
                .unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::None)))
        }
        "keys" => {
            arity(name, &args, 0, 0)?;
            let keys: Vec<Value> = dict.borrow().keys().map(Key::to_value).collect();
            interp.charge(keys.len() * 16)?;
            Ok(Value::List(Rc::new(std::cell::RefCell::new(keys))))
        }
        "values" => {
            arity(name, &args, 0, 0)?;
            let values: Vec<Value> = dict.borrow().entries().map(|(_, v)| v.clone()).collect();
            interp.charge(values.len() * 16)?;
            Ok(Value::List(Rc::new(std::cell::RefCell::new(values))))
        }
        "items" => {
            arity(name, &args, 0, 0)?;
            let items: Vec<Value> = dict
                .borrow()
                .entries()
                .map(|(k, v)| Value::Tuple(vec![k.to_value(), v.clone()].into()))
                .collect();
            interp.charge(items.len() * 32)?;
            Ok(Value::List(Rc::new(std::cell::RefCell::new(items))))
        }
        "pop" => {
            arity(name, &args, 1, 2)?;
            let key = Key::from_value(&args[0])?;
            match dict.borrow_mut().remove(&key) {
                Some(value) => Ok(value),
                None => args.get(1).cloned().ok_or_else(|| {
                    ExecutionError::new(ErrorKind::Key, repr(&args[0]))
                }),
            }
        }
        "update" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Dict(other) => {
                    let entries: Vec<(Key, Value)> = other
                        .borrow()
                        .entries()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    interp.charge(entries.len() * 32)?;
                    let mut inner = dict.borrow_mut();
                    for (key, value) in entries {
                        inner.insert(key, value);
                    }
                    Ok(Value::None)
                }
                other => {
                    let pairs = interp.materialize(other)?;
                    let mut inner = dict.borrow_mut();
                    for pair in pairs {
                        let items = match &pair {
                            Value::Tuple(items) if items.len() == 2 => items.to_vec(),
                            Value::List(items) if items.borrow().len() == 2 => {
                                items.borrow().clone()
                            }
                            _ => {
                                return Err(ExecutionError::value_err(
                                    "dictionary update sequence elements must be pairs",
                                ));
                            }
                        };
                        inner.insert(Key::from_value(&items[0])?, items[1].clone());
                    }
                    Ok(Value::None)
                }
            }
        }
        "setdefault" => {
            arity(name, &args, 1, 2)?;
            let key = Key::from_value(&args[0])?;
            let mut inner = dict.borrow_mut();
            if let Some(existing) = inner.get(&key) {
                return Ok(existing.clone());
            }
            let default = args.get(1).cloned().unwrap_or(Value::None);
            inner.insert(key, default.clone());
            Ok(default)
        }
        "clear" => {
            arity(name, &args, 0, 0)?;
            dict.borrow_mut().clear();
            Ok(Value::None)
        }
        "copy" => {
            arity(name, &args, 0, 0)?;
            let copied: DictValue = dict.borrow().clone();
            interp.charge(copied.len() * 32)?;
            Ok(Value::Dict(Rc::new(std::cell::RefCell::new(copied))))
        }
        _ => Err(ExecutionError::new(
            ErrorKind::Attribute,
            format!("'dict' object has no attribute '{name}'"),
        )),
    }
}

fn set_method(
    interp: &mut Interp,
    recv: &Value,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> ExecResult<Value> {
    let Value::Set(set) = recv else { unreachable!() };
    no_kwargs(name, &kwargs)?;
    match name {
        "add" => {
            arity(name, &args, 1, 1)?;
            interp.charge(16)?;
            set.borrow_mut().insert(Key::from_value(&args[0])?);
            Ok(Value::None)
        }
        "remove" => {
            arity(name, &args, 1, 1)?;
            let key = Key::from_value(&args[0])?;
            if set.borrow_mut().remove(&key) {
                Ok(Value::None)
            } else {
                Err(ExecutionError::new(ErrorKind::Key, repr(&args[0])))
            }
        }
        "discard" => {
            arity(name, &args, 1, 1)?;
            let key = Key::from_value(&args[0])?;
            set.borrow_mut().remove(&key);
            Ok(Value::None)
        }
        "union" | "intersection" | "difference" => {
            arity(name, &args, 1, 1)?;
            let other_items = interp.materialize(&args[0])?;
            let mut other = SetValue::new(false);
            for item in &other_items {
                other.insert(Key::from_value(item)?);
            }
            let inner = set.borrow();
            let mut out = SetValue::new(false);
            match name {
                "union" => {
                    for key in inner.keys().chain(other.keys()) {
                        out.insert(key.clone());
                    }
                }
                "intersection" => {
                    for key in inner.keys() {
                        if other.contains(key) {
                            out.insert(key.clone());
                        }
                    }
                }
                _ => {
                    for key in inner.keys() {
                        if !other.contains(key) {
                            out.insert(key.clone());
                        }
                    }
                }
            }
            interp.charge(out.len() * 16)?;
            Ok(Value::Set(Rc::new(std::cell::RefCell::new(out))))
        }
        "update" => {
            arity(name, &args, 1, 1)?;
            let extra = interp.materialize(&args[0])?;
            interp.charge(extra.len() * 16)?;
            let mut inner = set.borrow_mut();
            for item in &extra {
                inner.insert(Key::from_value(item)?);
            }
            Ok(Value::None)
        }
        "copy" => {
            arity(name, &args, 0, 0)?;
            let copied: SetValue = set.borrow().clone();
            interp.charge(copied.len() * 16)?;
            Ok(Value::Set(Rc::new(std::cell::RefCell::new(copied))))
        }
        _ => Err(ExecutionError::new(
            ErrorKind::Attribute,
            format!("'set' object has no attribute '{name}'"),
        )),
    }
}

fn tuple_method(
    _interp: &mut Interp,
    items: &Rc<[Value]>,
    name: &str,
    args: Vec<Value>,
) -> ExecResult<Value> {
    match name {
        "count" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Int(
                items
                    .iter()
                    .filter(|item| values_equal(item, &args[0]))
                    .count() as i64,
            ))
        }
        "index" => {
            arity(name, &args, 1, 1)?;
            match items.iter().position(|item| values_equal(item, &args[0])) {
                Some(pos) => Ok(Value::Int(pos as i64)),
                None => Err(ExecutionError::value_err(format!(
                    "{} is not in tuple",
                    repr(&args[0])
                ))),
            }
        }
        _ => Err(ExecutionError::new(
            ErrorKind::Attribute,
            format!("'tuple' object has no attribute '{name}'"),
        )),
    }
}

// ---- format mini-language ---------------------------------------------

struct FormatSpec {
    fill: char,
    align: Option<char>,
    sign: Option<char>,
    zero_pad: bool,
    width: usize,
    thousands: bool,
    precision: Option<usize>,
    kind: Option<char>,
}

fn parse_format_spec(spec: &str) -> ExecResult<FormatSpec> {
    let chars: Vec<char> = spec.chars().collect();
    let mut out = FormatSpec {
        fill: ' ',
        align: None,
        sign: None,
        zero_pad: false,
        width: 0,
        thousands: false,
        precision: None,
        kind: None,
    };
    let mut i = 0;
    if chars.len() >= 2 && matches!(chars[1], '<' | '>' | '^' | '=') {
        out.fill = chars[0];
        out.align = Some(chars[1]);
        i = 2;
    } else if !chars.is_empty() && matches!(chars[0], '<' | '>' | '^' | '=') {
        out.align = Some(chars[0]);
        i = 1;
    }
    if i < chars.len() && matches!(chars[i], '+' | '-' | ' ') {
        out.sign = Some(chars[i]);
        i += 1;
    }
    if i < chars.len() && chars[i] == '#' {
        i += 1;
    }
    if i < chars.len() && chars[i] == '0' {
        out.zero_pad = true;
        if out.align.is_none() {
            out.fill = '0';
            out.align = Some('=');
        }
        i += 1;
    }
    let mut width = String::new();
    while i < chars.len() && chars[i].is_ascii_digit() {
        width.push(chars[i]);
        i += 1;
    }
    if !width.is_empty() {
        out.width = width.parse().map_err(|_| {
            ExecutionError::value_err("invalid width in format spec")
        })?;
    }
    if i < chars.len() && chars[i] == ',' {
        out.thousands = true;
        i += 1;
    }
    if i < chars.len() && chars[i] == '.' {
        i += 1;
        let mut precision = String::new();
        while i < chars.len() && chars[i].is_ascii_digit() {
            precision.push(chars[i]);
            i += 1;
        }
        if precision.is_empty() {
            return Err(ExecutionError::value_err("missing precision in format spec"));
        }
        out.precision = Some(precision.parse().expect("digits parse"));
    }
    if i < chars.len() {
        out.kind = Some(chars[i]);
        i += 1;
    }
    if i < chars.len() {
        return Err(ExecutionError::value_err(format!(
            "invalid format spec '{spec}'"
        )));
    }
    Ok(out)
}

fn group_thousands(digits: &str) -> String {
    let mut out = String::new();
    let chars: Vec<char> = digits.chars().collect();
    for (idx, c) in chars.iter().enumerate() {
        if idx > 0 && (chars.len() - idx) % 3 == 0 {
            out.push(',');
        }
        out.push(*c);
    }
    out
}

/// `format(value, spec)` as used from f-strings.
pub fn format_value(value: &Value, spec: &str) -> ExecResult<String> {
    let parsed = parse_format_spec(spec)?;
    let (body, negative) = match (&parsed.kind, value) {
        (Some('d') | None, Value::Int(i)) => {
            let digits = i.unsigned_abs().to_string();
            let digits = if parsed.thousands {
                group_thousands(&digits)
            } else {
                digits
            };
            (digits, *i < 0)
        }
        (Some('x'), Value::Int(i)) => (format!("{:x}", i.unsigned_abs()), *i < 0),
        (Some('X'), Value::Int(i)) => (format!("{:X}", i.unsigned_abs()), *i < 0),
        (Some('o'), Value::Int(i)) => (format!("{:o}", i.unsigned_abs()), *i < 0),
        (Some('b'), Value::Int(i)) => (format!("{:b}", i.unsigned_abs()), *i < 0),
        (Some('f') | Some('F'), v) => {
            let f = expect_float(v)?;
            let precision = parsed.precision.unwrap_or(6);
            let body = format!("{:.*}", precision, f.abs());
            let body = if parsed.thousands {
                let (int_part, frac) = body.split_once('.').unwrap_or((body.as_str(), ""));
                if frac.is_empty() {
                    group_thousands(int_part)
                } else {
                    format!("{}.{}", group_thousands(int_part), frac)
                }
            } else {
                body
            };
            (body, f.is_sign_negative() && f != 0.0)
        }
        (Some('e') | Some('E'), v) => {
            let f = expect_float(v)?;
            let precision = parsed.precision.unwrap_or(6);
            let body = format!("{:.*e}", precision, f.abs());
            let body = fix_exponent(&body, parsed.kind == Some('E'));
            (body, f.is_sign_negative() && f != 0.0)
        }
        (Some('g') | Some('G') | None, Value::Float(f)) => {
            (crate::value::float_repr(f.abs()), *f < 0.0)
        }
        (Some('%'), v) => {
            let f = expect_float(v)?;
            let precision = parsed.precision.unwrap_or(6);
            (
                format!("{:.*}%", precision, f.abs() * 100.0),
                f.is_sign_negative() && f != 0.0,
            )
        }
        (Some('s') | None, v) => {
            let mut body = to_display(v);
            if let Some(precision) = parsed.precision {
                body = body.chars().take(precision).collect();
            }
            (body, false)
        }
        (Some(kind), v) => {
            return Err(ExecutionError::value_err(format!(
                "unknown format code '{kind}' for object of type '{}'",
                type_name(v)
            )));
        }
    };
    let sign = if negative {
        "-"
    } else {
        match parsed.sign {
            Some('+') => "+",
            Some(' ') => " ",
            _ => "",
        }
    };
    Ok(pad(&format!("{sign}{body}"), &parsed, sign.len()))
}

/// Applies only the padding part of a spec to an already-rendered string,
/// as needed for `{x!r:>10}`.
pub fn format_str(text: &str, spec: &str) -> ExecResult<String> {
    let parsed = parse_format_spec(spec)?;
    Ok(pad(text, &parsed, 0))
}

fn pad(text: &str, spec: &FormatSpec, sign_len: usize) -> String {
    let count = text.chars().count();
    if count >= spec.width {
        return text.to_owned();
    }
    let missing = spec.width - count;
    let fill: String = std::iter::repeat_n(spec.fill, missing).collect();
    match spec.align.unwrap_or('<') {
        '>' => format!("{fill}{text}"),
        '^' => {
            let left = missing / 2;
            let right = missing - left;
            let left: String = std::iter::repeat_n(spec.fill, left).collect();
            let right: String = std::iter::repeat_n(spec.fill, right).collect();
            format!("{left}{text}{right}")
        }
        '=' => {
            let (sign, rest) = text.split_at(sign_len);
            format!("{sign}{fill}{rest}")
        }
        _ => format!("{text}{fill}"),
    }
}

fn fix_exponent(body: &str, upper: bool) -> String {
    // Rust renders `1e5`, Python wants `1e+05`
    let mut out = String::with_capacity(body.len() + 2);
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c == 'e' || c == 'E' {
            out.push(if upper { 'E' } else { 'e' });
            let mut exp = String::new();
            let mut negative = false;
            if let Some('-') = chars.peek() {
                negative = true;
                chars.next();
            } else if let Some('+') = chars.peek() {
                chars.next();
            }
            for digit in chars.by_ref() {
                exp.push(digit);
            }
            out.push(if negative { '-' } else { '+' });
            if exp.len() < 2 {
                out.push('0');
            }
            out.push_str(&exp);
            return out;
        }
        out.push(c);
    }
    out
}

fn expect_float(value: &Value) -> ExecResult<f64> {
    match value {
        Value::Int(i) => Ok(*i as f64),
        Value::Float(f) => Ok(*f),
        Value::Bool(b) => Ok(*b as i64 as f64),
        other => Err(ExecutionError::type_err(format!(
            "numeric format code applied to '{}'",
            type_name(other)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_specs() {
        assert_eq!(format_value(&Value::Int(42), ">6").unwrap(), "    42");
        assert_eq!(format_value(&Value::Int(42), "06d").unwrap(), "000042");
        assert_eq!(format_value(&Value::Int(-42), "06d").unwrap(), "-00042");
        assert_eq!(format_value(&Value::Int(255), "x").unwrap(), "ff");
        assert_eq!(format_value(&Value::Float(3.14159), ".2f").unwrap(), "3.14");
        assert_eq!(
            format_value(&Value::Str("hi".into()), "^6").unwrap(),
            "  hi  "
        );
        assert_eq!(
            format_value(&Value::Int(1234567), ",d").unwrap(),
            "1,234,567"
        );
        assert_eq!(format_value(&Value::Float(1.5), "+.1f").unwrap(), "+1.5");
    }

    #[test]
    fn split_limited_matches_python() {
        assert_eq!(split_limited("a,b,c", ",", -1, false), vec!["a", "b", "c"]);
        assert_eq!(split_limited("a,b,c", ",", 1, false), vec!["a", "b,c"]);
        assert_eq!(split_limited("a,b,c", ",", 1, true), vec!["a,b", "c"]);
    }

    #[test]
    fn exponent_fixup() {
        assert_eq!(fix_exponent("1.5e5", false), "1.5e+05");
        assert_eq!(fix_exponent("1.5e-5", false), "1.5e-05");
        assert_eq!(fix_exponent("1.5e12", true), "1.5E+12");
    }
}
