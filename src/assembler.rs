// File: src/assembler.rs
//
// Line-based assembler for Alto bytecode, used by tests and tooling to
// drive the VM below the compiler. Two passes: the first collects labels,
// symbols, and data directives, the second resolves operands.

use crate::bytecode::{mnemonic_named, Instruction, Mnemonic, Operand};
use crate::errors::{AltoError, SourceLocation};
use crate::module::{FrameInfo, MapEntry, Module, SourceMap};
use crate::value::{Import, Value};
use ahash::RandomState;
use std::collections::HashMap;
use std::rc::Rc;

/// One operand as written: a literal integer or a symbol to resolve
#[derive(Debug, Clone)]
enum Arg {
    Int(i32),
    Symbol(String),
}

#[derive(Debug, Clone)]
enum LineTok {
    Word(String),
    Label(String),
    Number(f64),
    Str(String),
    Null,
    True,
    False,
}

struct PendingInstr {
    mnemonic: &'static Mnemonic,
    param: Option<Arg>,
    value: Option<Arg>,
    row: usize,
}

/// Assemble module text into an executable Module
pub fn assemble(source: &str) -> Result<Module, AltoError> {
    let mut symbols: HashMap<String, i32, RandomState> = HashMap::with_hasher(RandomState::new());
    symbols.insert("false".to_string(), 0);
    symbols.insert("true".to_string(), 1);

    let mut data: Vec<Value> = Vec::new();
    let mut pending: Vec<PendingInstr> = Vec::new();

    for (index, line) in source.lines().enumerate() {
        let row = index + 1;
        let toks = split_line(line, row)?;
        let Some(first) = toks.first() else { continue };

        match first {
            LineTok::Label(name) => {
                if toks.len() > 1 {
                    return Err(asm_error(row, line, "a label must stand alone on its line"));
                }
                define(&mut symbols, name, pending.len() as i32, row, line)?;
            }
            LineTok::Word(word) if word == "global" => {
                let (name, value) = match &toks[1..] {
                    [LineTok::Word(name), value] => (name, value),
                    _ => return Err(asm_error(row, line, "usage: global NAME VALUE")),
                };
                let slot = match value {
                    LineTok::Number(n) => Value::Number(*n),
                    LineTok::Str(s) => Value::string(s.as_str()),
                    LineTok::Null => Value::Null,
                    LineTok::True => Value::Boolean(true),
                    LineTok::False => Value::Boolean(false),
                    _ => return Err(asm_error(row, line, "usage: global NAME VALUE")),
                };
                define(&mut symbols, name, data.len() as i32, row, line)?;
                data.push(slot);
            }
            LineTok::Word(word) if word == "import" => {
                let (name, path) = match &toks[1..] {
                    [LineTok::Word(name), LineTok::Str(path)] => (name, path),
                    _ => return Err(asm_error(row, line, "usage: import NAME 'path'")),
                };
                define(&mut symbols, name, data.len() as i32, row, line)?;
                data.push(Value::Import(Rc::new(Import::new(path.clone()))));
            }
            LineTok::Word(word) if word == "const" => {
                let (name, value) = match &toks[1..] {
                    [LineTok::Word(name), LineTok::Number(n)] if n.fract() == 0.0 => {
                        (name, *n as i32)
                    }
                    _ => return Err(asm_error(row, line, "usage: const NAME INT")),
                };
                define(&mut symbols, name, value, row, line)?;
            }
            LineTok::Word(word) => {
                let Some(mnemonic) = mnemonic_named(word) else {
                    return Err(asm_error(row, line, format!("unknown mnemonic '{}'", word)));
                };
                let args: Vec<Arg> = toks[1..]
                    .iter()
                    .map(|tok| match tok {
                        LineTok::Number(n) if n.fract() == 0.0 => Ok(Arg::Int(*n as i32)),
                        LineTok::Word(name) => Ok(Arg::Symbol(name.clone())),
                        LineTok::True => Ok(Arg::Int(1)),
                        LineTok::False => Ok(Arg::Int(0)),
                        LineTok::Null => {
                            Err(asm_error(row, line, "null is not a valid operand"))
                        }
                        _ => Err(asm_error(row, line, "operands must be integers or symbols")),
                    })
                    .collect::<Result<_, _>>()?;

                let (param, value) = distribute(mnemonic, args, row, line)?;
                pending.push(PendingInstr { mnemonic, param, value, row });
            }
            _ => return Err(asm_error(row, line, "expected a mnemonic, directive, or label")),
        }
    }

    // Second pass: resolve symbols now that every label is known
    let mut code = Vec::with_capacity(pending.len());
    let mut map = SourceMap::new();
    let frame = Rc::new(FrameInfo::toplevel("main"));
    for instr in pending {
        let param = match instr.param {
            None => default_operand(instr.mnemonic.param),
            Some(arg) => resolve(&symbols, arg, instr.row)?,
        };
        let value = match instr.value {
            None => default_operand(instr.mnemonic.value),
            Some(arg) => resolve(&symbols, arg, instr.row)?,
        };
        code.push(Instruction::new(instr.mnemonic.opcode, param as u8, value));
        map.push(Rc::new(MapEntry { row: instr.row, column: 1, frame: Rc::clone(&frame) }));
    }

    Ok(Module::new(code, data, map))
}

fn asm_error(row: usize, line: &str, message: impl Into<String>) -> AltoError {
    AltoError::parse_error(message.into(), SourceLocation::new(row, 1))
        .with_source(line.to_string())
}

fn define(
    symbols: &mut HashMap<String, i32, RandomState>,
    name: &str,
    value: i32,
    row: usize,
    line: &str,
) -> Result<(), AltoError> {
    if symbols.insert(name.to_string(), value).is_some() {
        return Err(asm_error(row, line, format!("symbol '{}' is already defined", name)));
    }
    Ok(())
}

fn resolve(
    symbols: &HashMap<String, i32, RandomState>,
    arg: Arg,
    row: usize,
) -> Result<i32, AltoError> {
    match arg {
        Arg::Int(value) => Ok(value),
        Arg::Symbol(name) => symbols.get(&name).copied().ok_or_else(|| {
            AltoError::parse_error(
                format!("undefined symbol '{}'", name),
                SourceLocation::new(row, 1),
            )
        }),
    }
}

fn default_operand(spec: Operand) -> i32 {
    match spec {
        Operand::Optional(default) => default,
        _ => 0,
    }
}

/// Assign bare arguments to the param and value fields according to the
/// mnemonic's operand declarations
fn distribute(
    mnemonic: &Mnemonic,
    mut args: Vec<Arg>,
    row: usize,
    line: &str,
) -> Result<(Option<Arg>, Option<Arg>), AltoError> {
    let takes_param = mnemonic.param != Operand::Forbidden;
    let takes_value = mnemonic.value != Operand::Forbidden;

    let (param, value) = match (takes_param, takes_value, args.len()) {
        (_, _, 0) => (None, None),
        (false, true, 1) => (None, Some(args.remove(0))),
        (true, false, 1) => (Some(args.remove(0)), None),
        // With both fields open, a single argument is the value
        (true, true, 1) => (None, Some(args.remove(0))),
        (true, true, 2) => {
            let param = args.remove(0);
            (Some(param), Some(args.remove(0)))
        }
        _ => {
            return Err(asm_error(
                row,
                line,
                format!("'{}' does not take {} operands", mnemonic.name, args.len()),
            ))
        }
    };

    if mnemonic.param == Operand::Required && param.is_none() {
        return Err(asm_error(row, line, format!("'{}' requires a param", mnemonic.name)));
    }
    if mnemonic.value == Operand::Required && value.is_none() {
        return Err(asm_error(row, line, format!("'{}' requires a value", mnemonic.name)));
    }
    Ok((param, value))
}

/// Split one line into tokens; `;` starts a comment outside of strings
fn split_line(line: &str, row: usize) -> Result<Vec<LineTok>, AltoError> {
    let chars: Vec<char> = line.chars().collect();
    let mut toks = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let c = chars[pos];
        if c == ';' {
            break;
        }
        if c.is_whitespace() {
            pos += 1;
            continue;
        }
        if c == '\'' {
            pos += 1;
            let mut text = String::new();
            let mut closed = false;
            while pos < chars.len() {
                let d = chars[pos];
                pos += 1;
                if d == '\'' {
                    closed = true;
                    break;
                }
                if d == '\\' {
                    let esc = chars.get(pos).copied().unwrap_or('\\');
                    pos += 1;
                    match esc {
                        'n' => text.push('\n'),
                        'r' => text.push('\r'),
                        '\'' => text.push('\''),
                        '"' => text.push('"'),
                        other => text.push(other),
                    }
                } else {
                    text.push(d);
                }
            }
            if !closed {
                return Err(asm_error(row, line, "unterminated string"));
            }
            toks.push(LineTok::Str(text));
            continue;
        }
        if c == '-' || c.is_ascii_digit() {
            let start = pos;
            pos += 1;
            while pos < chars.len()
                && (chars[pos].is_ascii_digit() || chars[pos] == '.' || chars[pos] == 'e'
                    || chars[pos] == 'E' || chars[pos] == '+' || chars[pos] == '-')
            {
                pos += 1;
            }
            let text: String = chars[start..pos].iter().collect();
            let number = text.parse::<f64>().map_err(|_| {
                asm_error(row, line, format!("malformed number '{}'", text))
            })?;
            toks.push(LineTok::Number(number));
            continue;
        }
        if c == '_' || c.is_alphabetic() {
            let start = pos;
            while pos < chars.len() && (chars[pos] == '_' || chars[pos].is_alphanumeric()) {
                pos += 1;
            }
            let text: String = chars[start..pos].iter().collect();
            if pos < chars.len() && chars[pos] == ':' {
                pos += 1;
                toks.push(LineTok::Label(text));
            } else {
                match text.as_str() {
                    "null" => toks.push(LineTok::Null),
                    "true" => toks.push(LineTok::True),
                    "false" => toks.push(LineTok::False),
                    _ => toks.push(LineTok::Word(text)),
                }
            }
            continue;
        }
        return Err(asm_error(row, line, format!("unexpected character '{}'", c)));
    }

    Ok(toks)
}
