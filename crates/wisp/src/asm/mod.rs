//! A textual assembler/disassembler for [`Program`], used only to author
//! and inspect end-to-end fixtures without going through a compiler.
//!
//! Section order inside one program is fixed: `program:`, then optional
//! `loads:`, `names:`, `constants:`, then one or more `function:` blocks.
//! Opcode mnemonics are lowercased snake_case spellings of the
//! [`Opcode`] variants; every non-jump operand is a plain decimal
//! integer (an index into whichever table the opcode addresses), and
//! every jump operand (including `defers:`/`catches:` rows) is an index
//! into the enclosing `code:` sequence, resolved here to a byte address.
//! `#` starts a line comment outside of a quoted string.

use std::fmt;

use crate::{
    bytecode::{
        code::{Constant, Funcode, LoadEntry, ProtectedRegion},
        encoding::{decode_jump_operand, encode_jump_operand, read_uleb128, write_uleb128},
        op::Opcode,
        Program,
    },
    intern::{NameId, NamePool},
    pos::{Pos, PositionTable, PositionTableBuilder},
};

/// A failure assembling textual source, tagged with the 1-based source line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsmError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for AsmError {}

impl AsmError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self { line, message: message.into() }
    }
}

/// Strips a `#`-led trailing comment, respecting double-quoted spans.
fn strip_comment(line: &str) -> &str {
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            '#' if !in_quotes => return &line[..i],
            _ => {}
        }
    }
    line
}

/// Splits a line into whitespace-separated tokens, treating a
/// double-quoted span (with `\"`/`\\` escapes) as a single token whose
/// quotes are stripped.
fn tokenize(line: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            chars.next();
            let mut s = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some('n') => s.push('\n'),
                        Some('t') => s.push('\t'),
                        Some(other) => s.push(other),
                        None => return Err("unterminated escape in quoted string".to_owned()),
                    },
                    Some(other) => s.push(other),
                    None => return Err("unterminated quoted string".to_owned()),
                }
            }
            tokens.push(format!("\"{s}\""));
        } else {
            let mut s = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                s.push(c);
                chars.next();
            }
            tokens.push(s);
        }
    }
    Ok(tokens)
}

fn unquote(tok: &str) -> &str {
    tok.strip_prefix('"').and_then(|s| s.strip_suffix('"')).unwrap_or(tok)
}

fn parse_u32(tok: &str, line: usize) -> Result<u32, AsmError> {
    tok.parse::<u32>().map_err(|_| AsmError::new(line, format!("expected an integer, got '{tok}'")))
}

fn parse_i64(tok: &str, line: usize) -> Result<i64, AsmError> {
    tok.parse::<i64>().map_err(|_| AsmError::new(line, format!("expected an integer, got '{tok}'")))
}

/// The closed opname<->mnemonic table; keep in lockstep with [`Opcode::from_byte`]'s table.
const MNEMONICS: &[(Opcode, &str)] = &[
    (Opcode::Nop, "nop"),
    (Opcode::Dup, "dup"),
    (Opcode::Dup2, "dup2"),
    (Opcode::Pop, "pop"),
    (Opcode::Exch, "exch"),
    (Opcode::Lt, "lt"),
    (Opcode::Le, "le"),
    (Opcode::Gt, "gt"),
    (Opcode::Ge, "ge"),
    (Opcode::Eql, "eql"),
    (Opcode::Neq, "neq"),
    (Opcode::In, "in"),
    (Opcode::Plus, "plus"),
    (Opcode::Minus, "minus"),
    (Opcode::Star, "star"),
    (Opcode::Slash, "slash"),
    (Opcode::SlashSlash, "slash_slash"),
    (Opcode::Percent, "percent"),
    (Opcode::Circumflex, "circumflex"),
    (Opcode::Ampersand, "ampersand"),
    (Opcode::Pipe, "pipe"),
    (Opcode::LtLt, "lt_lt"),
    (Opcode::GtGt, "gt_gt"),
    (Opcode::UPlus, "u_plus"),
    (Opcode::UMinus, "u_minus"),
    (Opcode::UTilde, "u_tilde"),
    (Opcode::Not, "not"),
    (Opcode::Len, "len"),
    (Opcode::Nil, "nil"),
    (Opcode::True, "true"),
    (Opcode::False, "false"),
    (Opcode::Index, "index"),
    (Opcode::SetIndex, "set_index"),
    (Opcode::SetMap, "set_map"),
    (Opcode::IterPush, "iter_push"),
    (Opcode::IterPop, "iter_pop"),
    (Opcode::Return, "return"),
    (Opcode::RunDefer, "run_defer"),
    (Opcode::DeferExit, "defer_exit"),
    (Opcode::Throw, "throw"),
    (Opcode::Rethrow, "rethrow"),
    (Opcode::Constant, "constant"),
    (Opcode::MakeTuple, "make_tuple"),
    (Opcode::MakeArray, "make_array"),
    (Opcode::MakeMap, "make_map"),
    (Opcode::MakeFunc, "make_func"),
    (Opcode::Local, "local"),
    (Opcode::SetLocal, "set_local"),
    (Opcode::LocalCell, "local_cell"),
    (Opcode::SetLocalCell, "set_local_cell"),
    (Opcode::Free, "free"),
    (Opcode::FreeCell, "free_cell"),
    (Opcode::SetFreeCell, "set_free_cell"),
    (Opcode::Predeclared, "predeclared"),
    (Opcode::Universal, "universal"),
    (Opcode::Attr, "attr"),
    (Opcode::SetField, "set_field"),
    (Opcode::Call, "call"),
    (Opcode::CallVar, "call_var"),
    (Opcode::Load, "load"),
    (Opcode::Jmp, "jmp"),
    (Opcode::CJmp, "c_jmp"),
    (Opcode::IterJmp, "iter_jmp"),
    (Opcode::CatchJmp, "catch_jmp"),
];

fn opcode_name(op: Opcode) -> &'static str {
    MNEMONICS.iter().find(|(o, _)| *o == op).map_or("?", |(_, n)| n)
}

fn opcode_by_name(name: &str) -> Option<Opcode> {
    MNEMONICS.iter().find(|(_, n)| *n == name).map(|(o, _)| *o)
}

#[derive(Debug)]
struct RawInstr {
    line: usize,
    op: Opcode,
    operand: Option<i64>,
    pos: Option<Pos>,
}

#[derive(Debug, Default)]
struct FunctionSrc {
    name: String,
    max_stack: u32,
    num_params: u32,
    has_varargs: bool,
    num_locals: u32,
    cells: Vec<u32>,
    freevars: Vec<String>,
    defers: Vec<(i64, i64, i64)>,
    catches: Vec<(i64, i64, i64)>,
    code: Vec<RawInstr>,
}

#[derive(Debug, PartialEq, Eq)]
enum Section {
    TopLevel,
    Loads,
    Names,
    Constants,
    Locals,
    Cells,
    Freevars,
    Defers,
    Catches,
    Code,
}

/// Parses the textual assembly format described in spec §6 into a [`Program`].
pub fn assemble(text: &str) -> Result<Program, AsmError> {
    let mut filename = None;
    let mut loads: Vec<String> = Vec::new();
    let mut names: Vec<String> = Vec::new();
    let mut constants: Vec<Constant> = Vec::new();
    let mut functions: Vec<FunctionSrc> = Vec::new();

    let mut section = Section::TopLevel;

    for (idx, raw_line) in text.lines().enumerate() {
        let lineno = idx + 1;
        let stripped = strip_comment(raw_line).trim();
        if stripped.is_empty() {
            continue;
        }
        let tokens = tokenize(stripped).map_err(|e| AsmError::new(lineno, e))?;
        let head = tokens[0].as_str();

        match head {
            "program:" => {
                filename = Some(tokens.get(1).map(|s| unquote(s).to_owned()).unwrap_or_default());
                section = Section::TopLevel;
                continue;
            }
            "loads:" => {
                section = Section::Loads;
                continue;
            }
            "names:" => {
                section = Section::Names;
                continue;
            }
            "constants:" => {
                section = Section::Constants;
                continue;
            }
            "function:" => {
                let name = tokens.get(1).ok_or_else(|| AsmError::new(lineno, "function: needs a name"))?.clone();
                let stack = parse_u32(tokens.get(2).ok_or_else(|| AsmError::new(lineno, "function: needs a stack size"))?, lineno)?;
                let params = parse_u32(tokens.get(3).ok_or_else(|| AsmError::new(lineno, "function: needs a param count"))?, lineno)?;
                let has_varargs = tokens.get(4).is_some_and(|t| t == "+varargs");
                functions.push(FunctionSrc {
                    name,
                    max_stack: stack,
                    num_params: params,
                    has_varargs,
                    num_locals: params,
                    ..FunctionSrc::default()
                });
                section = Section::TopLevel;
                continue;
            }
            "locals:" => {
                let f = functions.last_mut().ok_or_else(|| AsmError::new(lineno, "locals: outside a function block"))?;
                if let Some(n) = tokens.get(1) {
                    f.num_locals = parse_u32(n, lineno)?;
                }
                section = Section::Locals;
                continue;
            }
            "cells:" => {
                let f = functions.last_mut().ok_or_else(|| AsmError::new(lineno, "cells: outside a function block"))?;
                for t in &tokens[1..] {
                    f.cells.push(parse_u32(t, lineno)?);
                }
                section = Section::Cells;
                continue;
            }
            "freevars:" => {
                let f = functions.last_mut().ok_or_else(|| AsmError::new(lineno, "freevars: outside a function block"))?;
                for t in &tokens[1..] {
                    f.freevars.push(unquote(t).to_owned());
                }
                section = Section::Freevars;
                continue;
            }
            "defers:" => {
                section = Section::Defers;
                continue;
            }
            "catches:" => {
                section = Section::Catches;
                continue;
            }
            "code:" => {
                section = Section::Code;
                continue;
            }
            _ => {}
        }

        match section {
            Section::TopLevel => return Err(AsmError::new(lineno, format!("unexpected content '{stripped}' outside any section"))),
            Section::Loads => loads.push(unquote(head).to_owned()),
            Section::Names => names.push(unquote(head).to_owned()),
            Section::Constants => {
                let value = tokens.get(1).ok_or_else(|| AsmError::new(lineno, "constant row needs a value"))?;
                let c = match head {
                    "int" => Constant::Int(parse_i64(value, lineno)?),
                    "float" => Constant::Float(
                        value.parse::<f64>().map_err(|_| AsmError::new(lineno, format!("expected a float, got '{value}'")))?,
                    ),
                    "str" => Constant::Str(unquote(value).to_owned()),
                    other => return Err(AsmError::new(lineno, format!("unknown constant kind '{other}'"))),
                };
                constants.push(c);
            }
            Section::Locals | Section::Cells | Section::Freevars => {
                return Err(AsmError::new(lineno, format!("unexpected row '{stripped}' in this section")));
            }
            Section::Defers | Section::Catches => {
                if tokens.len() != 3 {
                    return Err(AsmError::new(lineno, "defer/catch row needs exactly PC0 PC1 StartPC"));
                }
                let row = (parse_i64(&tokens[0], lineno)?, parse_i64(&tokens[1], lineno)?, parse_i64(&tokens[2], lineno)?);
                let f = functions.last_mut().ok_or_else(|| AsmError::new(lineno, "defer/catch row outside a function block"))?;
                if section == Section::Defers {
                    f.defers.push(row);
                } else {
                    f.catches.push(row);
                }
            }
            Section::Code => {
                let (mnemonic, rest) = (head, &tokens[1..]);
                let op = opcode_by_name(mnemonic).ok_or_else(|| AsmError::new(lineno, format!("unknown opcode '{mnemonic}'")))?;
                let mut operand = None;
                let mut pos = None;
                for tok in rest {
                    if let Some(posspec) = tok.strip_prefix('@') {
                        let (l, c) = posspec
                            .split_once(':')
                            .ok_or_else(|| AsmError::new(lineno, format!("malformed position annotation '{tok}'")))?;
                        let line = l.parse::<u32>().map_err(|_| AsmError::new(lineno, format!("bad line in '{tok}'")))?;
                        let col = c.parse::<u32>().map_err(|_| AsmError::new(lineno, format!("bad column in '{tok}'")))?;
                        pos = Some(Pos::new(line, col));
                    } else {
                        operand = Some(parse_i64(tok, lineno)?);
                    }
                }
                functions.last_mut().ok_or_else(|| AsmError::new(lineno, "code row outside a function block"))?.code.push(RawInstr {
                    line: lineno,
                    op,
                    operand,
                    pos,
                });
            }
        }
    }

    let filename = filename.ok_or_else(|| AsmError::new(1, "missing required 'program:' header"))?;
    if functions.is_empty() {
        return Err(AsmError::new(1, "program has no function: blocks"));
    }

    let mut name_pool = names;
    let mut name_index = |want: &str| -> usize {
        if let Some(i) = name_pool.iter().position(|n| n == want) {
            i
        } else {
            name_pool.push(want.to_owned());
            name_pool.len() - 1
        }
    };

    let load_entries: Vec<LoadEntry> =
        loads.iter().map(|n| LoadEntry { name: NameId(u32::try_from(name_index(n)).expect("name pool index fits u32")), pos: Pos::default() }).collect();

    let built_functions = functions.iter().map(build_funcode).collect::<Result<Vec<_>, _>>()?;

    Ok(Program {
        filename,
        loads: load_entries,
        names: name_pool_from(name_pool),
        constants,
        functions: built_functions.into_iter().map(std::rc::Rc::new).collect(),
        toplevel: 0,
    })
}

/// `NamePool`'s fields are private to the interning module; build one the
/// same way `Interner::finish` would, from an already-deduplicated list.
fn name_pool_from(strings: Vec<String>) -> NamePool {
    let mut interner = crate::intern::Interner::new();
    for s in &strings {
        interner.intern(s);
    }
    interner.finish()
}

fn build_funcode(src: &FunctionSrc) -> Result<Funcode, AsmError> {
    let n = src.code.len();
    let mut bytecode = Vec::new();
    let mut offsets = Vec::with_capacity(n + 1);
    let mut jump_patches: Vec<(usize, i64, usize)> = Vec::new(); // (byte offset of 4-byte field, target index, source line)
    let mut positions = PositionTableBuilder::new();

    for instr in &src.code {
        offsets.push(u32::try_from(bytecode.len()).expect("function exceeds u32-addressable bytecode"));
        if let Some(pos) = instr.pos {
            positions.record(offsets[offsets.len() - 1], pos);
        }
        bytecode.push(instr.op as u8);
        if instr.op.is_jump() {
            let target = instr.operand.ok_or_else(|| AsmError::new(instr.line, format!("{} needs a jump target", opcode_name(instr.op))))?;
            let field_at = bytecode.len();
            bytecode.extend_from_slice(&[0u8; 4]);
            jump_patches.push((field_at, target, instr.line));
        } else if instr.op.takes_operand() {
            let operand = instr.operand.ok_or_else(|| AsmError::new(instr.line, format!("{} needs an operand", opcode_name(instr.op))))?;
            if operand < 0 {
                return Err(AsmError::new(instr.line, "operand must be non-negative"));
            }
            write_uleb128(&mut bytecode, operand as u64);
        } else if instr.operand.is_some() {
            return Err(AsmError::new(instr.line, format!("{} takes no operand", opcode_name(instr.op))));
        }
    }
    offsets.push(u32::try_from(bytecode.len()).expect("function exceeds u32-addressable bytecode"));

    let resolve_index = |idx: i64, line: usize| -> Result<u32, AsmError> {
        let idx = usize::try_from(idx).map_err(|_| AsmError::new(line, "index must be non-negative"))?;
        offsets.get(idx).copied().ok_or_else(|| AsmError::new(line, format!("index {idx} is out of range for this function's code")))
    };

    for (field_at, target, line) in jump_patches {
        let addr = resolve_index(target, line)?;
        bytecode[field_at..field_at + 4].copy_from_slice(&encode_jump_operand(addr));
    }

    let resolve_region = |(pc0, pc1, start_pc): (i64, i64, i64), line: usize| -> Result<ProtectedRegion, AsmError> {
        Ok(ProtectedRegion { pc0: resolve_index(pc0, line)?, pc1: resolve_index(pc1, line)?, start_pc: resolve_index(start_pc, line)? })
    };
    let defers =
        src.defers.iter().map(|r| resolve_region(*r, src.code.first().map_or(1, |i| i.line))).collect::<Result<Vec<_>, _>>()?;
    let catches =
        src.catches.iter().map(|r| resolve_region(*r, src.code.first().map_or(1, |i| i.line))).collect::<Result<Vec<_>, _>>()?;

    Ok(Funcode {
        name: src.name.clone(),
        code: bytecode,
        num_locals: src.num_locals,
        cells: src.cells.clone(),
        freevars: src.freevars.clone(),
        defers,
        catches,
        max_stack: src.max_stack,
        num_params: src.num_params,
        has_varargs: src.has_varargs,
        position_table: positions.build(),
    })
}

/// Renders a [`Program`] back into the textual form [`assemble`] accepts.
/// Round-trips byte-identical code, tables, and position lookups for any
/// program produced by [`assemble`] or by the real compiler.
#[must_use]
pub fn disassemble(program: &Program) -> String {
    let mut out = String::new();
    out.push_str(&format!("program: {}\n", program.filename));

    if !program.loads.is_empty() {
        out.push_str("\nloads:\n");
        for entry in &program.loads {
            out.push_str(&format!("  {}\n", program.names.get(entry.name)));
        }
    }

    let name_count = program.names.len();
    if name_count > 0 {
        out.push_str("\nnames:\n");
        for i in 0..name_count {
            out.push_str(&format!("  {}\n", program.names.get(NameId(u32::try_from(i).expect("name pool index fits u32")))));
        }
    }

    if !program.constants.is_empty() {
        out.push_str("\nconstants:\n");
        for c in &program.constants {
            match c {
                Constant::Int(v) => out.push_str(&format!("  int {v}\n")),
                Constant::Float(v) => out.push_str(&format!("  float {v}\n")),
                Constant::Str(v) => out.push_str(&format!("  str \"{}\"\n", v.replace('\\', "\\\\").replace('"', "\\\""))),
            }
        }
    }

    for func in &program.functions {
        out.push('\n');
        disassemble_function(func, &mut out);
    }
    out
}

fn disassemble_function(func: &Funcode, out: &mut String) {
    out.push_str(&format!(
        "function: {} {} {}{}\n",
        func.name,
        func.max_stack,
        func.num_params,
        if func.has_varargs { " +varargs" } else { "" }
    ));
    out.push_str(&format!("  locals: {}\n", func.num_locals));
    if !func.cells.is_empty() {
        out.push_str("  cells:");
        for c in &func.cells {
            out.push_str(&format!(" {c}"));
        }
        out.push('\n');
    }
    if !func.freevars.is_empty() {
        out.push_str("  freevars:");
        for f in &func.freevars {
            out.push_str(&format!(" {f}"));
        }
        out.push('\n');
    }

    let boundaries = instruction_boundaries(&func.code);
    let index_of = |addr: u32| -> i64 { boundaries.iter().position(|&b| b == addr).map_or(-1, |i| i as i64) };

    if !func.defers.is_empty() {
        out.push_str("  defers:\n");
        for r in &func.defers {
            out.push_str(&format!("    {} {} {}\n", index_of(r.pc0), index_of(r.pc1), index_of(r.start_pc)));
        }
    }
    if !func.catches.is_empty() {
        out.push_str("  catches:\n");
        for r in &func.catches {
            out.push_str(&format!("    {} {} {}\n", index_of(r.pc0), index_of(r.pc1), index_of(r.start_pc)));
        }
    }

    out.push_str("  code:\n");
    let positions = decode_position_lookup(&func.position_table);
    let pos_at = |addr: u32| -> Option<Pos> { positions.get(&addr).copied() };
    let mut i = 0usize;
    while i < func.code.len() {
        let addr = u32::try_from(i).expect("bytecode offset fits u32");
        let op = Opcode::from_byte(func.code[i]).expect("well-formed bytecode carries only known opcodes");
        let mut line = format!("    {}", opcode_name(op));
        i += 1;
        if op.is_jump() {
            let bytes: [u8; 4] = func.code[i..i + 4].try_into().expect("jump operand is exactly 4 bytes");
            let target_addr = decode_jump_operand(bytes);
            i += 4;
            line.push_str(&format!(" {}", index_of(target_addr)));
        } else if op.takes_operand() {
            let mut pos = i;
            let value = read_uleb128(&func.code, &mut pos);
            i = pos;
            line.push_str(&format!(" {value}"));
        }
        if let Some(pos) = pos_at(addr) {
            line.push_str(&format!(" @{}:{}", pos.line, pos.col));
        }
        out.push_str(&line);
        out.push('\n');
    }
}

/// The byte offset each instruction (by source order) begins at, plus a
/// trailing sentinel equal to the function's total code length — the
/// same addressing space [`build_funcode`] resolves jump/region indices
/// against, used here in reverse to print addresses as indices.
fn instruction_boundaries(code: &[u8]) -> Vec<u32> {
    let mut boundaries = Vec::new();
    let mut i = 0usize;
    while i < code.len() {
        boundaries.push(u32::try_from(i).expect("bytecode offset fits u32"));
        let op = Opcode::from_byte(code[i]).expect("well-formed bytecode carries only known opcodes");
        i += 1;
        if op.is_jump() {
            i += 4;
        } else if op.takes_operand() {
            let mut pos = i;
            read_uleb128(code, &mut pos);
            i = pos;
        }
    }
    boundaries.push(u32::try_from(code.len()).expect("bytecode length fits u32"));
    boundaries
}

fn decode_position_lookup(table: &PositionTable) -> ahash::AHashMap<u32, Pos> {
    table.decode().into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
program: test.wisp

function: toplevel 1 0
  locals: 0
  code:
    nil
    return
"#;

    #[test]
    fn assembles_minimal_program() {
        let program = assemble(MINIMAL).expect("valid source assembles");
        assert_eq!(program.filename, "test.wisp");
        assert_eq!(program.functions.len(), 1);
        let f = program.toplevel();
        assert_eq!(f.name, "toplevel");
        assert_eq!(f.code, vec![Opcode::Nil as u8, Opcode::Return as u8]);
    }

    #[test]
    fn jump_operand_resolves_to_byte_address() {
        let src = r#"
program: test.wisp

function: toplevel 1 0
  locals: 0
  code:
    jmp 2
    nop
    return
"#;
        let program = assemble(src).expect("valid source assembles");
        let code = &program.toplevel().code;
        assert_eq!(code[0], Opcode::Jmp as u8);
        let target = decode_jump_operand(code[1..5].try_into().unwrap());
        assert_eq!(target, 6); // jmp(5 bytes) + nop(1 byte)
    }

    #[test]
    fn disassemble_then_assemble_round_trips_bytecode() {
        let program = assemble(MINIMAL).expect("valid source assembles");
        let text = disassemble(&program);
        let program2 = assemble(&text).expect("disassembled source re-assembles");
        assert_eq!(program.toplevel().code, program2.toplevel().code);
        assert_eq!(program.toplevel().max_stack, program2.toplevel().max_stack);
    }

    #[test]
    fn unknown_opcode_reports_its_line() {
        let src = "program: t\n\nfunction: f 1 0\n  locals: 0\n  code:\n    bogus\n";
        let err = assemble(src).unwrap_err();
        assert_eq!(err.line, 6);
    }

    #[test]
    fn defer_catch_rows_resolve_like_jumps() {
        let src = r#"
program: t

function: f 2 0
  locals: 1
  defers:
    0 2 2
  code:
    nil
    defer_exit
    return
"#;
        let program = assemble(src).expect("valid source assembles");
        let f = program.toplevel();
        assert_eq!(f.defers.len(), 1);
        assert_eq!(f.defers[0].pc0, 0);
        assert_eq!(f.defers[0].start_pc, f.defers[0].pc1);
    }
}
