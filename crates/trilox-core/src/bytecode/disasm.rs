//! Debug disassembly
//!
//! Not part of the compiler/VM contract (spec §1 treats disassembly as an
//! external collaborator) — useful only for `trilox run --disassemble` and
//! for eyeballing compiler output in tests.

use super::{Chunk, Opcode};
use std::fmt::Write as _;

pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {name} ==");
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(chunk, offset, &mut out);
    }
    out
}

fn disassemble_instruction(chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let _ = write!(out, "{offset:04} ");
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.lines[offset]);
    }

    let Some(op) = Opcode::from_u8(chunk.code[offset]) else {
        let _ = writeln!(out, "unknown opcode {}", chunk.code[offset]);
        return offset + 1;
    };

    use Opcode::*;
    match op {
        Constant | DefineGlobal | GetGlobal | SetGlobal | TableSet | TableGet => {
            constant_instr(chunk, op, offset, out)
        }
        Constant16 | DefineGlobal16 | GetGlobal16 | SetGlobal16 | TableSet16 | TableGet16 => {
            constant16_instr(chunk, op, offset, out)
        }
        GetLocal | SetLocal | GetUpvalue | SetUpvalue | Call | Collect | JumpTableJump => {
            byte_instr(op, chunk, offset, out)
        }
        Jump | JumpIfFalse | JumpIfUnknown | JumpIfTrue | JumpIfNotTrue => {
            jump_instr(op, 1, chunk, offset, out)
        }
        Loop => jump_instr(op, -1, chunk, offset, out),
        Closure => closure_instr(chunk, op, false, offset, out),
        Closure16 => closure_instr(chunk, op, true, offset, out),
        _ => simple_instr(op, offset, out),
    }
}

fn simple_instr(op: Opcode, offset: usize, out: &mut String) -> usize {
    let _ = writeln!(out, "{op:?}");
    offset + 1
}

fn byte_instr(op: Opcode, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let slot = chunk.code[offset + 1];
    let _ = writeln!(out, "{op:?} {slot}");
    offset + 2
}

fn constant_instr(chunk: &Chunk, op: Opcode, offset: usize, out: &mut String) -> usize {
    let idx = chunk.code[offset + 1] as usize;
    let value = chunk
        .constants
        .get(idx)
        .map(|v| v.to_string())
        .unwrap_or_default();
    let _ = writeln!(out, "{op:?} {idx} '{value}'");
    offset + 2
}

fn constant16_instr(chunk: &Chunk, op: Opcode, offset: usize, out: &mut String) -> usize {
    let idx = chunk.read_u16(offset + 1) as usize;
    let value = chunk
        .constants
        .get(idx)
        .map(|v| v.to_string())
        .unwrap_or_default();
    let _ = writeln!(out, "{op:?} {idx} '{value}'");
    offset + 3
}

fn closure_instr(chunk: &Chunk, op: Opcode, wide: bool, offset: usize, out: &mut String) -> usize {
    let idx = if wide {
        chunk.read_u16(offset + 1) as usize
    } else {
        chunk.code[offset + 1] as usize
    };
    let value = chunk
        .constants
        .get(idx)
        .map(|v| v.to_string())
        .unwrap_or_default();
    let _ = writeln!(out, "{op:?} {idx} '{value}'");

    let mut cursor = offset + if wide { 3 } else { 2 };
    let upvalue_count = chunk
        .constants
        .get(idx)
        .and_then(|v| v.as_object())
        .and_then(|obj| obj.as_function())
        .map(|f| f.upvalue_count)
        .unwrap_or(0);
    for _ in 0..upvalue_count {
        let is_local = chunk.code[cursor] != 0;
        let index = chunk.code[cursor + 1];
        let _ = writeln!(
            out,
            "{cursor:04}      | {} {index}",
            if is_local { "local" } else { "upvalue" }
        );
        cursor += 2;
    }
    cursor
}

fn jump_instr(op: Opcode, sign: i32, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let jump = chunk.read_u16(offset + 1) as i32;
    let target = offset as i32 + 3 + sign * jump;
    let _ = writeln!(out, "{op:?} {offset} -> {target}");
    offset + 3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disassembles_simple_chunk() {
        let mut chunk = Chunk::new();
        chunk.write_op(Opcode::Nil, 1);
        chunk.write_op(Opcode::Return, 1);
        let text = disassemble_chunk(&chunk, "test");
        assert!(text.contains("Nil"));
        assert!(text.contains("Return"));
    }

    #[test]
    fn disassembles_closure_with_upvalues() {
        let mut heap = crate::gc::Heap::new(&crate::config::VmConfig::default());
        let handle = crate::compiler::compile(
            "function make() var n = 0; function inc() n = n + 1; disp(n) end inc() end make()",
            &mut heap,
        )
        .unwrap();
        let function = handle.as_function().unwrap();
        // `make`'s own chunk is where `inc`'s Closure instruction (with its
        // captured-upvalue operand bytes) actually lives.
        let make_fn = function
            .chunk
            .constants
            .iter()
            .find_map(|v| v.as_object().and_then(|o| o.as_function()))
            .expect("make's function constant");
        let text = disassemble_chunk(&make_fn.chunk, "make");
        assert!(text.contains("Closure"));
        assert!(text.contains("local") || text.contains("upvalue"));
    }

    #[test]
    fn disassembles_table_constant_access() {
        let mut heap = crate::gc::Heap::new(&crate::config::VmConfig::default());
        let handle = crate::compiler::compile("var t = :[x: 1]; disp(t.x)", &mut heap).unwrap();
        let function = handle.as_function().unwrap();
        let text = disassemble_chunk(&function.chunk, "script");
        assert!(text.contains("TableGet"));
    }
}
