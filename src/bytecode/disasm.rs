use crate::bytecode::op::FIRE_HAS_TARGET;
use crate::bytecode::{Chunk, OpCode};
use crate::lang::value::Value;

/// Print disassembly of a chunk to stdout
pub fn print_chunk(chunk: &Chunk) {
    println!("════════════════════════════════════════");
    println!(" {}", chunk.name);
    println!(
        " {} bytes, {} constants",
        chunk.len(),
        chunk.constants.len()
    );
    println!("════════════════════════════════════════");
    print!("{}", disassemble(chunk));
    println!();
}

/// Return the full disassembly listing of a chunk.
///
/// One line per instruction: `<offset> <line> <mnemonic> <operands>`.
/// Unknown bytes print a placeholder and advance by exactly one byte, so the
/// walk terminates on any input.
pub fn disassemble(chunk: &Chunk) -> String {
    let mut output = String::new();
    let mut offset = 0;

    while offset < chunk.code.len() {
        offset = disassemble_instruction(chunk, offset, &mut output);
        output.push('\n');
    }

    output
}

/// Format one instruction into `out`, returning the offset of the next one.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let line = chunk.line_at(offset);
    if offset > 0 && chunk.line_at(offset - 1) == line {
        out.push_str(&format!("{:04}    | ", offset));
    } else {
        out.push_str(&format!("{:04} {:>4} ", offset, line));
    }

    let (text, next) = format_instruction(chunk, offset);
    out.push_str(&text);
    next
}

fn format_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let byte = chunk.code[offset];
    let op = OpCode::from_byte(byte);

    if op == OpCode::Unknown {
        return (format!("{:<14} 0x{:02X}", op.mnemonic(), byte), offset + 1);
    }

    let width = op.operand_width();
    if offset + width >= chunk.code.len() {
        return (
            format!("{:<14} <truncated>", op.mnemonic()),
            chunk.code.len(),
        );
    }

    let operand = |i: usize| chunk.code[offset + 1 + i];

    let text = match op {
        OpCode::Constant
        | OpCode::GetVariable
        | OpCode::SetVariable
        | OpCode::GetComponent
        | OpCode::ChangeState => {
            let index = operand(0);
            format!(
                "{:<14} {:>4} {}",
                op.mnemonic(),
                index,
                format_constant(chunk.constant(index))
            )
        }
        OpCode::Jump | OpCode::JumpIfFalse => {
            let jump = u16::from_be_bytes([operand(0), operand(1)]) as usize;
            let target = offset + 3 + jump;
            format!("{:<14} {:>+4} (→ {:04})", op.mnemonic(), jump, target)
        }
        OpCode::FireEvent => {
            let (name, flags, argc) = (operand(0), operand(1), operand(2));
            let target = if flags & FIRE_HAS_TARGET != 0 {
                " targeted"
            } else {
                ""
            };
            format!(
                "{:<14} {:>4} {} args={}{}",
                op.mnemonic(),
                name,
                format_constant(chunk.constant(name)),
                argc,
                target
            )
        }
        _ => op.mnemonic().to_string(),
    };

    (text, offset + 1 + width)
}

fn format_constant(value: Option<&Value>) -> String {
    match value {
        Some(v) => format!("'{}'", v),
        None => "<bad constant>".to_string(),
    }
}
