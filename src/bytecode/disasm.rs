//! Textual listing of a compiled executable.

use std::fmt::Write;

use crate::bytecode::exe::Executable;
use crate::bytecode::op::{Instr, Opcode};

/// Print the disassembly of an executable to stdout.
pub fn print_listing(exe: &Executable) {
    let mut out = String::new();
    if write_listing(exe, &mut out).is_ok() {
        print!("{}", out);
    }
}

/// Render an executable as one instruction per line, with jump targets
/// marked so control flow can be followed by eye.
pub fn write_listing(exe: &Executable, out: &mut impl Write) -> std::fmt::Result {
    writeln!(out, "════════════════════════════════════════")?;
    writeln!(out, " {}", exe.source().name())?;
    writeln!(out, " {} instructions", exe.len())?;
    writeln!(out, "════════════════════════════════════════")?;

    let targets = collect_jump_targets(exe);

    for (ip, instr) in exe.iter().enumerate() {
        write!(out, "{:04} ", ip)?;
        if targets.contains(&ip) {
            write!(out, "► ")?;
        } else {
            write!(out, "  ")?;
        }
        write_instr(instr, out)?;
        writeln!(out)?;
    }

    Ok(())
}

fn write_instr(instr: &Instr, out: &mut impl Write) -> std::fmt::Result {
    write!(out, "{:<16}", instr.opcode.name())?;
    for (i, operand) in instr.operands.iter().enumerate() {
        if i > 0 {
            write!(out, ", ")?;
        }
        write!(out, "{}", operand)?;
    }
    Ok(())
}

fn collect_jump_targets(exe: &Executable) -> Vec<usize> {
    let mut targets = Vec::new();

    for instr in exe.iter() {
        let is_jump = matches!(
            instr.opcode,
            Opcode::Jump | Opcode::JumpIfNotAndPop | Opcode::JumpIfAndPop
        );
        if !is_jump {
            continue;
        }

        if let Some(target) = instr.operands.first().and_then(|op| op.as_int()) {
            let target = target as usize;
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
    }

    targets
}
