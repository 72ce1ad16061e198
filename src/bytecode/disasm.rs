use std::collections::{BTreeMap, HashSet};
use std::fmt::Write;

use crate::bytecode::{ir::Bytecode, op::Instruction, scope::RESULT_SLOT};
use crate::lang::value::Value;

/// Print disassembly of a bytecode program to stdout.
pub fn print_bc(code: &Bytecode, labels: &BTreeMap<u32, String>) {
    print!("{}", disassemble_labeled(code, labels));
}

pub fn disassemble(code: &Bytecode) -> String {
    disassemble_labeled(code, &BTreeMap::new())
}

/// One line per instruction, `offset ► MNEMONIC operands`, with jump
/// targets marked and `labels` (usually procedure names by address)
/// printed as section headers.
pub fn disassemble_labeled(code: &Bytecode, labels: &BTreeMap<u32, String>) -> String {
    let mut out = String::new();
    let entry = code.entry_point().ok();

    let _ = writeln!(out, "════════════════════════════════════════");
    let _ = writeln!(out, " bytecode");
    match entry {
        Some(entry) => {
            let _ = writeln!(out, " {} bytes, entry at {:04}", code.len(), entry);
        }
        None => {
            let _ = writeln!(out, " {} bytes, no entry jump", code.len());
        }
    }
    let _ = writeln!(out, "════════════════════════════════════════");

    let targets = collect_jump_targets(code);

    for item in code.instructions() {
        let (offset, instruction) = match item {
            Ok(decoded) => decoded,
            Err(e) => {
                let _ = writeln!(out, "{:04}   <{}>", e.offset(), e);
                break;
            }
        };

        if let Some(name) = labels.get(&(offset as u32)) {
            let _ = writeln!(out, "\n {}:", name);
        } else if Some(offset as u32) == entry {
            let _ = writeln!(out, "\n top level:");
        }

        if targets.contains(&offset) {
            let _ = writeln!(out, "      ┌──────────────────────────────────");
            let _ = write!(out, "{:04} ► ", offset);
        } else {
            let _ = write!(out, "{:04}   ", offset);
        }
        let _ = writeln!(out, "{}", format_instruction(&instruction, offset));
    }

    out
}

fn collect_jump_targets(code: &Bytecode) -> HashSet<usize> {
    code.instructions()
        .filter_map(Result::ok)
        .filter(|(_, instruction)| !matches!(instruction, Instruction::Call(_)))
        .filter_map(|(_, instruction)| instruction.jump_target())
        .map(|target| target as usize)
        .collect()
}

fn format_instruction(instruction: &Instruction, offset: usize) -> String {
    let mnemonic = instruction.opcode().mnemonic();
    let operand = match instruction {
        Instruction::Jump(target) | Instruction::JumpIf(target) | Instruction::Call(target) => {
            let direction = if (*target as usize) <= offset {
                "↑"
            } else {
                "↓"
            };
            format!("{} {:04}", direction, target)
        }
        Instruction::Push(value) => format_value(value),
        Instruction::Load(slot) | Instruction::Store(slot) | Instruction::Free(slot) => {
            if *slot == RESULT_SLOT {
                format!("{}  ; the result", slot)
            } else {
                slot.to_string()
            }
        }
        Instruction::Convert(ty) | Instruction::GetItem(ty) => ty.to_string(),
        Instruction::CallExtern(name) => name.clone(),
        Instruction::MakeList(count) => count.to_string(),
        _ => return mnemonic.to_string(),
    };
    format!("{:<12}{}", mnemonic, operand)
}

fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => format!("{:?}", s),
        Value::List(items) => {
            let inner: Vec<String> = items.iter().map(format_value).collect();
            format!("[{}]", inner.join(", "))
        }
        other => other.to_string(),
    }
}
