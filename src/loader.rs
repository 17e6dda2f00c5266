// The assembly loader: the dirty grunt work of turning program text into a
// validated instruction stream. Two passes: the first collects labels and
// raw operand text, the second classifies operands and resolves label
// references to instruction indices. Everything that can go wrong goes wrong
// here, with a line number attached; past this point the instruction stream
// is well-formed by construction.

use crate::error::LoadError;
use crate::fields::{MvrDest, Operand, Register};
use crate::instructions::Instruction;
use std::collections::HashMap;

/// A loaded program: the instruction stream, the resolved label map and, for
/// each instruction, the 1-based source line it came from (the debugger keys
/// breakpoints on those).
#[derive(Debug)]
pub struct Program {
    pub instructions: Vec<Instruction>,
    pub labels: HashMap<String, usize>,
    pub source_lines: Vec<u32>,
}

impl Program {
    pub fn line_of(&self, pc: u16) -> Option<u32> {
        self.source_lines.get(pc as usize).copied()
    }

    /// First instruction emitted for a source line, if any.
    pub fn index_at_line(&self, line: u32) -> Option<usize> {
        self.source_lines.iter().position(|&l| l == line)
    }
}

struct RawLine {
    line: u32,
    mnemonic: String,
    operands: Vec<String>,
}

pub fn load(source: &str) -> Result<Program, LoadError> {
    let (raw, labels) = first_pass(source)?;
    let mut instructions = Vec::with_capacity(raw.len());
    let mut source_lines = Vec::with_capacity(raw.len());
    for entry in &raw {
        instructions.push(assemble(entry, &labels)?);
        source_lines.push(entry.line);
    }
    log::debug!(
        "loaded {} instructions, {} labels",
        instructions.len(),
        labels.len()
    );
    Ok(Program {
        instructions,
        labels,
        source_lines,
    })
}

/// Tokenize lines, peel off label definitions, count instruction indices.
fn first_pass(source: &str) -> Result<(Vec<RawLine>, HashMap<String, usize>), LoadError> {
    let mut raw = Vec::new();
    let mut labels = HashMap::new();
    for (idx, full_line) in source.lines().enumerate() {
        let line = idx as u32 + 1;
        let mut text = strip_comment(full_line).trim();
        // A leading `name:` token binds the label to the next instruction.
        while let Some(rest) = take_label(text) {
            let (name, tail) = rest;
            if labels.insert(name.to_string(), raw.len()).is_some() {
                return Err(LoadError::DuplicateLabel {
                    line,
                    name: name.to_string(),
                });
            }
            text = tail.trim();
        }
        if text.is_empty() {
            continue;
        }
        let (mnemonic, operand_text) = match text.split_once(char::is_whitespace) {
            Some((m, rest)) => (m, rest.trim()),
            None => (text, ""),
        };
        let operands = if operand_text.is_empty() {
            Vec::new()
        } else {
            operand_text.split(',').map(|o| o.trim().to_string()).collect()
        };
        raw.push(RawLine {
            line,
            mnemonic: mnemonic.to_ascii_uppercase(),
            operands,
        });
    }
    Ok((raw, labels))
}

fn strip_comment(line: &str) -> &str {
    let end = line
        .find("//")
        .into_iter()
        .chain(line.find(';'))
        .min()
        .unwrap_or(line.len());
    &line[..end]
}

/// Split off a leading `identifier:` if present.
fn take_label(text: &str) -> Option<(&str, &str)> {
    let first = text.split_whitespace().next()?;
    let name = first.strip_suffix(':')?;
    if is_identifier(name) {
        let tail = &text[text.find(first).unwrap() + first.len()..];
        Some((name, tail))
    } else {
        None
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Second pass: one instruction per raw line, operands classified per slot.
fn assemble(entry: &RawLine, labels: &HashMap<String, usize>) -> Result<Instruction, LoadError> {
    let line = entry.line;
    let expect = |n: usize| -> Result<(), LoadError> {
        if entry.operands.len() == n {
            Ok(())
        } else {
            Err(LoadError::WrongOperandCount {
                line,
                mnemonic: entry.mnemonic.clone(),
                expected: n,
                found: entry.operands.len(),
            })
        }
    };
    let value = |i: usize| value_operand(&entry.operands[i], line, labels);
    let narrow = |i: usize| -> Result<Operand, LoadError> {
        let op = value(i)?;
        if let Operand::Imm(v) = op {
            if v > 0xffff {
                return Err(LoadError::ImmediateTooLarge { line, value: v });
            }
        }
        Ok(op)
    };
    let register = |i: usize| register_operand(&entry.operands[i], line);

    let instruction = match entry.mnemonic.as_str() {
        "LOAD" => {
            expect(2)?;
            // The legacy `LOAD GPU, …` / `LOAD …, GPU` spellings are not part
            // of this ISA; the selector is only reachable through MVR.
            if entry.operands.iter().any(|o| o == "GPU") {
                return Err(LoadError::LoadToGpu { line });
            }
            Instruction::Load {
                src: narrow(0)?,
                dst: narrow(1)?,
            }
        }
        "READ" => {
            expect(2)?;
            Instruction::Read {
                src: narrow(0)?,
                dst: register(1)?,
            }
        }
        "MVR" => {
            expect(2)?;
            let dst = if entry.operands[1] == "GPU" {
                MvrDest::Gpu
            } else {
                MvrDest::Reg(register(1)?)
            };
            let src = value(0)?;
            // Only a selector-bound immediate may be wider than a word.
            if let (Operand::Imm(v), MvrDest::Reg(_)) = (src, dst) {
                if v > 0xffff {
                    return Err(LoadError::ImmediateTooLarge { line, value: v });
                }
            }
            Instruction::Mvr { src, dst }
        }
        "MVM" => {
            expect(2)?;
            Instruction::Mvm {
                src: narrow(0)?,
                dst: narrow(1)?,
            }
        }
        "ADD" => {
            expect(2)?;
            Instruction::Add { a: narrow(0)?, b: narrow(1)? }
        }
        "SUB" => {
            expect(2)?;
            Instruction::Sub { a: narrow(0)?, b: narrow(1)? }
        }
        "MULT" => {
            expect(2)?;
            Instruction::Mult { a: narrow(0)?, b: narrow(1)? }
        }
        "DIV" => {
            expect(2)?;
            Instruction::Div { a: narrow(0)?, b: narrow(1)? }
        }
        "SHL" => {
            expect(2)?;
            Instruction::Shl { a: narrow(0)?, b: narrow(1)? }
        }
        "SHR" => {
            expect(2)?;
            Instruction::Shr { a: narrow(0)?, b: narrow(1)? }
        }
        "SHLR" => {
            expect(2)?;
            Instruction::Shlr { a: narrow(0)?, b: narrow(1)? }
        }
        "AND" => {
            expect(2)?;
            Instruction::And { a: narrow(0)?, b: narrow(1)? }
        }
        "OR" => {
            expect(2)?;
            Instruction::Or { a: narrow(0)?, b: narrow(1)? }
        }
        "XOR" => {
            expect(2)?;
            Instruction::Xor { a: narrow(0)?, b: narrow(1)? }
        }
        "NOT" => {
            expect(1)?;
            Instruction::Not { reg: register(0)? }
        }
        "JMP" => {
            expect(1)?;
            Instruction::Jmp { target: narrow(0)? }
        }
        "JAL" => {
            expect(1)?;
            Instruction::Jal { target: narrow(0)? }
        }
        "JZ" => {
            expect(2)?;
            Instruction::Jz {
                target: narrow(0)?,
                cond: narrow(1)?,
            }
        }
        "JNZ" => {
            expect(2)?;
            Instruction::Jnz {
                target: narrow(0)?,
                cond: narrow(1)?,
            }
        }
        "JBT" => {
            expect(3)?;
            Instruction::Jbt {
                target: narrow(0)?,
                a: narrow(1)?,
                b: narrow(2)?,
            }
        }
        "KEYIN" => {
            expect(1)?;
            Instruction::KeyIn { addr: narrow(0)? }
        }
        "HALT" => {
            expect(0)?;
            Instruction::Halt
        }
        "DRLINE" => {
            expect(4)?;
            Instruction::DrLine {
                x1: narrow(0)?,
                y1: narrow(1)?,
                x2: narrow(2)?,
                y2: narrow(3)?,
            }
        }
        "DRGRD" => {
            expect(4)?;
            Instruction::DrGrid {
                x: narrow(0)?,
                y: narrow(1)?,
                w: narrow(2)?,
                h: narrow(3)?,
            }
        }
        "CLRGRID" => {
            expect(4)?;
            Instruction::ClrGrid {
                x: narrow(0)?,
                y: narrow(1)?,
                w: narrow(2)?,
                h: narrow(3)?,
            }
        }
        "LDSPR" => {
            expect(2)?;
            Instruction::LdSpr {
                id: narrow(0)?,
                data: narrow(1)?,
            }
        }
        "DRSPR" => {
            expect(3)?;
            Instruction::DrSpr {
                id: narrow(0)?,
                x: narrow(1)?,
                y: narrow(2)?,
            }
        }
        "LDTXT" => {
            expect(2)?;
            Instruction::LdTxt {
                id: narrow(0)?,
                code: narrow(1)?,
            }
        }
        "DRTXT" => {
            expect(3)?;
            Instruction::DrTxt {
                id: narrow(0)?,
                x: narrow(1)?,
                y: narrow(2)?,
            }
        }
        "SCRLBFR" => {
            expect(2)?;
            Instruction::ScrlBfr {
                offx: narrow(0)?,
                offy: narrow(1)?,
            }
        }
        _ => {
            return Err(LoadError::UnknownOpcode {
                line,
                mnemonic: entry.mnemonic.clone(),
            })
        }
    };
    Ok(instruction)
}

/// Classify a value-position operand: bare decimal is a register, `i:` or
/// `0x` an immediate, `GPU` the selector, anything identifier-shaped a label
/// reference.
fn value_operand(
    text: &str,
    line: u32,
    labels: &HashMap<String, usize>,
) -> Result<Operand, LoadError> {
    if text == "GPU" {
        return Ok(Operand::Gpu);
    }
    if let Some(imm) = text.strip_prefix("i:") {
        return parse_immediate(imm, line, text);
    }
    if text.starts_with("0x") {
        return parse_immediate(text, line, text);
    }
    if !text.is_empty() && text.chars().all(|c| c.is_ascii_digit()) {
        let index: u32 = text.parse().map_err(|_| LoadError::BadOperand {
            line,
            operand: text.to_string(),
        })?;
        if index > 31 {
            return Err(LoadError::BadRegister { line, index });
        }
        return Ok(Operand::Reg(index as u8));
    }
    if is_identifier(text) {
        return match labels.get(text) {
            Some(&index) => Ok(Operand::Imm(index as u32)),
            None => Err(LoadError::UndefinedLabel {
                line,
                name: text.to_string(),
            }),
        };
    }
    Err(LoadError::BadOperand {
        line,
        operand: text.to_string(),
    })
}

fn parse_immediate(text: &str, line: u32, original: &str) -> Result<Operand, LoadError> {
    let parsed = if let Some(hex) = text.strip_prefix("0x") {
        u32::from_str_radix(hex, 16)
    } else {
        text.parse::<u32>()
    };
    match parsed {
        Ok(v) => Ok(Operand::Imm(v)),
        Err(_) => Err(LoadError::BadOperand {
            line,
            operand: original.to_string(),
        }),
    }
}

/// Register-only slots take a bare decimal and nothing else.
fn register_operand(text: &str, line: u32) -> Result<Register, LoadError> {
    if !text.is_empty() && text.chars().all(|c| c.is_ascii_digit()) {
        let index: u32 = text.parse().map_err(|_| LoadError::BadOperand {
            line,
            operand: text.to_string(),
        })?;
        if index > 31 {
            return Err(LoadError::BadRegister { line, index });
        }
        Ok(Register(index as u8))
    } else {
        Err(LoadError::RegisterOnly {
            line,
            operand: text.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_resolve_to_instruction_indices() {
        let program = load(
            "// demo\n\
             start: MVR i:1, 5\n\
             loop:\n\
             ADD 5, i:1 ; bump\n\
             JMP loop\n",
        )
        .unwrap();
        assert_eq!(program.instructions.len(), 3);
        assert_eq!(program.labels["start"], 0);
        assert_eq!(program.labels["loop"], 1);
        assert_eq!(
            program.instructions[2],
            Instruction::Jmp {
                target: Operand::Imm(1)
            }
        );
        assert_eq!(program.source_lines, vec![2, 4, 5]);
    }

    #[test]
    fn register_only_slots_reject_immediates() {
        let err = load("READ i:0x1000, i:5\n").unwrap_err();
        assert!(matches!(err, LoadError::RegisterOnly { line: 1, .. }));
        let err = load("NOT i:3\n").unwrap_err();
        assert!(matches!(err, LoadError::RegisterOnly { .. }));
        let err = load("MVR i:1, i:2\n").unwrap_err();
        assert!(matches!(err, LoadError::RegisterOnly { .. }));
    }

    #[test]
    fn undefined_labels_and_opcodes_carry_line_numbers() {
        let err = load("MVR i:1, 5\nJMP nowhere\n").unwrap_err();
        assert_eq!(err.line(), 2);
        assert!(matches!(err, LoadError::UndefinedLabel { .. }));
        let err = load("\nFROB 1, 2\n").unwrap_err();
        assert!(matches!(err, LoadError::UnknownOpcode { line: 2, .. }));
    }

    #[test]
    fn register_indices_above_31_are_rejected() {
        let err = load("ADD 32, i:1\n").unwrap_err();
        assert!(matches!(err, LoadError::BadRegister { index: 32, .. }));
    }

    #[test]
    fn wide_immediates_only_fit_the_selector() {
        assert!(load("MVR i:0x00010001, GPU\n").is_ok());
        let err = load("MVR i:0x00010001, 5\n").unwrap_err();
        assert!(matches!(err, LoadError::ImmediateTooLarge { .. }));
        let err = load("ADD i:0x10000, i:1\n").unwrap_err();
        assert!(matches!(err, LoadError::ImmediateTooLarge { .. }));
    }

    #[test]
    fn load_lines_touching_the_gpu_are_rejected_with_guidance() {
        let err = load("LOAD GPU, i:1\n").unwrap_err();
        assert!(matches!(err, LoadError::LoadToGpu { line: 1 }));
        let err = load("LOAD i:1, GPU\n").unwrap_err();
        assert!(matches!(err, LoadError::LoadToGpu { .. }));
    }

    #[test]
    fn hex_and_decimal_immediates_parse() {
        let program = load("MVR 0x10, 5\nMVR i:16, 6\nMVR i:0x10, 7\nHALT\n").unwrap();
        for i in 0..3 {
            match program.instructions[i] {
                Instruction::Mvr {
                    src: Operand::Imm(16),
                    ..
                } => {}
                ref other => panic!("unexpected instruction {:?}", other),
            }
        }
    }

    #[test]
    fn duplicate_labels_are_rejected() {
        let err = load("a: HALT\na: HALT\n").unwrap_err();
        assert!(matches!(err, LoadError::DuplicateLabel { line: 2, .. }));
    }

    #[test]
    fn operand_counts_are_enforced() {
        let err = load("ADD 1\n").unwrap_err();
        assert!(matches!(
            err,
            LoadError::WrongOperandCount {
                expected: 2,
                found: 1,
                ..
            }
        ));
    }
}
