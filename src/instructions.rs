// The instruction set. One variant per opcode with named operand fields;
// execution happens right here on the CPU state, and `as_asm` gives back the
// canonical text form for fault reports and the debugger.
//
// Register-only slots carry `Register`/`MvrDest` instead of `Operand`, so a
// malformed combination cannot exist past the loader.

use crate::error::{Fault, FaultKind};
use crate::fields::{MvrDest, Operand, Register};
use crate::processor::{KeySource, Outcome, CPU};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Instruction {
    // Memory
    Load { src: Operand, dst: Operand },
    Read { src: Operand, dst: Register },
    Mvr { src: Operand, dst: MvrDest },
    Mvm { src: Operand, dst: Operand },
    // ALU
    Add { a: Operand, b: Operand },
    Sub { a: Operand, b: Operand },
    Mult { a: Operand, b: Operand },
    Div { a: Operand, b: Operand },
    // Shift / rotate
    Shl { a: Operand, b: Operand },
    Shr { a: Operand, b: Operand },
    Shlr { a: Operand, b: Operand },
    // Bitwise
    And { a: Operand, b: Operand },
    Or { a: Operand, b: Operand },
    Xor { a: Operand, b: Operand },
    Not { reg: Register },
    // Control
    Jmp { target: Operand },
    Jal { target: Operand },
    Jz { target: Operand, cond: Operand },
    Jnz { target: Operand, cond: Operand },
    Jbt { target: Operand, a: Operand, b: Operand },
    // System
    KeyIn { addr: Operand },
    Halt,
    // GPU
    DrLine { x1: Operand, y1: Operand, x2: Operand, y2: Operand },
    DrGrid { x: Operand, y: Operand, w: Operand, h: Operand },
    ClrGrid { x: Operand, y: Operand, w: Operand, h: Operand },
    LdSpr { id: Operand, data: Operand },
    DrSpr { id: Operand, x: Operand, y: Operand },
    LdTxt { id: Operand, code: Operand },
    DrTxt { id: Operand, x: Operand, y: Operand },
    ScrlBfr { offx: Operand, offy: Operand },
}

use Instruction::*;

impl Instruction {
    /// Execute one instruction. Everything except a taken jump, a fault or a
    /// HALT falls through to `pc + 1`.
    pub fn execute(&self, cpu: &mut CPU, keys: &mut dyn KeySource) -> Outcome {
        match *self {
            Load { src, dst } => {
                let value = cpu.value(src) as u16;
                let addr = cpu.value(dst) as u16;
                cpu.ram.write(addr, value);
            }
            Read { src, dst } => {
                let addr = cpu.value(src) as u16;
                let word = cpu.ram.read(addr);
                cpu.reg[dst.index()] = word;
            }
            Mvr { src, dst } => {
                let value = cpu.value(src);
                match dst {
                    MvrDest::Reg(r) => cpu.reg[r.index()] = value as u16,
                    MvrDest::Gpu => cpu.gpu.write_selector(value),
                }
            }
            Mvm { src, dst } => {
                let src_addr = cpu.value(src) as u16;
                let dst_addr = cpu.value(dst) as u16;
                let word = cpu.ram.read(src_addr);
                cpu.ram.write(dst_addr, word);
            }
            Add { a, b } => {
                let r = (cpu.value(a) as u16).wrapping_add(cpu.value(b) as u16);
                cpu.reg[0] = r;
            }
            Sub { a, b } => {
                let r = (cpu.value(a) as u16).wrapping_sub(cpu.value(b) as u16);
                cpu.reg[0] = r;
            }
            Mult { a, b } => {
                // Full product of the resolved values. For 16-bit sources
                // this is the usual low/high split; a GPU source lands its
                // display field in R1.
                let product = cpu.value(a) as u64 * cpu.value(b) as u64;
                cpu.reg[0] = product as u16;
                cpu.reg[1] = (product >> 16) as u16;
            }
            Div { a, b } => {
                let divisor = cpu.value(b) as u16 as i16;
                if divisor == 0 {
                    return self.fault(cpu, FaultKind::DivByZero);
                }
                let dividend = cpu.value(a) as u16 as i16;
                cpu.reg[0] = dividend.wrapping_div(divisor) as u16;
                cpu.reg[1] = dividend.wrapping_rem(divisor) as u16;
            }
            Shl { a, b } => {
                let amount = (cpu.value(b) % 16) as u32;
                cpu.reg[0] = (cpu.value(a) as u16) << amount;
            }
            Shr { a, b } => {
                let amount = (cpu.value(b) % 16) as u32;
                cpu.reg[0] = (cpu.value(a) as u16) >> amount;
            }
            Shlr { a, b } => {
                let amount = (cpu.value(b) % 16) as u32;
                cpu.reg[0] = (cpu.value(a) as u16).rotate_left(amount);
            }
            And { a, b } => cpu.reg[0] = cpu.value(a) as u16 & cpu.value(b) as u16,
            Or { a, b } => cpu.reg[0] = cpu.value(a) as u16 | cpu.value(b) as u16,
            Xor { a, b } => cpu.reg[0] = cpu.value(a) as u16 ^ cpu.value(b) as u16,
            Not { reg } => {
                cpu.reg[reg.index()] = !cpu.reg[reg.index()];
            }
            Jmp { target } => {
                cpu.pc = cpu.value(target) as u16;
                return Outcome::Running;
            }
            Jal { target } => {
                cpu.reg[2] = cpu.pc.wrapping_add(1);
                cpu.pc = cpu.value(target) as u16;
                return Outcome::Running;
            }
            Jz { target, cond } => {
                if cpu.value(cond) == 0 {
                    cpu.pc = cpu.value(target) as u16;
                    return Outcome::Running;
                }
            }
            Jnz { target, cond } => {
                if cpu.value(cond) != 0 {
                    cpu.pc = cpu.value(target) as u16;
                    return Outcome::Running;
                }
            }
            Jbt { target, a, b } => {
                if cpu.value(a) > cpu.value(b) {
                    cpu.pc = cpu.value(target) as u16;
                    return Outcome::Running;
                }
            }
            KeyIn { addr } => match keys.next_key() {
                Some(code) => {
                    let addr = cpu.value(addr) as u16;
                    cpu.ram.write(addr, code as u16);
                }
                // Cancelled or end of input: orderly halt, RAM untouched.
                None => return Outcome::Halted,
            },
            Halt => return Outcome::Halted,
            DrLine { x1, y1, x2, y2 } => {
                let (x1, y1) = (cpu.value(x1), cpu.value(y1));
                let (x2, y2) = (cpu.value(x2), cpu.value(y2));
                if let Err(kind) = cpu.gpu.draw_line(x1, y1, x2, y2) {
                    return self.fault(cpu, kind);
                }
            }
            DrGrid { x, y, w, h } => {
                let (x, y) = (cpu.value(x), cpu.value(y));
                let (w, h) = (cpu.value(w), cpu.value(h));
                if let Err(kind) = cpu.gpu.draw_grid(x, y, w, h) {
                    return self.fault(cpu, kind);
                }
            }
            ClrGrid { x, y, w, h } => {
                let (x, y) = (cpu.value(x), cpu.value(y));
                let (w, h) = (cpu.value(w), cpu.value(h));
                if let Err(kind) = cpu.gpu.clear_grid(x, y, w, h) {
                    return self.fault(cpu, kind);
                }
            }
            LdSpr { id, data } => {
                let (id, data) = (cpu.value(id), cpu.value(data));
                if let Err(kind) = cpu.gpu.load_sprite(id, data) {
                    return self.fault(cpu, kind);
                }
            }
            DrSpr { id, x, y } => {
                let (id, x, y) = (cpu.value(id), cpu.value(x), cpu.value(y));
                if let Err(kind) = cpu.gpu.draw_sprite(id, x, y) {
                    return self.fault(cpu, kind);
                }
            }
            LdTxt { id, code } => {
                let (id, code) = (cpu.value(id), cpu.value(code));
                if let Err(kind) = cpu.gpu.load_text(id, code) {
                    return self.fault(cpu, kind);
                }
            }
            DrTxt { id, x, y } => {
                let (id, x, y) = (cpu.value(id), cpu.value(x), cpu.value(y));
                if let Err(kind) = cpu.gpu.draw_text(id, x, y) {
                    return self.fault(cpu, kind);
                }
            }
            ScrlBfr { offx, offy } => {
                let (offx, offy) = (cpu.value(offx), cpu.value(offy));
                cpu.gpu.scroll(offx, offy);
            }
        }
        cpu.pc = cpu.pc.wrapping_add(1);
        Outcome::Running
    }

    fn fault(&self, cpu: &CPU, kind: FaultKind) -> Outcome {
        Outcome::Fault(Fault {
            pc: cpu.pc,
            instruction: self.as_asm(),
            kind,
        })
    }

    /// Canonical text form, re-parsable by the loader (modulo labels, which
    /// have been lowered to instruction indices by now).
    pub fn as_asm(&self) -> String {
        match self {
            Load { src, dst } => format!("LOAD {}, {}", src, dst),
            Read { src, dst } => format!("READ {}, {}", src, dst),
            Mvr { src, dst } => format!("MVR {}, {}", src, dst),
            Mvm { src, dst } => format!("MVM {}, {}", src, dst),
            Add { a, b } => format!("ADD {}, {}", a, b),
            Sub { a, b } => format!("SUB {}, {}", a, b),
            Mult { a, b } => format!("MULT {}, {}", a, b),
            Div { a, b } => format!("DIV {}, {}", a, b),
            Shl { a, b } => format!("SHL {}, {}", a, b),
            Shr { a, b } => format!("SHR {}, {}", a, b),
            Shlr { a, b } => format!("SHLR {}, {}", a, b),
            And { a, b } => format!("AND {}, {}", a, b),
            Or { a, b } => format!("OR {}, {}", a, b),
            Xor { a, b } => format!("XOR {}, {}", a, b),
            Not { reg } => format!("NOT {}", reg),
            Jmp { target } => format!("JMP {}", target),
            Jal { target } => format!("JAL {}", target),
            Jz { target, cond } => format!("JZ {}, {}", target, cond),
            Jnz { target, cond } => format!("JNZ {}, {}", target, cond),
            Jbt { target, a, b } => format!("JBT {}, {}, {}", target, a, b),
            KeyIn { addr } => format!("KEYIN {}", addr),
            Halt => String::from("HALT"),
            DrLine { x1, y1, x2, y2 } => format!("DRLINE {}, {}, {}, {}", x1, y1, x2, y2),
            DrGrid { x, y, w, h } => format!("DRGRD {}, {}, {}, {}", x, y, w, h),
            ClrGrid { x, y, w, h } => format!("CLRGRID {}, {}, {}, {}", x, y, w, h),
            LdSpr { id, data } => format!("LDSPR {}, {}", id, data),
            DrSpr { id, x, y } => format!("DRSPR {}, {}, {}", id, x, y),
            LdTxt { id, code } => format!("LDTXT {}, {}", id, code),
            DrTxt { id, x, y } => format!("DRTXT {}, {}, {}", id, x, y),
            ScrlBfr { offx, offy } => format!("SCRLBFR {}, {}", offx, offy),
        }
    }
}
