use mcl::error::FaultKind;
use mcl::host::QueuedKeys;
use mcl::processor::{Outcome, CPU};
use mcl::{compile_source, load};

/// Run an assembly listing to completion; panic on faults.
fn run_asm(source: &str) -> CPU {
    let (cpu, outcome) = run_asm_outcome(source, Vec::new());
    match outcome {
        Outcome::Halted => cpu,
        other => panic!("program did not halt cleanly: {:?}", other),
    }
}

fn run_asm_outcome(source: &str, keys: Vec<u8>) -> (CPU, Outcome) {
    let program = load(source).expect("assembly loads");
    let mut cpu = CPU::new(program);
    let mut keys = QueuedKeys::from(keys);
    for _ in 0..1_000_000 {
        match cpu.step(&mut keys) {
            Outcome::Running => {}
            outcome => return (cpu, outcome),
        }
    }
    panic!("program ran away");
}

/// Compile MCL source, run it, return the machine at HALT.
fn run_mcl(source: &str) -> CPU {
    run_mcl_with_keys(source, Vec::new())
}

fn run_mcl_with_keys(source: &str, keys: Vec<u8>) -> CPU {
    let assembly = compile_source(source).expect("source compiles");
    let (cpu, outcome) = run_asm_outcome(&assembly, keys);
    match outcome {
        Outcome::Halted => cpu,
        other => panic!("program did not halt cleanly: {:?}\n{}", other, assembly),
    }
}

fn returns(source: &str) -> u16 {
    run_mcl(source).reg[0]
}

// ── End-to-end scenarios ──────────────────────────────────────────────────

#[test]
fn scenario_arithmetic_main() {
    assert_eq!(returns("function main(){ return 10 + 5*2 - 8/2; }"), 16);
}

#[test]
fn scenario_recursive_factorial() {
    assert_eq!(
        returns("function f(n){ if(n<=1) return 1; return n*f(n-1);} function main(){ return f(5); }"),
        120
    );
}

#[test]
fn scenario_keyin_demo() {
    let (cpu, outcome) = run_asm_outcome(
        "KEYIN i:0x1000\n\
         KEYIN i:0x1001\n\
         READ i:0x1000, 5\n\
         READ i:0x1001, 6\n\
         ADD 5, 6\n\
         HALT\n",
        vec![7, 4], // 'H', 'E'
    );
    assert_eq!(outcome, Outcome::Halted);
    assert_eq!(cpu.reg[0], 11);
    assert_eq!(cpu.reg[5], 7);
    assert_eq!(cpu.reg[6], 4);
    assert_eq!(cpu.ram.read(0x1000), 7);
    assert_eq!(cpu.ram.read(0x1001), 4);
}

#[test]
fn scenario_gpu_diagonal() {
    let cpu = run_asm(
        "CLRGRID i:0, i:0, i:32, i:32\n\
         DRLINE i:0, i:0, i:31, i:31\n\
         HALT\n",
    );
    for y in 0..32u16 {
        assert_eq!(
            cpu.gpu.edit_buffer()[y as usize],
            1 << (31 - y),
            "row {}",
            y
        );
    }
}

#[test]
fn scenario_selector_round_trip() {
    let cpu = run_asm("MVR i:0x00010001, GPU\nHALT\n");
    assert_eq!(cpu.gpu.selector(), 0x0001_0001);
}

#[test]
fn scenario_div_by_zero_fault() {
    let (_, outcome) = run_asm_outcome("MVR i:5, 4\nMVR i:0, 5\nDIV 4, 5\n", Vec::new());
    match outcome {
        Outcome::Fault(fault) => {
            assert_eq!(fault.kind, FaultKind::DivByZero);
            assert_eq!(fault.pc, 2);
            assert!(fault.instruction.starts_with("DIV"));
        }
        other => panic!("expected a fault, got {:?}", other),
    }
}

// ── Compiler round-trips: every operator, folded and through registers ───

fn apply(op: &str, a: i32, b: i32) -> (u16, u16) {
    let folded = returns(&format!("function main(){{ return {} {} {}; }}", a, op, b));
    let through_registers = returns(&format!(
        "function apply(a, b){{ return a {} b; }} function main(){{ return apply({}, {}); }}",
        op, a, b
    ));
    (folded, through_registers)
}

#[test]
fn operators_match_their_mathematical_meaning() {
    let cases: &[(&str, i32, i32, u16)] = &[
        ("+", 40, 2, 42),
        ("+", 0xffff, 1, 0),
        ("-", 3, 5, 0xfffe),
        ("*", 300, 300, (90000u32 % 65536) as u16),
        ("/", 47, 5, 9),
        ("%", 47, 5, 2),
        ("&", 0b1100, 0b1010, 0b1000),
        ("|", 0b1100, 0b1010, 0b1110),
        ("^", 0b1100, 0b1010, 0b0110),
        ("<<", 1, 5, 32),
        (">>", 0x8000, 15, 1),
        ("<", 3, 5, 1),
        ("<", 5, 3, 0),
        ("<=", 5, 5, 1),
        (">", 5, 3, 1),
        (">=", 3, 5, 0),
        ("==", 7, 7, 1),
        ("==", 7, 8, 0),
        ("!=", 7, 8, 1),
        ("&&", 1, 0, 0),
        ("&&", 2, 3, 1),
        ("||", 0, 0, 0),
        ("||", 0, 9, 1),
    ];
    for &(op, a, b, expected) in cases {
        let (folded, through_registers) = apply(op, a, b);
        assert_eq!(folded, expected, "folded {} {} {}", a, op, b);
        assert_eq!(through_registers, expected, "register {} {} {}", a, op, b);
    }
}

#[test]
fn signed_comparison_uses_the_top_bit() {
    // -1 < 1 signed, even though 0xffff > 1 unsigned.
    assert_eq!(
        returns("function apply(a, b){ return a < b; } function main(){ return apply(0xffff, 1); }"),
        1
    );
}

#[test]
fn unary_operators() {
    assert_eq!(returns("function main(){ return -(5) + 10; }"), 5);
    assert_eq!(
        returns("function f(x){ return ~x; } function main(){ return f(0); }"),
        0xffff
    );
    assert_eq!(
        returns("function f(x){ return !x; } function main(){ return f(0) + !3; }"),
        1
    );
}

#[test]
fn short_circuit_skips_the_right_hand_side() {
    // The right-hand call would fault on DIV by zero if it ran.
    let source = "function boom(){ return 1 / 0; }\n\
                  function main(){ if (0 && boom()) return 1; return 7; }";
    assert_eq!(returns(source), 7);
}

#[test]
fn compilation_is_deterministic() {
    let source = "function f(n){ if(n<=1) return 1; return n*f(n-1);}\n\
                  function main(){ int a[4]; a[0] = f(3); return a[0]; }";
    let first = compile_source(source).unwrap();
    let second = compile_source(source).unwrap();
    assert_eq!(first, second);
}

// ── Language features through the whole pipeline ─────────────────────────

#[test]
fn while_and_for_loops() {
    assert_eq!(
        returns(
            "function main(){\n\
                 int total = 0;\n\
                 int i = 0;\n\
                 while (i < 5) { total = total + i; i = i + 1; }\n\
                 for (int j = 0; j < 5; j = j + 1) total = total + j;\n\
                 return total;\n\
             }"
        ),
        20
    );
}

#[test]
fn break_and_continue() {
    assert_eq!(
        returns(
            "function main(){\n\
                 int total = 0;\n\
                 for (int i = 0; i < 10; i = i + 1) {\n\
                     if (i == 3) continue;\n\
                     if (i == 6) break;\n\
                     total = total + i;\n\
                 }\n\
                 return total;\n\
             }"
        ),
        0 + 1 + 2 + 4 + 5
    );
}

#[test]
fn switch_dispatch_with_default_and_fallthrough() {
    let source = |selector: u16| {
        format!(
            "function pick(x){{\n\
                 int out = 0;\n\
                 switch (x) {{\n\
                     case 1: out = 10; break;\n\
                     case 2: out = 20;\n\
                     case 3: out = out + 1; break;\n\
                     default: out = 99;\n\
                 }}\n\
                 return out;\n\
             }}\n\
             function main(){{ return pick({}); }}",
            selector
        )
    };
    assert_eq!(returns(&source(1)), 10);
    assert_eq!(returns(&source(2)), 21); // falls through into case 3
    assert_eq!(returns(&source(3)), 1);
    assert_eq!(returns(&source(7)), 99);
}

#[test]
fn pointers_and_address_of() {
    assert_eq!(
        returns(
            "function main(){\n\
                 int x = 5;\n\
                 int* p = @x;\n\
                 *p = *p + 2;\n\
                 return x;\n\
             }"
        ),
        7
    );
}

#[test]
fn arrays_and_malloc() {
    assert_eq!(
        returns(
            "function main(){\n\
                 int a[4];\n\
                 int* buffer = malloc(8);\n\
                 a[0] = 3;\n\
                 a[1] = a[0] * 2;\n\
                 buffer[2] = a[1] + 1;\n\
                 free(buffer);\n\
                 return buffer[2] + a[0];\n\
             }"
        ),
        10
    );
}

#[test]
fn char_literals_flow_through() {
    assert_eq!(returns("function main(){ return 'H' + 'E'; }"), 11);
    assert_eq!(returns("function main(){ char c = ','; return c; }"), 42);
}

#[test]
fn read_key_builtin() {
    let cpu = run_mcl_with_keys(
        "function main(){ return readKey() + readKey(); }",
        vec![7, 4],
    );
    assert_eq!(cpu.reg[0], 11);
}

#[test]
fn nested_calls_preserve_caller_registers() {
    assert_eq!(
        returns(
            "function g(x){ int noise = 99; return x + 1; }\n\
             function main(){\n\
                 int a = 10;\n\
                 int b = g(5);\n\
                 return a + b;\n\
             }"
        ),
        16
    );
}

#[test]
fn mutual_recursion() {
    assert_eq!(
        returns(
            "function even(n){ if (n == 0) return 1; return odd(n - 1); }\n\
             function odd(n){ if (n == 0) return 0; return even(n - 1); }\n\
             function main(){ return even(10) + odd(7); }"
        ),
        2
    );
}

#[test]
fn deep_recursion_uses_the_stack() {
    assert_eq!(
        returns(
            "function sum(n){ if (n == 0) return 0; return n + sum(n - 1); }\n\
             function main(){ return sum(100); }"
        ),
        5050
    );
}

// ── GPU through the compiler ─────────────────────────────────────────────

#[test]
fn gpu_builtins_lower_one_to_one() {
    let cpu = run_mcl(
        "function main(){\n\
             clearGrid(0, 0, 32, 32);\n\
             drawGrid(1, 2, 3, 4);\n\
             drawLine(0, 0, 7, 0);\n\
             return 0;\n\
         }",
    );
    assert!(cpu.gpu.pixel(1, 2));
    assert!(cpu.gpu.pixel(3, 5));
    assert!(!cpu.gpu.pixel(4, 2));
    assert!(cpu.gpu.pixel(0, 0));
    assert!(cpu.gpu.pixel(7, 0));
}

#[test]
fn sprite_and_text_builtins() {
    let cpu = run_mcl(
        "function main(){\n\
             loadSprite(1, 0x7fff);\n\
             drawSprite(1, 10, 10);\n\
             loadText(0, 'A');\n\
             drawText(0, 20, 20);\n\
             scrollBuffer(0, 1);\n\
             return 0;\n\
         }",
    );
    // The sprite block moved down one row by the scroll.
    assert!(cpu.gpu.pixel(10, 11));
    assert!(!cpu.gpu.pixel(10, 10));
    // Top row of the 'A' glyph, one row down.
    assert!(cpu.gpu.pixel(21, 21));
}

#[test]
fn selector_helpers_interoperate_with_raw_writes() {
    let cpu = run_mcl(
        "function main(){\n\
             setGPUBuffer(0, 1);\n\
             setGPUBuffer(1, 1);\n\
             return getGPUBuffer(1) * 10 + getGPUBuffer(0);\n\
         }",
    );
    assert_eq!(cpu.gpu.selector(), 0x0001_0001);
    assert_eq!(cpu.reg[0], 11);
}

#[test]
fn get_gpu_buffer_reads_the_live_selector() {
    // A raw selector write after the helpers; the getter must see it.
    let source = "function main(){ setGPUBuffer(1, 1); return getGPUBuffer(1); }";
    let assembly = compile_source(source).unwrap();
    let patched = format!("MVR i:0x00000000, GPU\n{}", assembly);
    // The raw write above runs first but the helper write wins (last write
    // wins), then the getter reads the hardware.
    let (cpu, outcome) = run_asm_outcome(&patched, Vec::new());
    assert_eq!(outcome, Outcome::Halted);
    assert_eq!(cpu.reg[0], 1);
}

#[test]
fn draw_ops_target_the_edit_buffer_only() {
    let cpu = run_mcl(
        "function main(){\n\
             setGPUBuffer(0, 1);\n\
             drawGrid(0, 0, 32, 32);\n\
             return 0;\n\
         }",
    );
    // Display still shows buffer 0, which is untouched.
    assert!(cpu.gpu.display_buffer().iter().all(|&row| row == 0));
    assert!(cpu.gpu.edit_buffer().iter().all(|&row| row == u32::MAX));
}

// ── Fault and error surfaces ─────────────────────────────────────────────

#[test]
fn gpu_out_of_range_faults_carry_the_instruction() {
    let (_, outcome) = run_asm_outcome("DRGRD i:32, i:0, i:1, i:1\n", Vec::new());
    match outcome {
        Outcome::Fault(fault) => {
            assert_eq!(fault.kind, FaultKind::OutOfRange);
            assert_eq!(fault.kind.code(), "OUT_OF_RANGE");
            assert_eq!(fault.pc, 0);
            assert!(fault.instruction.starts_with("DRGRD"));
        }
        other => panic!("expected a fault, got {:?}", other),
    }
}

#[test]
fn sprite_id_out_of_range_faults() {
    let (_, outcome) = run_asm_outcome("LDSPR i:32, i:1\n", Vec::new());
    assert!(matches!(
        outcome,
        Outcome::Fault(fault) if fault.kind == FaultKind::OutOfRange
    ));
}

#[test]
fn type_errors_abort_compilation() {
    assert!(compile_source("function main(){ return missing; }").is_err());
    assert!(compile_source("function main(){ return f(1); }").is_err());
    assert!(
        compile_source("function f(a){ return a; } function main(){ return f(1, 2); }").is_err()
    );
    assert!(compile_source("function main(){ break; return 0; }").is_err());
    assert!(compile_source("function g(){ return 0; }").is_err()); // no main
    assert!(compile_source("function main(){ int* p = malloc(readKey()); return 0; }").is_err());
}

#[test]
fn keyin_eof_is_an_orderly_halt() {
    let (cpu, outcome) = run_asm_outcome("KEYIN i:0x1000\nHALT\n", Vec::new());
    assert_eq!(outcome, Outcome::Halted);
    assert_eq!(cpu.ram.read(0x1000), 0);
}

// ── Machine invariants after arbitrary programs ──────────────────────────

#[test]
fn division_identity_from_source() {
    for (a, b) in [(47u16, 5u16), (100, 7), (65, 64)] {
        let q = returns(&format!(
            "function f(a, b){{ return a / b; }} function main(){{ return f({}, {}); }}",
            a, b
        ));
        let r = returns(&format!(
            "function f(a, b){{ return a % b; }} function main(){{ return f({}, {}); }}",
            a, b
        ));
        assert_eq!(a, q * b + r, "{} / {}", a, b);
        assert!(r < b);
    }
}

#[test]
fn free_is_accepted_and_does_nothing() {
    let assembly =
        compile_source("function main(){ int* p = malloc(2); free(p); return 1; }").unwrap();
    assert!(assembly.contains("// free"));
    let (cpu, outcome) = run_asm_outcome(&assembly, Vec::new());
    assert_eq!(outcome, Outcome::Halted);
    assert_eq!(cpu.reg[0], 1);
}
