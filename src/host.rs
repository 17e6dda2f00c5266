//! The VM host: owns the machine, the clock and the glue to the display and
//! input collaborators. One tick is one CPU step. In interactive mode the
//! tick rate is enforced by a timer thread feeding a channel; headless mode
//! free-runs. The host also carries the debugger hooks; breakpoints are
//! keyed on source lines via the loader's line map.

use crate::error::Fault;
use crate::loader::Program;
use crate::processor::{KeySource, Outcome, CPU};
use minifb::{Key, KeyRepeat, Scale, Window, WindowOptions};
use std::collections::{HashSet, VecDeque};
use std::io::{self, BufRead, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use termion::color;

/// Host settings. The clock only matters in interactive mode; headless runs
/// flat out.
pub struct Configuration {
    /// Instructions per second, clamped to 0.5 .. 1000.
    pub clock_hz: f64,
    pub headless: bool,
    /// Display magnification, one of 1, 2, 4, 8, 16, 32.
    pub scale: usize,
    pub debug: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            clock_hz: 500.0,
            headless: false,
            scale: 8,
            debug: false,
        }
    }
}

pub struct Host {
    cpu: CPU,
    config: Configuration,
    breakpoints: HashSet<u32>,
    stop: Arc<AtomicBool>,
}

impl Host {
    pub fn new(program: Program, config: Configuration) -> Self {
        Host {
            cpu: CPU::new(program),
            config,
            breakpoints: HashSet::new(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag the collaborators may set to cancel the run between ticks (and
    /// to wake a KEYIN that is blocked on input).
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    // ── Debugger hooks ────────────────────────────────────────────────────

    pub fn set_breakpoint(&mut self, line: u32) {
        self.breakpoints.insert(line);
    }

    pub fn clear_breakpoint(&mut self, line: u32) {
        self.breakpoints.remove(&line);
    }

    pub fn read_register(&self, index: usize) -> Option<u16> {
        self.cpu.reg.get(index).copied()
    }

    pub fn read_ram(&self, address: u16) -> u16 {
        self.cpu.ram.read(address)
    }

    pub fn cpu(&self) -> &CPU {
        &self.cpu
    }

    /// One tick.
    pub fn step_one(&mut self, keys: &mut dyn KeySource) -> Outcome {
        self.cpu.step(keys)
    }

    /// Tick until a breakpoint line is reached or the run ends. Returns
    /// `Running` when paused at a breakpoint.
    pub fn run_until_break(&mut self, keys: &mut dyn KeySource) -> Outcome {
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return Outcome::Halted;
            }
            match self.cpu.step(keys) {
                Outcome::Running => {}
                outcome => return outcome,
            }
            if let Some(line) = self.cpu.current_line() {
                if self.breakpoints.contains(&line) {
                    return Outcome::Running;
                }
            }
        }
    }

    // ── Run loops ─────────────────────────────────────────────────────────

    pub fn run(&mut self) -> Outcome {
        if self.config.headless {
            self.run_headless()
        } else {
            self.run_interactive()
        }
    }

    /// Full speed, no window; KEYIN reads from stdin through a reader
    /// thread, EOF surfaces as an orderly halt.
    fn run_headless(&mut self) -> Outcome {
        if self.config.debug {
            log::warn!("debugger needs the window input path; ignoring --debug headless");
        }
        let mut keys = StdinKeys::spawn(Arc::clone(&self.stop));
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return Outcome::Halted;
            }
            match self.cpu.step(&mut keys) {
                Outcome::Running => {}
                outcome => {
                    self.report(&outcome);
                    return outcome;
                }
            }
        }
    }

    /// Rate-limited loop with a display window; the timer thread delivers
    /// ticks over a channel.
    fn run_interactive(&mut self) -> Outcome {
        let hz = self.config.clock_hz.clamp(0.5, 1000.0);
        log::info!("clock at {} Hz, scale {}x", hz, self.config.scale);
        let mut display = Display::new(self.config.scale, Arc::clone(&self.stop));
        let timer = timer::Timer::new();
        let (tick_tx, tick_rx) = mpsc::channel();
        let _guard = timer.schedule_repeating(
            chrono::Duration::nanoseconds((1e9 / hz) as i64),
            move || {
                let _ = tick_tx.send(());
            },
        );
        let mut debugger = if self.config.debug {
            Some(Debugger::new())
        } else {
            None
        };
        display.render(self.cpu.gpu.display_buffer());
        loop {
            if self.stop.load(Ordering::Relaxed) || !display.pump() {
                return Outcome::Halted;
            }
            match tick_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(()) => {}
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Outcome::Halted,
            }
            if let Some(debugger) = debugger.as_mut() {
                match debugger.update(&self.cpu, &mut self.breakpoints) {
                    DebugSignal::Step => {}
                    DebugSignal::Quit => return Outcome::Halted,
                }
            }
            let outcome = self.cpu.step(&mut display);
            if self.cpu.gpu.take_dirty() {
                display.render(self.cpu.gpu.display_buffer());
            }
            match outcome {
                Outcome::Running => {}
                outcome => {
                    self.report(&outcome);
                    return outcome;
                }
            }
        }
    }

    fn report(&self, outcome: &Outcome) {
        match outcome {
            Outcome::Halted => log::info!("halted, R0 = {}", self.cpu.reg[0]),
            Outcome::Fault(fault) => log::error!("{}", fault),
            Outcome::Running => {}
        }
    }
}

/// Fault presentation shared by the binary and the debugger.
pub fn describe_fault(fault: &Fault) -> String {
    format!(
        "{}fault [{}]{} at pc {}: {} in `{}`",
        color::Fg(color::Red),
        fault.kind.code(),
        color::Fg(color::Reset),
        fault.pc,
        fault.kind,
        fault.instruction,
    )
}

// ── Key sources ───────────────────────────────────────────────────────────

/// Canned key codes, used by tests and by anything that wants scripted
/// input. An exhausted queue halts the machine at the next KEYIN.
#[derive(Default)]
pub struct QueuedKeys {
    queue: VecDeque<u8>,
}

impl From<Vec<u8>> for QueuedKeys {
    fn from(codes: Vec<u8>) -> Self {
        QueuedKeys {
            queue: codes.into(),
        }
    }
}

impl KeySource for QueuedKeys {
    fn next_key(&mut self) -> Option<u8> {
        self.queue.pop_front()
    }
}

/// Stdin reader behind an SPSC channel, so a blocked KEYIN stays
/// cancellable: the reader thread owns the blocking read, the VM side polls
/// the channel and the stop flag.
pub struct StdinKeys {
    rx: mpsc::Receiver<u8>,
    stop: Arc<AtomicBool>,
}

impl StdinKeys {
    pub fn spawn(stop: Arc<AtomicBool>) -> Self {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            for byte in io::stdin().lock().bytes() {
                let byte = match byte {
                    Ok(b) => b,
                    Err(_) => break,
                };
                if let Some(code) = crate::fields::encode_char(byte as char) {
                    if tx.send(code).is_err() {
                        break;
                    }
                }
            }
            // Dropping the sender is the EOF signal.
        });
        StdinKeys { rx, stop }
    }
}

impl KeySource for StdinKeys {
    fn next_key(&mut self) -> Option<u8> {
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return None;
            }
            match self.rx.recv_timeout(Duration::from_millis(50)) {
                Ok(code) => return Some(code),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

// ── Display window ────────────────────────────────────────────────────────

/// The 32×32 display behind a minifb window. Doubles as the interactive key
/// source: a KEYIN blocked on input keeps the window event loop alive.
struct Display {
    window: Window,
    frame: Vec<u32>,
    stop: Arc<AtomicBool>,
}

impl Display {
    fn new(scale: usize, stop: Arc<AtomicBool>) -> Display {
        let scale = match scale {
            1 => Scale::X1,
            2 => Scale::X2,
            4 => Scale::X4,
            16 => Scale::X16,
            32 => Scale::X32,
            _ => Scale::X8,
        };
        let mut window = Window::new(
            "MCL - ESC to exit",
            32,
            32,
            WindowOptions {
                scale,
                ..WindowOptions::default()
            },
        )
        .unwrap_or_else(|e| {
            panic!("{}", e);
        });
        window.limit_update_rate(Some(Duration::from_micros(16600)));
        Display {
            window,
            frame: vec![0; 32 * 32],
            stop,
        }
    }

    fn render(&mut self, plane: &[u32; 32]) {
        for (y, &row) in plane.iter().enumerate() {
            for x in 0..32 {
                self.frame[y * 32 + x] = if row & (1 << (31 - x)) != 0 {
                    0xffffff
                } else {
                    0x0
                };
            }
        }
        self.window
            .update_with_buffer(&self.frame, 32, 32)
            .expect("Error updating screen!");
    }

    /// Keep the window responsive; false once it should close.
    fn pump(&mut self) -> bool {
        if !self.window.is_open() || self.window.is_key_down(Key::Escape) {
            return false;
        }
        self.window.update();
        true
    }
}

impl KeySource for Display {
    fn next_key(&mut self) -> Option<u8> {
        loop {
            if self.stop.load(Ordering::Relaxed) || !self.pump() {
                return None;
            }
            let keys = self.window.get_keys_pressed(KeyRepeat::No);
            for key in keys {
                if let Some(code) = window_key_code(key) {
                    return Some(code);
                }
            }
        }
    }
}

fn window_key_code(key: Key) -> Option<u8> {
    let code = match key {
        Key::A => 0,
        Key::B => 1,
        Key::C => 2,
        Key::D => 3,
        Key::E => 4,
        Key::F => 5,
        Key::G => 6,
        Key::H => 7,
        Key::I => 8,
        Key::J => 9,
        Key::K => 10,
        Key::L => 11,
        Key::M => 12,
        Key::N => 13,
        Key::O => 14,
        Key::P => 15,
        Key::Q => 16,
        Key::R => 17,
        Key::S => 18,
        Key::T => 19,
        Key::U => 20,
        Key::V => 21,
        Key::W => 22,
        Key::X => 23,
        Key::Y => 24,
        Key::Z => 25,
        Key::Key0 | Key::NumPad0 => 26,
        Key::Key1 | Key::NumPad1 => 27,
        Key::Key2 | Key::NumPad2 => 28,
        Key::Key3 | Key::NumPad3 => 29,
        Key::Key4 | Key::NumPad4 => 30,
        Key::Key5 | Key::NumPad5 => 31,
        Key::Key6 | Key::NumPad6 => 32,
        Key::Key7 | Key::NumPad7 => 33,
        Key::Key8 | Key::NumPad8 => 34,
        Key::Key9 | Key::NumPad9 => 35,
        Key::Slash => 37,
        Key::Equal | Key::NumPadPlus => 38,
        Key::Minus | Key::NumPadMinus => 39,
        Key::NumPadAsterisk => 40,
        Key::Period | Key::NumPadDot => 41,
        Key::Comma => 42,
        _ => return None,
    };
    Some(code)
}

// ── Thin debugger REPL ────────────────────────────────────────────────────

pub enum DebugSignal {
    Step,
    Quit,
}

#[derive(Clone, PartialEq)]
enum DebugCommand {
    Step,
    Continue,
    Quit,
    SetBreakpoint(Option<String>),
    DeleteBreakpoint(Option<String>),
    Register(Option<String>),
    Memory(Option<String>),
}

/// Stdin command loop layered over the host hooks: single step, continue,
/// per-line breakpoints, register and RAM peeks.
pub struct Debugger {
    code_running: bool,
    last_cmd: DebugCommand,
}

impl Debugger {
    pub fn new() -> Self {
        Debugger {
            code_running: false,
            last_cmd: DebugCommand::Step,
        }
    }

    pub fn update(&mut self, cpu: &CPU, breakpoints: &mut HashSet<u32>) -> DebugSignal {
        let at_breakpoint = cpu
            .current_line()
            .map_or(false, |line| breakpoints.contains(&line));
        if self.code_running && !at_breakpoint {
            return DebugSignal::Step;
        }
        self.code_running = false;
        loop {
            self.draw(cpu);
            match self.get_command() {
                DebugCommand::Quit => return DebugSignal::Quit,
                DebugCommand::Step => {
                    self.last_cmd = DebugCommand::Step;
                    return DebugSignal::Step;
                }
                DebugCommand::Continue => {
                    self.code_running = true;
                    return DebugSignal::Step;
                }
                DebugCommand::SetBreakpoint(arg) => match parse_number(&arg) {
                    Some(line) => {
                        breakpoints.insert(line as u32);
                        println!("Breakpoint at line {}.", line);
                    }
                    None => println!("Invalid line!"),
                },
                DebugCommand::DeleteBreakpoint(arg) => match parse_number(&arg) {
                    Some(line) => {
                        breakpoints.remove(&(line as u32));
                        println!("Breakpoint deleted.");
                    }
                    None => println!("Invalid line!"),
                },
                DebugCommand::Register(arg) => match parse_number(&arg) {
                    Some(index) if index < 32 => {
                        println!("R{} = {:#06x}", index, cpu.reg[index as usize])
                    }
                    _ => println!("Invalid register!"),
                },
                DebugCommand::Memory(arg) => match parse_number(&arg) {
                    Some(address) if address <= 0xffff => println!(
                        "RAM[{:#06x}] = {:#06x}",
                        address,
                        cpu.ram.read(address as u16)
                    ),
                    _ => println!("Invalid address!"),
                },
            }
        }
    }

    fn draw(&self, cpu: &CPU) {
        println!("{}", cpu);
        println!(
            "Next instruction: {}{}{}",
            color::Fg(color::Green),
            cpu.current_instruction()
                .unwrap_or_else(|| String::from("<none>")),
            color::Fg(color::Reset),
        );
        println!("n/s step, c continue, b/d <line> breakpoints, r <reg>, m <addr>, q quit");
        print!("> ");
        io::stdout().flush().expect("");
    }

    fn get_command(&mut self) -> DebugCommand {
        let mut input = String::new();
        if io::stdin().lock().read_line(&mut input).is_err() {
            return DebugCommand::Quit;
        }
        let mut cmd = input.split_whitespace();
        match cmd.next() {
            Some("q") => DebugCommand::Quit,
            Some("s") | Some("n") => DebugCommand::Step,
            Some("c") => DebugCommand::Continue,
            Some("b") => DebugCommand::SetBreakpoint(cmd.next().map(String::from)),
            Some("d") => DebugCommand::DeleteBreakpoint(cmd.next().map(String::from)),
            Some("r") => DebugCommand::Register(cmd.next().map(String::from)),
            Some("m") => DebugCommand::Memory(cmd.next().map(String::from)),
            _ => self.last_cmd.clone(),
        }
    }
}

impl Default for Debugger {
    fn default() -> Self {
        Debugger::new()
    }
}

fn parse_number(arg: &Option<String>) -> Option<u32> {
    let arg = arg.as_deref()?;
    if let Some(hex) = arg.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()
    } else {
        arg.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader;

    #[test]
    fn run_until_break_pauses_on_a_source_line() {
        let program = loader::load(
            "MVR i:1, 5\n\
             MVR i:2, 6\n\
             ADD 5, 6\n\
             HALT\n",
        )
        .unwrap();
        let mut host = Host::new(program, Configuration::default());
        host.set_breakpoint(3);
        let mut keys = QueuedKeys::default();
        assert_eq!(host.run_until_break(&mut keys), Outcome::Running);
        assert_eq!(host.cpu().pc, 2);
        assert_eq!(host.read_register(5), Some(1));
        host.clear_breakpoint(3);
        assert_eq!(host.run_until_break(&mut keys), Outcome::Halted);
        assert_eq!(host.read_register(0), Some(3));
    }

    #[test]
    fn stop_flag_halts_between_ticks() {
        let program = loader::load("loop: JMP loop\n").unwrap();
        let mut host = Host::new(program, Configuration::default());
        host.stop_handle().store(true, Ordering::Relaxed);
        let mut keys = QueuedKeys::default();
        assert_eq!(host.run_until_break(&mut keys), Outcome::Halted);
    }

    #[test]
    fn read_ram_sees_guest_writes() {
        let program = loader::load("LOAD i:0xbeef, i:0x100\nHALT\n").unwrap();
        let mut host = Host::new(program, Configuration::default());
        let mut keys = QueuedKeys::default();
        assert_eq!(host.step_one(&mut keys), Outcome::Running);
        assert_eq!(host.read_ram(0x100), 0xbeef);
    }
}
