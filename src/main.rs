use anyhow::Context;
use clap::{Parser, Subcommand};
use mcl::host::{describe_fault, Configuration, Host};
use mcl::Outcome;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use termion::color;

#[derive(Parser)]
#[command(name = "mcl", about = "MCL compiler and virtual machine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile an MCL source file to assembly.
    Compile {
        input: PathBuf,
        /// Output path; defaults to the input with an .asm extension.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Print the generated assembly to stdout as well.
        #[arg(long)]
        debug: bool,
        /// Check the program without writing anything.
        #[arg(long)]
        validate_only: bool,
    },
    /// Load and run an assembly program.
    Run {
        input: PathBuf,
        /// Run without a display window, reading keys from stdin.
        #[arg(long)]
        headless: bool,
        /// Display magnification.
        #[arg(long, default_value_t = 8)]
        scale: usize,
        /// Attach the single-step debugger.
        #[arg(long)]
        debug: bool,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Compile {
            input,
            output,
            debug,
            validate_only,
        } => compile_command(&input, output, debug, validate_only),
        Command::Run {
            input,
            headless,
            scale,
            debug,
        } => run_command(&input, headless, scale, debug),
    }
}

fn compile_command(
    input: &Path,
    output: Option<PathBuf>,
    debug: bool,
    validate_only: bool,
) -> ExitCode {
    let source = match std::fs::read_to_string(input)
        .with_context(|| format!("cannot read {}", input.display()))
    {
        Ok(source) => source,
        Err(e) => {
            eprintln!("{}error:{} {:#}", color::Fg(color::Red), color::Fg(color::Reset), e);
            return ExitCode::from(1);
        }
    };
    let assembly = match mcl::compile_source(&source) {
        Ok(assembly) => assembly,
        Err(e) => {
            eprintln!(
                "{}compile error:{} {}",
                color::Fg(color::Red),
                color::Fg(color::Reset),
                e
            );
            return ExitCode::from(1);
        }
    };
    if debug {
        print!("{}", assembly);
    }
    if !validate_only {
        let output = output.unwrap_or_else(|| input.with_extension("asm"));
        if let Err(e) = std::fs::write(&output, &assembly)
            .with_context(|| format!("cannot write {}", output.display()))
        {
            eprintln!("{}error:{} {:#}", color::Fg(color::Red), color::Fg(color::Reset), e);
            return ExitCode::from(1);
        }
        log::info!("wrote {}", output.display());
    }
    ExitCode::SUCCESS
}

fn run_command(input: &Path, headless: bool, scale: usize, debug: bool) -> ExitCode {
    let source = match std::fs::read_to_string(input)
        .with_context(|| format!("cannot read {}", input.display()))
    {
        Ok(source) => source,
        Err(e) => {
            eprintln!("{}error:{} {:#}", color::Fg(color::Red), color::Fg(color::Reset), e);
            return ExitCode::from(2);
        }
    };
    let program = match mcl::load(&source) {
        Ok(program) => program,
        Err(e) => {
            eprintln!(
                "{}load error:{} {}",
                color::Fg(color::Red),
                color::Fg(color::Reset),
                e
            );
            return ExitCode::from(2);
        }
    };
    let mut host = Host::new(
        program,
        Configuration {
            headless,
            scale,
            debug,
            ..Configuration::default()
        },
    );
    match host.run() {
        Outcome::Halted => ExitCode::SUCCESS,
        Outcome::Fault(fault) => {
            eprintln!("{}", describe_fault(&fault));
            ExitCode::from(3)
        }
        // The run loops never hand Running back.
        Outcome::Running => ExitCode::SUCCESS,
    }
}
