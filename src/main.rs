use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;
use miette::{IntoDiagnostic, Result};
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};

use zax::runtime::{attach_console_peripherals, DEFAULT_STEP_LIMIT};
use zax::{disasm, Machine, Memory};

/// Zax is an assembler and simulator toolchain for the Z80 microprocessor.
#[derive(Parser)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Log chatter from the simulator core
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Assemble a `.z80` file and run it against the console peripherals
    Run {
        /// `.z80` file to run
        name: PathBuf,
        /// Stop after this many instructions even without HALT
        #[arg(long, default_value_t = DEFAULT_STEP_LIMIT)]
        steps: u64,
    },
    /// Assemble a `.z80` file into a flat binary image and print the listing
    Asm {
        /// `.z80` file to assemble
        name: PathBuf,
        /// Destination for the `.bin` image
        dest: Option<PathBuf>,
    },
    /// Check a `.z80` file without running or writing a binary
    Check {
        /// File to check
        name: PathBuf,
    },
    /// Disassemble a flat binary image
    Disasm {
        /// `.bin` file to decode
        name: PathBuf,
        /// Address the image is based at
        #[arg(long, default_value_t = 0)]
        org: u16,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    let _ = TermLogger::init(
        level,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    );

    let Some(command) = args.command else {
        println!("\n~ zax v{VERSION} ~");
        println!("{SHORT_INFO}");
        return Ok(());
    };

    match command {
        Command::Run { name, steps } => {
            let contents: &'static str =
                Box::leak(Box::new(fs::read_to_string(&name).into_diagnostic()?));
            println!(
                "{:>12} target {}",
                "Assembling".green().bold(),
                name.display()
            );
            let assembly = zax::assemble(contents)?;
            println!("{:>12} image ({} bytes)", "Running".green().bold(), assembly.image.len());
            let mut machine = Machine::new();
            attach_console_peripherals(&mut machine.bus);
            machine.load_assembly(&assembly);
            let taken = machine.run(steps).into_diagnostic()?;
            println!(
                "{:>12} after {} steps",
                "Halted".cyan().bold(),
                taken
            );
            print_registers(&machine);
            Ok(())
        }
        Command::Asm { name, dest } => {
            let contents: &'static str =
                Box::leak(Box::new(fs::read_to_string(&name).into_diagnostic()?));
            println!(
                "{:>12} target {}",
                "Assembling".green().bold(),
                name.display()
            );
            let assembly = zax::assemble(contents)?;
            print!("{}", assembly.listing);
            let out_file_name = dest.unwrap_or_else(|| {
                name.with_extension("bin")
                    .file_name()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("out.bin"))
            });
            let mut file = File::create(&out_file_name).into_diagnostic()?;
            file.write_all(&assembly.image).into_diagnostic()?;
            println!(
                "{:>12} {} ({} bytes)",
                "Saved to".green().bold(),
                out_file_name.display(),
                assembly.image.len()
            );
            Ok(())
        }
        Command::Check { name } => {
            let contents: &'static str =
                Box::leak(Box::new(fs::read_to_string(&name).into_diagnostic()?));
            println!(
                "{:>12} target {}",
                "Checking".green().bold(),
                name.display()
            );
            let assembly = zax::assemble(contents)?;
            println!(
                "{:>12} with 0 errors ({} bytes, {} labels)",
                "Finished".green().bold(),
                assembly.image.len(),
                assembly.labels.len()
            );
            Ok(())
        }
        Command::Disasm { name, org } => {
            let image = fs::read(&name).into_diagnostic()?;
            let mut mem = Memory::new();
            mem.load(org, &image);
            let end = org.saturating_add(image.len().min(0xFFFF) as u16);
            for (addr, instr) in disasm::disasm_range(&mem, org, end) {
                let bytes = (0..instr.len)
                    .map(|i| format!("{:02X}", mem.read(addr.wrapping_add(i))))
                    .collect::<Vec<_>>()
                    .join(" ");
                println!("{addr:04X} | {bytes:<14} | {}", instr.text);
            }
            Ok(())
        }
    }
}

fn print_registers(machine: &Machine) {
    let regs = &machine.cpu.regs;
    println!(
        "{:>12} A={:02X} F={:02X} BC={:04X} DE={:04X} HL={:04X}",
        "regs".cyan(),
        regs.a,
        regs.f,
        regs.bc(),
        regs.de(),
        regs.hl()
    );
    println!(
        "{:>12} IX={:04X} IY={:04X} SP={:04X} PC={:04X}",
        "".normal(),
        regs.ix,
        regs.iy,
        regs.sp,
        regs.pc
    );
}

const SHORT_INFO: &str = r"
Welcome to zax, an all-in-one toolchain for assembling and simulating
Z80 machine code with a bank of memory-mapped demo peripherals.
Please use `-h` or `--help` to access the usage instructions.
";

const VERSION: &str = env!("CARGO_PKG_VERSION");
