use std::{env, fs, process};

use colored::Colorize;
use log::debug;

use verybasic::bytecode::disasm::print_bc;
use verybasic::demo;
use verybasic::lang::program::Program;
use verybasic::runtime::{ExternTable, Session, SessionError, VmConfig};

struct Options {
    bytecode: bool,
    no_run: bool,
    max_steps: Option<usize>,
    filename: Option<String>,
}

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return;
    }
    if args.contains(&"--no-color".to_string()) {
        colored::control::set_override(false);
    }

    let options = match parse_options(&args) {
        Ok(options) => options,
        Err(msg) => {
            eprintln!("{} {}", "error:".red().bold(), msg);
            print_usage();
            process::exit(2);
        }
    };

    let config = VmConfig {
        max_steps: options.max_steps,
        ..VmConfig::default()
    };
    let mut session = Session::with_config(ExternTable::standard(), config);

    let ok = match &options.filename {
        Some(filename) => match load_program(filename) {
            Ok(program) => run_unit(&mut session, &program, &options),
            Err(msg) => {
                eprintln!("{} {}", "error:".red().bold(), msg);
                false
            }
        },
        None => run_demos(&mut session, &options),
    };

    if !ok {
        process::exit(1);
    }
}

fn parse_options(args: &[String]) -> Result<Options, String> {
    let mut options = Options {
        bytecode: false,
        no_run: false,
        max_steps: None,
        filename: None,
    };

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--bc" | "--bytecode" => options.bytecode = true,
            "--no-run" => options.no_run = true,
            "--no-color" => {}
            "--max-steps" => {
                let n = iter
                    .next()
                    .ok_or("--max-steps needs a number")?
                    .parse::<usize>()
                    .map_err(|e| format!("--max-steps: {}", e))?;
                options.max_steps = Some(n);
            }
            flag if flag.starts_with('-') => return Err(format!("unknown flag '{}'", flag)),
            // first non-flag argument is the filename
            name if options.filename.is_none() => options.filename = Some(name.to_string()),
            extra => return Err(format!("unexpected argument '{}'", extra)),
        }
    }

    Ok(options)
}

fn load_program(filename: &str) -> Result<Program, String> {
    let bytes = fs::read(filename).map_err(|e| format!("failed to read '{}': {}", filename, e))?;
    let program = Program::from_postcard(&bytes)
        .map_err(|e| format!("'{}' is not a VeryBasic program: {}", filename, e))?;
    debug!("loaded {} statements from {}", program.statements.len(), filename);
    Ok(program)
}

fn run_demos(session: &mut Session, options: &Options) -> bool {
    println!("{}", "VeryBasic demo mode".bold());
    let mut ok = true;
    for demo in demo::all() {
        println!();
        println!("{} {}", "──".dimmed(), demo.title.cyan());
        ok &= run_unit(session, &demo.program, options);
    }
    ok
}

fn run_unit(session: &mut Session, program: &Program, options: &Options) -> bool {
    let code = match session.compile(program) {
        Ok(code) => code,
        Err(e) => {
            report(&e);
            return false;
        }
    };

    if options.bytecode {
        print_bc(&code, &session.procedure_labels());
    }
    if options.no_run {
        return true;
    }

    match session.execute(code) {
        Ok(()) => true,
        Err(e) => {
            report(&e);
            false
        }
    }
}

fn report(err: &SessionError) {
    if err.is_internal() {
        eprintln!("{}", "internal error (this is a bug in VeryBasic)".magenta().bold());
        eprintln!("{}", err.to_string().magenta());
        return;
    }
    match err {
        SessionError::Compile(e) => {
            eprintln!("{}", e.to_string().yellow());
            if let Some(hint) = e.hint() {
                eprintln!("  {} {}", "hint:".bold(), hint);
            }
        }
        SessionError::Vm(e) => eprintln!("{}", e.to_string().red()),
    }
}

fn print_usage() {
    println!("VeryBasic - bytecode compiler and virtual machine");
    println!();
    println!("Usage:");
    println!("  verybasic                      Run the demo programs");
    println!("  verybasic <program.vbast>      Run a postcard-encoded program");
    println!();
    println!("Flags:");
    println!("  --bc, --bytecode               Print the disassembly before running");
    println!("  --no-run                       Compile only");
    println!("  --max-steps <n>                Stop after n instructions");
    println!("  --no-color                     Plain output");
    println!("  --help, -h                     Show this help");
    println!();
    println!("Set RUST_LOG=debug to trace compilation and execution.");
}
