use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use clap::error::ErrorKind;

use quill::{InterpretError, Vm};

// Exit codes follow the BSD sysexits convention.
const EX_USAGE: u8 = 64;
const EX_DATAERR: u8 = 65;
const EX_SOFTWARE: u8 = 70;
const EX_IOERR: u8 = 74;

#[derive(Parser)]
#[command(name = "quill", version, about = "The quill language interpreter")]
struct Cli {
    /// Script to run; starts an interactive session when omitted.
    script: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(EX_USAGE);
        }
    };

    match cli.script {
        Some(path) => run_file(&path),
        None => repl(),
    }
}

fn run_file(path: &Path) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("error: could not read {}: {e}", path.display());
            return ExitCode::from(EX_IOERR);
        }
    };

    let mut stdout = io::stdout().lock();
    let mut vm = Vm::new(&mut stdout);
    match vm.interpret(&source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(InterpretError::Compile(errors)) => {
            for e in errors {
                eprintln!("{e}");
            }
            ExitCode::from(EX_DATAERR)
        }
        Err(InterpretError::Runtime(e)) => {
            eprintln!("{e}");
            ExitCode::from(EX_SOFTWARE)
        }
    }
}

/// Line-at-a-time interactive session. Each line is its own program; the
/// heap and interned strings persist across lines, global bindings do not.
fn repl() -> ExitCode {
    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    let mut vm = Vm::new(&mut stdout);

    loop {
        eprint!("> ");
        let _ = io::stderr().flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => return ExitCode::SUCCESS,
            Ok(_) => {}
            Err(e) => {
                eprintln!("error: could not read input: {e}");
                return ExitCode::from(EX_IOERR);
            }
        }
        if line.trim().is_empty() {
            continue;
        }
        match vm.interpret(&line) {
            Ok(()) => {}
            Err(InterpretError::Compile(errors)) => {
                for e in errors {
                    eprintln!("{e}");
                }
            }
            Err(InterpretError::Runtime(e)) => eprintln!("{e}"),
        }
    }
}
