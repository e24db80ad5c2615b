use std::env;
use std::fs;
use std::io::{self, BufRead, Write};
use std::process;

use lox_vm::{InterpretError, Vm};

const USAGE_EXIT: i32 = 64;
const FAILURE_EXIT: i32 = 1;

fn main() {
    let args: Vec<String> = env::args().collect();
    match args.len() {
        1 => run_repl(),
        2 => run_file(&args[1]),
        _ => {
            eprintln!("Usage: lox [path]");
            process::exit(USAGE_EXIT);
        }
    }
}

fn run_file(path: &str) {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Error: Can't open file '{}': {}", path, e);
            process::exit(FAILURE_EXIT);
        }
    };
    let mut vm = Vm::new();
    if let Err(e) = vm.interpret(&source) {
        report(&e);
        process::exit(FAILURE_EXIT);
    }
}

fn report(err: &InterpretError) {
    eprint!("{}", err);
}

// ---- REPL -------------------------------------------------------------------------

fn run_repl() {
    let mut vm = Vm::new();
    display_header();
    prompt();

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                eprintln!("Error: {}", e);
                break;
            }
        };

        if let Some(rest) = line.strip_prefix('.') {
            if !handle_command(rest.trim_end(), &mut vm) {
                break;
            }
        } else if let Err(e) = vm.interpret(&line) {
            report(&e);
        }
        prompt();
    }
}

/// Returns `false` to terminate the session (`.exit`).
fn handle_command(command: &str, vm: &mut Vm) -> bool {
    let mut parts = command.splitn(2, ' ');
    match parts.next().unwrap_or("") {
        "exit" => return false,
        "clear" => {
            clear_screen();
            display_header();
        }
        "help" => display_help(),
        "file" => {
            let path = parts.next().map(str::trim).unwrap_or("");
            if path.is_empty() {
                println!("Invalid .file command. Type '.help' for a list of commands.");
            } else {
                run_repl_file(path, vm);
            }
        }
        _ => println!("Invalid console command. Type '.help' for a list of commands."),
    }
    true
}

fn run_repl_file(path: &str, vm: &mut Vm) {
    match fs::read_to_string(path) {
        Ok(source) => {
            if let Err(e) = vm.interpret(&source) {
                report(&e);
            }
        }
        Err(e) => println!("Error: Can't open file '{}': {}", path, e),
    }
}

fn clear_screen() {
    print!("\x1b[2J\x1b[1;1H");
    io::stdout().flush().ok();
}

fn display_header() {
    println!("Lox Lang Interpreter");
    println!("Enter '.help' to see a list of commands.\n");
}

fn display_help() {
    display_header();
    println!("Help page\n");
    println!("All commands must be prefixed with '.' to mark them as non-executable code.\n");
    println!("List of commands:");
    println!("[.exit]             - Terminate the session.");
    println!("[.help]             - Display this page.");
    println!("[.clear]            - Clear the terminal screen.");
    println!("[.file] [filename]  - Run file.");
}

fn prompt() {
    print!("> ");
    io::stdout().flush().ok();
}
