use std::fs;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::process::ExitCode;

use ember::checker::ChunkChecker;
use ember::chunk_io::{read_chunk, ChunkWriter};
use ember::compiler::{compile, ErrorReporter};
use ember::error::ErrorKind;
use ember::heap::ObjRef;
use ember::object::{Closure, ObjKind};
use ember::optimizer;
use ember::vm::Vm;

// Process exit codes, one per failure class. The discriminant order is
// part of the tool's contract with callers.
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
enum Exit {
    NotEnoughArguments = 100,
    NoRunFile,
    UnknownCommand,
    CouldNotOpenFile,
    ChunkRead,
    ChunkWrite,
    Compile,
    ChunkCheckFailed,
    OptimizerFailure,
    StackOverflow,
    StackUnderflow,
    UnknownInstruction,
    ZeroDivision,
    WrongType,
    UndefinedVariable,
    NonCallable,
    WrongArgumentsCount,
    UndefinedProperty,
    Runtime,
    InvalidStackAccess,
}

fn exit_for(kind: &ErrorKind) -> Exit {
    match kind {
        ErrorKind::StackOverflow => Exit::StackOverflow,
        ErrorKind::StackUnderflow => Exit::StackUnderflow,
        ErrorKind::InvalidStackAccess => Exit::InvalidStackAccess,
        ErrorKind::UnknownInstruction(_) => Exit::UnknownInstruction,
        ErrorKind::ZeroDivision => Exit::ZeroDivision,
        ErrorKind::WrongType { .. } | ErrorKind::WrongObjectType { .. } => Exit::WrongType,
        ErrorKind::UndefinedVariable(_) => Exit::UndefinedVariable,
        ErrorKind::UndefinedProperty(_) => Exit::UndefinedProperty,
        ErrorKind::NonCallable(_) => Exit::NonCallable,
        ErrorKind::WrongArgumentsCount { .. } => Exit::WrongArgumentsCount,
        ErrorKind::OptimizerFailure(_) => Exit::OptimizerFailure,
        ErrorKind::Runtime(_) => Exit::Runtime,
    }
}

/// Prints each compile error as it is reported.
struct ConsoleReporter;

impl ErrorReporter for ConsoleReporter {
    fn report(&mut self, path: &str, line: usize, message: &str) {
        eprintln!("error [{}:{}]: {}", path, line, message);
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        return error_and_usage("not enough arguments", Exit::NotEnoughArguments);
    }

    let result = match args[1].as_str() {
        "repl" => repl(),
        "run_file" => match args.get(2) {
            Some(path) => run_file(path),
            None => return error_and_usage("not enough arguments", Exit::NoRunFile),
        },
        "run_bytecode" => match args.get(2) {
            Some(path) => run_bytecode(path),
            None => return error_and_usage("not enough arguments", Exit::NoRunFile),
        },
        "compile" => match (args.get(2), args.get(3)) {
            (Some(source), Some(dest)) => compile_file(source, dest),
            _ => return error_and_usage("not enough arguments", Exit::NoRunFile),
        },
        _ => return error_and_usage("unknown command", Exit::UnknownCommand),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(exit) => ExitCode::from(exit as u8),
    }
}

fn repl() -> Result<(), Exit> {
    println!("ember bytecode interpreter.");
    println!("Write ':quit' (without quotes) to exit.");

    let mut vm = Vm::new();
    let mut line = String::new();
    loop {
        print!("> ");
        let _ = io::stdout().flush();

        line.clear();
        match io::stdin().read_line(&mut line) {
            Ok(0) => return Ok(()),
            Ok(_) => {
                if line.trim_end() == ":quit" {
                    return Ok(());
                }
                // Errors are printed; the session keeps going.
                let _ = run_source(&mut vm, "stdin", &line);
            }
            Err(error) => {
                eprintln!("error reading line: {}", error);
                return Ok(());
            }
        }
    }
}

fn run_file(path: &str) -> Result<(), Exit> {
    let source = read_source(path)?;
    let mut vm = Vm::new();
    run_source(&mut vm, path, &source)
}

fn run_bytecode(path: &str) -> Result<(), Exit> {
    let file = File::open(path).map_err(|error| {
        eprintln!("error: could not read file '{}': {}", path, error);
        Exit::CouldNotOpenFile
    })?;

    let mut vm = Vm::new();
    let chunk = read_chunk(&mut vm, &mut BufReader::new(file)).map_err(|error| {
        eprintln!("error: chunk wrong file format or I/O error: {}", error);
        Exit::ChunkRead
    })?;

    let name = vm.intern_string("<script>");
    let script = vm.allocate(ObjKind::Closure(Closure {
        name,
        arity: 0,
        chunk,
        upvalues: Vec::new(),
    }));
    run_closure(&mut vm, script)
}

fn compile_file(source_path: &str, dest_path: &str) -> Result<(), Exit> {
    let source = read_source(source_path)?;
    let mut vm = Vm::new();
    let script = compile_source(&mut vm, source_path, &source)?;

    let file = File::create(dest_path).map_err(|error| {
        eprintln!("error: could not write to file '{}': {}", dest_path, error);
        Exit::ChunkWrite
    })?;

    let writer = ChunkWriter::new(vm.heap(), &vm.heap().closure(script).chunk);
    writer.write(&mut BufWriter::new(file)).map_err(|error| {
        eprintln!("error: could not write chunk: {}", error);
        Exit::ChunkWrite
    })
}

fn run_source(vm: &mut Vm, path: &str, source: &str) -> Result<(), Exit> {
    let script = compile_source(vm, path, source)?;
    run_closure(vm, script)
}

fn compile_source(vm: &mut Vm, path: &str, source: &str) -> Result<ObjRef, Exit> {
    let mut reporter = ConsoleReporter;
    match compile(vm, &mut reporter, path, source) {
        Some(script) => Ok(script),
        None => {
            eprintln!("error: had errors while compiling, exiting");
            Err(Exit::Compile)
        }
    }
}

/// Verifies, optimizes, and runs a script closure.
fn run_closure(vm: &mut Vm, script: ObjRef) -> Result<(), Exit> {
    if !ChunkChecker::new(&vm.heap().closure(script).chunk).check() {
        eprintln!("error: chunk failed verification");
        return Err(Exit::ChunkCheckFailed);
    }

    optimizer::optimize_closure(vm, script).map_err(|error| {
        eprintln!("{}", error);
        exit_for(&error.kind)
    })?;

    vm.run_script(script).map_err(|error| {
        eprintln!("{}", error);
        exit_for(&error.kind)
    })
}

fn read_source(path: &str) -> Result<String, Exit> {
    fs::read_to_string(path).map_err(|error| {
        eprintln!("error: could not read file '{}': {}", path, error);
        Exit::CouldNotOpenFile
    })
}

fn error_and_usage(message: &str, exit: Exit) -> ExitCode {
    eprintln!("error: {}.", message);
    print_usage();
    ExitCode::from(exit as u8)
}

fn print_usage() {
    eprintln!("Usage: ember command [file]");
    eprintln!("Where:");
    eprintln!("  command - one of {{ repl, run_file, run_bytecode, compile }}");
    eprintln!("  file - path to file");
    eprintln!("When: command = compile:");
    eprintln!("  Usage: ember compile source destination");
    eprintln!("    Where:");
    eprintln!("      source - path to source file");
    eprintln!("      destination - path to bytecode file");
}
