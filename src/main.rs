mod bytecode;
mod error;
mod frontend;
mod lang;
mod runtime;

use std::{env, fs, path::Path, process};

use crate::bytecode::compile::compile;
use crate::bytecode::disasm::print_listing;
use crate::bytecode::exe::Executable;
use crate::frontend::lexer::Lexer;
use crate::frontend::parser::Parser;
use crate::lang::ast::Ast;
use crate::lang::source::Source;
use crate::runtime::prelude;
use crate::runtime::vm::Vm;

fn main() {
    init_tracing();

    let args: Vec<String> = env::args().collect();

    let tokens_only = args.contains(&"--tokens".to_string());
    let ast_only = args.contains(&"--ast".to_string());
    let bytecode = args.contains(&"--bc".to_string()) || args.contains(&"--bytecode".to_string());
    let emit_json = args
        .iter()
        .position(|a| a == "--emit-json")
        .map(|i| args.get(i + 1).cloned());

    if args.contains(&"--help".to_string()) || args.contains(&"-h".to_string()) {
        print_usage();
        return;
    }

    let json_target = match emit_json {
        Some(Some(path)) => Some(path),
        Some(None) => {
            eprintln!("Error: --emit-json needs a target file");
            process::exit(1);
        }
        None => None,
    };

    // first non-flag argument is the filename; --emit-json's value is not it
    let mut filename = None;
    let mut i = 1;
    while i < args.len() {
        let arg = &args[i];
        if arg == "--emit-json" {
            i += 2;
            continue;
        }
        if !arg.starts_with('-') && filename.is_none() {
            filename = Some(arg);
        }
        i += 1;
    }

    match filename {
        Some(filename) => {
            ensure_extension(filename);
            match fs::read_to_string(filename) {
                Ok(text) => {
                    let source = Source::new(Some(filename.clone()), text);
                    run_program(source, tokens_only, ast_only, bytecode, json_target);
                }
                Err(e) => {
                    eprintln!("Failed to read '{}': {}", filename, e);
                    process::exit(1);
                }
            }
        }
        None => print_usage(),
    }
}

/// Tracing goes to stderr, filtered by `CINDER_LOG` (falling back to
/// `RUST_LOG`, then to warnings only).
fn init_tracing() {
    use tracing_subscriber::{prelude::*, EnvFilter, Registry};

    let filter = EnvFilter::try_from_env("CINDER_LOG")
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .compact(),
        )
        .with(filter)
        .init();
}

fn ensure_extension(filename: &str) {
    let path = Path::new(filename);
    if path.extension().and_then(|e| e.to_str()) != Some("cn") {
        eprintln!("Error: expected a .cn file, got {}", filename);
        process::exit(1);
    }
}

fn print_usage() {
    println!("CINDER - A Small Scripting Language");
    println!();
    println!("Usage:");
    println!("  cinder <file.cn>                 Run a program");
    println!("  cinder --tokens <file.cn>        Show the token stream");
    println!("  cinder --ast <file.cn>           Show the parse tree");
    println!("  cinder --bc <file.cn>            Disassemble instead of running");
    println!("  cinder --emit-json <out> <file>  Write the compiled program as JSON");
    println!("  cinder --help, -h                Show this help");
}

fn run_program(
    source: std::rc::Rc<Source>,
    tokens_only: bool,
    ast_only: bool,
    bytecode: bool,
    json_target: Option<String>,
) {
    let mut lexer = Lexer::new(source.body());
    let tokens = match lexer.tokenize() {
        Ok(tokens) => tokens,
        Err(e) => {
            eprintln!("Lexer error: {}", e);
            process::exit(1);
        }
    };

    if tokens_only {
        for spanned in &tokens {
            let (line, col) = source.line_col(spanned.offset);
            println!("{:>4}:{:<3} {:?}", line, col, spanned.token);
        }
        return;
    }

    let ast = match Parser::new(tokens, source).parse() {
        Ok(ast) => ast,
        Err(e) => {
            eprintln!("Parse error: {}", e);
            process::exit(1);
        }
    };

    if ast_only {
        println!("{:#?}", ast.root);
        return;
    }

    let exe = compile_or_exit(&ast);

    if let Some(path) = json_target {
        write_json(&exe, &path);
    }

    if bytecode {
        print_listing(&exe);
        return;
    }

    let mut vm = match Vm::new() {
        Ok(vm) => vm,
        Err(e) => {
            eprintln!("Startup error: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = prelude::install(&mut vm) {
        eprintln!("Startup error: {}", e);
        process::exit(1);
    }

    if let Err(e) = vm.load_and_run(exe) {
        eprintln!("Runtime error: {}", e);
        process::exit(1);
    }
}

fn compile_or_exit(ast: &Ast) -> Executable {
    match compile(ast) {
        Ok(exe) => exe,
        Err(e) => {
            eprintln!("Compile error: {}", e);
            process::exit(1);
        }
    }
}

fn write_json(exe: &Executable, path: &str) {
    let json = match serde_json::to_string_pretty(exe) {
        Ok(json) => json,
        Err(e) => {
            eprintln!("Failed to serialize bytecode: {}", e);
            process::exit(1);
        }
    };
    if let Err(e) = fs::write(path, json) {
        eprintln!("Failed to write '{}': {}", path, e);
        process::exit(1);
    }
}
