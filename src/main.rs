// File: src/main.rs
//
// Command-line host for the Alto language.
// Compiles and runs source files, resolving the built-in host imports
// (console, math), and runs assembly text for tooling and tests.

mod assembler;
mod ast;
mod bytecode;
mod compiler;
mod errors;
mod lexer;
mod module;
mod parser;
mod prototypes;
mod resolver;
mod value;
mod vm;

use clap::{Parser as ClapParser, Subcommand};
use module::Module;
use std::fs;
use std::path::PathBuf;
use value::{Import, Value};

#[derive(ClapParser)]
#[command(
    name = "alto",
    about = "Alto: a small dynamic scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(arg_required_else_help = true)]
enum Commands {
    /// Compile and run an Alto script file
    Run {
        /// Path to the .alto file
        file: PathBuf,

        /// Print the compiled bytecode before running
        #[arg(long)]
        dump: bool,

        /// Arguments passed to the script's main
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        script_args: Vec<String>,
    },

    /// Assemble and run an Alto assembly file
    Asm {
        /// Path to the assembly file
        file: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file, dump, script_args } => {
            let source = match fs::read_to_string(&file) {
                Ok(source) => source,
                Err(e) => {
                    eprintln!("error: cannot read {}: {}", file.display(), e);
                    std::process::exit(1);
                }
            };

            let module = match compiler::compile(&source) {
                Ok(module) => module,
                Err(e) => {
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
            };

            if dump {
                eprintln!("{}", bytecode::disassemble(module.code()));
            }

            module.set_importing(resolve_host_import);
            let args: Vec<Value> = script_args.iter().map(|a| Value::string(a.as_str())).collect();
            if let Err(e) = module.main(&args) {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        }

        Commands::Asm { file } => {
            let source = match fs::read_to_string(&file) {
                Ok(source) => source,
                Err(e) => {
                    eprintln!("error: cannot read {}: {}", file.display(), e);
                    std::process::exit(1);
                }
            };

            let module = match assembler::assemble(&source) {
                Ok(module) => module,
                Err(e) => {
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
            };

            module.set_importing(resolve_host_import);
            match module.main(&[]) {
                Ok(result) => {
                    if !result.is_null() {
                        println!("{}", result.to_display_string());
                    }
                }
                Err(e) => {
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}

/// Satisfy the host-provided imports scripts may request
fn resolve_host_import(_module: &Module, import: &Import) {
    let resolved = match import.name.as_str() {
        "console" => Some(console_table()),
        "math" => Some(math_table()),
        _ => None,
    };
    if let Some(value) = resolved {
        *import.resolved.borrow_mut() = value;
    }
}

fn console_table() -> Value {
    let table = Value::table();
    let _ = table.set(
        Value::string("log"),
        Value::native("log", |_, args| {
            let line: Vec<String> = args.iter().map(|a| a.to_display_string()).collect();
            println!("{}", line.join(" "));
            Ok(Value::Null)
        }),
    );
    let _ = table.set(
        Value::string("error"),
        Value::native("error", |_, args| {
            let line: Vec<String> = args.iter().map(|a| a.to_display_string()).collect();
            eprintln!("{}", line.join(" "));
            Ok(Value::Null)
        }),
    );
    table
}

fn math_table() -> Value {
    fn unary(name: &'static str, f: fn(f64) -> f64) -> Value {
        Value::native(name, move |_, args| {
            let n = args.first().map(|a| a.to_number()).unwrap_or(f64::NAN);
            Ok(Value::Number(f(n)))
        })
    }

    let table = Value::table();
    let _ = table.set(Value::string("floor"), unary("floor", f64::floor));
    let _ = table.set(Value::string("ceil"), unary("ceil", f64::ceil));
    let _ = table.set(Value::string("abs"), unary("abs", f64::abs));
    let _ = table.set(Value::string("sqrt"), unary("sqrt", f64::sqrt));
    let _ = table.set(Value::string("pi"), Value::Number(std::f64::consts::PI));
    let _ = table.set(
        Value::string("pow"),
        Value::native("pow", |_, args| {
            let a = args.first().map(|a| a.to_number()).unwrap_or(f64::NAN);
            let b = args.get(1).map(|a| a.to_number()).unwrap_or(f64::NAN);
            Ok(Value::Number(a.powf(b)))
        }),
    );
    let _ = table.set(
        Value::string("min"),
        Value::native("min", |_, args| {
            let result = args.iter().map(|a| a.to_number()).fold(f64::INFINITY, f64::min);
            Ok(Value::Number(result))
        }),
    );
    let _ = table.set(
        Value::string("max"),
        Value::native("max", |_, args| {
            let result = args.iter().map(|a| a.to_number()).fold(f64::NEG_INFINITY, f64::max);
            Ok(Value::Number(result))
        }),
    );
    table
}
