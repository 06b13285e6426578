use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use ariadne::{Color, Label, Report, ReportKind, Source};
use clap::{Parser, Subcommand};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing_subscriber::EnvFilter;

use skiff::compiler::{Compiler, SymbolScope};
use skiff::lexer::{SourceFileSet, Span};
use skiff::parser::{CallArgs, Expr, ExprKind, File, Literal, StmtKind};
use skiff::{CompilerOptions, Error, HostFunction, ModuleMap, SymbolTable, Value, Vm};

/// Skiff - a small embeddable scripting language
#[derive(Parser)]
#[command(name = "skiff")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log filter used when RUST_LOG is not set (e.g. "debug", "skiff_vm=trace")
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and run a Skiff source file
    Run {
        /// Path to the Skiff source file
        file: PathBuf,

        /// Allocation budget; negative means unbounded
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        max_allocs: i64,

        /// Directory for file imports (defaults to the file's directory)
        #[arg(long)]
        import_dir: Option<PathBuf>,
    },

    /// Disassemble a file to show bytecode
    Disasm {
        /// Path to the Skiff source file
        file: PathBuf,

        /// Directory for file imports (defaults to the file's directory)
        #[arg(long)]
        import_dir: Option<PathBuf>,
    },

    /// Start an interactive REPL
    Repl,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Some(Commands::Run {
            file,
            max_allocs,
            import_dir,
        }) => run_file(&file, max_allocs, import_dir),
        Some(Commands::Disasm { file, import_dir }) => disasm_file(&file, import_dir),
        Some(Commands::Repl) | None => run_repl(),
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn file_options(path: &Path, import_dir: Option<PathBuf>) -> CompilerOptions {
    let import_dir = import_dir.unwrap_or_else(|| match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    });
    CompilerOptions {
        allow_file_import: true,
        import_dir,
        ..CompilerOptions::default()
    }
}

/// Read and compile a source file, reporting any error.
fn compile_file(path: &Path, import_dir: Option<PathBuf>) -> Option<skiff::Bytecode> {
    let source = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error reading file '{}': {}", path.display(), e);
            return None;
        }
    };

    let filename = path.to_string_lossy();
    let options = file_options(path, import_dir);
    match skiff::compile(&filename, &source, options, ModuleMap::new()) {
        Ok(bytecode) => Some(bytecode),
        Err(e) => {
            report_error(&e);
            None
        }
    }
}

/// Run a Skiff source file
fn run_file(path: &Path, max_allocs: i64, import_dir: Option<PathBuf>) -> ExitCode {
    let Some(bytecode) = compile_file(path, import_dir) else {
        return ExitCode::FAILURE;
    };

    let mut vm = Vm::new(bytecode, None, max_allocs);
    if let Err(e) = vm.run() {
        report_error(&Error::Runtime(e));
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Disassemble a file to show bytecode
fn disasm_file(path: &Path, import_dir: Option<PathBuf>) -> ExitCode {
    let Some(bytecode) = compile_file(path, import_dir) else {
        return ExitCode::FAILURE;
    };
    print!("{}", bytecode.disassemble());
    ExitCode::SUCCESS
}

// ---
// REPL
// ---

const REPL_PRINT: &str = "__repl_println__";

/// Compiler and VM state carried from one REPL line to the next.
struct ReplState {
    file_set: SourceFileSet,
    symbol_table: SymbolTable,
    constants: Vec<Value>,
    globals: Vec<Value>,
    lines: usize,
}

impl ReplState {
    fn new() -> Self {
        let mut symbol_table = SymbolTable::with_builtins();
        let print_slot = symbol_table.define(REPL_PRINT);
        let print_slot = symbol_table.symbol(print_slot).index;

        let mut globals = vec![Value::Undefined; print_slot + 1];
        globals[print_slot] = Value::from(HostFunction::new(REPL_PRINT, |args, _| {
            for arg in args {
                println!("{}", arg);
            }
            Ok(Value::Undefined)
        }));

        Self {
            file_set: SourceFileSet::new(),
            symbol_table,
            constants: Vec::new(),
            globals,
            lines: 0,
        }
    }

    fn eval(&mut self, line: &str) {
        self.lines += 1;
        let name = format!("repl:{}", self.lines);
        let file_id = self.file_set.add_file(name, line);

        let mut file = match skiff::parser::parse(line, file_id) {
            Ok(file) => file,
            Err(errors) => {
                for error in errors {
                    eprintln!("Parse Error: {}", error);
                }
                return;
            }
        };
        print_expression_statements(&mut file);

        let mut compiler = Compiler::new(self.file_set.clone())
            .with_symbol_table(self.symbol_table.clone())
            .with_constants(self.constants.clone());
        if let Err(e) = compiler.compile(&file) {
            eprintln!("{}", e.render(&self.file_set));
            return;
        }
        let (bytecode, symbol_table) = compiler.into_parts();
        self.symbol_table = symbol_table;
        self.constants = bytecode.constants.clone();

        let globals = std::mem::take(&mut self.globals);
        let mut vm = Vm::new(bytecode, Some(globals), -1);
        let result = vm.run();
        self.globals = vm.into_globals();
        if let Err(e) = result {
            eprintln!("{}", e);
        }
    }
}

/// Rewrite top-level expression statements into calls that print their
/// value.
fn print_expression_statements(file: &mut File) {
    for stmt in &mut file.stmts {
        let StmtKind::Expr(expr) = &mut stmt.kind else {
            continue;
        };
        let span = expr.span;
        let value = std::mem::replace(expr, Expr::new(ExprKind::Literal(Literal::Undefined), span));
        let callee = Expr::new(ExprKind::Ident(Arc::from(REPL_PRINT)), span);
        *expr = Expr::new(
            ExprKind::Call {
                callee: Box::new(callee),
                args: CallArgs {
                    positional: vec![value],
                    ..CallArgs::default()
                },
            },
            span,
        );
    }
}

/// Run the interactive REPL
fn run_repl() -> ExitCode {
    println!("Skiff {} - Interactive REPL", env!("CARGO_PKG_VERSION"));
    println!("Type 'exit' or press Ctrl+D to quit, 'help' for commands.\n");

    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("Error initializing REPL: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut state = ReplState::new();

    loop {
        match rl.readline(">> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line);

                match line {
                    "exit" | "quit" => break,
                    "help" => {
                        print_repl_help();
                        continue;
                    }
                    "globals" => {
                        print_globals(&state);
                        continue;
                    }
                    "reset" => {
                        state = ReplState::new();
                        println!("State reset.");
                        continue;
                    }
                    _ => {}
                }

                state.eval(line);
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    ExitCode::SUCCESS
}

fn print_globals(state: &ReplState) {
    // Resolving may record free symbols, so work on a copy.
    let mut table = state.symbol_table.clone();
    for name in table.names() {
        if &*name == REPL_PRINT {
            continue;
        }
        let Some((id, _)) = table.resolve(&name, false) else {
            continue;
        };
        let symbol = table.symbol(id);
        if symbol.scope != SymbolScope::Global {
            continue;
        }
        if let Some(value) = state.globals.get(symbol.index) {
            println!("  {} = {}", name, value);
        }
    }
}

fn print_repl_help() {
    println!("Skiff REPL Commands:");
    println!("  help     - Show this help message");
    println!("  exit     - Exit the REPL (also: quit, Ctrl+D)");
    println!("  globals  - List global variables");
    println!("  reset    - Forget all definitions");
    println!();
    println!("Examples:");
    println!("  >> x := 40");
    println!("  >> x + 2");
    println!("  42");
    println!("  >> sq := func(n) {{ return n * n }}");
    println!("  >> sq(5)");
    println!("  25");
}

// ---
// Error reporting with ariadne
// ---

fn report_error(error: &Error) {
    match error {
        Error::Parse { errors, file_set } => {
            for e in errors {
                report_span(file_set, e.span(), "Parse error", &e.to_string());
            }
        }
        Error::Compile { error, file_set } => {
            report_span(file_set, error.span, "Compile error", &error.kind.to_string());
        }
        Error::Runtime(e) => {
            eprintln!("\x1b[1;31m{}\x1b[0m", e);
        }
    }
}

fn report_span(file_set: &SourceFileSet, span: Span, title: &str, message: &str) {
    let Some(file) = file_set.file(span.file_id) else {
        eprintln!("{}: {}", title, message);
        return;
    };
    let filename = file.name();
    let range = span.start as usize..span.end as usize;

    let _ = Report::build(ReportKind::Error, (filename, range.clone()))
        .with_message(title)
        .with_label(
            Label::new((filename, range))
                .with_message(message)
                .with_color(Color::Red),
        )
        .finish()
        .eprint((filename, Source::from(file.source())));
}
