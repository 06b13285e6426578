//! Skiff: a small, dynamically typed scripting language.
//!
//! This crate ties the pipeline together. Source text is parsed by
//! [`parser`], lowered to [`Bytecode`] by [`compiler`] and executed by
//! [`Vm`]. The helpers below cover the common "compile this string and run
//! it" path; embedders that need finer control use the re-exported crates
//! directly.
//!
//! ```no_run
//! let bytecode = skiff::compile("main", "x := 1 + 2", Default::default(), Default::default())?;
//! let mut vm = skiff::Vm::new(bytecode, None, -1);
//! vm.run()?;
//! # Ok::<(), skiff::Error>(())
//! ```

pub use skiff_compiler as compiler;
pub use skiff_lexer as lexer;
pub use skiff_object as object;
pub use skiff_parser as parser;
pub use skiff_vm as vm;

pub use skiff_compiler::{Bytecode, CompileError, CompilerOptions, ModuleMap, SymbolTable};
pub use skiff_lexer::SourceFileSet;
pub use skiff_object::{HostFunction, Kwargs, RuntimeError, Value};
pub use skiff_parser::ParseError;
pub use skiff_vm::{Vm, VmConfig, VmError};

use skiff_compiler::Compiler;

/// Anything that can go wrong between source text and a finished run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Parse Error: {}", first_message(.errors))]
    Parse {
        errors: Vec<ParseError>,
        file_set: SourceFileSet,
    },
    #[error("{}", render_compile(.error, .file_set))]
    Compile {
        error: CompileError,
        file_set: SourceFileSet,
    },
    #[error(transparent)]
    Runtime(#[from] VmError),
}

fn first_message(errors: &[ParseError]) -> String {
    match errors {
        [] => String::new(),
        [only] => only.to_string(),
        [first, rest @ ..] => format!("{} (and {} more)", first, rest.len()),
    }
}

fn render_compile(error: &CompileError, file_set: &SourceFileSet) -> String {
    error.render(file_set)
}

pub type Result<T> = std::result::Result<T, Error>;

/// Parse and compile one source file. Duplicate constants are merged
/// before the bytecode is returned.
pub fn compile(
    name: &str,
    source: &str,
    options: CompilerOptions,
    modules: ModuleMap,
) -> Result<Bytecode> {
    let mut file_set = SourceFileSet::new();
    let file_id = file_set.add_file(name, source);
    let file = match skiff_parser::parse(source, file_id) {
        Ok(file) => file,
        Err(errors) => return Err(Error::Parse { errors, file_set }),
    };

    let mut compiler = Compiler::new(file_set)
        .with_options(options)
        .with_module_map(modules);
    if let Err(error) = compiler.compile(&file) {
        let file_set = compiler.file_set().clone();
        return Err(Error::Compile { error, file_set });
    }

    let mut bytecode = compiler.bytecode();
    bytecode.remove_duplicates();
    tracing::debug!(
        file = name,
        constants = bytecode.constants.len(),
        "compiled"
    );
    Ok(bytecode)
}

/// Compile and run `source`, returning the final globals.
pub fn run(source: &str, max_allocs: i64) -> Result<Vec<Value>> {
    let bytecode = compile("main", source, CompilerOptions::default(), ModuleMap::new())?;
    let mut vm = Vm::new(bytecode, None, max_allocs);
    vm.run()?;
    Ok(vm.into_globals())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_and_run() {
        let globals = run("a := 2; b := a * 21", -1).unwrap();
        assert_eq!(globals[1], Value::Int(42));
    }

    #[test]
    fn test_parse_error_message() {
        let err = compile("main", "a := (", Default::default(), Default::default()).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
        assert!(err.to_string().starts_with("Parse Error: "));
    }

    #[test]
    fn test_compile_error_message() {
        let err = compile("main.skf", "a := 1\nb", Default::default(), Default::default())
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Compile Error: unresolved reference 'b'\n\tat main.skf:2:1"
        );
    }

    #[test]
    fn test_runtime_error_is_wrapped() {
        let err = run("x := 1 / 0", -1).unwrap_err();
        match err {
            Error::Runtime(e) => assert_eq!(e.error, RuntimeError::DivisionByZero),
            other => panic!("unexpected {other:?}"),
        }
    }
}
