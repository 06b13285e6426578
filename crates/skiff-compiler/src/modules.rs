use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use skiff_object::{CompiledFunction, Value};

/// A module importable by name.
#[derive(Debug, Clone)]
pub enum Module {
    /// Skiff source compiled on first import.
    Source(Arc<str>),
    /// A table of host values, exposed as an immutable map.
    Native(IndexMap<String, Value>),
}

impl Module {
    /// The value a native module evaluates to. Source modules have none.
    pub fn as_value(&self) -> Option<Value> {
        match self {
            Module::Source(_) => None,
            Module::Native(attrs) => Some(Value::immutable_map(attrs.clone())),
        }
    }
}

/// Named modules available to `import`.
#[derive(Debug, Clone, Default)]
pub struct ModuleMap {
    modules: IndexMap<String, Module>,
}

impl ModuleMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, module: Module) {
        self.modules.insert(name.into(), module);
    }

    pub fn add_source_module(&mut self, name: impl Into<String>, source: impl Into<Arc<str>>) {
        self.add(name, Module::Source(source.into()));
    }

    pub fn add_builtin_module(&mut self, name: impl Into<String>, attrs: IndexMap<String, Value>) {
        self.add(name, Module::Native(attrs));
    }

    pub fn get(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Module> {
        self.modules.shift_remove(name)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }
}

/// State shared by a top-level compilation and every module it pulls in.
#[derive(Debug, Default)]
pub(crate) struct CompilationContext {
    /// Compiled module bodies keyed by module path.
    pub cache: FxHashMap<String, Arc<CompiledFunction>>,
    /// Constant slots of native modules already imported, keyed by name.
    pub native: FxHashMap<String, usize>,
    /// Paths of the modules currently being compiled, outermost first.
    pub stack: Vec<String>,
}

impl CompilationContext {
    pub fn is_compiling(&self, path: &str) -> bool {
        self.stack.iter().any(|p| p == path)
    }
}

/// Options controlling module resolution.
#[derive(Debug, Clone)]
pub struct CompilerOptions {
    /// Resolve unknown module names as files under `import_dir`.
    pub allow_file_import: bool,
    pub import_dir: PathBuf,
    /// Appended to a module name that does not already end with it.
    pub import_file_ext: String,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            allow_file_import: false,
            import_dir: PathBuf::from("."),
            import_file_ext: ".skf".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_module_value_holds_only_attrs() {
        let mut attrs = IndexMap::new();
        attrs.insert("pi".to_string(), Value::Float(2.5));
        let mut map = ModuleMap::new();
        map.add_builtin_module("math", attrs);
        let value = map.get("math").and_then(Module::as_value).unwrap();
        assert_eq!(value.index_get(&Value::from("pi")).unwrap(), Value::Float(2.5));
        match value {
            Value::ImmutableMap(m) => assert_eq!(m.read().len(), 1),
            other => panic!("expected immutable map, got {:?}", other),
        }
    }

    #[test]
    fn test_source_module_has_no_value() {
        let mut map = ModuleMap::new();
        map.add_source_module("util", "export 1");
        assert!(map.get("util").unwrap().as_value().is_none());
        assert_eq!(map.names().collect::<Vec<_>>(), vec!["util"]);
    }
}
