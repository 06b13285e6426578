use std::sync::Arc;

use rustc_hash::FxHashMap;

/// Where a symbol's value lives at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolScope {
    Global,
    Local,
    Builtin,
    Free,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub name: Arc<str>,
    pub scope: SymbolScope,
    pub index: usize,
    /// Set once a local has been stored to. Unassigned locals are invisible
    /// to non-recursive resolution so `a := a + 1` reads an outer `a`.
    pub local_assigned: bool,
}

pub type ScopeId = usize;
pub type SymbolId = usize;

#[derive(Debug, Clone)]
struct Scope {
    parent: Option<ScopeId>,
    /// Block scopes share slot numbering with the enclosing function.
    block: bool,
    store: FxHashMap<Arc<str>, SymbolId>,
    num_definition: usize,
    max_definition: usize,
    /// Original symbols captured by this function scope, in capture order.
    free_symbols: Vec<SymbolId>,
}

impl Scope {
    fn new(parent: Option<ScopeId>, block: bool) -> Self {
        Self {
            parent,
            block,
            store: FxHashMap::default(),
            num_definition: 0,
            max_definition: 0,
            free_symbols: Vec::new(),
        }
    }
}

/// Lexical scopes of one compilation unit, stored as an arena.
///
/// The table always has a current scope. `fork` enters a child scope and
/// `unfork` returns to its parent; scopes are never freed, so symbol ids
/// stay valid for the lifetime of the table.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    scopes: Vec<Scope>,
    symbols: Vec<Symbol>,
    current: ScopeId,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope::new(None, false)],
            symbols: Vec::new(),
            current: 0,
        }
    }

    /// A table pre-seeded with every builtin function.
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        for builtin in skiff_object::Builtin::ALL {
            table.define_builtin(builtin.index() as usize, builtin.name());
        }
        table
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id]
    }

    pub fn current_scope(&self) -> ScopeId {
        self.current
    }

    /// Define `name` in the current scope. Symbols defined outside any
    /// function are global, with slots counted at the root.
    pub fn define(&mut self, name: &str) -> SymbolId {
        let index = self.next_index(self.current);
        let scope = if self.enclosing_function(self.current).is_none() {
            SymbolScope::Global
        } else {
            SymbolScope::Local
        };
        if scope == SymbolScope::Global && self.current != 0 {
            self.scopes[0].num_definition += 1;
        } else {
            self.scopes[self.current].num_definition += 1;
        }
        let id = self.push_symbol(name, scope, index);
        self.update_max_defs(self.current, index + 1);
        id
    }

    pub fn define_builtin(&mut self, index: usize, name: &str) -> SymbolId {
        self.push_symbol(name, SymbolScope::Builtin, index)
    }

    /// Whether the current scope is inside a function (or module body).
    pub fn in_function(&self) -> bool {
        self.enclosing_function(self.current).is_some()
    }

    pub fn mark_assigned(&mut self, id: SymbolId) {
        self.symbols[id].local_assigned = true;
    }

    /// Look `name` up from the current scope outwards. Crossing a function
    /// boundary turns locals of the outer function into free symbols of
    /// every function crossed. Returns the symbol and how many scopes were
    /// crossed.
    pub fn resolve(&mut self, name: &str, recur: bool) -> Option<(SymbolId, usize)> {
        self.resolve_in(self.current, name, recur)
    }

    fn resolve_in(&mut self, scope: ScopeId, name: &str, recur: bool) -> Option<(SymbolId, usize)> {
        if let Some(&id) = self.scopes[scope].store.get(name) {
            let symbol = &self.symbols[id];
            if symbol.scope != SymbolScope::Local || symbol.local_assigned || recur {
                return Some((id, 0));
            }
        }
        let parent = self.scopes[scope].parent?;
        let (id, depth) = self.resolve_in(parent, name, true)?;
        let depth = depth + 1;
        let found = self.symbols[id].scope;
        if !self.scopes[scope].block
            && found != SymbolScope::Global
            && found != SymbolScope::Builtin
        {
            return Some((self.define_free(scope, id), depth));
        }
        Some((id, depth))
    }

    fn define_free(&mut self, scope: ScopeId, original: SymbolId) -> SymbolId {
        self.scopes[scope].free_symbols.push(original);
        let index = self.scopes[scope].free_symbols.len() - 1;
        let name = self.symbols[original].name.clone();
        let id = self.symbols.len();
        self.symbols.push(Symbol {
            name: name.clone(),
            scope: SymbolScope::Free,
            index,
            local_assigned: false,
        });
        self.scopes[scope].store.insert(name, id);
        id
    }

    /// Enter a child scope. A block scope continues the enclosing
    /// function's slot numbering.
    pub fn fork(&mut self, block: bool) -> ScopeId {
        let id = self.scopes.len();
        self.scopes.push(Scope::new(Some(self.current), block));
        self.current = id;
        id
    }

    /// Return to the parent of the current scope.
    pub fn unfork(&mut self) {
        if let Some(parent) = self.scopes[self.current].parent {
            self.current = parent;
        }
    }

    /// Highest number of slots the current scope ever needed at once.
    pub fn max_symbols(&self) -> usize {
        self.scopes[self.current].max_definition
    }

    /// Original symbols captured by the current function scope.
    pub fn free_symbols(&self) -> &[SymbolId] {
        &self.scopes[self.current].free_symbols
    }

    pub fn builtin_symbols(&self) -> Vec<&Symbol> {
        let root = self.root_of(self.current);
        let mut builtins: Vec<&Symbol> = self.scopes[root]
            .store
            .values()
            .map(|&id| &self.symbols[id])
            .filter(|s| s.scope == SymbolScope::Builtin)
            .collect();
        builtins.sort_by_key(|s| s.index);
        builtins
    }

    /// Names defined directly in the current scope, sorted.
    pub fn names(&self) -> Vec<Arc<str>> {
        let mut names: Vec<Arc<str>> = self.scopes[self.current].store.keys().cloned().collect();
        names.sort();
        names
    }

    // ---
    // Helpers
    // ---

    fn push_symbol(&mut self, name: &str, scope: SymbolScope, index: usize) -> SymbolId {
        let name: Arc<str> = Arc::from(name);
        let id = self.symbols.len();
        self.symbols.push(Symbol {
            name: name.clone(),
            scope,
            index,
            local_assigned: false,
        });
        self.scopes[self.current].store.insert(name, id);
        id
    }

    /// The nearest non-block ancestor of `scope` (excluding `scope`
    /// itself), or `None` at the top level.
    fn enclosing_function(&self, scope: ScopeId) -> Option<ScopeId> {
        let mut s = scope;
        while self.scopes[s].block {
            s = self.scopes[s].parent?;
        }
        self.scopes[s].parent
    }

    fn root_of(&self, mut scope: ScopeId) -> ScopeId {
        while let Some(parent) = self.scopes[scope].parent {
            scope = parent;
        }
        scope
    }

    fn next_index(&self, scope: ScopeId) -> usize {
        let s = &self.scopes[scope];
        match s.parent {
            Some(parent) if s.block => self.next_index(parent) + s.num_definition,
            _ => s.num_definition,
        }
    }

    fn update_max_defs(&mut self, scope: ScopeId, num_defs: usize) {
        let s = &mut self.scopes[scope];
        if num_defs > s.max_definition {
            s.max_definition = num_defs;
        }
        if let (true, Some(parent)) = (s.block, s.parent) {
            self.update_max_defs(parent, num_defs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect(table: &mut SymbolTable, name: &str, scope: SymbolScope, index: usize, depth: usize) {
        let (id, d) = table.resolve(name, false).unwrap();
        let symbol = table.symbol(id);
        assert_eq!((symbol.scope, symbol.index, d), (scope, index, depth), "{}", name);
    }

    #[test]
    fn test_globals_and_locals() {
        let mut t = SymbolTable::new();
        t.define("a");
        t.define("b");
        t.fork(false);
        let c = t.define("c");
        t.mark_assigned(c);
        expect(&mut t, "a", SymbolScope::Global, 0, 1);
        expect(&mut t, "c", SymbolScope::Local, 0, 0);
    }

    #[test]
    fn test_global_block_counts_at_root() {
        let mut t = SymbolTable::new();
        t.define("a");
        t.fork(true);
        let b = t.define("b");
        assert_eq!(t.symbol(b).scope, SymbolScope::Global);
        assert_eq!(t.symbol(b).index, 1);
        t.unfork();
        let c = t.define("c");
        assert_eq!(t.symbol(c).index, 2);
    }

    #[test]
    fn test_block_slots_are_reused() {
        let mut t = SymbolTable::new();
        t.fork(false);
        t.define("x");
        t.fork(true);
        let y = t.define("y");
        assert_eq!(t.symbol(y).index, 1);
        t.unfork();
        t.fork(true);
        let z = t.define("z");
        assert_eq!(t.symbol(z).index, 1);
        t.unfork();
        assert_eq!(t.max_symbols(), 2);
    }

    #[test]
    fn test_free_symbols_across_functions() {
        let mut t = SymbolTable::new();
        t.fork(false);
        let a = t.define("a");
        t.mark_assigned(a);
        t.fork(false);
        t.fork(false);
        expect(&mut t, "a", SymbolScope::Free, 0, 2);
        assert_eq!(t.free_symbols().len(), 1);
        let middle_original = t.free_symbols()[0];
        assert_eq!(t.symbol(middle_original).scope, SymbolScope::Free);
        t.unfork();
        assert_eq!(t.free_symbols(), &[a]);
    }

    #[test]
    fn test_unassigned_local_is_skipped() {
        let mut t = SymbolTable::new();
        t.fork(false);
        let outer = t.define("a");
        t.mark_assigned(outer);
        t.fork(true);
        t.define("a");
        let (id, depth) = t.resolve("a", false).unwrap();
        assert_eq!(id, outer);
        assert_eq!(depth, 1);
    }

    #[test]
    fn test_builtins() {
        let mut t = SymbolTable::with_builtins();
        expect(&mut t, "len", SymbolScope::Builtin, 0, 0);
        t.fork(false);
        expect(&mut t, "len", SymbolScope::Builtin, 0, 1);
        assert!(t.free_symbols().is_empty());
        assert_eq!(t.builtin_symbols().len(), skiff_object::Builtin::ALL.len());
    }

    #[test]
    fn test_unresolved() {
        let mut t = SymbolTable::new();
        assert!(t.resolve("nope", false).is_none());
    }
}
