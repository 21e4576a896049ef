use crate::runtime::{
    error::{RuntimeError, RuntimeResult},
    globals::GlobalStore,
    registers::RegisterTable,
    value::Value,
};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ScopeError {
    #[error("Scope handle {index} is no longer alive")]
    Stale { index: u32 },
}

/// Generation-checked handle into a [`ScopeArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScopeId {
    index: u32,
    generation: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeKind {
    Root,
    Function,
    Block,
}

#[derive(Clone, Debug)]
pub struct Scope {
    pub parent: Option<ScopeId>,
    pub kind: ScopeKind,
    symbols: Vec<(String, Value)>,
}

impl Scope {
    fn new(parent: Option<ScopeId>, kind: ScopeKind) -> Self {
        Self {
            parent,
            kind,
            symbols: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.symbols
            .iter()
            .find(|(symbol, _)| symbol == name)
            .map(|(_, value)| value)
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.symbols
            .iter_mut()
            .find(|(symbol, _)| symbol == name)
            .map(|(_, value)| value)
    }

    fn define(&mut self, name: &str, value: Value) {
        match self.get_mut(name) {
            Some(slot) => *slot = value,
            None => self.symbols.push((name.to_string(), value)),
        }
    }

    pub fn symbols(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.symbols
            .iter()
            .map(|(name, value)| (name.as_str(), value))
    }
}

#[derive(Clone, Debug)]
struct ArenaSlot {
    generation: u32,
    scope: Option<Scope>,
}

#[derive(Clone, Debug, Default)]
pub struct ScopeArena {
    slots: Vec<ArenaSlot>,
    free: Vec<u32>,
}

impl ScopeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, parent: Option<ScopeId>, kind: ScopeKind) -> ScopeId {
        let scope = Scope::new(parent, kind);
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.scope = Some(scope);
            return ScopeId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(ArenaSlot {
            generation: 0,
            scope: Some(scope),
        });
        ScopeId {
            index,
            generation: 0,
        }
    }

    pub fn release(&mut self, id: ScopeId) {
        if let Some(slot) = self.slots.get_mut(id.index as usize) {
            if slot.generation == id.generation && slot.scope.take().is_some() {
                self.free.push(id.index);
            }
        }
    }

    pub fn get(&self, id: ScopeId) -> Result<&Scope, ScopeError> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.scope.as_ref())
            .ok_or(ScopeError::Stale { index: id.index })
    }

    pub fn get_mut(&mut self, id: ScopeId) -> Result<&mut Scope, ScopeError> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.scope.as_mut())
            .ok_or(ScopeError::Stale { index: id.index })
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.scope.is_some()).count()
    }
}

/// Whether assigning to an unknown name creates it in the root scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeclarationMode {
    Strict,
    Implicit,
}

/// Where a resolved name lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reference {
    Local(ScopeId),
    Constant,
    Register(usize),
    Global,
}

/// Scope chain plus the per-script constant and register tables and the shared
/// global store.
#[derive(Clone, Debug)]
pub struct Environment {
    arena: ScopeArena,
    root: ScopeId,
    constants: HashMap<String, Value>,
    registers: RegisterTable,
    globals: GlobalStore,
}

impl Environment {
    pub fn new(register_capacity: usize, globals: GlobalStore) -> Self {
        let mut arena = ScopeArena::new();
        let root = arena.alloc(None, ScopeKind::Root);
        Self {
            arena,
            root,
            constants: HashMap::new(),
            registers: RegisterTable::new(register_capacity),
            globals,
        }
    }

    pub fn root(&self) -> ScopeId {
        self.root
    }

    pub fn globals(&self) -> &GlobalStore {
        &self.globals
    }

    /// Publishes global writes staged while `onInit` ran.
    pub fn commit_globals(&mut self) {
        self.globals = self.globals.commit();
    }

    pub fn registers(&self) -> &RegisterTable {
        &self.registers
    }

    pub fn push_scope(&mut self, parent: ScopeId, kind: ScopeKind) -> ScopeId {
        self.arena.alloc(Some(parent), kind)
    }

    pub fn pop_scope(&mut self, id: ScopeId) {
        if id != self.root {
            self.arena.release(id);
        }
    }

    pub fn live_scopes(&self) -> usize {
        self.arena.live_count()
    }

    pub fn resolve(&self, scope: ScopeId, name: &str) -> RuntimeResult<Option<Reference>> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let frame = self.arena.get(id)?;
            if frame.get(name).is_some() {
                return Ok(Some(Reference::Local(id)));
            }
            current = frame.parent;
        }
        if self.constants.contains_key(name) {
            return Ok(Some(Reference::Constant));
        }
        if let Some(index) = self.registers.index_of(name) {
            return Ok(Some(Reference::Register(index)));
        }
        if self.globals.contains(name) {
            return Ok(Some(Reference::Global));
        }
        Ok(None)
    }

    pub fn read(&self, reference: Reference, name: &str) -> RuntimeResult<Value> {
        let value = match reference {
            Reference::Local(id) => self.arena.get(id)?.get(name).cloned(),
            Reference::Constant => self.constants.get(name).cloned(),
            Reference::Register(index) => self.registers.get(index).cloned(),
            Reference::Global => self.globals.get(name),
        };
        value.ok_or_else(|| RuntimeError::UnknownSymbol {
            name: name.to_string(),
        })
    }

    pub fn lookup(&self, scope: ScopeId, name: &str) -> RuntimeResult<Option<Value>> {
        match self.resolve(scope, name)? {
            Some(reference) => self.read(reference, name).map(Some),
            None => Ok(None),
        }
    }

    pub fn assign(
        &mut self,
        scope: ScopeId,
        name: &str,
        value: Value,
        mode: DeclarationMode,
    ) -> RuntimeResult<()> {
        match self.resolve(scope, name)? {
            Some(Reference::Local(id)) => {
                self.arena.get_mut(id)?.define(name, value);
                Ok(())
            }
            Some(Reference::Constant) => Err(RuntimeError::ImmutableBinding {
                name: name.to_string(),
            }),
            Some(Reference::Register(index)) => self.registers.set(index, value),
            Some(Reference::Global) => {
                self.globals.set(name, value);
                Ok(())
            }
            None => match mode {
                DeclarationMode::Implicit => {
                    let root = self.root;
                    self.arena.get_mut(root)?.define(name, value);
                    Ok(())
                }
                DeclarationMode::Strict => Err(RuntimeError::UndeclaredAssignment {
                    name: name.to_string(),
                }),
            },
        }
    }

    pub fn declare_local(&mut self, scope: ScopeId, name: &str, value: Value) -> RuntimeResult<()> {
        if self.constants.contains_key(name) {
            return Err(RuntimeError::DuplicateDeclaration {
                name: name.to_string(),
            });
        }
        self.arena.get_mut(scope)?.define(name, value);
        Ok(())
    }

    pub fn declare_constant(&mut self, name: &str, value: Value) -> RuntimeResult<()> {
        if self.constants.contains_key(name) {
            return Err(RuntimeError::ImmutableBinding {
                name: name.to_string(),
            });
        }
        self.constants.insert(name.to_string(), value);
        Ok(())
    }

    pub fn declare_register(&mut self, name: &str, value: Value) -> RuntimeResult<usize> {
        self.registers.declare(name, value)
    }

    pub fn declare_global(&mut self, name: &str, value: Option<Value>) {
        self.globals.declare(name, value);
    }

    /// Variables from `scope` up to the nearest function scope, or up to the
    /// root scope for top-level code.
    pub fn frame_locals(&self, scope: ScopeId) -> RuntimeResult<Vec<(String, Value)>> {
        let mut out = Vec::new();
        let mut current = Some(scope);
        while let Some(id) = current {
            let frame = self.arena.get(id)?;
            for (name, value) in frame.symbols() {
                if !out.iter().any(|(existing, _): &(String, Value)| existing == name) {
                    out.push((name.to_string(), value.clone()));
                }
            }
            if frame.kind != ScopeKind::Block {
                break;
            }
            current = frame.parent;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> Environment {
        Environment::new(8, GlobalStore::new())
    }

    #[test]
    fn stale_handles_are_rejected_after_reuse() {
        let mut arena = ScopeArena::new();
        let first = arena.alloc(None, ScopeKind::Block);
        arena.release(first);
        let second = arena.alloc(None, ScopeKind::Block);
        assert!(arena.get(first).is_err());
        assert!(arena.get(second).is_ok());
    }

    #[test]
    fn resolution_prefers_lexical_scope_over_tables() {
        let mut env = env();
        env.declare_constant("x", Value::Int(1)).unwrap();
        let root = env.root();
        let func = env.push_scope(root, ScopeKind::Function);
        env.arena.get_mut(func).unwrap().define("y", Value::Int(2));
        assert_eq!(env.resolve(func, "y").unwrap(), Some(Reference::Local(func)));
        assert_eq!(env.resolve(func, "x").unwrap(), Some(Reference::Constant));
    }

    #[test]
    fn strict_assignment_to_unknown_name_fails() {
        let mut env = env();
        let root = env.root();
        let err = env
            .assign(root, "ghost", Value::Int(1), DeclarationMode::Strict)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::UndeclaredAssignment { .. }));
    }

    #[test]
    fn implicit_assignment_lands_in_root() {
        let mut env = env();
        let root = env.root();
        let block = env.push_scope(root, ScopeKind::Block);
        env.assign(block, "made", Value::Int(5), DeclarationMode::Implicit)
            .unwrap();
        env.pop_scope(block);
        assert!(matches!(env.lookup(root, "made").unwrap(), Some(Value::Int(5))));
    }

    #[test]
    fn constants_cannot_be_reassigned() {
        let mut env = env();
        let root = env.root();
        env.declare_constant("k", Value::Int(1)).unwrap();
        let err = env
            .assign(root, "k", Value::Int(2), DeclarationMode::Implicit)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ImmutableBinding { .. }));
    }

    #[test]
    fn frame_locals_stop_at_function_scope() {
        let mut env = env();
        let root = env.root();
        env.declare_local(root, "outer", Value::Int(0)).unwrap();
        let func = env.push_scope(root, ScopeKind::Function);
        env.declare_local(func, "arg", Value::Int(1)).unwrap();
        let block = env.push_scope(func, ScopeKind::Block);
        env.declare_local(block, "inner", Value::Int(2)).unwrap();
        let names: Vec<String> = env
            .frame_locals(block)
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["inner".to_string(), "arg".to_string()]);
    }
}
