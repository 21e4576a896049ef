use crate::runtime::{
    error::{RuntimeError, RuntimeResult},
    value::{Value, ValueKind},
};
use std::collections::HashMap;

#[derive(Clone, Debug)]
struct RegisterSlot {
    name: String,
    value: Value,
    kind: Option<ValueKind>,
}

/// Fixed-capacity table of fast variables. A slot's type is locked by its first
/// non-undefined write.
#[derive(Clone, Debug)]
pub struct RegisterTable {
    capacity: usize,
    slots: Vec<RegisterSlot>,
    names: HashMap<String, usize>,
}

impl RegisterTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Vec::with_capacity(capacity),
            names: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.get(name).copied()
    }

    pub fn declare(&mut self, name: &str, value: Value) -> RuntimeResult<usize> {
        if let Some(index) = self.index_of(name) {
            self.set(index, value)?;
            return Ok(index);
        }
        if self.slots.len() >= self.capacity {
            return Err(RuntimeError::RegisterCapacity {
                capacity: self.capacity,
            });
        }
        let index = self.slots.len();
        self.slots.push(RegisterSlot {
            name: name.to_string(),
            value: Value::Undefined,
            kind: None,
        });
        self.names.insert(name.to_string(), index);
        self.set(index, value)?;
        Ok(index)
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.slots.get(index).map(|slot| &slot.value)
    }

    pub fn set(&mut self, index: usize, value: Value) -> RuntimeResult<()> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| RuntimeError::Unsupported {
                message: format!("register index {index} is out of range"),
            })?;
        let incoming = value.kind();
        match slot.kind {
            Some(expected) if expected != incoming => {
                return Err(RuntimeError::RegisterType {
                    name: slot.name.clone(),
                    expected: expected.to_string(),
                    found: incoming.to_string(),
                });
            }
            None if incoming != ValueKind::Undefined => slot.kind = Some(incoming),
            _ => {}
        }
        slot.value = value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_write_locks_the_type() {
        let mut table = RegisterTable::new(4);
        let idx = table.declare("gain", Value::Double(0.5)).unwrap();
        table.set(idx, Value::Int(1)).unwrap();
        let err = table.set(idx, Value::from("loud")).unwrap_err();
        assert!(matches!(err, RuntimeError::RegisterType { .. }));
    }

    #[test]
    fn undefined_declaration_defers_the_lock() {
        let mut table = RegisterTable::new(2);
        let idx = table.declare("r", Value::Undefined).unwrap();
        table.set(idx, Value::Bool(true)).unwrap();
        assert!(table.set(idx, Value::Int(3)).is_err());
    }

    #[test]
    fn capacity_is_enforced() {
        let mut table = RegisterTable::new(1);
        table.declare("a", Value::Int(1)).unwrap();
        let err = table.declare("b", Value::Int(2)).unwrap_err();
        assert!(matches!(err, RuntimeError::RegisterCapacity { capacity: 1 }));
    }
}
