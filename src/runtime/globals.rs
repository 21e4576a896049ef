use crate::runtime::value::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

type Values = Arc<Mutex<HashMap<String, Value>>>;

/// Key/value store shared by every script instance of a host.
///
/// A staging view keeps its writes in a private overlay until
/// [`commit`](Self::commit); a compile that fails drops the view and leaves
/// the shared values untouched.
#[derive(Clone, Debug, Default)]
pub struct GlobalStore {
    values: Values,
    staged: Option<Values>,
}

impl GlobalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A view that reads through to this store but keeps writes to itself.
    pub fn staging(&self) -> Self {
        Self {
            values: Arc::clone(&self.values),
            staged: Some(Values::default()),
        }
    }

    pub fn is_staging(&self) -> bool {
        self.staged.is_some()
    }

    /// Publishes staged writes and returns the plain shared store.
    pub fn commit(&self) -> Self {
        if let Some(staged) = &self.staged {
            let pending = std::mem::take(&mut *staged.lock());
            self.values.lock().extend(pending);
        }
        Self {
            values: Arc::clone(&self.values),
            staged: None,
        }
    }

    fn writes(&self) -> &Values {
        self.staged.as_ref().unwrap_or(&self.values)
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(staged) = &self.staged {
            if let Some(value) = staged.lock().get(name) {
                return Some(value.clone());
            }
        }
        self.values.lock().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.staged
            .as_ref()
            .is_some_and(|staged| staged.lock().contains_key(name))
            || self.values.lock().contains_key(name)
    }

    pub fn set(&self, name: &str, value: Value) {
        self.writes().lock().insert(name.to_string(), value);
    }

    /// Declares `name`, keeping an existing value when no initialiser is given.
    pub fn declare(&self, name: &str, value: Option<Value>) {
        match value {
            Some(value) => self.set(name, value),
            None => {
                if !self.contains(name) {
                    self.set(name, Value::Undefined);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        let shared = self.values.lock();
        let fresh = self.staged.as_ref().map_or(0, |staged| {
            staged
                .lock()
                .keys()
                .filter(|key| !shared.contains_key(*key))
                .count()
        });
        shared.len() + fresh
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
