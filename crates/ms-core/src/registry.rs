//! Shared parameter registry.
//!
//! Every model registers its parameters into one [`ParameterRegistry`].
//! Entries are keyed by fully-qualified name (`global.<name>` or
//! `<model>.<name>`); the ordinal of an entry in name order is the column
//! it occupies in the minimizer's flat parameter vector.

use crate::parameter::Parameter;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Prefix of parameters shared across models.
pub const GLOBAL_PREFIX: &str = "global";

/// Registry handle shared by the composition root and the minimizer.
pub type SharedRegistry = Rc<RefCell<ParameterRegistry>>;

/// Fully-qualified name of `name` as declared by model `owner`.
pub fn qualified_name(owner: &str, name: &str, global: bool) -> String {
    if global { format!("{GLOBAL_PREFIX}.{name}") } else { format!("{owner}.{name}") }
}

/// Mapping from fully-qualified name to [`Parameter`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterRegistry {
    params: BTreeMap<String, Parameter>,
}

impl ParameterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry behind a shared handle.
    pub fn shared() -> SharedRegistry {
        Rc::new(RefCell::new(Self::new()))
    }

    /// Number of registered parameters.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    /// Insert `par` under its current name unless the name is taken.
    ///
    /// Returns `false` (and drops `par`) when an entry already exists.
    pub fn insert_if_absent(&mut self, par: Parameter) -> bool {
        if self.params.contains_key(par.name()) {
            return false;
        }
        self.params.insert(par.name().to_string(), par);
        true
    }

    /// Parameter by fully-qualified name.
    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.get(name)
    }

    /// Mutable parameter by fully-qualified name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.params.get_mut(name)
    }

    /// Column index of `name` in the flat parameter vector.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.params.keys().position(|k| k == name)
    }

    /// Parameter at column `index`.
    pub fn get_by_index(&self, index: usize) -> Option<&Parameter> {
        self.params.values().nth(index)
    }

    /// Parameters in column order.
    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.values()
    }

    /// Mutable parameters in column order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Parameter> {
        self.params.values_mut()
    }

    /// Fully-qualified names in column order.
    pub fn names(&self) -> Vec<String> {
        self.params.keys().cloned().collect()
    }
}
