//! Named variable tables.

use std::collections::BTreeMap;

use bytemuck::Pod;

use crate::marshal::{MapValue, Value};

/// A named set of variables, always traversed in lexicographic name order.
///
/// The traversal order is what keeps two peers' tag sequences aligned when
/// they walk the same table from the same base tag, so it is part of the
/// wire contract, not a convenience.
#[derive(Clone, Debug, Default)]
pub struct VarTable {
    vars: BTreeMap<String, Value>,
}

impl VarTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, name: &str, value: Value) {
        let previous = self.vars.insert(name.to_string(), value);
        assert!(previous.is_none(), "variable {:?} registered twice", name);
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// Variable names in traversal order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(|name| name.as_str())
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.vars.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Value)> {
        self.vars.iter_mut().map(|(name, value)| (name.as_str(), value))
    }

    pub fn value(&self, name: &str) -> &Value {
        self.vars
            .get(name)
            .unwrap_or_else(|| panic!("no variable named {:?}", name))
    }

    pub fn value_mut(&mut self, name: &str) -> &mut Value {
        self.vars
            .get_mut(name)
            .unwrap_or_else(|| panic!("no variable named {:?}", name))
    }

    /// The scalar variable `name`.
    pub fn pod<T: Pod>(&self, name: &str) -> T {
        self.value(name).get()
    }

    /// Replaces the scalar variable `name`.
    pub fn set_pod<T: Pod>(&mut self, name: &str, value: T) {
        self.value_mut(name).set(value)
    }

    /// A typed view of the array variable `name`.
    pub fn array<T: Pod>(&self, name: &str) -> &[T] {
        self.value(name).as_slice()
    }

    /// A mutable typed view of the array variable `name`.
    pub fn array_mut<T: Pod>(&mut self, name: &str) -> &mut [T] {
        self.value_mut(name).as_mut_slice()
    }

    pub fn map(&self, name: &str) -> &MapValue {
        self.value(name).as_map()
    }

    pub fn map_mut(&mut self, name: &str) -> &mut MapValue {
        self.value_mut(name).as_map_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::bootstrap_for_tests;

    #[test]
    fn names_come_back_sorted() {
        bootstrap_for_tests();
        let mut table = VarTable::new();
        table.insert("z", Value::pod(1_u32));
        table.insert("a", Value::pod(2_u32));
        table.insert("m", Value::pod(3_u32));
        let names: Vec<&str> = table.names().collect();
        assert_eq!(names, vec!["a", "m", "z"]);
    }

    #[test]
    fn typed_accessors_reach_the_values() {
        bootstrap_for_tests();
        let mut table = VarTable::new();
        table.insert("x", Value::seq(&[1.0_f64, 2.0]));
        table.insert("n", Value::pod(9_u64));
        assert_eq!(table.pod::<u64>("n"), 9);
        table.array_mut::<f64>("x")[0] = 4.0;
        assert_eq!(table.array::<f64>("x"), &[4.0, 2.0]);
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_names_are_fatal() {
        bootstrap_for_tests();
        let mut table = VarTable::new();
        table.insert("x", Value::pod(1_u32));
        table.insert("x", Value::pod(2_u32));
    }

    #[test]
    #[should_panic(expected = "no variable named")]
    fn missing_names_are_fatal() {
        bootstrap_for_tests();
        VarTable::new().pod::<u32>("ghost");
    }
}
