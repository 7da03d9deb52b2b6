//! The process-wide registries: marshalled-value variants and update
//! functions.
//!
//! Both registries are populated by a single, explicit [`bootstrap`] call
//! executed before any transport activity. Ids are handed out by monotonic
//! counters as registrations arrive, so every peer running the same
//! bootstrap computes identical ids. After bootstrap the registries are
//! immutable and reads are lock-free.

use std::any::TypeId;
use std::collections::HashMap;
use std::mem::size_of;
use std::sync::OnceLock;

use bytemuck::Pod;

use crate::marshal::Value;
use crate::sync::{Noop, SyncFn};

/// Registry id of a marshalled-value variant.
pub type DataId = u64;

/// Registry id of an update function.
pub type UpdateFnId = u64;

const FIRST_DATA_ID: DataId = 1000;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum RegKey {
    Pod(TypeId),
    Array(TypeId, usize),
    Seq(TypeId),
    Map(TypeId, TypeId),
    Sharded(TypeId),
    Values,
}

/// Everything needed to rebuild an empty instance from an id.
#[derive(Clone, Copy, Debug)]
pub(crate) enum TypeSpec {
    Pod { size: usize },
    Array { elem_size: usize, len: usize },
    Seq { elem_size: usize },
    Map { key_size: usize, val_size: usize },
    Sharded { elem_size: usize },
    Values,
}

pub struct Registry {
    ids: HashMap<RegKey, DataId>,
    specs: Vec<TypeSpec>,
    update_ids: HashMap<TypeId, UpdateFnId>,
    update_fns: Vec<fn() -> Box<dyn SyncFn>>,
}

impl Registry {
    fn new() -> Self {
        Registry {
            ids: HashMap::new(),
            specs: Vec::new(),
            update_ids: HashMap::new(),
            update_fns: Vec::new(),
        }
    }

    /// Registers the built-in variants, in a fixed order: the value
    /// sequence, then scalar/sequence/sharded triples for each primitive
    /// numeric type, then the no-op update function as id 0.
    fn install_builtins(&mut self) {
        self.intern(RegKey::Values, TypeSpec::Values);

        macro_rules! builtins {
            ($reg:ident, $($t:ty),*) => {$(
                $reg.register_pod::<$t>();
                $reg.register_seq::<$t>();
                $reg.register_sharded::<$t>();
            )*}
        }
        builtins!(self, u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

        self.register_update::<Noop>();
    }

    fn intern(&mut self, key: RegKey, spec: TypeSpec) -> DataId {
        if let Some(&id) = self.ids.get(&key) {
            return id;
        }
        let id = FIRST_DATA_ID + self.specs.len() as DataId;
        self.ids.insert(key, id);
        self.specs.push(spec);
        id
    }

    pub fn register_pod<T: Pod + 'static>(&mut self) -> DataId {
        self.intern(
            RegKey::Pod(TypeId::of::<T>()),
            TypeSpec::Pod { size: size_of::<T>() },
        )
    }

    pub fn register_array<T: Pod + 'static>(&mut self, len: usize) -> DataId {
        self.intern(
            RegKey::Array(TypeId::of::<T>(), len),
            TypeSpec::Array { elem_size: size_of::<T>(), len },
        )
    }

    pub fn register_seq<T: Pod + 'static>(&mut self) -> DataId {
        self.intern(
            RegKey::Seq(TypeId::of::<T>()),
            TypeSpec::Seq { elem_size: size_of::<T>() },
        )
    }

    pub fn register_sharded<T: Pod + 'static>(&mut self) -> DataId {
        self.intern(
            RegKey::Sharded(TypeId::of::<T>()),
            TypeSpec::Sharded { elem_size: size_of::<T>() },
        )
    }

    pub fn register_map<K: Pod + 'static, V: Pod + 'static>(&mut self) -> DataId {
        self.intern(
            RegKey::Map(TypeId::of::<K>(), TypeId::of::<V>()),
            TypeSpec::Map {
                key_size: size_of::<K>(),
                val_size: size_of::<V>(),
            },
        )
    }

    /// Registers an update function. Ids are dense, in registration order.
    pub fn register_update<F: SyncFn + Default + 'static>(&mut self) -> UpdateFnId {
        fn make<F: SyncFn + Default + 'static>() -> Box<dyn SyncFn> {
            Box::new(F::default())
        }
        if let Some(&id) = self.update_ids.get(&TypeId::of::<F>()) {
            return id;
        }
        let id = self.update_fns.len() as UpdateFnId;
        self.update_ids.insert(TypeId::of::<F>(), id);
        self.update_fns.push(make::<F>);
        id
    }

    fn lookup(&self, key: RegKey) -> DataId {
        *self
            .ids
            .get(&key)
            .expect("type not registered; add it to the bootstrap registration")
    }

    pub(crate) fn values_id(&self) -> DataId {
        self.lookup(RegKey::Values)
    }

    pub(crate) fn pod_id<T: Pod + 'static>(&self) -> DataId {
        self.lookup(RegKey::Pod(TypeId::of::<T>()))
    }

    pub(crate) fn array_id<T: Pod + 'static>(&self, len: usize) -> DataId {
        self.lookup(RegKey::Array(TypeId::of::<T>(), len))
    }

    pub(crate) fn seq_id<T: Pod + 'static>(&self) -> DataId {
        self.lookup(RegKey::Seq(TypeId::of::<T>()))
    }

    pub(crate) fn sharded_id<T: Pod + 'static>(&self) -> DataId {
        self.lookup(RegKey::Sharded(TypeId::of::<T>()))
    }

    pub(crate) fn map_id<K: Pod + 'static, V: Pod + 'static>(&self) -> DataId {
        self.lookup(RegKey::Map(TypeId::of::<K>(), TypeId::of::<V>()))
    }

    pub(crate) fn spec(&self, id: DataId) -> TypeSpec {
        let index = id
            .checked_sub(FIRST_DATA_ID)
            .filter(|&i| (i as usize) < self.specs.len())
            .unwrap_or_else(|| panic!("unknown registry id {}", id));
        self.specs[index as usize]
    }

    /// Builds an empty instance for `id`, for receivers that learn the
    /// variant from the wire.
    pub(crate) fn make_value(&self, id: DataId) -> Value {
        Value::empty(id, self.spec(id))
    }

    /// A fresh update-function object for `id`.
    pub(crate) fn update_fn(&self, id: UpdateFnId) -> Box<dyn SyncFn> {
        let make = self
            .update_fns
            .get(id as usize)
            .unwrap_or_else(|| panic!("unknown update function id {}", id));
        make()
    }

    pub(crate) fn update_fn_id<F: 'static>(&self) -> UpdateFnId {
        *self
            .update_ids
            .get(&TypeId::of::<F>())
            .expect("update function not registered; add it to the bootstrap registration")
    }
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Installs the built-in variants and the caller's registrations, exactly
/// once per process, before any transport activity.
///
/// Every peer must run the same bootstrap: ids are assigned in registration
/// order, and the wire format identifies payloads by id alone.
pub fn bootstrap<F: FnOnce(&mut Registry)>(f: F) {
    let mut reg = Registry::new();
    reg.install_builtins();
    f(&mut reg);
    if REGISTRY.set(reg).is_err() {
        panic!("synchromesh bootstrap may only run once per process");
    }
}

/// The process-wide registry. Panics if [`bootstrap`] has not run.
pub(crate) fn registry() -> &'static Registry {
    REGISTRY
        .get()
        .expect("synchromesh bootstrap must run before any marshalling")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    #[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
    struct Custom {
        a: u32,
        b: u32,
    }

    fn fresh() -> Registry {
        let mut reg = Registry::new();
        reg.install_builtins();
        reg
    }

    #[test]
    fn ids_start_at_one_thousand() {
        let reg = fresh();
        assert_eq!(reg.values_id(), 1000);
        assert_eq!(reg.pod_id::<u8>(), 1001);
        assert_eq!(reg.seq_id::<u8>(), 1002);
        assert_eq!(reg.sharded_id::<u8>(), 1003);
    }

    #[test]
    fn identical_registrations_agree_across_instances() {
        let mut a = fresh();
        let mut b = fresh();
        let ids_a = (a.register_pod::<Custom>(), a.register_map::<i32, i32>());
        let ids_b = (b.register_pod::<Custom>(), b.register_map::<i32, i32>());
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn registration_is_idempotent() {
        let mut reg = fresh();
        let first = reg.register_pod::<Custom>();
        let second = reg.register_pod::<Custom>();
        assert_eq!(first, second);
    }

    #[test]
    fn same_element_different_variant_gets_distinct_ids() {
        let mut reg = fresh();
        let pod = reg.register_pod::<Custom>();
        let seq = reg.register_seq::<Custom>();
        let sharded = reg.register_sharded::<Custom>();
        assert_ne!(pod, seq);
        assert_ne!(seq, sharded);
    }

    #[test]
    fn noop_update_is_id_zero() {
        let reg = fresh();
        assert_eq!(reg.update_fn_id::<crate::sync::Noop>(), 0);
    }

    #[test]
    #[should_panic(expected = "unknown registry id")]
    fn unknown_id_is_fatal() {
        let reg = fresh();
        reg.spec(999);
    }
}
