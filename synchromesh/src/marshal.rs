//! Marshalling for the payload variants the runtime ships between peers:
//! scalars, fixed arrays, resizable sequences, key-value maps, sharded
//! arrays, and heterogeneous value sequences.
//!
//! Payload bytes travel in native layout; counts and registry ids travel as
//! native-endian words. Every sub-send consumes one tag from a [`TagSeq`],
//! so a receiver walking the same structure from the same base tag matches
//! each sub-send no matter how the transport interleaves them.

use std::collections::BTreeMap;
use std::mem::size_of;

use byteorder::{ByteOrder, NativeEndian};
use bytemuck::{Pod, Zeroable};

use synchromesh_communication::rpc::{Request, RequestGroup, Rpc, Tag};
use synchromesh_communication::shard::ShardCalc;

use crate::registry::{registry, DataId, TypeSpec};

/// Hands out the consecutive tags one logical transfer consumes.
///
/// Worker and syncer construct sequences from the same base; as long as
/// both traverse the same payload structure, every sub-send and its
/// matching receive agree on a tag.
#[derive(Clone, Copy, Debug)]
pub struct TagSeq {
    cursor: Tag,
}

impl TagSeq {
    pub fn new(base: Tag) -> Self {
        TagSeq { cursor: base }
    }

    /// The tag the next sub-operation will consume.
    pub fn peek(&self) -> Tag {
        self.cursor
    }

    /// Consumes and returns the next tag.
    pub fn next(&mut self) -> Tag {
        let tag = self.cursor;
        self.cursor += 1;
        tag
    }
}

/// Byte storage aligned for any primitive element type.
///
/// Backing the buffer with words keeps typed views (`cast_slice`) valid for
/// elements up to eight-byte alignment.
#[derive(Clone, Debug, Default)]
struct AlignedBytes {
    words: Vec<u64>,
    len: usize,
}

impl AlignedBytes {
    fn with_len(len: usize) -> Self {
        AlignedBytes {
            words: vec![0; (len + 7) / 8],
            len,
        }
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = Self::with_len(bytes.len());
        buf.as_mut_slice().copy_from_slice(bytes);
        buf
    }

    fn resize(&mut self, len: usize) {
        self.words.resize((len + 7) / 8, 0);
        self.len = len;
    }

    fn len(&self) -> usize {
        self.len
    }

    fn as_slice(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.len]
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.len]
    }
}

/// A fixed-size record.
#[derive(Clone, Debug)]
pub struct PodValue {
    id: DataId,
    bytes: AlignedBytes,
}

impl PodValue {
    pub fn get<T: Pod>(&self) -> T {
        assert_eq!(self.bytes.len(), size_of::<T>(), "scalar size mismatch");
        bytemuck::pod_read_unaligned(self.bytes.as_slice())
    }

    pub fn set<T: Pod>(&mut self, value: T) {
        assert_eq!(self.bytes.len(), size_of::<T>(), "scalar size mismatch");
        self.bytes.as_mut_slice().copy_from_slice(bytemuck::bytes_of(&value));
    }
}

/// A contiguous array whose element count is fixed at registration.
#[derive(Clone, Debug)]
pub struct ArrayValue {
    id: DataId,
    elem_size: usize,
    bytes: AlignedBytes,
}

/// A resizable homogeneous sequence; the element count prefixes the payload.
#[derive(Clone, Debug)]
pub struct SeqValue {
    id: DataId,
    elem_size: usize,
    bytes: AlignedBytes,
}

/// A resizable numeric region that the sharded strategy may scatter across
/// a group.
#[derive(Clone, Debug)]
pub struct ShardedValue {
    id: DataId,
    elem_size: usize,
    bytes: AlignedBytes,
}

impl ShardedValue {
    pub(crate) fn elem_size(&self) -> usize {
        self.elem_size
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len() / self.elem_size
    }

    /// Sends the shard `slot` of `workers` to `dst`: the fragment's element
    /// count, then its raw bytes.
    pub fn send_fragment(
        &self,
        rpc: &dyn Rpc,
        dst: usize,
        workers: usize,
        slot: usize,
        tags: &mut TagSeq,
    ) -> RequestGroup {
        let calc = ShardCalc::new(self.len(), self.elem_size, workers);
        let mut reqs = RequestGroup::new();
        reqs.add(send_word(rpc, dst, tags.next(), calc.num_elems(slot) as u64));
        reqs.add(rpc.send_data(
            dst,
            tags.next(),
            &self.bytes.as_slice()[calc.start_byte(slot)..calc.end_byte(slot)],
        ));
        reqs
    }

    /// Receives the shard `slot` of `workers` from `src` into place.
    pub(crate) fn recv_fragment(
        &mut self,
        rpc: &dyn Rpc,
        src: usize,
        workers: usize,
        slot: usize,
        tags: &mut TagSeq,
    ) {
        let calc = ShardCalc::new(self.len(), self.elem_size, workers);
        let count = recv_word(rpc, src, tags.next()) as usize;
        assert_eq!(
            count,
            calc.num_elems(slot),
            "fragment size mismatch from worker {}",
            src
        );
        let range = calc.start_byte(slot)..calc.end_byte(slot);
        rpc.recv_data(Some(src), Some(tags.next()), &mut self.bytes.as_mut_slice()[range]);
    }
}

/// A keyed collection of fixed-size keys and values. Entries are held and
/// transmitted in byte-lexicographic key order.
#[derive(Clone, Debug)]
pub struct MapValue {
    id: DataId,
    key_size: usize,
    val_size: usize,
    entries: BTreeMap<Box<[u8]>, Box<[u8]>>,
}

impl MapValue {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert<K: Pod, V: Pod>(&mut self, key: K, value: V) {
        assert_eq!(size_of::<K>(), self.key_size, "map key size mismatch");
        assert_eq!(size_of::<V>(), self.val_size, "map value size mismatch");
        self.entries.insert(
            bytemuck::bytes_of(&key).into(),
            bytemuck::bytes_of(&value).into(),
        );
    }

    pub fn get<K: Pod, V: Pod>(&self, key: &K) -> Option<V> {
        assert_eq!(size_of::<K>(), self.key_size, "map key size mismatch");
        assert_eq!(size_of::<V>(), self.val_size, "map value size mismatch");
        self.entries
            .get(bytemuck::bytes_of(key))
            .map(|bytes| bytemuck::pod_read_unaligned(bytes))
    }
}

/// An ordered list of heterogeneous values, each shipped behind its
/// registry id so the receiver can reconstruct it.
#[derive(Clone, Debug)]
pub struct ValueSeq {
    id: DataId,
    items: Vec<Value>,
}

impl ValueSeq {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, value: Value) {
        self.items.push(value);
    }

    pub fn get(&self, index: usize) -> &Value {
        &self.items[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.items.iter()
    }
}

/// A marshalled value: one of the closed set of payload variants.
#[derive(Clone, Debug)]
pub enum Value {
    Pod(PodValue),
    Array(ArrayValue),
    Seq(SeqValue),
    Map(MapValue),
    Sharded(ShardedValue),
    Values(ValueSeq),
}

impl Value {
    /// A scalar holding `value`. The type must be registered.
    pub fn pod<T: Pod + 'static>(value: T) -> Value {
        let id = registry().pod_id::<T>();
        Value::Pod(PodValue {
            id,
            bytes: AlignedBytes::from_bytes(bytemuck::bytes_of(&value)),
        })
    }

    /// A fixed array holding `data`. The (type, length) pair must be
    /// registered.
    pub fn array<T: Pod + 'static>(data: &[T]) -> Value {
        let id = registry().array_id::<T>(data.len());
        Value::Array(ArrayValue {
            id,
            elem_size: size_of::<T>(),
            bytes: AlignedBytes::from_bytes(bytemuck::cast_slice(data)),
        })
    }

    /// A resizable sequence holding `data`.
    pub fn seq<T: Pod + 'static>(data: &[T]) -> Value {
        let id = registry().seq_id::<T>();
        Value::Seq(SeqValue {
            id,
            elem_size: size_of::<T>(),
            bytes: AlignedBytes::from_bytes(bytemuck::cast_slice(data)),
        })
    }

    /// A sharded array holding `data`.
    pub fn sharded<T: Pod + 'static>(data: &[T]) -> Value {
        let id = registry().sharded_id::<T>();
        Value::Sharded(ShardedValue {
            id,
            elem_size: size_of::<T>(),
            bytes: AlignedBytes::from_bytes(bytemuck::cast_slice(data)),
        })
    }

    /// An empty map keyed by `K` with `V` values.
    pub fn map<K: Pod + 'static, V: Pod + 'static>() -> Value {
        let id = registry().map_id::<K, V>();
        Value::Map(MapValue {
            id,
            key_size: size_of::<K>(),
            val_size: size_of::<V>(),
            entries: BTreeMap::new(),
        })
    }

    /// An empty heterogeneous value sequence.
    pub fn values() -> Value {
        Value::Values(ValueSeq {
            id: registry().values_id(),
            items: Vec::new(),
        })
    }

    /// An empty instance for `id`, used when the variant is learned from
    /// the wire.
    pub(crate) fn empty(id: DataId, spec: TypeSpec) -> Value {
        match spec {
            TypeSpec::Pod { size } => Value::Pod(PodValue {
                id,
                bytes: AlignedBytes::with_len(size),
            }),
            TypeSpec::Array { elem_size, len } => Value::Array(ArrayValue {
                id,
                elem_size,
                bytes: AlignedBytes::with_len(elem_size * len),
            }),
            TypeSpec::Seq { elem_size } => Value::Seq(SeqValue {
                id,
                elem_size,
                bytes: AlignedBytes::default(),
            }),
            TypeSpec::Map { key_size, val_size } => Value::Map(MapValue {
                id,
                key_size,
                val_size,
                entries: BTreeMap::new(),
            }),
            TypeSpec::Sharded { elem_size } => Value::Sharded(ShardedValue {
                id,
                elem_size,
                bytes: AlignedBytes::default(),
            }),
            TypeSpec::Values => Value::Values(ValueSeq {
                id,
                items: Vec::new(),
            }),
        }
    }

    /// The registry id of this value.
    pub fn id(&self) -> DataId {
        match self {
            Value::Pod(v) => v.id,
            Value::Array(v) => v.id,
            Value::Seq(v) => v.id,
            Value::Map(v) => v.id,
            Value::Sharded(v) => v.id,
            Value::Values(v) => v.id,
        }
    }

    /// True iff the sharded strategy may scatter this value.
    pub fn shardable(&self) -> bool {
        matches!(self, Value::Sharded(_))
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            Value::Pod(_) => "scalar",
            Value::Array(_) => "array",
            Value::Seq(_) => "sequence",
            Value::Map(_) => "map",
            Value::Sharded(_) => "sharded",
            Value::Values(_) => "values",
        }
    }

    /// The scalar this value holds.
    pub fn get<T: Pod>(&self) -> T {
        match self {
            Value::Pod(v) => v.get(),
            other => panic!("{} value is not a scalar", other.kind_name()),
        }
    }

    /// Replaces the scalar this value holds.
    pub fn set<T: Pod>(&mut self, value: T) {
        match self {
            Value::Pod(v) => v.set(value),
            other => panic!("{} value is not a scalar", other.kind_name()),
        }
    }

    /// The element count of an array-like or keyed value.
    pub fn len(&self) -> usize {
        match self {
            Value::Array(v) => v.bytes.len() / v.elem_size,
            Value::Seq(v) => v.bytes.len() / v.elem_size,
            Value::Sharded(v) => v.len(),
            Value::Map(v) => v.len(),
            Value::Values(v) => v.len(),
            Value::Pod(_) => panic!("scalar value has no element count"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A typed view of a contiguous value's elements.
    pub fn as_slice<T: Pod>(&self) -> &[T] {
        let (elem_size, bytes) = match self {
            Value::Array(v) => (v.elem_size, &v.bytes),
            Value::Seq(v) => (v.elem_size, &v.bytes),
            Value::Sharded(v) => (v.elem_size, &v.bytes),
            other => panic!("{} value has no contiguous elements", other.kind_name()),
        };
        assert_eq!(elem_size, size_of::<T>(), "element size mismatch");
        bytemuck::cast_slice(bytes.as_slice())
    }

    /// A mutable typed view of a contiguous value's elements.
    pub fn as_mut_slice<T: Pod>(&mut self) -> &mut [T] {
        let (elem_size, bytes) = match self {
            Value::Array(v) => (v.elem_size, &mut v.bytes),
            Value::Seq(v) => (v.elem_size, &mut v.bytes),
            Value::Sharded(v) => (v.elem_size, &mut v.bytes),
            other => panic!("{} value has no contiguous elements", other.kind_name()),
        };
        assert_eq!(elem_size, size_of::<T>(), "element size mismatch");
        bytemuck::cast_slice_mut(bytes.as_mut_slice())
    }

    pub fn as_map(&self) -> &MapValue {
        match self {
            Value::Map(v) => v,
            other => panic!("{} value is not a map", other.kind_name()),
        }
    }

    pub fn as_map_mut(&mut self) -> &mut MapValue {
        match self {
            Value::Map(v) => v,
            other => panic!("{} value is not a map", other.kind_name()),
        }
    }

    pub fn as_values(&self) -> &ValueSeq {
        match self {
            Value::Values(v) => v,
            other => panic!("{} value is not a value sequence", other.kind_name()),
        }
    }

    pub fn as_values_mut(&mut self) -> &mut ValueSeq {
        match self {
            Value::Values(v) => v,
            other => panic!("{} value is not a value sequence", other.kind_name()),
        }
    }

    pub fn as_sharded(&self) -> &ShardedValue {
        match self {
            Value::Sharded(v) => v,
            other => panic!("sharding {} values is not supported", other.kind_name()),
        }
    }

    pub(crate) fn as_sharded_mut(&mut self) -> &mut ShardedValue {
        match self {
            Value::Sharded(v) => v,
            other => panic!("sharding {} values is not supported", other.kind_name()),
        }
    }

    /// Encodes this value to `dst`, consuming one tag per sub-send.
    pub fn send(&self, rpc: &dyn Rpc, dst: usize, tags: &mut TagSeq) -> RequestGroup {
        let mut reqs = RequestGroup::new();
        match self {
            Value::Pod(v) => reqs.add(rpc.send_data(dst, tags.next(), v.bytes.as_slice())),
            Value::Array(v) => reqs.add(rpc.send_data(dst, tags.next(), v.bytes.as_slice())),
            Value::Seq(v) => {
                reqs.add(send_word(rpc, dst, tags.next(), (v.bytes.len() / v.elem_size) as u64));
                reqs.add(rpc.send_data(dst, tags.next(), v.bytes.as_slice()));
            }
            Value::Sharded(v) => {
                reqs.add(send_word(rpc, dst, tags.next(), v.len() as u64));
                reqs.add(rpc.send_data(dst, tags.next(), v.bytes.as_slice()));
            }
            Value::Map(v) => {
                reqs.add(send_word(rpc, dst, tags.next(), v.entries.len() as u64));
                for (key, value) in &v.entries {
                    reqs.add(rpc.send_data(dst, tags.next(), key));
                    reqs.add(rpc.send_data(dst, tags.next(), value));
                }
            }
            Value::Values(v) => {
                reqs.add(send_word(rpc, dst, tags.next(), v.items.len() as u64));
                for item in &v.items {
                    reqs.add(send_word(rpc, dst, tags.next(), item.id()));
                    reqs.merge(item.send(rpc, dst, tags));
                }
            }
        }
        reqs
    }

    /// Decodes a value of this variant from `src` in place, consuming the
    /// same tags the sender did.
    pub fn recv(&mut self, rpc: &dyn Rpc, src: usize, tags: &mut TagSeq) {
        match self {
            Value::Pod(v) => {
                rpc.recv_data(Some(src), Some(tags.next()), v.bytes.as_mut_slice());
            }
            Value::Array(v) => {
                rpc.recv_data(Some(src), Some(tags.next()), v.bytes.as_mut_slice());
            }
            Value::Seq(v) => {
                let count = recv_word(rpc, src, tags.next()) as usize;
                v.bytes.resize(count * v.elem_size);
                rpc.recv_data(Some(src), Some(tags.next()), v.bytes.as_mut_slice());
            }
            Value::Sharded(v) => {
                let count = recv_word(rpc, src, tags.next()) as usize;
                v.bytes.resize(count * v.elem_size);
                rpc.recv_data(Some(src), Some(tags.next()), v.bytes.as_mut_slice());
            }
            Value::Map(v) => {
                let count = recv_word(rpc, src, tags.next()) as usize;
                v.entries.clear();
                for _ in 0..count {
                    let mut key = vec![0u8; v.key_size];
                    rpc.recv_data(Some(src), Some(tags.next()), &mut key);
                    let mut value = vec![0u8; v.val_size];
                    rpc.recv_data(Some(src), Some(tags.next()), &mut value);
                    v.entries.insert(key.into_boxed_slice(), value.into_boxed_slice());
                }
            }
            Value::Values(v) => {
                let count = recv_word(rpc, src, tags.next()) as usize;
                v.items.clear();
                for _ in 0..count {
                    let id = recv_word(rpc, src, tags.next());
                    let mut item = registry().make_value(id);
                    item.recv(rpc, src, tags);
                    v.items.push(item);
                }
            }
        }
    }
}

/// Sends `value` prefixed by its registry id, for receivers that do not
/// know the variant ahead of time.
pub fn send_with_id(value: &Value, rpc: &dyn Rpc, dst: usize, tags: &mut TagSeq) -> RequestGroup {
    let mut reqs = RequestGroup::new();
    reqs.add(send_word(rpc, dst, tags.next(), value.id()));
    reqs.merge(value.send(rpc, dst, tags));
    reqs
}

/// Reads a registry id from `src`, constructs an empty instance through the
/// registry, and decodes it.
pub fn recv_with_id(rpc: &dyn Rpc, src: usize, tags: &mut TagSeq) -> Value {
    let id = recv_word(rpc, src, tags.next());
    let mut value = registry().make_value(id);
    value.recv(rpc, src, tags);
    value
}

/// Sends one fixed-size record on a single tag.
pub fn send_pod<T: Pod>(rpc: &dyn Rpc, dst: usize, tag: Tag, value: &T) -> Box<dyn Request> {
    rpc.send_data(dst, tag, bytemuck::bytes_of(value))
}

/// Receives one fixed-size record, returning the concrete source.
pub fn recv_pod<T: Pod>(rpc: &dyn Rpc, src: Option<usize>, tag: Tag) -> (usize, T) {
    let mut value = T::zeroed();
    let (src, _tag) = rpc.recv_data(src, Some(tag), bytemuck::bytes_of_mut(&mut value));
    (src, value)
}

/// Sends a count or id as a native-endian word.
pub(crate) fn send_word(rpc: &dyn Rpc, dst: usize, tag: Tag, word: u64) -> Box<dyn Request> {
    let mut buf = [0u8; 8];
    NativeEndian::write_u64(&mut buf, word);
    rpc.send_data(dst, tag, &buf)
}

pub(crate) fn recv_word(rpc: &dyn Rpc, src: usize, tag: Tag) -> u64 {
    let mut buf = [0u8; 8];
    rpc.recv_data(Some(src), Some(tag), &mut buf);
    NativeEndian::read_u64(&buf)
}
