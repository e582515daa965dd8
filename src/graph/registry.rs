//! G1 registration: every node type registers a small table of function
//! pointers keyed by `(group_id << 8) | type_id` (§4.8). Dispatch over node
//! types is by function pointer rather than a trait object, so a type-block
//! can pack its elements as raw bytes instead of `Box<dyn Node>` per node.

use std::collections::HashMap;
use std::ptr;

use crate::jobs::JobScheduler;
use crate::memory::Resource;

/// `(group_id << 8) | type_id`, the composite key §4.8 registers function
/// pointers under.
pub type NodeTypeKey = u16;

pub fn make_key(group_id: u8, type_id: u8) -> NodeTypeKey {
    ((group_id as u16) << 8) | type_id as u16
}

/// Runs every node packed in `block_bytes` (a contiguous run of `T`), given
/// an opaque user-data pointer and the scheduler an entry point may fan work
/// out onto (§4.8: "it may internally use `parallel_for` over its own
/// elements").
pub type EntryFn = fn(block_bytes: &mut [u8], user_data: *mut (), scheduler: &JobScheduler);

/// Deep-copies one element's bytes from `src` into `dst` through `resource`
/// (for node types that own resource-backed data of their own).
pub type CopyFn = fn(resource: &dyn Resource, dst_bytes: &mut [u8], src_bytes: &[u8]);

/// Destructs every element packed in `bytes` (drop, not dealloc -- the block
/// storage itself is owned by the hierarchy).
pub type ClearFn = fn(resource: &dyn Resource, bytes: &mut [u8]);

/// The four function pointers a node type registers, plus the per-element
/// layout/drop metadata the hierarchy needs to pack/move/destruct single
/// elements during `add`/`remove` (§4.8).
pub struct NodeVTable {
    pub elem_size: usize,
    pub elem_align: usize,
    pub entry_point: EntryFn,
    pub debug_entry_point: EntryFn,
    pub copy: CopyFn,
    pub clear: ClearFn,
    pub(crate) drop_one: fn(*mut u8),
}

/// Maps a node type's key to its vtable. Populated once at start-up, read
/// thereafter -- registration is not on any hot path.
#[derive(Default)]
pub struct NodeRegistry {
    types: HashMap<NodeTypeKey, NodeVTable>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        NodeRegistry { types: HashMap::new() }
    }

    /// Registers `T` under `key`. `entry_point`/`debug_entry_point` operate
    /// on the whole block's bytes and are supplied by the node type's
    /// author; `drop_one` (used by `remove<T>`) and the block's element
    /// layout are derived generically from `T` so the caller never has to
    /// hand-write unsafe glue.
    pub fn register<T: 'static>(
        &mut self,
        key: NodeTypeKey,
        entry_point: EntryFn,
        debug_entry_point: EntryFn,
        copy: CopyFn,
        clear: ClearFn,
    ) {
        let vtable = NodeVTable {
            elem_size: std::mem::size_of::<T>(),
            elem_align: std::mem::align_of::<T>(),
            entry_point,
            debug_entry_point,
            copy,
            clear,
            drop_one: drop_one::<T>,
        };
        self.types.insert(key, vtable);
    }

    pub fn get(&self, key: NodeTypeKey) -> Option<&NodeVTable> {
        self.types.get(&key)
    }
}

fn drop_one<T>(ptr: *mut u8) {
    unsafe { ptr::drop_in_place(ptr as *mut T) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Resource;

    struct Dummy(u32);

    fn noop_entry(_bytes: &mut [u8], _user_data: *mut (), _scheduler: &JobScheduler) {}
    fn noop_copy(_r: &dyn Resource, _dst: &mut [u8], _src: &[u8]) {}
    fn noop_clear(_r: &dyn Resource, _bytes: &mut [u8]) {}

    #[test]
    fn key_packs_group_and_type() {
        assert_eq!(make_key(1, 2), (1u16 << 8) | 2);
    }

    #[test]
    fn registered_type_reports_its_own_layout() {
        let mut registry = NodeRegistry::new();
        registry.register::<Dummy>(make_key(0, 1), noop_entry, noop_entry, noop_copy, noop_clear);
        let vt = registry.get(make_key(0, 1)).unwrap();
        assert_eq!(vt.elem_size, std::mem::size_of::<Dummy>());
        assert_eq!(vt.elem_align, std::mem::align_of::<Dummy>());
    }
}
