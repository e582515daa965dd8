//! G1: the node hierarchy. Nodes are packed by type into per-phase,
//! per-partition blocks of raw bytes; execution walks phases in order,
//! running partition 0 before partition 1 is allowed to overlap with the
//! next phase (§3, §4.8, §5).

use std::alloc::{alloc, dealloc, realloc, Layout};
use std::any::TypeId;
use std::collections::HashMap;
use std::ptr;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::jobs::JobScheduler;
use crate::memory::Resource;

use super::registry::{EntryFn, NodeRegistry, NodeTypeKey};

/// A growable byte buffer aligned to a fixed, type-chosen alignment rather
/// than `align_of::<u8>()`. `Vec<u8>` only ever contracts for byte
/// alignment, so a node type wider than that (a SIMD payload, an explicitly
/// over-aligned struct) would otherwise get misaligned reads/writes through
/// the `*mut T` casts in `push`/`get`/`get_mut` below.
struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
    cap: usize,
    align: usize,
}

impl AlignedBuf {
    fn new(align: usize) -> Self {
        AlignedBuf { ptr: NonNull::dangling(), len: 0, cap: 0, align }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    fn reserve_to(&mut self, new_len: usize) {
        if new_len <= self.cap {
            return;
        }
        let new_cap = new_len.max(self.cap * 2).max(self.align);
        let new_layout = Layout::from_size_align(new_cap, self.align).unwrap();
        let new_ptr = if self.cap == 0 {
            unsafe { alloc(new_layout) }
        } else {
            let old_layout = Layout::from_size_align(self.cap, self.align).unwrap();
            unsafe { realloc(self.ptr.as_ptr(), old_layout, new_cap) }
        };
        self.ptr = NonNull::new(new_ptr).expect("node block allocation failed");
        self.cap = new_cap;
    }

    fn resize_len(&mut self, new_len: usize) {
        self.reserve_to(new_len);
        self.len = new_len;
    }

    fn truncate(&mut self, new_len: usize) {
        self.len = new_len;
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        if self.cap > 0 {
            let layout = Layout::from_size_align(self.cap, self.align).unwrap();
            unsafe { dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

/// One node type's packed storage for a single (phase, partition) slot.
struct TypeBlock {
    key: NodeTypeKey,
    elem_size: usize,
    bytes: AlignedBuf,
    graph_ids: Vec<u64>,
    drop_one: fn(*mut u8),
    entry_point: EntryFn,
    debug_entry_point: EntryFn,
}

impl TypeBlock {
    fn len(&self) -> usize {
        self.graph_ids.len()
    }

    fn is_empty(&self) -> bool {
        self.graph_ids.is_empty()
    }

    /// # Safety
    /// `T` must be the exact type this block was created for.
    unsafe fn push<T>(&mut self, graph_id: u64, value: T) -> usize {
        let idx = self.len();
        let offset = self.bytes.len();
        self.bytes.resize_len(offset + self.elem_size);
        unsafe {
            (self.bytes.as_mut_ptr().add(offset) as *mut T).write(value);
        }
        self.graph_ids.push(graph_id);
        idx
    }

    /// # Safety
    /// `T` must be the exact type this block was created for, and `idx`
    /// must be in bounds.
    unsafe fn get<T>(&self, idx: usize) -> &T {
        unsafe { &*(self.bytes.as_ptr().add(idx * self.elem_size) as *const T) }
    }

    /// # Safety
    /// Same as [`get`](Self::get).
    unsafe fn get_mut<T>(&mut self, idx: usize) -> &mut T {
        unsafe { &mut *(self.bytes.as_mut_ptr().add(idx * self.elem_size) as *mut T) }
    }

    /// Destructs the element at `idx`, then moves the block's last element
    /// into its slot (§4.8: "swaps with the last element... destructs the
    /// removed instance, shrinks the block"). Returns the graph id now
    /// occupying `idx`, if any element was displaced into it.
    fn swap_remove(&mut self, idx: usize) -> Option<u64> {
        let len = self.len();
        debug_assert!(idx < len);
        unsafe {
            let elem_ptr = self.bytes.as_mut_ptr().add(idx * self.elem_size);
            (self.drop_one)(elem_ptr);
            if idx != len - 1 {
                let last_ptr = self.bytes.as_ptr().add((len - 1) * self.elem_size);
                ptr::copy_nonoverlapping(last_ptr, elem_ptr, self.elem_size);
            }
        }
        self.bytes.truncate((len - 1) * self.elem_size);
        self.graph_ids.swap_remove(idx);
        if idx < self.graph_ids.len() {
            Some(self.graph_ids[idx])
        } else {
            None
        }
    }
}

impl Drop for TypeBlock {
    fn drop(&mut self) {
        for i in 0..self.len() {
            unsafe { (self.drop_one)(self.bytes.as_mut_ptr().add(i * self.elem_size)) };
        }
    }
}

#[derive(Clone, Copy)]
struct NodeLocation {
    key: NodeTypeKey,
    partition: usize,
    index: usize,
}

struct GraphInfo {
    phases: Vec<Option<NodeLocation>>,
}

/// Phase/partition storage, type registry, and per-graph indices for a set
/// of graphs executed together (§3: "Node graph", §4.8).
pub struct NodeHierarchy {
    max_phases: usize,
    /// `blocks[phase][partition]` is the set of type-blocks live in that
    /// (phase, partition) slot.
    blocks: Vec<[Vec<TypeBlock>; 2]>,
    /// `type_to_block_index[phase][partition]` maps a type key to its index
    /// in `blocks[phase][partition]`, for O(1) append by type (§3).
    type_to_block_index: Vec<[HashMap<NodeTypeKey, usize>; 2]>,
    graph_info: HashMap<u64, GraphInfo>,
    registry: Arc<NodeRegistry>,
    type_keys: HashMap<TypeId, NodeTypeKey>,
    debug: AtomicBool,
}

impl NodeHierarchy {
    pub fn new(max_phases: usize, registry: Arc<NodeRegistry>, type_keys: HashMap<TypeId, NodeTypeKey>) -> Self {
        NodeHierarchy {
            max_phases,
            blocks: (0..max_phases).map(|_| [Vec::new(), Vec::new()]).collect(),
            type_to_block_index: (0..max_phases).map(|_| [HashMap::new(), HashMap::new()]).collect(),
            graph_info: HashMap::new(),
            registry,
            type_keys,
            debug: AtomicBool::new(false),
        }
    }

    pub fn set_debug(&self, debug: bool) {
        self.debug.store(debug, Ordering::Relaxed);
    }

    /// Widens graph `graph_id`'s per-phase slot vector to at least
    /// `offset + phase_count` entries (§3, §6: `reserve(g, n)`).
    pub fn reserve(&mut self, graph_id: u64, phase_count: usize, offset: usize) {
        let entry = self.graph_info.entry(graph_id).or_insert_with(|| GraphInfo { phases: Vec::new() });
        let needed = offset + phase_count;
        if entry.phases.len() < needed {
            entry.phases.resize(needed, None);
        }
    }

    fn key_of<T: 'static>(&self) -> NodeTypeKey {
        *self.type_keys.get(&TypeId::of::<T>()).expect("node type not registered")
    }

    fn block_for<T: 'static>(&mut self, phase: usize, partition: usize, key: NodeTypeKey) -> usize {
        if let Some(&idx) = self.type_to_block_index[phase][partition].get(&key) {
            return idx;
        }
        let vt = self.registry.get(key).expect("node type not registered");
        let block = TypeBlock {
            key,
            elem_size: vt.elem_size,
            bytes: AlignedBuf::new(vt.elem_align),
            graph_ids: Vec::new(),
            drop_one: vt.drop_one,
            entry_point: vt.entry_point,
            debug_entry_point: vt.debug_entry_point,
        };
        let idx = self.blocks[phase][partition].len();
        self.blocks[phase][partition].push(block);
        self.type_to_block_index[phase][partition].insert(key, idx);
        idx
    }

    /// Appends one `T` node into the matching type-block for `(phase,
    /// is_final_node)`, records its index in the graph's per-phase slot, and
    /// grows the block's `graph_ids` (§4.8).
    pub fn add<T: 'static>(&mut self, graph_id: u64, phase: usize, is_final_node: bool, value: T) -> usize {
        let partition = is_final_node as usize;
        let key = self.key_of::<T>();
        let block_idx = self.block_for::<T>(phase, partition, key);
        let index = unsafe { self.blocks[phase][partition][block_idx].push(graph_id, value) };

        let info = self.graph_info.entry(graph_id).or_insert_with(|| GraphInfo { phases: Vec::new() });
        if info.phases.len() <= phase {
            info.phases.resize(phase + 1, None);
        }
        info.phases[phase] = Some(NodeLocation { key, partition, index });
        index
    }

    pub fn get<T: 'static>(&self, graph_id: u64, phase: usize, is_final_node: bool) -> Option<&T> {
        let loc = self.location(graph_id, phase, is_final_node)?;
        let block_idx = *self.type_to_block_index[phase][loc.partition].get(&loc.key)?;
        Some(unsafe { self.blocks[phase][loc.partition][block_idx].get::<T>(loc.index) })
    }

    pub fn get_mut<T: 'static>(&mut self, graph_id: u64, phase: usize, is_final_node: bool) -> Option<&mut T> {
        let loc = self.location(graph_id, phase, is_final_node)?;
        let block_idx = *self.type_to_block_index[phase][loc.partition].get(&loc.key)?;
        Some(unsafe { self.blocks[phase][loc.partition][block_idx].get_mut::<T>(loc.index) })
    }

    /// The node's current offset within its type-block, needed by callers
    /// of [`remove`](Self::remove) (§4.8: `remove<T>(g, p, k, final)` takes
    /// the block offset `k` directly rather than re-deriving it).
    pub fn index_of<T: 'static>(&self, graph_id: u64, phase: usize, is_final_node: bool) -> Option<usize> {
        self.location(graph_id, phase, is_final_node).map(|loc| loc.index)
    }

    fn location(&self, graph_id: u64, phase: usize, is_final_node: bool) -> Option<NodeLocation> {
        let loc = *self.graph_info.get(&graph_id)?.phases.get(phase)?.as_ref()?;
        if (loc.partition == 1) != is_final_node {
            return None;
        }
        Some(loc)
    }

    /// Removes the `T` node at block offset `offset` in `(phase,
    /// is_final_node)`, fixes up whichever graph got swapped into that slot,
    /// and clears `graph_id`'s own back-pointer for this phase (§4.8,
    /// tested by the swap-remove-consistency property of §8).
    pub fn remove<T: 'static>(&mut self, graph_id: u64, phase: usize, offset: usize, is_final_node: bool) {
        let partition = is_final_node as usize;
        let key = self.key_of::<T>();
        let Some(&block_idx) = self.type_to_block_index[phase][partition].get(&key) else { return };

        let displaced = self.blocks[phase][partition][block_idx].swap_remove(offset);
        if let Some(displaced_graph) = displaced {
            if let Some(loc) = self.graph_info.get_mut(&displaced_graph).and_then(|g| g.phases.get_mut(phase)).and_then(|s| s.as_mut()) {
                loc.index = offset;
            }
        }
        if let Some(slot) = self.graph_info.get_mut(&graph_id).and_then(|g| g.phases.get_mut(phase)) {
            *slot = None;
        }

        if self.blocks[phase][partition][block_idx].is_empty() {
            self.remove_block(phase, partition, key, block_idx);
        }
    }

    fn remove_block(&mut self, phase: usize, partition: usize, key: NodeTypeKey, block_idx: usize) {
        let last = self.blocks[phase][partition].len() - 1;
        self.blocks[phase][partition].swap_remove(block_idx);
        self.type_to_block_index[phase][partition].remove(&key);
        if block_idx != last {
            let moved_key = self.blocks[phase][partition][block_idx].key;
            self.type_to_block_index[phase][partition].insert(moved_key, block_idx);
        }
    }

    /// Clears every node belonging to `graph_id` across its reserved
    /// phases, via each type's registered `clear` (§6: `clear(g, n)`).
    pub fn clear(&mut self, graph_id: u64, resource: &dyn Resource) {
        let phases = match self.graph_info.get(&graph_id) {
            Some(info) => info.phases.clone(),
            None => return,
        };
        for (phase, slot) in phases.into_iter().enumerate() {
            let Some(loc) = slot else { continue };
            if let Some(&block_idx) = self.type_to_block_index[phase][loc.partition].get(&loc.key) {
                let block = &mut self.blocks[phase][loc.partition][block_idx];
                let vt = self.registry.get(loc.key).expect("node type not registered");
                let start = loc.index * block.elem_size;
                let end = start + block.elem_size;
                let slice = &mut block.bytes.as_mut_slice()[start..end];
                (vt.clear)(resource, slice);
            }
        }
        self.graph_info.remove(&graph_id);
    }

    fn phase_has_nodes(&self, phase: usize) -> bool {
        !self.blocks[phase][0].is_empty() || !self.blocks[phase][1].is_empty()
    }

    fn partition_has_nodes(&self, phase: usize, partition: usize) -> bool {
        self.blocks[phase][partition].iter().any(|b| !b.is_empty())
    }

    /// Runs every type-block in `(phase, partition)` via `parallel_for`, one
    /// task per block; each block's own registered entry point may further
    /// fan out internally (§4.8: "entry point contract").
    fn run_partition(&mut self, phase: usize, partition: usize, user_data: *mut (), scheduler: &Arc<JobScheduler>) {
        let debug = self.debug.load(Ordering::Relaxed);
        let blocks = &mut self.blocks[phase][partition];
        let user_data_addr = user_data as usize;

        if debug {
            for block in blocks.iter_mut() {
                (block.debug_entry_point)(block.bytes.as_mut_slice(), user_data_addr as *mut (), scheduler);
            }
            return;
        }

        // Each block is independent of its siblings in the same partition,
        // so they can run concurrently; `parallel_for` gives us that for
        // free by treating "one task per block" as the index range. Pass
        // addresses rather than raw pointers across the task boundary since
        // `*mut TypeBlock` itself is not `Send`.
        let block_addrs: Vec<usize> = blocks.iter_mut().map(|b| b as *mut TypeBlock as usize).collect();
        let scheduler_for_tasks = scheduler.clone();
        scheduler.parallel_for(0, block_addrs.len(), 1, 1, move |i| {
            // SAFETY: each index names a distinct block; no two tasks touch
            // the same `TypeBlock`.
            let block = unsafe { &mut *(block_addrs[i] as *mut TypeBlock) };
            (block.entry_point)(block.bytes.as_mut_slice(), user_data_addr as *mut (), &scheduler_for_tasks);
        });
    }

    /// Executes every phase in order (§4.8). Partition 0 of phase `p`
    /// always completes before partition 1 of phase `p` or phase `p+1`
    /// begin; partition 1 of phase `p` is then run concurrently with phase
    /// `p+1` (§5's ordering guarantee).
    pub fn run(&mut self, user_data: *mut (), scheduler: &Arc<JobScheduler>) {
        let user_data_addr = user_data as usize;
        let hierarchy_ptr = self as *mut NodeHierarchy as usize;
        run_from_phase(hierarchy_ptr, 0, user_data_addr, scheduler);
    }
}

fn run_from_phase(hierarchy_ptr: usize, phase: usize, user_data_addr: usize, scheduler: &Arc<JobScheduler>) {
    let hierarchy = unsafe { &mut *(hierarchy_ptr as *mut NodeHierarchy) };
    if phase >= hierarchy.max_phases {
        return;
    }

    if !hierarchy.phase_has_nodes(phase) {
        run_from_phase(hierarchy_ptr, phase + 1, user_data_addr, scheduler);
        return;
    }

    hierarchy.run_partition(phase, 0, user_data_addr as *mut (), scheduler);

    if hierarchy.partition_has_nodes(phase, 1) {
        let scheduler_a = scheduler.clone();
        let scheduler_b = scheduler.clone();
        scheduler.parallel_invoke(
            move || {
                let hierarchy = unsafe { &mut *(hierarchy_ptr as *mut NodeHierarchy) };
                hierarchy.run_partition(phase, 1, user_data_addr as *mut (), &scheduler_a);
            },
            move || run_from_phase(hierarchy_ptr, phase + 1, user_data_addr, &scheduler_b),
        );
    } else {
        run_from_phase(hierarchy_ptr, phase + 1, user_data_addr, scheduler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::registry::make_key;
    use crate::memory::monotonic::MonotonicResource;
    use std::sync::atomic::AtomicU32;

    struct Counter(u32);

    fn entry(bytes: &mut [u8], _user_data: *mut (), _scheduler: &JobScheduler) {
        let n = bytes.len() / std::mem::size_of::<Counter>();
        for i in 0..n {
            let c = unsafe { &mut *(bytes.as_mut_ptr().add(i * std::mem::size_of::<Counter>()) as *mut Counter) };
            c.0 += 1;
        }
    }
    fn noop_copy(_r: &dyn Resource, _dst: &mut [u8], _src: &[u8]) {}
    fn noop_clear(_r: &dyn Resource, bytes: &mut [u8]) {
        let n = bytes.len() / std::mem::size_of::<Counter>();
        for i in 0..n {
            unsafe { ptr::drop_in_place(bytes.as_mut_ptr().add(i * std::mem::size_of::<Counter>()) as *mut Counter) };
        }
    }

    fn build_registry() -> (Arc<NodeRegistry>, HashMap<TypeId, NodeTypeKey>) {
        let mut registry = NodeRegistry::new();
        let key = make_key(0, 1);
        registry.register::<Counter>(key, entry, entry, noop_copy, noop_clear);
        let mut type_keys = HashMap::new();
        type_keys.insert(TypeId::of::<Counter>(), key);
        (Arc::new(registry), type_keys)
    }

    #[test]
    fn add_then_get_round_trips() {
        let (registry, type_keys) = build_registry();
        let mut h = NodeHierarchy::new(4, registry, type_keys);
        h.add(1, 0, false, Counter(7));
        assert_eq!(h.get::<Counter>(1, 0, false).unwrap().0, 7);
    }

    #[test]
    fn swap_remove_fixes_up_the_displaced_graph() {
        let (registry, type_keys) = build_registry();
        let mut h = NodeHierarchy::new(4, registry, type_keys);
        h.add(1, 0, false, Counter(1));
        h.add(2, 0, false, Counter(2));
        h.add(3, 0, false, Counter(3));

        // remove the first node (graph 1); graph 3 (the block's last
        // element) should be swapped into offset 0.
        h.remove::<Counter>(1, 0, 0, false);

        let loc3 = h.location(3, 0, false).unwrap();
        assert_eq!(loc3.index, 0);
        assert_eq!(h.get::<Counter>(3, 0, false).unwrap().0, 3);
        assert_eq!(h.get::<Counter>(2, 0, false).unwrap().0, 2);
    }

    #[test]
    fn removing_the_last_node_drops_the_block() {
        let (registry, type_keys) = build_registry();
        let mut h = NodeHierarchy::new(2, registry, type_keys);
        h.add(1, 0, false, Counter(1));
        h.remove::<Counter>(1, 0, 0, false);
        assert!(h.type_to_block_index[0][0].is_empty());
    }

    #[test]
    fn run_invokes_entry_point_on_every_block() {
        let (registry, type_keys) = build_registry();
        let mut h = NodeHierarchy::new(2, registry, type_keys);
        h.add(1, 0, false, Counter(0));
        h.add(2, 0, false, Counter(0));

        let scheduler = JobScheduler::new(2, 1);
        h.run(std::ptr::null_mut(), &scheduler);

        assert_eq!(h.get::<Counter>(1, 0, false).unwrap().0, 1);
        assert_eq!(h.get::<Counter>(2, 0, false).unwrap().0, 1);
        scheduler.shutdown();
    }

    #[test]
    fn clear_drops_every_node_and_forgets_the_graph() {
        let (registry, type_keys) = build_registry();
        let mut h = NodeHierarchy::new(2, registry, type_keys);
        h.add(1, 0, false, Counter(1));
        let backing = MonotonicResource::new(4096);
        h.clear(1, &backing);
        assert!(h.location(1, 0, false).is_none());
    }
}
