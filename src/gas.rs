//! The partitioned global address space.
//!
//! Memory is handed out in blocks, each owned by exactly one node for its whole lifetime.
//! A cyclic allocation reserves one block per partition and places partition `i` on node `i % num_nodes`,
//! so ownership can be computed from the block index alone (`block % num_nodes`) without any directory lookup.
//!
//! Blocks are only ever materialized as local memory through a [PinGuard], and only on the node that owns them.
//! Remote data is reached through the dispatcher (`memget`/`memput` or an action executing on the owner).
//!
//! # Examples
//!```
//! let world = amgas::WorldBuilder::new().with_nodes(2).build();
//! let gas = world.gas();
//! let base = gas.allocate_cyclic(2, 16)?; // two 16 byte partitions, one per node
//! let first = gas.offset(base, 0, 8)?;
//! {
//!     let mut pinned = gas.pin(first)?; // partition 0 lives on node 0
//!     pinned.write(|bytes| bytes.copy_from_slice(&[1u8; 8]))?;
//! } // unpinned here
//! gas.deallocate(base)?;
//!```
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

pub(crate) mod heap;
use heap::NodeHeap;

/// Index of a node in the fixed topology (`0..num_nodes`)
pub type NodeId = usize;

/// Errors raised by address space operations
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum GasError {
    /// a node could not reserve the requested bytes (or a zero sized request was made)
    Allocation { node: NodeId, bytes: usize },
    /// a derived range does not fit inside the block it was derived from
    OutOfRange {
        offset: usize,
        len: usize,
        extent: usize,
    },
    /// the address is owned by a different node than the caller
    NotLocal { addr: GlobalAddress, caller: NodeId },
    /// the address does not name a live allocation (or names a pinned one on deallocation)
    InvalidAddress { addr: GlobalAddress, reason: String },
    /// the calling thread is already inside an access to this block
    AlreadyPinned { addr: GlobalAddress },
}

impl std::fmt::Display for GasError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            GasError::Allocation { node, bytes } => {
                write!(f, "node {} unable to allocate {} bytes", node, bytes)
            }
            GasError::OutOfRange {
                offset,
                len,
                extent,
            } => write!(
                f,
                "range [{}, {}) exceeds block extent {}",
                offset,
                offset.saturating_add(*len),
                extent
            ),
            GasError::NotLocal { addr, caller } => write!(
                f,
                "{} is owned by node {}, not by calling node {}",
                addr, addr.node, caller
            ),
            GasError::InvalidAddress { addr, reason } => {
                write!(f, "invalid address {}: {}", addr, reason)
            }
            GasError::AlreadyPinned { addr } => {
                write!(f, "{} is already being accessed by this thread", addr)
            }
        }
    }
}

impl std::error::Error for GasError {}

/// A Result type for address space operations
pub type GasResult<T> = Result<T, GasError>;

/// A globally meaningful reference to a byte range inside one block.
///
/// Addresses are plain values, they can be copied freely and shipped inside action arguments.
#[derive(
    serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct GlobalAddress {
    pub(crate) node: NodeId,
    pub(crate) block: u64,
    pub(crate) offset: usize,
    pub(crate) len: usize,
}

impl GlobalAddress {
    /// The node owning this address
    pub fn node(&self) -> NodeId {
        self.node
    }
    /// The global block index
    pub fn block(&self) -> u64 {
        self.block
    }
    /// Byte offset of this range inside its block
    pub fn offset(&self) -> usize {
        self.offset
    }
    /// Length in bytes of this range
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Display for GlobalAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "gas[node {} block {} +{}..{}]",
            self.node,
            self.block,
            self.offset,
            self.offset.saturating_add(self.len)
        )
    }
}

#[derive(Debug)]
struct Block {
    node: NodeId,
    first_block: u64, // block index of partition 0 of the owning allocation
    heap_addr: usize,
    extent: usize,
    data: RwLock<Box<[u8]>>,
    pins: AtomicUsize,
    // threads currently running an access closure against this block
    accessing: Mutex<Vec<ThreadId>>,
}

#[derive(Debug)]
struct Allocation {
    blocks: Vec<u64>,
    block_bytes: usize,
}

/// The address space shared by every node of a world.
///
/// Each node contributes a heap of fixed capacity; blocks are carved out of the owner's heap.
#[derive(Debug)]
pub struct AddressSpace {
    num_nodes: usize,
    heaps: Vec<NodeHeap>,
    blocks: RwLock<HashMap<u64, Arc<Block>>>,
    allocations: Mutex<HashMap<u64, Allocation>>,
    next_block: AtomicU64,
}

impl AddressSpace {
    pub(crate) fn new(num_nodes: usize, heap_size: usize) -> AddressSpace {
        AddressSpace {
            num_nodes,
            heaps: (0..num_nodes)
                .map(|node| NodeHeap::new(format!("node_{}_heap", node), heap_size))
                .collect(),
            blocks: RwLock::new(HashMap::new()),
            allocations: Mutex::new(HashMap::new()),
            next_block: AtomicU64::new(0),
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Node that owns a block index
    pub fn owner(&self, block: u64) -> NodeId {
        (block % self.num_nodes as u64) as NodeId
    }

    // reserves a run of block indices that starts on node 0, so block i of the run is owned by node i % num_nodes
    fn reserve_blocks(&self, count: usize) -> u64 {
        let n = self.num_nodes as u64;
        let span = (count as u64).div_ceil(n) * n;
        self.next_block.fetch_add(span, Ordering::SeqCst)
    }

    fn insert_allocation(&self, blocks: Vec<(u64, NodeId)>, block_bytes: usize) -> GasResult<u64> {
        let mut placed: Vec<(u64, NodeId, usize)> = Vec::with_capacity(blocks.len());
        for (block, node) in blocks.iter() {
            match self.heaps[*node].try_malloc(block_bytes) {
                Some(heap_addr) => placed.push((*block, *node, heap_addr)),
                None => {
                    for (_, node, heap_addr) in placed {
                        self.heaps[node].free(heap_addr);
                    }
                    tracing::debug!(
                        "allocation of {} bytes failed on node {} ({} of {} bytes in use)",
                        block_bytes,
                        node,
                        self.heaps[*node].used(),
                        self.heaps[*node].capacity()
                    );
                    return Err(GasError::Allocation {
                        node: *node,
                        bytes: block_bytes,
                    });
                }
            }
        }
        let first_block = blocks[0].0;
        let mut table = self.blocks.write();
        for (block, node, heap_addr) in placed {
            table.insert(
                block,
                Arc::new(Block {
                    node,
                    first_block,
                    heap_addr,
                    extent: block_bytes,
                    data: RwLock::new(vec![0u8; block_bytes].into_boxed_slice()),
                    pins: AtomicUsize::new(0),
                    accessing: Mutex::new(vec![]),
                }),
            );
        }
        drop(table);
        self.allocations.lock().insert(
            first_block,
            Allocation {
                blocks: blocks.iter().map(|(b, _)| *b).collect(),
                block_bytes,
            },
        );
        Ok(first_block)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    pub(crate) fn allocate_cyclic(
        &self,
        partitions: usize,
        bytes_per_partition: usize,
    ) -> GasResult<GlobalAddress> {
        if partitions == 0 || bytes_per_partition == 0 {
            return Err(GasError::Allocation {
                node: 0,
                bytes: partitions * bytes_per_partition,
            });
        }
        let base = self.reserve_blocks(partitions);
        let blocks = (0..partitions as u64)
            .map(|i| (base + i, self.owner(base + i)))
            .collect();
        let first_block = self.insert_allocation(blocks, bytes_per_partition)?;
        Ok(GlobalAddress {
            node: self.owner(first_block),
            block: first_block,
            offset: 0,
            len: bytes_per_partition,
        })
    }

    #[tracing::instrument(skip(self), level = "debug")]
    pub(crate) fn allocate_local(&self, node: NodeId, bytes: usize) -> GasResult<GlobalAddress> {
        if node >= self.num_nodes || bytes == 0 {
            return Err(GasError::Allocation { node, bytes });
        }
        let block = self.reserve_blocks(1) + node as u64;
        let first_block = self.insert_allocation(vec![(block, node)], bytes)?;
        Ok(GlobalAddress {
            node,
            block: first_block,
            offset: 0,
            len: bytes,
        })
    }

    fn block(&self, addr: &GlobalAddress) -> GasResult<Arc<Block>> {
        Self::lookup(&self.blocks.read(), addr)
    }

    fn lookup(table: &HashMap<u64, Arc<Block>>, addr: &GlobalAddress) -> GasResult<Arc<Block>> {
        match table.get(&addr.block) {
            Some(block) if block.node == addr.node => Ok(block.clone()),
            Some(_) => Err(GasError::InvalidAddress {
                addr: *addr,
                reason: "node does not own block".to_owned(),
            }),
            None => Err(GasError::InvalidAddress {
                addr: *addr,
                reason: "no live allocation".to_owned(),
            }),
        }
    }

    pub(crate) fn offset(
        &self,
        base: GlobalAddress,
        byte_offset: usize,
        byte_len: usize,
    ) -> GasResult<GlobalAddress> {
        let block = self.block(&base)?;
        let end = base
            .offset
            .checked_add(byte_offset)
            .and_then(|offset| offset.checked_add(byte_len));
        match end {
            Some(end) if end <= block.extent => Ok(GlobalAddress {
                offset: base.offset + byte_offset,
                len: byte_len,
                ..base
            }),
            _ => Err(GasError::OutOfRange {
                offset: base.offset.saturating_add(byte_offset),
                len: byte_len,
                extent: block.extent,
            }),
        }
    }

    pub(crate) fn partition(&self, base: GlobalAddress, index: usize) -> GasResult<GlobalAddress> {
        let allocations = self.allocations.lock();
        let alloc = allocations
            .get(&base.block)
            .ok_or_else(|| GasError::InvalidAddress {
                addr: base,
                reason: "not the base of an allocation".to_owned(),
            })?;
        match alloc.blocks.get(index) {
            Some(block) => Ok(GlobalAddress {
                node: self.owner(*block),
                block: *block,
                offset: 0,
                len: alloc.block_bytes,
            }),
            None => Err(GasError::OutOfRange {
                offset: index * alloc.block_bytes,
                len: alloc.block_bytes,
                extent: alloc.blocks.len() * alloc.block_bytes,
            }),
        }
    }

    /// Number of partitions in the allocation whose base is `base`
    pub(crate) fn partitions(&self, base: GlobalAddress) -> GasResult<usize> {
        match self.allocations.lock().get(&base.block) {
            Some(alloc) => Ok(alloc.blocks.len()),
            None => Err(GasError::InvalidAddress {
                addr: base,
                reason: "not the base of an allocation".to_owned(),
            }),
        }
    }

    pub(crate) fn is_local(&self, caller: NodeId, addr: &GlobalAddress) -> GasResult<()> {
        if addr.node != caller {
            return Err(GasError::NotLocal {
                addr: *addr,
                caller,
            });
        }
        self.block(addr).map(|_| ())
    }

    pub(crate) fn pin(&self, caller: NodeId, addr: GlobalAddress) -> GasResult<PinGuard> {
        if addr.node != caller {
            return Err(GasError::NotLocal { addr, caller });
        }
        // counted under the table lock so a concurrent deallocate either sees the pin or wins outright
        let table = self.blocks.read();
        let block = Self::lookup(&table, &addr)?;
        match addr.offset.checked_add(addr.len) {
            Some(end) if end <= block.extent => {}
            _ => {
                return Err(GasError::OutOfRange {
                    offset: addr.offset,
                    len: addr.len,
                    extent: block.extent,
                })
            }
        }
        block.pins.fetch_add(1, Ordering::SeqCst);
        drop(table);
        Ok(PinGuard {
            addr,
            range: addr.offset..addr.offset + addr.len,
            block,
        })
    }

    #[tracing::instrument(skip(self), level = "debug")]
    pub(crate) fn deallocate(&self, addr: GlobalAddress) -> GasResult<()> {
        let mut allocations = self.allocations.lock();
        let is_base = addr.offset == 0
            && allocations.contains_key(&addr.block)
            && self.owner(addr.block) == addr.node;
        if !is_base {
            return Err(GasError::InvalidAddress {
                addr,
                reason: "not the base of a live allocation".to_owned(),
            });
        }
        let mut table = self.blocks.write();
        let blocks = &allocations[&addr.block].blocks;
        if blocks
            .iter()
            .filter_map(|b| table.get(b))
            .any(|b| b.pins.load(Ordering::SeqCst) > 0)
        {
            return Err(GasError::InvalidAddress {
                addr,
                reason: "allocation is still pinned".to_owned(),
            });
        }
        if let Some(alloc) = allocations.remove(&addr.block) {
            for b in alloc.blocks {
                if let Some(block) = table.remove(&b) {
                    debug_assert_eq!(block.first_block, addr.block);
                    self.heaps[block.node].free(block.heap_addr);
                }
            }
        }
        Ok(())
    }
}

/// A scoped, node-local materialization of a [GlobalAddress].
///
/// Holding the guard keeps the block alive: [deallocate][GasHandle::deallocate] fails while any pin is outstanding.
/// Any number of guards may pin the same block at once, from any task, and the runtime does not order their accesses;
/// handlers sharing a block coordinate through phases (control objects), not through the pin.
///
/// The bytes are only reachable inside [read][PinGuard::read] and [write][PinGuard::write]. Each call holds the block
/// for the duration of its closure only, which cannot suspend, so a pin held across an `.await` never stalls another worker.
/// Dropping the guard (or calling [unpin][PinGuard::unpin]) releases the pin on every exit path, including `?` and panics.
pub struct PinGuard {
    addr: GlobalAddress,
    range: Range<usize>,
    block: Arc<Block>,
}

// marks the current thread as inside an access to one block
struct Access<'a> {
    block: &'a Block,
    thread: ThreadId,
}

impl<'a> Access<'a> {
    fn enter(block: &'a Block, addr: GlobalAddress) -> GasResult<Access<'a>> {
        let thread = std::thread::current().id();
        let mut accessing = block.accessing.lock();
        if accessing.contains(&thread) {
            return Err(GasError::AlreadyPinned { addr });
        }
        accessing.push(thread);
        Ok(Access { block, thread })
    }
}

impl Drop for Access<'_> {
    fn drop(&mut self) {
        self.block.accessing.lock().retain(|t| *t != self.thread);
    }
}

impl PinGuard {
    pub fn addr(&self) -> GlobalAddress {
        self.addr
    }

    /// Run `op` over the pinned bytes.
    ///
    /// Fails with [GasError::AlreadyPinned] when called from inside another access to the same block on this thread.
    pub fn read<R>(&self, op: impl FnOnce(&[u8]) -> R) -> GasResult<R> {
        let _access = Access::enter(&self.block, self.addr)?;
        let data = self.block.data.read();
        Ok(op(&data[self.range.clone()]))
    }

    /// Run `op` over the pinned bytes with write access
    pub fn write<R>(&mut self, op: impl FnOnce(&mut [u8]) -> R) -> GasResult<R> {
        let _access = Access::enter(&self.block, self.addr)?;
        let mut data = self.block.data.write();
        Ok(op(&mut data[self.range.clone()]))
    }

    /// Copy of the pinned bytes
    pub fn to_vec(&self) -> GasResult<Vec<u8>> {
        self.read(|bytes| bytes.to_vec())
    }

    /// Release the pin.
    ///
    /// Equivalent to dropping the guard; taking it by value makes any later access a compile error.
    pub fn unpin(self) {}
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.block.pins.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for PinGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PinGuard({})", self.addr)
    }
}

/// A node's view of the address space.
///
/// Obtained from [NodeHandle::gas][crate::NodeHandle::gas] or [ActionContext::gas][crate::ActionContext::gas];
/// pins are resolved relative to the node this handle belongs to.
#[derive(Clone, Debug)]
pub struct GasHandle {
    pub(crate) node: NodeId,
    pub(crate) gas: Arc<AddressSpace>,
}

impl GasHandle {
    /// The node this handle pins on behalf of
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn num_nodes(&self) -> usize {
        self.gas.num_nodes
    }

    /// Reserve `partitions` blocks of `bytes_per_partition` bytes each, placed round-robin starting at node 0.
    ///
    /// The returned address is the base of the allocation: partition 0, covering its whole extent.
    /// Fails with [GasError::Allocation] (and reserves nothing) if any node cannot satisfy its share.
    pub fn allocate_cyclic(
        &self,
        partitions: usize,
        bytes_per_partition: usize,
    ) -> GasResult<GlobalAddress> {
        self.gas.allocate_cyclic(partitions, bytes_per_partition)
    }

    /// Reserve a single block on this node
    pub fn allocate_local(&self, bytes: usize) -> GasResult<GlobalAddress> {
        self.gas.allocate_local(self.node, bytes)
    }

    /// Reserve a single block on `node`
    pub fn allocate_local_at(&self, node: NodeId, bytes: usize) -> GasResult<GlobalAddress> {
        self.gas.allocate_local(node, bytes)
    }

    /// Derive the sub-range `[byte_offset, byte_offset + byte_len)` relative to `base`.
    ///
    /// The derived range never leaves the block of `base`; use [partition][GasHandle::partition] to move between partitions.
    pub fn offset(
        &self,
        base: GlobalAddress,
        byte_offset: usize,
        byte_len: usize,
    ) -> GasResult<GlobalAddress> {
        self.gas.offset(base, byte_offset, byte_len)
    }

    /// Address of partition `index` of the allocation whose base is `base`
    pub fn partition(&self, base: GlobalAddress, index: usize) -> GasResult<GlobalAddress> {
        self.gas.partition(base, index)
    }

    /// Number of partitions of the allocation whose base is `base`
    pub fn partitions(&self, base: GlobalAddress) -> GasResult<usize> {
        self.gas.partitions(base)
    }

    /// Pin `addr` for direct local access, fails with [GasError::NotLocal] if another node owns it
    pub fn pin(&self, addr: GlobalAddress) -> GasResult<PinGuard> {
        self.gas.pin(self.node, addr)
    }

    /// Run `op` against the pinned bytes of `addr`, unpinning on every exit path
    pub fn with_pinned<R>(&self, addr: GlobalAddress, op: impl FnOnce(&mut [u8]) -> R) -> GasResult<R> {
        self.pin(addr)?.write(op)
    }

    /// Release the allocation whose base is `addr`
    pub fn deallocate(&self, addr: GlobalAddress) -> GasResult<()> {
        self.gas.deallocate(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(node: NodeId, gas: &Arc<AddressSpace>) -> GasHandle {
        GasHandle {
            node,
            gas: gas.clone(),
        }
    }

    #[test]
    fn offset_stays_inside_partition() {
        for (nodes, partitions, bytes) in [(1, 1, 8), (3, 5, 16), (4, 4, 1), (2, 7, 4096)] {
            let gas = Arc::new(AddressSpace::new(nodes, 1 << 20));
            let h = handle(0, &gas);
            let base = h.allocate_cyclic(partitions, bytes).unwrap();
            assert!(h.offset(base, 0, bytes).is_ok());
            assert!(matches!(
                h.offset(base, bytes, 1),
                Err(GasError::OutOfRange { .. })
            ));
            let sub = h.offset(base, bytes / 2, bytes - bytes / 2).unwrap();
            assert_eq!(sub.offset(), bytes / 2);
            assert!(matches!(
                h.offset(sub, 0, bytes),
                Err(GasError::OutOfRange { .. })
            ));
        }
    }

    #[test]
    fn cyclic_partitions_are_round_robin() {
        let gas = Arc::new(AddressSpace::new(3, 1 << 20));
        let h = handle(0, &gas);
        let base = h.allocate_cyclic(7, 32).unwrap();
        assert_eq!(h.partitions(base).unwrap(), 7);
        for i in 0..7 {
            let part = h.partition(base, i).unwrap();
            assert_eq!(part.node(), i % 3);
            assert_eq!(gas.owner(part.block()), part.node());
            assert_eq!(part.len(), 32);
        }
        assert!(matches!(
            h.partition(base, 7),
            Err(GasError::OutOfRange { .. })
        ));
        let other = h.allocate_cyclic(2, 32).unwrap();
        assert_eq!(other.node(), 0);
        assert_ne!(other.block(), base.block());
    }

    #[test]
    fn pin_requires_ownership() {
        let gas = Arc::new(AddressSpace::new(2, 1 << 20));
        let base = handle(0, &gas).allocate_cyclic(2, 8).unwrap();
        let remote = handle(0, &gas).partition(base, 1).unwrap();
        assert!(matches!(
            handle(0, &gas).pin(remote),
            Err(GasError::NotLocal { caller: 0, .. })
        ));
        let mut pinned = handle(1, &gas).pin(remote).unwrap();
        pinned.write(|bytes| bytes.copy_from_slice(&[7u8; 8])).unwrap();
        pinned.unpin();
        let pinned = handle(1, &gas).pin(remote).unwrap();
        assert_eq!(pinned.to_vec().unwrap(), [7u8; 8]);
    }

    #[test]
    fn sub_range_pin_sees_block_bytes() {
        let gas = Arc::new(AddressSpace::new(1, 1 << 20));
        let h = handle(0, &gas);
        let base = h.allocate_local(16).unwrap();
        h.with_pinned(base, |bytes| {
            for (i, b) in bytes.iter_mut().enumerate() {
                *b = i as u8;
            }
        })
        .unwrap();
        let sub = h.offset(base, 4, 4).unwrap();
        let pinned = h.pin(sub).unwrap();
        assert_eq!(pinned.to_vec().unwrap(), [4, 5, 6, 7]);
    }

    #[test]
    fn offset_overflow_is_out_of_range() {
        let gas = Arc::new(AddressSpace::new(1, 1 << 20));
        let h = handle(0, &gas);
        let base = h.allocate_local(8).unwrap();
        let sub = h.offset(base, 4, 4).unwrap();
        for (off, len) in [(usize::MAX, 1), (1, usize::MAX), (usize::MAX, usize::MAX)] {
            let err = h.offset(sub, off, len).unwrap_err();
            assert!(matches!(err, GasError::OutOfRange { extent: 8, .. }), "{:?}", err);
            assert!(!err.to_string().is_empty());
        }
        let forged = GlobalAddress {
            offset: usize::MAX,
            len: 2,
            ..base
        };
        assert!(matches!(h.pin(forged), Err(GasError::OutOfRange { .. })));
        assert!(forged.to_string().contains("block"));
    }

    #[test]
    fn pins_on_one_block_coexist() {
        let gas = Arc::new(AddressSpace::new(1, 1 << 20));
        let h = handle(0, &gas);
        let base = h.allocate_local(8).unwrap();
        let mut first = h.pin(base).unwrap();
        let second = h.pin(h.offset(base, 4, 4).unwrap()).unwrap();
        first.write(|bytes| bytes.fill(3)).unwrap();
        assert_eq!(second.to_vec().unwrap(), [3; 4]);

        // a pin held on another thread does not stall this one
        let other = {
            let h = h.clone();
            std::thread::spawn(move || h.pin(base).unwrap().to_vec().unwrap())
        };
        assert_eq!(other.join().unwrap(), [3; 8]);
        assert!(h.deallocate(base).is_err());
        drop((first, second));
        h.deallocate(base).unwrap();
    }

    #[test]
    fn nested_access_on_same_thread_is_rejected() {
        let gas = Arc::new(AddressSpace::new(1, 1 << 20));
        let h = handle(0, &gas);
        let base = h.allocate_local(8).unwrap();
        let outer = h.pin(base).unwrap();
        let inner = h.pin(base).unwrap();
        let nested = outer.read(|_| inner.to_vec()).unwrap();
        assert!(matches!(nested, Err(GasError::AlreadyPinned { .. })));
        // the failed access left no trace
        assert_eq!(inner.to_vec().unwrap(), [0; 8]);
    }

    #[test]
    fn deallocate_checks_base_and_pins() {
        let gas = Arc::new(AddressSpace::new(2, 1 << 20));
        let h = handle(0, &gas);
        let base = h.allocate_cyclic(2, 8).unwrap();
        let sub = h.offset(base, 4, 4).unwrap();
        assert!(matches!(
            h.deallocate(sub),
            Err(GasError::InvalidAddress { .. })
        ));
        let pinned = h.pin(base).unwrap();
        assert!(matches!(
            h.deallocate(base),
            Err(GasError::InvalidAddress { .. })
        ));
        drop(pinned);
        h.deallocate(base).unwrap();
        // the address is dead now, every use is a defined failure
        assert!(matches!(h.pin(base), Err(GasError::InvalidAddress { .. })));
        assert!(matches!(
            h.offset(base, 0, 1),
            Err(GasError::InvalidAddress { .. })
        ));
        assert!(matches!(
            h.deallocate(base),
            Err(GasError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn failed_pinned_scope_still_unpins() {
        let gas = Arc::new(AddressSpace::new(1, 1 << 20));
        let h = handle(0, &gas);
        let base = h.allocate_local(8).unwrap();
        let attempt: Result<(), String> = (|| {
            let _pinned = h.pin(base).map_err(|e| e.to_string())?;
            Err("handler failed".to_owned())
        })();
        assert!(attempt.is_err());
        h.deallocate(base).unwrap();
    }

    #[test]
    fn exhausted_node_fails_whole_allocation() {
        let gas = Arc::new(AddressSpace::new(2, 64));
        let h = handle(0, &gas);
        let _hog = h.allocate_local_at(1, 40).unwrap();
        assert_eq!(
            h.allocate_cyclic(2, 32),
            Err(GasError::Allocation { node: 1, bytes: 32 })
        );
        // node 0's share was rolled back
        assert!(h.allocate_local_at(0, 64).is_ok());
        assert!(matches!(
            h.allocate_cyclic(1, 0),
            Err(GasError::Allocation { .. })
        ));
    }
}
