use indexmap::IndexSet;
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default)]
struct FreeEntries {
    sizes: BTreeMap<usize, IndexSet<usize>>, //<size,<Vec<addr>>
    addrs: BTreeMap<usize, usize>,           //<addr,size>
}

/// Best-fit allocator over one node's heap segment.
///
/// Offsets handed out here are the node-local heap positions of GAS blocks;
/// running out of contiguous space is reported instead of waited on.
#[derive(Debug)]
pub(crate) struct NodeHeap {
    free_entries: Mutex<FreeEntries>,
    allocated_addrs: Mutex<BTreeMap<usize, usize>>, //<addr,size>
    capacity: usize,
    id: String,
}

impl NodeHeap {
    pub(crate) fn new(id: String, capacity: usize) -> NodeHeap {
        let mut free_entries = FreeEntries::default();
        if capacity > 0 {
            let mut temp = IndexSet::new();
            temp.insert(0);
            free_entries.sizes.insert(capacity, temp);
            free_entries.addrs.insert(0, capacity);
        }
        NodeHeap {
            free_entries: Mutex::new(free_entries),
            allocated_addrs: Mutex::new(BTreeMap::new()),
            capacity,
            id,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn used(&self) -> usize {
        self.allocated_addrs.lock().values().sum()
    }

    pub(crate) fn try_malloc(&self, size: usize) -> Option<usize> {
        if size == 0 {
            return None;
        }
        let mut free_entries = self.free_entries.lock();
        let mut addr: Option<usize> = None;
        let mut remove_size: Option<usize> = None;
        //find smallest memory segment greater than or equal to size
        if let Some((free_size, addrs)) = free_entries.sizes.range_mut(size..).next() {
            addr = addrs.pop();
            if addrs.is_empty() {
                remove_size = Some(*free_size);
            }
        }
        if let Some(rsize) = remove_size {
            free_entries.sizes.remove(&rsize);
        }
        let a = addr?;
        if let Some(fsize) = free_entries.addrs.remove(&a) {
            if fsize != size {
                let remaining = fsize - size;
                let new_addr = a + size;
                free_entries
                    .sizes
                    .entry(remaining)
                    .or_insert_with(IndexSet::new)
                    .insert(new_addr);
                free_entries.addrs.insert(new_addr, remaining);
            }
        } else {
            tracing::error!("{:?} addr {:?} missing from free list", self.id, a);
            return None;
        }
        drop(free_entries);
        self.allocated_addrs.lock().insert(a, size);
        Some(a)
    }

    /// Returns false if `addr` was not an outstanding allocation.
    pub(crate) fn free(&self, addr: usize) -> bool {
        let size = match self.allocated_addrs.lock().remove(&addr) {
            Some(size) => size,
            None => return false,
        };
        let mut temp_addr = addr;
        let mut temp_size = size;
        let mut remove: Vec<(usize, usize)> = vec![];
        let mut free_entries = self.free_entries.lock();
        if let Some((faddr, fsize)) = free_entries.addrs.range(..addr).next_back() {
            if faddr + fsize == addr {
                temp_addr = *faddr;
                temp_size = fsize + size;
                remove.push((*faddr, *fsize));
            }
        }
        if let Some((faddr, fsize)) = free_entries.addrs.range(addr..).next() {
            if temp_addr + temp_size == *faddr {
                temp_size += fsize;
                remove.push((*faddr, *fsize));
            }
        }
        for (raddr, rsize) in remove {
            free_entries.addrs.remove(&raddr);
            let mut remove_size = false;
            if let Some(addrs) = free_entries.sizes.get_mut(&rsize) {
                addrs.shift_remove(&raddr);
                remove_size = addrs.is_empty();
            }
            if remove_size {
                free_entries.sizes.remove(&rsize);
            }
        }
        free_entries.addrs.insert(temp_addr, temp_size);
        free_entries
            .sizes
            .entry(temp_size)
            .or_insert_with(IndexSet::new)
            .insert(temp_addr);
        true
    }
}
