//! Disappearing links: weak cells the collector zeroes once their target
//! becomes unreachable.
//!
//! A link is the address of a word-sized cell. It does not keep its target
//! alive: the table stores both the cell and the target as hidden pointers,
//! so scanning the registry never marks anything.

use crate::error::{GcError, GcResult};
use crate::finalization::FinalizationRegistry;
use crate::hash_table::{ChainEntry, ChainLink, HashTable};
use crate::heap::{Heap, WORD};
use crate::hidden::HiddenPointer;

/// Outcome of a successful link registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// A new link was added
    Registered,
    /// The link was already registered; its target was updated
    Duplicate,
}

/// A registered link, keyed by the hidden address of the cell.
pub struct DisappearingLink {
    chain: ChainLink,
    hidden_obj: HiddenPointer,
}

impl DisappearingLink {
    fn new(link: usize, obj: usize) -> Self {
        Self {
            chain: ChainLink::new(link),
            hidden_obj: HiddenPointer::hide(obj),
        }
    }

    /// Address of the cell that gets cleared.
    #[inline]
    pub fn link(&self) -> usize {
        self.chain.key()
    }

    /// Object whose death clears the cell.
    #[inline]
    pub fn object(&self) -> usize {
        self.hidden_obj.reveal()
    }
}

impl ChainEntry for DisappearingLink {
    fn link(&self) -> &ChainLink {
        &self.chain
    }

    fn link_mut(&mut self) -> &mut ChainLink {
        &mut self.chain
    }
}

impl FinalizationRegistry {
    /// Register a link cell that lives inside the object it refers to.
    ///
    /// The cell is cleared when the enclosing object becomes unreachable.
    ///
    /// # Safety
    /// Same contract as [`FinalizationRegistry::general_register_disappearing_link`].
    ///
    /// # Panics
    /// Panics if `link` is not inside a heap object.
    pub unsafe fn register_disappearing_link<H: Heap + ?Sized>(
        &self,
        heap: &H,
        link: usize,
    ) -> GcResult<LinkStatus> {
        let Some(base) = heap.base(link) else {
            panic!("Bad arg to register_disappearing_link: {:#x}", link);
        };
        // SAFETY: forwarded caller contract.
        unsafe { self.general_register_disappearing_link(heap, link, base) }
    }

    /// Register `link` to be cleared once `obj` becomes unreachable.
    ///
    /// Registering an already registered cell updates its target and
    /// returns [`LinkStatus::Duplicate`].
    ///
    /// # Safety
    /// `link` must stay writable word-sized memory until it is unregistered
    /// or until the heap object containing it becomes unreachable.
    ///
    /// # Panics
    /// Panics if `link` is null or not word aligned.
    pub unsafe fn general_register_disappearing_link<H: Heap + ?Sized>(
        &self,
        heap: &H,
        link: usize,
        obj: usize,
    ) -> GcResult<LinkStatus> {
        if link == 0 || link % WORD != 0 {
            panic!("Bad arg to general_register_disappearing_link: {:#x}", link);
        }
        debug_assert!(obj != 0 && heap.base(obj) == Some(obj));

        let mut state = self.state.lock();
        self.grow_if_needed(&mut state.links, "dl");

        let mut retried = false;
        loop {
            if let Some(idx) = state.links.find(link) {
                state.links.get_mut(idx).hidden_obj = HiddenPointer::hide(obj);
                return Ok(LinkStatus::Duplicate);
            }
            if state.links.try_insert(DisappearingLink::new(link, obj)).is_ok() {
                return Ok(LinkStatus::Registered);
            }
            if retried
                || !self.run_oom_hook(&mut state, std::mem::size_of::<DisappearingLink>())
            {
                return Err(GcError::OutOfMemory);
            }
            // The table may have changed while unlocked; look again.
            retried = true;
        }
    }

    /// Remove a registration. Returns false if `link` was not registered.
    pub fn unregister_disappearing_link(&self, link: usize) -> bool {
        if link % WORD != 0 {
            return false;
        }
        self.state.lock().links.remove(link).is_some()
    }
}

/// Zero every link whose target is unmarked and drop its entry.
pub(crate) fn clear_unreachable_links<H: Heap + ?Sized>(
    links: &mut HashTable<DisappearingLink>,
    heap: &H,
) -> usize {
    links.retain(|dl| {
        if heap.is_marked(dl.object()) {
            return true;
        }
        // SAFETY: registration requires the cell to stay writable while
        // registered; cells inside dead objects are not swept yet.
        unsafe { std::ptr::write(dl.link() as *mut usize, 0) };
        false
    })
}

/// Drop links whose cell lives in an unmarked heap object.
pub(crate) fn drop_dangling_links<H: Heap + ?Sized>(
    links: &mut HashTable<DisappearingLink>,
    heap: &H,
) -> usize {
    links.retain(|dl| match heap.base(dl.link()) {
        Some(base) => heap.is_marked(base),
        None => true,
    })
}
