use indexmap::IndexMap;
use pagewatch_core::{
    AddressContext, Architecture as _, KernelCore, KernelDriver, KernelError, LeafEntry, Pfn,
    TaskId, Va,
};

use super::{AccessCounters, ContentPatch, MAX_MARKED_IPS, MarkedIps, WatchContext, WatchState};

/// Watched pages, keyed by the identity of their leaf entry.
///
/// Contexts are kept in registration order. No two contexts share a leaf
/// entry.
#[derive(Debug, Default)]
pub struct WatchRegistry {
    contexts: IndexMap<LeafEntry, WatchContext>,
}

impl WatchRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of watched pages.
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Checks if no page is watched.
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Iterates over the watched pages in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &WatchContext> {
        self.contexts.values()
    }

    /// Finds the watched page mapped by `entry`.
    pub fn find_by_leaf_entry(&self, entry: LeafEntry) -> Option<&WatchContext> {
        self.contexts.get(&entry)
    }

    pub(super) fn find_by_leaf_entry_mut(&mut self, entry: LeafEntry) -> Option<&mut WatchContext> {
        self.contexts.get_mut(&entry)
    }

    /// Finds the watched page starting at the page-aligned address `va`.
    pub fn find_by_va(&self, va: Va) -> Option<&WatchContext> {
        self.contexts.values().find(|context| context.va == va)
    }

    /// Registers the page containing `va` in the address space of `task`.
    ///
    /// The page's current frame is pinned as the exec backing. A fresh frame
    /// is allocated as the read backing, filled with a copy of the exec
    /// backing, and patched. The leaf entry is left untouched until the page
    /// is disarmed.
    ///
    /// # Errors
    ///
    /// - [`KernelError::InvalidConfig`] if more than [`MAX_MARKED_IPS`]
    ///   instruction pointers are marked.
    /// - [`KernelError::UnresolvedTranslation`] if the page tables do not
    ///   resolve to a leaf entry.
    /// - [`KernelError::AlreadyWatched`] if the page is already registered.
    /// - [`KernelError::UnmappedRegion`] if no memory region contains `va`.
    /// - [`KernelError::AllocationFailure`] if either backing could not be
    ///   obtained.
    ///
    /// Nothing is left registered or allocated when an error is returned.
    pub fn register<Driver>(
        &mut self,
        core: &KernelCore<Driver>,
        task: TaskId,
        va: Va,
        marked_ips: &[Va],
        patches: &[ContentPatch],
    ) -> Result<&WatchContext, KernelError>
    where
        Driver: KernelDriver,
    {
        if marked_ips.len() > MAX_MARKED_IPS {
            return Err(KernelError::InvalidConfig("too many marked instruction pointers"));
        }

        let va = Driver::Architecture::va_align_down(va);
        let root = core.translation_root(task)?;

        let entry = Driver::Architecture::leaf_entry(core, AddressContext::new(va, root))?
            .ok_or(KernelError::UnresolvedTranslation(va))?;

        if self.contexts.contains_key(&entry) {
            return Err(KernelError::AlreadyWatched(va));
        }

        let region = core
            .find_region(task, va)?
            .ok_or(KernelError::UnmappedRegion(va))?;

        let exec = core.pin_user_page(task, va).map_err(|err| {
            tracing::warn!(%va, %err, "failed to pin exec backing");
            KernelError::AllocationFailure(va)
        })?;

        let read = match Self::populate_read_backing(core, exec, patches) {
            Ok(read) => read,
            Err(err) => {
                tracing::warn!(%va, %err, "failed to populate read backing");

                if let Err(err) = core.unpin_page(exec) {
                    tracing::warn!(%va, %err, "failed to unpin exec backing");
                }

                return Err(match err {
                    KernelError::OutOfBounds => KernelError::OutOfBounds,
                    _ => KernelError::AllocationFailure(va),
                });
            }
        };

        tracing::info!(%va, %entry, %exec, %read, "watch registered");

        let context = WatchContext {
            va,
            entry,
            region,
            exec,
            read,
            marked_ips: MarkedIps::from_slice(marked_ips),
            state: WatchState::Released,
            counters: AccessCounters::default(),
        };

        Ok(self.contexts.entry(entry).or_insert(context))
    }

    fn populate_read_backing<Driver>(
        core: &KernelCore<Driver>,
        exec: Pfn,
        patches: &[ContentPatch],
    ) -> Result<Pfn, KernelError>
    where
        Driver: KernelDriver,
    {
        let read = core.allocate_page()?;

        let populated = core.copy_page(exec, read).and_then(|()| {
            patches
                .iter()
                .try_for_each(|patch| core.write_page(read, patch.offset, &[patch.value]))
        });

        match populated {
            Ok(()) => Ok(read),
            Err(err) => {
                if let Err(err) = core.free_page(read) {
                    tracing::warn!(%read, %err, "failed to free read backing");
                }

                Err(err)
            }
        }
    }

    /// Clears the present bit of the page's leaf entry.
    ///
    /// The next access of any kind to the page faults. Calling this on an
    /// armed page has no further effect.
    pub fn disarm<Driver>(
        &mut self,
        core: &KernelCore<Driver>,
        entry: LeafEntry,
    ) -> Result<(), KernelError>
    where
        Driver: KernelDriver,
    {
        let context = self
            .contexts
            .get_mut(&entry)
            .ok_or(KernelError::InternalConsistency("disarm of an unknown entry"))?;

        core.clear_leaf_present(entry)?;
        context.state = WatchState::Armed;
        Ok(())
    }

    /// Disarms every watched page, in registration order.
    pub fn disarm_all<Driver>(&mut self, core: &KernelCore<Driver>) -> Result<(), KernelError>
    where
        Driver: KernelDriver,
    {
        for context in self.contexts.values_mut() {
            core.clear_leaf_present(context.entry)?;
            context.state = WatchState::Armed;
        }

        Ok(())
    }

    /// Sets the present bit of the page's leaf entry, keeping whichever
    /// backing was installed last.
    pub fn rearm<Driver>(
        &mut self,
        core: &KernelCore<Driver>,
        entry: LeafEntry,
    ) -> Result<(), KernelError>
    where
        Driver: KernelDriver,
    {
        if !self.contexts.contains_key(&entry) {
            return Err(KernelError::InternalConsistency("rearm of an unknown entry"));
        }

        core.set_leaf_present(entry)
    }

    /// Releases every watched page.
    ///
    /// Each leaf entry is pointed back at its exec backing and marked
    /// present, followed by a single flush. Then the read backings are freed
    /// and the exec backings unpinned. Cleanup continues past failures, and
    /// the first error is returned.
    pub fn teardown<Driver>(&mut self, core: &KernelCore<Driver>) -> Result<(), KernelError>
    where
        Driver: KernelDriver,
    {
        let mut result = core.install_leaves(
            self.contexts
                .values()
                .map(|context| (context.entry, context.exec)),
        );

        for (_, context) in self.contexts.drain(..) {
            if let Err(err) = core.free_page(context.read) {
                tracing::warn!(va = %context.va, %err, "failed to free read backing");
                result = result.and(Err(err));
            }

            if let Err(err) = core.unpin_page(context.exec) {
                tracing::warn!(va = %context.va, %err, "failed to unpin exec backing");
                result = result.and(Err(err));
            }

            tracing::debug!(va = %context.va, "watch released");
        }

        result
    }
}
