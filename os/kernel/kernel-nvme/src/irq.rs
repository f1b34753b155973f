//! Interrupt routing from raw vectors to controllers.

use crate::controller::NvmeController;
use alloc::sync::Arc;
use kernel_storage::{Arena, Handle};
use kernel_sync::SpinLock;
use log::{debug, trace};

/// Stable reference to a controller registered with an [`IrqRouter`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ControllerHandle(Handle);

impl ControllerHandle {
    /// Small integer unique among live controllers, for naming devices.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.0.index()
    }
}

/// Every controller that can raise interrupts, keyed by handle.
#[derive(Default)]
pub struct IrqRouter {
    controllers: SpinLock<Arena<Arc<NvmeController>>>,
}

impl IrqRouter {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            controllers: SpinLock::new(Arena::new()),
        }
    }

    pub fn register(&self, controller: Arc<NvmeController>) -> ControllerHandle {
        let irq = controller.irq_range();
        let handle = self.controllers.lock_irq().insert(controller);
        debug!(
            "Routing vectors {}..{} ({:?}) to controller {}",
            irq.base,
            irq.base + irq.count,
            irq.mode,
            handle.index()
        );
        ControllerHandle(handle)
    }

    pub fn unregister(&self, handle: ControllerHandle) -> Option<Arc<NvmeController>> {
        let removed = self.controllers.lock_irq().remove(handle.0);
        if removed.is_some() {
            debug!("Removed interrupt route of controller {}", handle.index());
        }
        removed
    }

    #[must_use]
    pub fn get(&self, handle: ControllerHandle) -> Option<Arc<NvmeController>> {
        self.controllers.lock_irq().get(handle.0).map(Arc::clone)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.controllers.lock_irq().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.controllers.lock_irq().is_empty()
    }

    /// Interrupt entry point: drains the queues of every controller that
    /// owns `vector`. Returns the number of completions consumed.
    ///
    /// Controllers are visited in handle order, each outside the router lock
    /// so its handlers may register or unregister routes.
    pub fn dispatch(&self, vector: u32) -> usize {
        let mut drained = 0;
        let mut next = 0;
        while let Some((index, offset, controller)) = self.next_owner(vector, next) {
            drained += controller.handle_irq(offset);
            next = index + 1;
        }
        trace!("Vector {vector}: {drained} completions");
        drained
    }

    /// The first controller at or after slot `from` that owns `vector`.
    fn next_owner(&self, vector: u32, from: u32) -> Option<(u32, u32, Arc<NvmeController>)> {
        self.controllers
            .lock_irq()
            .iter()
            .skip_while(|(handle, _)| handle.index() < from)
            .find_map(|(handle, controller)| {
                let offset = controller.irq_range().offset_of(vector)?;
                Some((handle.index(), offset, Arc::clone(controller)))
            })
    }
}
