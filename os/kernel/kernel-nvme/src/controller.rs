//! Controller bring-up and interrupt demultiplexing.
//!
//! [`NvmeController::init`] walks the controller from whatever state firmware
//! left it in to a set of live I/O queue pairs:
//!
//! 1. disable, wait for `CSTS.RDY = 0`
//! 2. allocate queue memory for every candidate queue pair
//! 3. program the admin queue, enable, wait for `CSTS.RDY = 1`
//! 4. bring up the admin queue pair
//! 5. negotiate the number of I/O queues (Set Features)
//! 6. bring up the granted I/O queue pairs
//! 7. issue Identify Controller without waiting for it
//! 8. create the I/O completion queues, then the I/O submission queues
//! 9. collect the Identify Controller data
//! 10. optionally lend the controller a host memory buffer
//!
//! Every wait is bounded by the controller's own worst-case ready timeout
//! (`CAP.TO`). Only step 10 may fail without failing bring-up.
//!
//! Admin completions arrive through [`NvmeController::handle_irq`], so the
//! controller must be reachable from the interrupt path (see
//! [`IrqRouter`](crate::IrqRouter)) before `init` is called.

use crate::config::NvmeConfig;
use crate::error::{InitError, Stage};
use crate::namespace::NvmeNamespace;
use crate::platform::{ControllerResources, DmaRegion, IrqMode, IrqRange, PhysRange, Platform};
use crate::queue_pair::{CompletionEvent, Payload, QueueMemory, QueuePair, SCRATCH_BYTES_PER_SLOT};
use crate::wire::{
    Acq, Aqa, Asq, COMMAND_SIZE, COMPLETION_SIZE, Cap, Cc, Command, Csts, IdentifyCns, IdentifyController,
    IdentifyNamespace, NamespaceList, NumberOfQueues, PAGE_SHIFT, PAGE_SIZE, Vs,
};
use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use core::time::Duration;
use kernel_mmio::{RegisterBlock, RegisterIo};
use kernel_storage::{IoError, Iocp};
use kernel_sync::{Clock, Deadline, SpinLock, SyncOnceCell};
use log::{debug, error, info, warn};

/// Largest admin queue the `AQA` register can describe.
const MAX_ADMIN_QUEUE_SLOTS: u32 = 4096;

/// Identify Controller fields the driver keeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerIdentity {
    pub serial: String,
    pub model: String,
    pub firmware: String,
    /// Maximum data transfer size exponent; 0 means unlimited.
    pub mdts: u8,
    /// Host memory buffer preferred / minimum size in 4 KiB units.
    pub hmpre: u32,
    pub hmmin: u32,
    pub namespace_count: u32,
    pub supports_trim: bool,
}

impl From<&IdentifyController> for ControllerIdentity {
    fn from(id: &IdentifyController) -> Self {
        Self {
            serial: id.serial().to_string(),
            model: id.model().to_string(),
            firmware: id.firmware().to_string(),
            mdts: id.mdts,
            hmpre: id.hmpre,
            hmmin: id.hmmin,
            namespace_count: id.nn,
            supports_trim: id.supports_dataset_management(),
        }
    }
}

/// An active namespace as reported by Identify Namespace.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NamespaceInfo {
    pub nsid: u32,
    pub block_size_log2: u8,
    pub block_count: u64,
}

/// Parameters fixed once the controller has been reset.
#[derive(Debug, Copy, Clone)]
struct Geometry {
    slots: u32,
    doorbell_stride: u8,
    timeout: Duration,
}

/// Placement of every queue pair inside the one contiguous queue allocation:
/// all submission rings, then all completion rings, then all scratch areas,
/// each page aligned.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct QueueLayout {
    pairs: usize,
    sq_stride: usize,
    cq_stride: usize,
    scratch_stride: usize,
}

impl QueueLayout {
    const fn new(pairs: usize, slots: u32) -> Self {
        let slots = slots as usize;
        Self {
            pairs,
            sq_stride: (slots * COMMAND_SIZE).next_multiple_of(PAGE_SIZE),
            cq_stride: (slots * COMPLETION_SIZE).next_multiple_of(PAGE_SIZE),
            scratch_stride: (slots * SCRATCH_BYTES_PER_SLOT).next_multiple_of(PAGE_SIZE),
        }
    }

    const fn total(&self) -> usize {
        self.pairs * (self.sq_stride + self.cq_stride + self.scratch_stride)
    }

    /// Byte offsets of the submission ring, completion ring and scratch area
    /// of `pair`.
    const fn offsets(&self, pair: usize) -> (usize, usize, usize) {
        let cq_base = self.pairs * self.sq_stride;
        let scratch_base = cq_base + self.pairs * self.cq_stride;
        (
            pair * self.sq_stride,
            cq_base + pair * self.cq_stride,
            scratch_base + pair * self.scratch_stride,
        )
    }

    fn memory(&self, region: &DmaRegion, pair: usize) -> QueueMemory {
        let (sq, cq, scratch) = self.offsets(pair);
        let base = region.as_ptr();
        // SAFETY: every offset lies below `total()`, which the region spans.
        unsafe {
            QueueMemory {
                submission: base.add(sq).cast(),
                submission_phys: region.phys().offset(sq),
                completion: base.add(cq).cast(),
                completion_phys: region.phys().offset(cq),
                scratch: base.add(scratch),
                scratch_phys: region.phys().offset(scratch),
            }
        }
    }
}

#[cfg(feature = "host-memory-buffer")]
struct HostMemoryBuffer {
    descriptors: DmaRegion,
    chunks: Vec<DmaRegion>,
}

#[cfg(feature = "host-memory-buffer")]
impl HostMemoryBuffer {
    fn bytes(&self) -> usize {
        self.chunks.iter().map(DmaRegion::len).sum()
    }
}

pub struct NvmeController {
    platform: Arc<dyn Platform>,
    registers: Arc<dyn RegisterIo>,
    irq: IrqRange,
    config: NvmeConfig,
    /// Index 0 is the admin queue pair.
    queues: Box<[SyncOnceCell<QueuePair>]>,
    /// Live queue pairs, admin included; 0 until bring-up finished.
    queue_count: AtomicUsize,
    geometry: SyncOnceCell<Geometry>,
    memory: SpinLock<Option<DmaRegion>>,
    identity: SyncOnceCell<ControllerIdentity>,
    namespaces: SyncOnceCell<Vec<NamespaceInfo>>,
    #[cfg(feature = "host-memory-buffer")]
    host_memory: SpinLock<Option<HostMemoryBuffer>>,
}

impl NvmeController {
    /// Prepares a controller for [`init`](Self::init). Touches no registers.
    ///
    /// Sizes the queue pair table for one I/O queue per CPU plus the admin
    /// queue, capped by [`NvmeConfig::max_queues`].
    ///
    /// # Errors
    /// [`InitError::NoQueues`] if the configuration leaves no room for an
    /// I/O queue.
    pub fn new(
        platform: Arc<dyn Platform>,
        resources: ControllerResources,
        config: NvmeConfig,
    ) -> Result<Self, InitError> {
        let requested = config
            .max_queues
            .min(platform.cpu_count() + 1)
            .min(usize::from(u16::MAX));
        if requested < 2 {
            return Err(InitError::NoQueues);
        }

        Ok(Self {
            platform,
            registers: resources.registers,
            irq: resources.irq,
            config,
            queues: (0..requested).map(|_| SyncOnceCell::new()).collect(),
            queue_count: AtomicUsize::new(0),
            geometry: SyncOnceCell::new(),
            memory: SpinLock::new(None),
            identity: SyncOnceCell::new(),
            namespaces: SyncOnceCell::new(),
            #[cfg(feature = "host-memory-buffer")]
            host_memory: SpinLock::new(None),
        })
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        &*self.platform
    }

    pub(crate) fn platform(&self) -> &dyn Platform {
        &*self.platform
    }

    pub(crate) const fn config(&self) -> &NvmeConfig {
        &self.config
    }

    #[must_use]
    pub const fn irq_range(&self) -> IrqRange {
        self.irq
    }

    /// Queue pairs the controller was prepared for, admin included.
    #[must_use]
    pub fn requested_queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Live queue pairs, admin included; 0 before bring-up finished.
    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.queue_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn queue(&self, qid: u16) -> Option<&QueuePair> {
        self.queues.get(usize::from(qid))?.get()
    }

    #[must_use]
    pub fn identity(&self) -> Option<&ControllerIdentity> {
        self.identity.get()
    }

    /// Namespaces found by [`detect_namespaces`](Self::detect_namespaces).
    #[must_use]
    pub fn namespaces(&self) -> &[NamespaceInfo] {
        self.namespaces.get().map_or(&[], Vec::as_slice)
    }

    /// Entries per queue, once negotiated.
    #[must_use]
    pub fn queue_slots(&self) -> Option<u32> {
        self.geometry.get().map(|g| g.slots)
    }

    /// Bytes of host memory lent to the controller.
    #[cfg(feature = "host-memory-buffer")]
    #[must_use]
    pub fn host_memory_bytes(&self) -> usize {
        self.host_memory.lock().as_ref().map_or(0, HostMemoryBuffer::bytes)
    }

    /// Largest transfer a single command may carry.
    #[must_use]
    pub fn max_transfer(&self) -> usize {
        let device_limit = self
            .identity
            .get()
            .filter(|id| id.mdts != 0)
            .map(|id| u32::from(id.mdts) + PAGE_SHIFT)
            // A limit beyond the address space is no limit.
            .filter(|&shift| shift < usize::BITS)
            .map_or(usize::MAX, |shift| 1 << shift);
        self.config.max_transfer.min(device_limit)
    }

    /// The I/O queue pair serving `cpu`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn io_queue_for(&self, cpu: usize) -> Option<&QueuePair> {
        let count = self.queue_count();
        if count < 2 {
            return None;
        }
        self.queue((1 + cpu % (count - 1)) as u16)
    }

    /// Drains every queue pair bound to interrupt vector `vector_offset`
    /// (every queue pair, for pin-based interrupts). Returns the number of
    /// completions consumed.
    pub fn handle_irq(&self, vector_offset: u32) -> usize {
        let shared_line = matches!(self.irq.mode, IrqMode::Pin);
        self.queues
            .iter()
            .filter_map(SyncOnceCell::get)
            .filter(|pair| shared_line || u32::from(self.irq.vector_for_queue(pair.id())) == vector_offset)
            .map(|pair| pair.drain(|sqid| self.queue(sqid)))
            .sum()
    }

    /// Runs the bring-up state machine.
    ///
    /// # Errors
    /// Any [`InitError`]; the controller must not be used afterwards.
    ///
    /// # Panics
    /// If called more than once.
    pub fn init(&self) -> Result<(), InitError> {
        let cap: Cap = self.registers.load64();
        if u64::from(cap) == u64::MAX {
            return Err(InitError::DeviceGone);
        }
        let vs: Vs = self.registers.load();
        let geometry = Geometry {
            slots: Self::slots_for(self.config.queue_slots, cap),
            doorbell_stride: cap.dstrd(),
            timeout: Duration::from_millis(u64::from(cap.to().max(1)) * 500),
        };
        assert!(self.geometry.set(geometry).is_ok(), "controller initialized twice");
        info!(
            "NVMe {}.{}.{} controller: MQES {}, DSTRD {}, ready timeout {:?}, {} slots per queue",
            vs.mjr(),
            vs.mnr(),
            vs.ter(),
            u32::from(cap.mqes_z()) + 1,
            cap.dstrd(),
            geometry.timeout,
            geometry.slots
        );

        debug!("Disabling controller ...");
        self.disable(geometry.timeout)?;

        let pairs = self.queues.len();
        let layout = QueueLayout::new(pairs, geometry.slots);
        let memory = self
            .platform
            .alloc_dma(layout.total())
            .ok_or(InitError::OutOfMemory { bytes: layout.total() })?;
        memory.zero();
        let queue_memory: Vec<QueueMemory> = (0..pairs).map(|pair| layout.memory(&memory, pair)).collect();
        *self.memory.lock() = Some(memory);

        debug!("Enabling controller with room for {pairs} queue pairs ...");
        self.enable(cap, geometry, &queue_memory[0])?;
        let admin = self.install(0, queue_memory[0], geometry);

        debug!("Negotiating I/O queue count ...");
        let granted = self.negotiate_queue_count(admin, pairs - 1, geometry.timeout)?;
        let count = pairs.min(granted + 1);
        info!("Controller granted {granted} I/O queues, using {}", count - 1);
        for (qid, memory) in queue_memory.iter().enumerate().take(count).skip(1) {
            self.install(qid, *memory, geometry);
        }

        let identify_page = self
            .platform
            .alloc_dma(PAGE_SIZE)
            .ok_or(InitError::OutOfMemory { bytes: PAGE_SIZE })?;
        let identify = Arc::new(Iocp::blocking());
        identify.set_expect(1);
        Self::submit_admin(
            admin,
            Command::identify(IdentifyCns::Controller, 0),
            Payload::Ranges(&[page_range(&identify_page)]),
            &Deadline::after(self.clock(), geometry.timeout),
            &identify,
            |_| {},
        );

        debug!("Creating {} I/O queue pairs ...", count - 1);
        let identified = self.create_io_queues(admin, count, geometry).and_then(|()| {
            let deadline = Deadline::after(self.clock(), geometry.timeout);
            Self::wait_admin(Stage::IdentifyController, &identify, &deadline)
        });
        if let Err(err) = identified {
            self.release_after(identify_page, &identify);
            return Err(err);
        }

        let identity = identify_page
            .view::<IdentifyController>()
            .map(ControllerIdentity::from)
            .ok_or(InitError::OutOfMemory { bytes: PAGE_SIZE })?;
        self.platform.free_dma(identify_page);
        let identity = self.identity.get_or_init(|| identity);
        info!(
            "Controller {} (serial {}, firmware {}): {} namespaces, MDTS {}, trim {}",
            identity.model,
            identity.serial,
            identity.firmware,
            identity.namespace_count,
            identity.mdts,
            if identity.supports_trim { "supported" } else { "unsupported" }
        );

        #[cfg(feature = "host-memory-buffer")]
        self.setup_host_memory(admin, identity, geometry.timeout);

        self.queue_count.store(count, Ordering::Release);
        info!("Controller ready with {} I/O queues of {} slots", count - 1, geometry.slots);
        Ok(())
    }

    /// Identifies every active namespace and wraps each in a block device.
    ///
    /// Namespaces that report zero capacity or an unusable block size are
    /// skipped.
    ///
    /// # Errors
    /// [`InitError::NoQueues`] before [`init`](Self::init) succeeded, or any
    /// admin command failure.
    pub fn detect_namespaces(self: &Arc<Self>) -> Result<Vec<Arc<NvmeNamespace>>, InitError> {
        let (Some(admin), Some(geometry)) = (self.queue(0), self.geometry.get()) else {
            return Err(InitError::NoQueues);
        };
        if self.queue_count() < 2 {
            return Err(InitError::NoQueues);
        }

        let page = self
            .platform
            .alloc_dma(PAGE_SIZE)
            .ok_or(InitError::OutOfMemory { bytes: PAGE_SIZE })?;
        let iocp = Arc::new(Iocp::blocking());
        let identify = |cns: IdentifyCns, nsid: u32| {
            iocp.reset();
            page.zero();
            iocp.set_expect(1);
            let deadline = Deadline::after(self.clock(), geometry.timeout);
            Self::submit_admin(
                admin,
                Command::identify(cns, nsid),
                Payload::Ranges(&[page_range(&page)]),
                &deadline,
                &iocp,
                |_| {},
            );
            Self::wait_admin(Stage::IdentifyNamespaces, &iocp, &deadline)
        };

        let mut found = Vec::new();
        let listed = identify(IdentifyCns::ActiveNamespaces, 0).map(|()| {
            page.view::<NamespaceList>()
                .map(|list| list.iter().copied().take_while(|&nsid| nsid != 0).collect::<Vec<_>>())
                .unwrap_or_default()
        });
        let scanned = listed.and_then(|ids| {
            for nsid in ids {
                identify(IdentifyCns::Namespace, nsid)?;
                let Some(ns) = page.view::<IdentifyNamespace>() else {
                    continue;
                };
                let block_size_log2 = ns.lba_format().lbads();
                if ns.nsze == 0 || !(9..=16).contains(&block_size_log2) {
                    warn!(
                        "Skipping namespace {nsid}: {} blocks of 2^{block_size_log2} bytes",
                        ns.nsze
                    );
                    continue;
                }
                info!("Namespace {nsid}: {} blocks of {} bytes", ns.nsze, 1u32 << block_size_log2);
                found.push(NamespaceInfo {
                    nsid,
                    block_size_log2,
                    block_count: ns.nsze,
                });
            }
            Ok(())
        });
        self.release_after(page, &iocp);
        scanned?;

        if self.namespaces.set(found.clone()).is_err() {
            warn!("Namespaces detected twice; keeping the first list");
        }
        Ok(found
            .into_iter()
            .map(|info| Arc::new(NvmeNamespace::new(Arc::clone(self), info)))
            .collect())
    }

    /// Largest power-of-two queue size both sides support.
    fn slots_for(requested: u32, cap: Cap) -> u32 {
        let supported = (u32::from(cap.mqes_z()) + 1).min(MAX_ADMIN_QUEUE_SLOTS);
        let slots = requested.min(supported).max(2);
        1 << slots.ilog2()
    }

    fn disable(&self, timeout: Duration) -> Result<(), InitError> {
        let cc: Cc = self.registers.load();
        if cc.en() {
            self.registers.store(cc.with_en(false));
        }
        self.wait_ready(false, Stage::Disable, timeout)
    }

    fn enable(&self, cap: Cap, geometry: Geometry, admin: &QueueMemory) -> Result<(), InitError> {
        #[allow(clippy::cast_possible_truncation)]
        let entries_z = (geometry.slots - 1) as u16;
        self.registers
            .store(Aqa::new().with_asqs_z(entries_z).with_acqs_z(entries_z));
        self.registers.store64(Asq(admin.submission_phys.as_u64()));
        self.registers.store64(Acq(admin.completion_phys.as_u64()));

        let cc = Cc::new()
            .with_css(0)
            .with_mps(0)
            .with_ams(u8::from(cap.ams_weighted_round_robin()))
            .with_iosqes(6)
            .with_iocqes(4);
        self.registers.store(cc);
        self.registers.store(cc.with_en(true));
        self.wait_ready(true, Stage::Enable, geometry.timeout)
    }

    /// Polls `CSTS.RDY` until it reads `ready`.
    fn wait_ready(&self, ready: bool, stage: Stage, timeout: Duration) -> Result<(), InitError> {
        let deadline = Deadline::after(self.clock(), timeout);
        loop {
            let csts: Csts = self.registers.load();
            if csts.is_device_gone() {
                error!("Controller vanished during {stage:?}");
                return Err(InitError::DeviceGone);
            }
            if ready && csts.cfs() {
                error!("Controller fatal status during {stage:?}");
                return Err(InitError::ControllerFatal);
            }
            if csts.rdy() == ready {
                return Ok(());
            }
            if deadline.has_expired() {
                error!("Controller did not reach RDY={ready} within {timeout:?}");
                return Err(InitError::Timeout(stage));
            }
            spin_loop();
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn install(&self, qid: usize, memory: QueueMemory, geometry: Geometry) -> &QueuePair {
        // SAFETY: `memory` is carved out of the queue region, which lives
        // until the controller is dropped, and belongs to this pair only.
        self.queues[qid].get_or_init(|| unsafe {
            QueuePair::new(
                qid as u16,
                geometry.slots,
                memory,
                &self.registers,
                geometry.doorbell_stride,
            )
        })
    }

    /// Returns the number of I/O queues the controller granted.
    fn negotiate_queue_count(&self, admin: &QueuePair, wanted: usize, timeout: Duration) -> Result<usize, InitError> {
        let granted = Arc::new(AtomicU32::new(0));
        let iocp = Arc::new(Iocp::blocking());
        iocp.set_expect(1);
        let deadline = Deadline::after(self.clock(), timeout);

        let dw0 = Arc::clone(&granted);
        Self::submit_admin(
            admin,
            Command::set_number_of_queues(u16::try_from(wanted).unwrap_or(u16::MAX)),
            Payload::None,
            &deadline,
            &iocp,
            move |event| dw0.store(event.completion.dw0, Ordering::Release),
        );
        Self::wait_admin(Stage::SetQueueCount, &iocp, &deadline)?;

        let granted = NumberOfQueues::from(granted.load(Ordering::Acquire));
        Ok(usize::from(granted.nsq_z().min(granted.ncq_z())) + 1)
    }

    /// Creates the completion queues of I/O pairs `1..count`, then their
    /// submission queues, each batch acknowledged before the next starts.
    fn create_io_queues(&self, admin: &QueuePair, count: usize, geometry: Geometry) -> Result<(), InitError> {
        let pairs: Vec<&QueuePair> = self.queues[1..count].iter().filter_map(SyncOnceCell::get).collect();
        #[allow(clippy::cast_possible_truncation)]
        let batch = pairs.len() as u32;
        let iocp = Arc::new(Iocp::blocking());

        iocp.set_expect(batch);
        let deadline = Deadline::after(self.clock(), geometry.timeout);
        for pair in &pairs {
            let ring = PhysRange {
                addr: pair.completion_phys(),
                len: pair.capacity() as usize * COMPLETION_SIZE,
            };
            Self::submit_admin(
                admin,
                Command::create_io_completion_queue(pair.id(), geometry.slots, self.irq.vector_for_queue(pair.id())),
                Payload::Ranges(&[ring]),
                &deadline,
                &iocp,
                |_| {},
            );
        }
        Self::wait_admin(Stage::CreateQueues, &iocp, &deadline)?;

        iocp.reset();
        iocp.set_expect(batch);
        let deadline = Deadline::after(self.clock(), geometry.timeout);
        for pair in &pairs {
            let ring = PhysRange {
                addr: pair.submission_phys(),
                len: pair.capacity() as usize * COMMAND_SIZE,
            };
            Self::submit_admin(
                admin,
                Command::create_io_submission_queue(pair.id(), geometry.slots, pair.id()),
                Payload::Ranges(&[ring]),
                &deadline,
                &iocp,
                |_| {},
            );
        }
        Self::wait_admin(Stage::CreateQueues, &iocp, &deadline)
    }

    #[cfg(feature = "host-memory-buffer")]
    fn setup_host_memory(&self, admin: &QueuePair, identity: &ControllerIdentity, timeout: Duration) {
        if identity.hmpre == 0 {
            return;
        }
        match self.lend_host_memory(admin, identity, timeout) {
            Ok(buffer) => {
                info!(
                    "Lent {} KiB of host memory in {} chunks",
                    buffer.bytes() / 1024,
                    buffer.chunks.len()
                );
                *self.host_memory.lock() = Some(buffer);
            }
            Err(err) => warn!("Continuing without host memory buffer: {err}"),
        }
    }

    #[cfg(feature = "host-memory-buffer")]
    fn lend_host_memory(
        &self,
        admin: &QueuePair,
        identity: &ControllerIdentity,
        timeout: Duration,
    ) -> Result<HostMemoryBuffer, InitError> {
        use crate::wire::HostMemoryDescriptor;

        const MAX_DESCRIPTORS: usize = PAGE_SIZE / size_of::<HostMemoryDescriptor>();

        let preferred = (identity.hmpre as usize).saturating_mul(PAGE_SIZE);
        let minimum = (identity.hmmin as usize).saturating_mul(PAGE_SIZE);
        let wanted = preferred.min(self.config.hmb_limit);
        let chunk = self.config.hmb_chunk.next_multiple_of(PAGE_SIZE).max(PAGE_SIZE);
        debug!("Allocating up to {wanted} bytes of host memory for the controller ...");

        let descriptors = self
            .platform
            .alloc_dma(PAGE_SIZE)
            .ok_or(InitError::OutOfMemory { bytes: PAGE_SIZE })?;
        descriptors.zero();
        let mut buffer = HostMemoryBuffer {
            descriptors,
            chunks: Vec::new(),
        };

        let mut total = 0;
        while total < wanted && buffer.chunks.len() < MAX_DESCRIPTORS {
            let len = chunk.min(wanted - total).next_multiple_of(PAGE_SIZE);
            let Some(region) = self.platform.alloc_dma(len) else {
                break;
            };
            #[allow(clippy::cast_possible_truncation)]
            let descriptor = HostMemoryDescriptor {
                badd: region.phys().as_u64(),
                bsize: (len / PAGE_SIZE) as u32,
                rsvd: 0,
            };
            buffer
                .descriptors
                .write(buffer.chunks.len() * size_of::<HostMemoryDescriptor>(), &descriptor);
            total += len;
            buffer.chunks.push(region);
        }

        if total == 0 || total < minimum {
            self.free_host_memory(buffer);
            return Err(InitError::OutOfMemory {
                bytes: minimum.max(chunk.min(wanted)),
            });
        }

        let iocp = Arc::new(Iocp::blocking());
        iocp.set_expect(1);
        let deadline = Deadline::after(self.clock(), timeout);
        #[allow(clippy::cast_possible_truncation)]
        let command = Command::set_host_memory_buffer(
            (total / PAGE_SIZE) as u32,
            buffer.descriptors.phys().as_u64(),
            buffer.chunks.len() as u32,
        );
        Self::submit_admin(admin, command, Payload::None, &deadline, &iocp, |_| {});
        match Self::wait_admin(Stage::HostMemoryBuffer, &iocp, &deadline) {
            Ok(()) => Ok(buffer),
            Err(err) => {
                if iocp.is_done() {
                    self.free_host_memory(buffer);
                } else {
                    warn!("Leaking {total} bytes of host memory the controller may still use");
                }
                Err(err)
            }
        }
    }

    #[cfg(feature = "host-memory-buffer")]
    fn free_host_memory(&self, buffer: HostMemoryBuffer) {
        for chunk in buffer.chunks {
            self.platform.free_dma(chunk);
        }
        self.platform.free_dma(buffer.descriptors);
    }

    /// Queues an admin command whose completion is counted on `iocp`.
    ///
    /// `inspect` sees the raw completion first. A command that cannot be
    /// queued completes `iocp` with the submission error right away.
    fn submit_admin(
        admin: &QueuePair,
        command: Command,
        payload: Payload<'_>,
        deadline: &Deadline<'_>,
        iocp: &Arc<Iocp>,
        inspect: impl FnOnce(&CompletionEvent) + Send + 'static,
    ) {
        let port = Arc::clone(iocp);
        let handler = Box::new(move |event: &CompletionEvent| {
            inspect(event);
            port.complete(event.result());
        });
        if let Err(err) = admin.submit(command, handler, None, deadline, payload) {
            warn!("Admin command {:#04x} not queued: {err}", command.opcode());
            iocp.complete(Err(err.into()));
        }
    }

    fn wait_admin(stage: Stage, iocp: &Iocp, deadline: &Deadline<'_>) -> Result<(), InitError> {
        iocp.wait_until(deadline).map_err(|source| {
            error!("{stage:?} failed: {source}");
            match source {
                IoError::TimedOut => InitError::Timeout(stage),
                source => InitError::Command { stage, source },
            }
        })
    }

    /// Frees a region a command was targeting, unless the command may still
    /// be in flight.
    fn release_after(&self, region: DmaRegion, iocp: &Iocp) {
        if iocp.is_done() {
            self.platform.free_dma(region);
        } else {
            warn!("Leaking {} bytes of DMA memory the controller may still write", region.len());
        }
    }
}

impl Drop for NvmeController {
    fn drop(&mut self) {
        let Some(memory) = self.memory.get_mut().take() else {
            return;
        };
        let timeout = self.geometry.get().map_or(Duration::from_millis(500), |g| g.timeout);
        if let Err(err) = self.disable(timeout) {
            warn!("Leaking controller memory, disable failed: {err}");
            return;
        }
        self.platform.free_dma(memory);
        #[cfg(feature = "host-memory-buffer")]
        if let Some(buffer) = self.host_memory.get_mut().take() {
            self.free_host_memory(buffer);
        }
    }
}

impl fmt::Debug for NvmeController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NvmeController")
            .field("irq", &self.irq)
            .field("queue_count", &self.queue_count())
            .field("identity", &self.identity.get())
            .finish_non_exhaustive()
    }
}

const fn page_range(region: &DmaRegion) -> PhysRange {
    PhysRange {
        addr: region.phys(),
        len: PAGE_SIZE,
    }
}
