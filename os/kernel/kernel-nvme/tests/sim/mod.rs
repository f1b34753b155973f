//! A simulated NVMe controller for driving the driver end to end on the host.
//!
//! The register file lives behind a mutex; a worker thread fetches commands
//! whenever a doorbell moves, executes them against in-memory disks, posts
//! completions with the right phase and raises the completion queue's vector
//! through [`IrqRouter::dispatch`]. Physical addresses are host virtual
//! addresses.

#![allow(dead_code)]

use kernel_mmio::RegisterIo;
use kernel_nvme::wire::{
    AdminOpcode, Aqa, Cap, Cc, Cdw10CreateQueue, Cdw11CreateCompletionQueue, Cdw11CreateSubmissionQueue,
    Cdw12ReadWrite, Command, Completion, CompletionStatus, Csts, DatasetRange, FeatureId, HostMemoryDescriptor,
    IdentifyCns, IdentifyController, IdentifyNamespace, LbaFormat, NumberOfQueues, NvmOpcode,
    ONCS_DATASET_MANAGEMENT, PAGE_SIZE, Vs, status,
};
use kernel_nvme::{ControllerResources, DmaRegion, IrqMode, IrqRange, IrqRouter, PhysAddr, Platform};
use kernel_sync::Clock;
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use zerocopy::{FromZeros, IntoBytes};

/// Host memory standing in for physical memory: identity mapped, page
/// aligned, with every live allocation tracked.
pub struct SimPlatform {
    start: Instant,
    cpu_count: usize,
    current_cpu: AtomicUsize,
    dma_limit: Option<usize>,
    live: Mutex<HashMap<usize, usize>>,
}

impl SimPlatform {
    pub fn new(cpu_count: usize, dma_limit: Option<usize>) -> Self {
        Self {
            start: Instant::now(),
            cpu_count,
            current_cpu: AtomicUsize::new(0),
            dma_limit,
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_current_cpu(&self, cpu: usize) {
        self.current_cpu.store(cpu, Ordering::SeqCst);
    }

    pub fn live_allocations(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

impl Clock for SimPlatform {
    fn now_ns(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_nanos()).unwrap()
    }
}

impl Platform for SimPlatform {
    fn alloc_dma(&self, len: usize) -> Option<DmaRegion> {
        if self.dma_limit.is_some_and(|limit| len > limit) {
            return None;
        }
        let size = len.max(1);
        let layout = Layout::from_size_align(size, PAGE_SIZE).unwrap();
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        self.live.lock().unwrap().insert(ptr.as_ptr() as usize, size);
        Some(unsafe { DmaRegion::new(ptr, PhysAddr(ptr.as_ptr() as u64), len) })
    }

    fn free_dma(&self, region: DmaRegion) {
        let ptr = region.as_ptr().as_ptr();
        let size = self
            .live
            .lock()
            .unwrap()
            .remove(&(ptr as usize))
            .expect("freeing a region that was never allocated");
        unsafe { dealloc(ptr, Layout::from_size_align(size, PAGE_SIZE).unwrap()) }
    }

    fn phys_addr(&self, virt: *const u8) -> Option<PhysAddr> {
        Some(PhysAddr(virt as u64))
    }

    fn current_cpu(&self) -> usize {
        self.current_cpu.load(Ordering::SeqCst)
    }

    fn cpu_count(&self) -> usize {
        self.cpu_count
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SimNamespace {
    pub nsid: u32,
    pub lbads: u8,
    pub blocks: u64,
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub cpu_count: usize,
    pub granted_io_queues: u16,
    pub mqes_z: u16,
    pub mdts: u8,
    pub hmpre: u32,
    pub hmmin: u32,
    pub trim: bool,
    pub namespaces: Vec<SimNamespace>,
    pub irq: IrqRange,
    pub device_gone: bool,
    pub fatal_on_enable: bool,
    pub never_ready: bool,
    pub reject_host_memory: bool,
    pub dma_limit: Option<usize>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            cpu_count: 4,
            granted_io_queues: 4,
            mqes_z: 63,
            mdts: 5,
            hmpre: 0,
            hmmin: 0,
            trim: true,
            namespaces: vec![SimNamespace {
                nsid: 1,
                lbads: 9,
                blocks: 4096,
            }],
            irq: IrqRange {
                base: 48,
                count: 4,
                mode: IrqMode::MsiX,
            },
            device_gone: false,
            fatal_on_enable: false,
            never_ready: false,
            reject_host_memory: false,
            dma_limit: None,
        }
    }
}

/// An NVM command as the device executed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Executed {
    pub qid: u16,
    pub opcode: u8,
    pub nsid: u32,
    pub slba: u64,
    pub blocks: u32,
    pub fua: bool,
    pub trim: Option<DatasetRange>,
}

struct SubmissionQueue {
    base: u64,
    entries: u32,
    head: u32,
    tail: u32,
    cqid: u16,
}

struct CompletionQueue {
    base: u64,
    entries: u32,
    head: u32,
    tail: u32,
    phase: bool,
    vector: u16,
}

#[derive(Default)]
struct DeviceState {
    cc: u32,
    csts: u32,
    aqa: u32,
    asq: u64,
    acq: u64,
    sqs: BTreeMap<u16, SubmissionQueue>,
    cqs: BTreeMap<u16, CompletionQueue>,
    disks: BTreeMap<u32, (u8, Vec<u8>)>,
    executed: Vec<Executed>,
    requested_io_queues: Option<u16>,
    host_memory: Option<(u32, Vec<HostMemoryDescriptor>)>,
    io_paused: bool,
    fail_next_io: Option<u8>,
    shutdown: bool,
}

pub struct SimDevice {
    config: SimConfig,
    state: Mutex<DeviceState>,
    wake: Condvar,
}

fn padded<const N: usize>(text: &str) -> [u8; N] {
    let mut out = [b' '; N];
    out[..text.len()].copy_from_slice(text.as_bytes());
    out
}

unsafe fn copy_to_phys(addr: u64, bytes: &[u8]) {
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len()) }
}

/// Walks PRP1/PRP2 (and the PRP list PRP2 may point to) for a transfer of
/// `len` bytes.
unsafe fn prp_segments(command: &Command, len: usize) -> Vec<(u64, usize)> {
    let page = PAGE_SIZE as u64;
    let first = len.min(PAGE_SIZE - (command.prp1 % page) as usize);
    let mut segments = vec![(command.prp1, first)];
    let mut remaining = len - first;
    if remaining == 0 {
        return segments;
    }
    if remaining <= PAGE_SIZE {
        segments.push((command.prp2, remaining));
        return segments;
    }
    let list = command.prp2 as *const u64;
    let mut index = 0;
    while remaining > 0 {
        let chunk = remaining.min(PAGE_SIZE);
        segments.push((unsafe { list.add(index).read_volatile() }, chunk));
        remaining -= chunk;
        index += 1;
    }
    segments
}

impl SimDevice {
    fn new(config: SimConfig) -> Self {
        let disks = config
            .namespaces
            .iter()
            .map(|ns| (ns.nsid, (ns.lbads, vec![0u8; (ns.blocks as usize) << ns.lbads])))
            .collect();
        Self {
            config,
            state: Mutex::new(DeviceState {
                disks,
                ..DeviceState::default()
            }),
            wake: Condvar::new(),
        }
    }

    fn cap(&self) -> u64 {
        Cap::new()
            .with_mqes_z(self.config.mqes_z)
            .with_cqr(true)
            .with_ams_weighted_round_robin(true)
            .with_to(1)
            .with_css_nvm(true)
            .into()
    }

    fn serve(&self, router: &IrqRouter) {
        loop {
            let raised = {
                let mut state = self.state.lock().unwrap();
                loop {
                    if state.shutdown {
                        return;
                    }
                    let raised = state.run(&self.config);
                    if !raised.is_empty() {
                        break raised;
                    }
                    state = self.wake.wait_timeout(state, Duration::from_millis(2)).unwrap().0;
                }
            };
            for vector in raised {
                router.dispatch(self.config.irq.base + u32::from(vector));
            }
        }
    }
}

impl RegisterIo for SimDevice {
    #[allow(clippy::cast_possible_truncation)]
    fn read_u32(&self, offset: usize) -> u32 {
        if self.config.device_gone {
            return u32::MAX;
        }
        let state = self.state.lock().unwrap();
        match offset {
            0x00 => self.cap() as u32,
            0x04 => (self.cap() >> 32) as u32,
            0x08 => Vs::new().with_mjr(1).with_mnr(4).into(),
            0x14 => state.cc,
            0x1C => state.csts,
            0x24 => state.aqa,
            0x28 => state.asq as u32,
            0x2C => (state.asq >> 32) as u32,
            0x30 => state.acq as u32,
            0x34 => (state.acq >> 32) as u32,
            _ => 0,
        }
    }

    fn write_u32(&self, offset: usize, value: u32) {
        let mut state = self.state.lock().unwrap();
        match offset {
            0x14 => state.write_cc(value, &self.config),
            0x24 => state.aqa = value,
            0x28 => state.asq = (state.asq & !0xFFFF_FFFF) | u64::from(value),
            0x2C => state.asq = (state.asq & 0xFFFF_FFFF) | (u64::from(value) << 32),
            0x30 => state.acq = (state.acq & !0xFFFF_FFFF) | u64::from(value),
            0x34 => state.acq = (state.acq & 0xFFFF_FFFF) | (u64::from(value) << 32),
            doorbell if doorbell >= 0x1000 => {
                let index = (doorbell - 0x1000) / 4;
                let qid = u16::try_from(index / 2).unwrap();
                if index % 2 == 0 {
                    if let Some(sq) = state.sqs.get_mut(&qid) {
                        sq.tail = value;
                    }
                } else if let Some(cq) = state.cqs.get_mut(&qid) {
                    cq.head = value;
                }
                self.wake.notify_all();
            }
            _ => {}
        }
    }
}

impl DeviceState {
    fn write_cc(&mut self, value: u32, config: &SimConfig) {
        let old = Cc::from(self.cc);
        let new = Cc::from(value);
        self.cc = value;
        if !old.en() && new.en() {
            let aqa = Aqa::from(self.aqa);
            self.sqs.insert(
                0,
                SubmissionQueue {
                    base: self.asq,
                    entries: u32::from(aqa.asqs_z()) + 1,
                    head: 0,
                    tail: 0,
                    cqid: 0,
                },
            );
            self.cqs.insert(
                0,
                CompletionQueue {
                    base: self.acq,
                    entries: u32::from(aqa.acqs_z()) + 1,
                    head: 0,
                    tail: 0,
                    phase: true,
                    vector: 0,
                },
            );
            let csts = if config.fatal_on_enable {
                Csts::new().with_cfs(true)
            } else {
                Csts::new().with_rdy(!config.never_ready)
            };
            self.csts = csts.into();
        } else if old.en() && !new.en() {
            self.sqs.clear();
            self.cqs.clear();
            self.csts = 0;
        }
    }

    /// Executes everything the host has queued; returns the vectors to raise.
    fn run(&mut self, config: &SimConfig) -> BTreeSet<u16> {
        let mut raised = BTreeSet::new();
        let ids: Vec<u16> = self.sqs.keys().copied().collect();
        for sqid in ids {
            if sqid != 0 && self.io_paused {
                continue;
            }
            loop {
                let Some(sq) = self.sqs.get(&sqid) else { break };
                if sq.head == sq.tail {
                    break;
                }
                let cqid = sq.cqid;
                let Some(cq) = self.cqs.get(&cqid) else { break };
                if (cq.tail + 1) % cq.entries == cq.head {
                    break;
                }

                let command = unsafe { ((sq.base + u64::from(sq.head) * 64) as *const Command).read_volatile() };
                let sq = self.sqs.get_mut(&sqid).unwrap();
                sq.head = (sq.head + 1) % sq.entries;
                let sqhd = u16::try_from(sq.head).unwrap();

                let (dw0, sct, sc) = if sqid == 0 {
                    self.admin(&command, config)
                } else {
                    self.io(sqid, &command)
                };

                let cq = self.cqs.get_mut(&cqid).unwrap();
                let completion = Completion {
                    dw0,
                    dw1: 0,
                    sqhd,
                    sqid,
                    cid: command.cdw0.cid(),
                    status: CompletionStatus::new().with_phase(cq.phase).with_sct(sct).with_sc(sc),
                };
                unsafe { ((cq.base + u64::from(cq.tail) * 16) as *mut Completion).write_volatile(completion) };
                cq.tail = (cq.tail + 1) % cq.entries;
                if cq.tail == 0 {
                    cq.phase = !cq.phase;
                }
                raised.insert(cq.vector);
            }
        }
        raised
    }

    fn admin(&mut self, command: &Command, config: &SimConfig) -> (u32, u8, u8) {
        const OK: (u32, u8, u8) = (0, status::TYPE_GENERIC, status::SUCCESS);
        const INVALID_FIELD: (u32, u8, u8) = (0, status::TYPE_GENERIC, status::INVALID_FIELD);

        match AdminOpcode::try_from(command.opcode()) {
            Ok(AdminOpcode::Identify) => match IdentifyCns::try_from(command.cdw10 as u8) {
                Ok(IdentifyCns::Controller) => {
                    let mut id = IdentifyController::new_zeroed();
                    id.sn = padded("SIM-0001");
                    id.mn = padded("Simulated NVMe Controller");
                    id.fr = padded("1.0");
                    id.mdts = config.mdts;
                    id.hmpre = config.hmpre;
                    id.hmmin = config.hmmin;
                    id.nn = u32::try_from(config.namespaces.len()).unwrap();
                    id.oncs = if config.trim { ONCS_DATASET_MANAGEMENT } else { 0 };
                    unsafe { copy_to_phys(command.prp1, id.as_bytes()) };
                    OK
                }
                Ok(IdentifyCns::ActiveNamespaces) => {
                    let mut list = [0u32; 1024];
                    let active = config.namespaces.iter().filter(|ns| ns.nsid > command.nsid);
                    for (slot, ns) in list.iter_mut().zip(active) {
                        *slot = ns.nsid;
                    }
                    unsafe { copy_to_phys(command.prp1, list.as_bytes()) };
                    OK
                }
                Ok(IdentifyCns::Namespace) => {
                    let Some(ns) = config.namespaces.iter().find(|ns| ns.nsid == command.nsid) else {
                        return INVALID_FIELD;
                    };
                    let mut id = IdentifyNamespace::new_zeroed();
                    id.nsze = ns.blocks;
                    id.ncap = ns.blocks;
                    id.nuse = ns.blocks;
                    id.lbaf[0] = LbaFormat::new().with_lbads(ns.lbads);
                    unsafe { copy_to_phys(command.prp1, id.as_bytes()) };
                    OK
                }
                Err(_) => INVALID_FIELD,
            },
            Ok(AdminOpcode::SetFeatures) => match FeatureId::try_from(command.cdw10 as u8) {
                Ok(FeatureId::NumberOfQueues) => {
                    let requested = NumberOfQueues::from(command.cdw11);
                    self.requested_io_queues = Some(requested.nsq_z() + 1);
                    let granted = config.granted_io_queues - 1;
                    let dw0 = NumberOfQueues::new().with_nsq_z(granted).with_ncq_z(granted);
                    (dw0.into(), status::TYPE_GENERIC, status::SUCCESS)
                }
                Ok(FeatureId::HostMemoryBuffer) => {
                    if config.reject_host_memory {
                        return INVALID_FIELD;
                    }
                    let list = (u64::from(command.cdw13) | (u64::from(command.cdw14) << 32)) as *const HostMemoryDescriptor;
                    let descriptors = (0..command.cdw15 as usize)
                        .map(|i| unsafe { list.add(i).read_volatile() })
                        .collect();
                    self.host_memory = Some((command.cdw12, descriptors));
                    OK
                }
                _ => INVALID_FIELD,
            },
            Ok(AdminOpcode::CreateIoCompletionQueue) => {
                let dword = Cdw10CreateQueue::from(command.cdw10);
                if dword.qid() == 0 || self.cqs.contains_key(&dword.qid()) {
                    return (0, status::TYPE_COMMAND_SPECIFIC, status::INVALID_QUEUE_IDENTIFIER);
                }
                self.cqs.insert(
                    dword.qid(),
                    CompletionQueue {
                        base: command.prp1,
                        entries: u32::from(dword.qsize_z()) + 1,
                        head: 0,
                        tail: 0,
                        phase: true,
                        vector: Cdw11CreateCompletionQueue::from(command.cdw11).iv(),
                    },
                );
                OK
            }
            Ok(AdminOpcode::CreateIoSubmissionQueue) => {
                let dword = Cdw10CreateQueue::from(command.cdw10);
                let cqid = Cdw11CreateSubmissionQueue::from(command.cdw11).cqid();
                if !self.cqs.contains_key(&cqid) {
                    return (0, status::TYPE_COMMAND_SPECIFIC, status::COMPLETION_QUEUE_INVALID);
                }
                if dword.qid() == 0 || self.sqs.contains_key(&dword.qid()) {
                    return (0, status::TYPE_COMMAND_SPECIFIC, status::INVALID_QUEUE_IDENTIFIER);
                }
                self.sqs.insert(
                    dword.qid(),
                    SubmissionQueue {
                        base: command.prp1,
                        entries: u32::from(dword.qsize_z()) + 1,
                        head: 0,
                        tail: 0,
                        cqid,
                    },
                );
                OK
            }
            _ => (0, status::TYPE_GENERIC, status::INVALID_OPCODE),
        }
    }

    fn io(&mut self, qid: u16, command: &Command) -> (u32, u8, u8) {
        let rw = Cdw12ReadWrite::from(command.cdw12);
        let mut executed = Executed {
            qid,
            opcode: command.opcode(),
            nsid: command.nsid,
            slba: u64::from(command.cdw10) | (u64::from(command.cdw11) << 32),
            blocks: u32::from(rw.nlb_z()) + 1,
            fua: rw.fua(),
            trim: None,
        };
        let opcode = NvmOpcode::try_from(command.opcode());
        if opcode == Ok(NvmOpcode::DatasetManagement) {
            let range = unsafe { (command.prp1 as *const DatasetRange).read_volatile() };
            executed.slba = range.starting_lba;
            executed.blocks = range.lba_count;
            executed.trim = Some(range);
        }
        if opcode == Ok(NvmOpcode::Flush) {
            executed.slba = 0;
            executed.blocks = 0;
        }
        self.executed.push(executed);

        if let Some(code) = self.fail_next_io.take() {
            return (0, status::TYPE_GENERIC, code);
        }
        let Some((lbads, disk)) = self.disks.get_mut(&command.nsid) else {
            return (0, status::TYPE_GENERIC, status::INVALID_FIELD);
        };
        let start = (executed.slba as usize) << *lbads;
        let len = (executed.blocks as usize) << *lbads;
        if start + len > disk.len() {
            return (0, status::TYPE_GENERIC, status::LBA_OUT_OF_RANGE);
        }

        match opcode {
            Ok(NvmOpcode::Read) => {
                let mut at = start;
                for (addr, chunk) in unsafe { prp_segments(command, len) } {
                    unsafe { copy_to_phys(addr, &disk[at..at + chunk]) };
                    at += chunk;
                }
            }
            Ok(NvmOpcode::Write) => {
                let mut at = start;
                for (addr, chunk) in unsafe { prp_segments(command, len) } {
                    let src = unsafe { std::slice::from_raw_parts(addr as *const u8, chunk) };
                    disk[at..at + chunk].copy_from_slice(src);
                    at += chunk;
                }
            }
            Ok(NvmOpcode::DatasetManagement) => disk[start..start + len].fill(0),
            Ok(NvmOpcode::Flush) => {}
            _ => return (0, status::TYPE_GENERIC, status::INVALID_OPCODE),
        }
        (0, status::TYPE_GENERIC, status::SUCCESS)
    }
}

/// A running simulated controller plus the interrupt router it raises
/// vectors on.
pub struct Sim {
    pub device: Arc<SimDevice>,
    pub platform: Arc<SimPlatform>,
    pub router: Arc<IrqRouter>,
    worker: Option<JoinHandle<()>>,
}

impl Sim {
    pub fn start(config: SimConfig) -> Self {
        let platform = Arc::new(SimPlatform::new(config.cpu_count, config.dma_limit));
        let device = Arc::new(SimDevice::new(config));
        let router = Arc::new(IrqRouter::new());
        let worker = {
            let device = Arc::clone(&device);
            let router = Arc::clone(&router);
            std::thread::spawn(move || device.serve(&router))
        };
        Self {
            device,
            platform,
            router,
            worker: Some(worker),
        }
    }

    pub fn platform(&self) -> Arc<dyn Platform> {
        self.platform.clone()
    }

    pub fn resources(&self) -> ControllerResources {
        ControllerResources {
            registers: self.device.clone(),
            irq: self.device.config.irq,
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut DeviceState) -> R) -> R {
        f(&mut self.device.state.lock().unwrap())
    }

    /// NVM commands executed so far.
    pub fn executed(&self) -> Vec<Executed> {
        self.with_state(|s| s.executed.clone())
    }

    pub fn clear_executed(&self) {
        self.with_state(|s| s.executed.clear());
    }

    /// While paused, I/O submission queues are not fetched.
    pub fn pause_io(&self, paused: bool) {
        self.with_state(|s| s.io_paused = paused);
        self.device.wake.notify_all();
    }

    /// Fails the next NVM command with generic status `code`.
    pub fn fail_next_io(&self, code: u8) {
        self.with_state(|s| s.fail_next_io = Some(code));
    }

    pub fn requested_io_queues(&self) -> Option<u16> {
        self.with_state(|s| s.requested_io_queues)
    }

    /// I/O submission and completion queues the device has created.
    pub fn io_queues(&self) -> (usize, usize) {
        self.with_state(|s| (s.sqs.len() - 1, s.cqs.len() - 1))
    }

    /// Interrupt vector of I/O completion queue `qid`.
    pub fn cq_vector(&self, qid: u16) -> Option<u16> {
        self.with_state(|s| s.cqs.get(&qid).map(|cq| cq.vector))
    }

    pub fn host_memory(&self) -> Option<(u32, Vec<HostMemoryDescriptor>)> {
        self.with_state(|s| s.host_memory.clone())
    }

    pub fn disk(&self, nsid: u32) -> Vec<u8> {
        self.with_state(|s| s.disks[&nsid].1.clone())
    }

    pub fn fill_disk(&self, nsid: u32, f: impl Fn(usize) -> u8) {
        self.with_state(|s| {
            for (i, byte) in s.disks.get_mut(&nsid).unwrap().1.iter_mut().enumerate() {
                *byte = f(i);
            }
        });
    }
}

impl Drop for Sim {
    fn drop(&mut self) {
        self.with_state(|s| s.shutdown = true);
        self.device.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
