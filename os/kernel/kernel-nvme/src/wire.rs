//! NVMe wire format: controller registers, queue entries, identify data.
//!
//! Everything here is bit-exact to NVM Express Base 2.0 and the PCIe
//! transport binding. Structures shared with the device derive `zerocopy`
//! traits so they can be copied in and out of DMA memory without casts, and
//! their layout is pinned by compile-time assertions.

use bitfield_struct::bitfield;
use core::mem::offset_of;
use kernel_mmio::{Register32, Register64};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

/// Memory page size the driver programs into `CC.MPS` (`MPS = 0`).
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// Offset of the first doorbell register in BAR0.
pub const DOORBELL_BASE: usize = 0x1000;

/// Size in bytes of a submission queue entry (`CC.IOSQES = 6`).
pub const COMMAND_SIZE: usize = 64;
/// Size in bytes of a completion queue entry (`CC.IOCQES = 4`).
pub const COMPLETION_SIZE: usize = 16;

/// Offset of the submission tail (`completion == false`) or completion head
/// doorbell of queue `qid`.
#[must_use]
pub const fn doorbell_offset(qid: u16, completion: bool, dstrd: u8) -> usize {
    DOORBELL_BASE + ((2 * qid as usize + completion as usize) << (2 + dstrd as usize))
}

/// Controller Capabilities (`CAP`, offset `0x00`).
#[bitfield(u64)]
pub struct Cap {
    /// Bits 0-15: maximum queue entries supported, zero-based.
    pub mqes_z: u16,
    /// Bit 16: contiguous queues required.
    pub cqr: bool,
    /// Bit 17: weighted round robin with urgent priority class arbitration.
    pub ams_weighted_round_robin: bool,
    pub ams_vendor_specific: bool,
    #[bits(5)]
    __: u8,
    /// Bits 24-31: worst-case time for `CSTS.RDY` to follow `CC.EN`, in
    /// 500 ms units.
    pub to: u8,
    /// Bits 32-35: doorbell stride, as `2 ^ (2 + DSTRD)` bytes.
    #[bits(4)]
    pub dstrd: u8,
    pub nssrs: bool,
    /// Bit 37: NVM command set supported.
    pub css_nvm: bool,
    #[bits(7)]
    __: u8,
    /// Bit 45: boot partition support.
    pub bps: bool,
    #[bits(2)]
    pub cps: u8,
    /// Bits 48-51: minimum memory page size, as `2 ^ (12 + MPSMIN)`.
    #[bits(4)]
    pub mpsmin: u8,
    #[bits(4)]
    pub mpsmax: u8,
    #[bits(8)]
    __: u8,
}

impl Register64 for Cap {
    const OFFSET: usize = 0x00;
}

/// Version (`VS`, offset `0x08`).
#[bitfield(u32)]
pub struct Vs {
    pub ter: u8,
    pub mnr: u8,
    pub mjr: u16,
}

impl Register32 for Vs {
    const OFFSET: usize = 0x08;
}

/// Controller Configuration (`CC`, offset `0x14`).
#[bitfield(u32)]
pub struct Cc {
    /// Bit 0: enable.
    pub en: bool,
    #[bits(3)]
    __: u8,
    /// Bits 4-6: I/O command set selected (0 = NVM).
    #[bits(3)]
    pub css: u8,
    /// Bits 7-10: memory page size, as `2 ^ (12 + MPS)`.
    #[bits(4)]
    pub mps: u8,
    /// Bits 11-13: arbitration mechanism (0 = round robin, 1 = weighted
    /// round robin with urgent).
    #[bits(3)]
    pub ams: u8,
    /// Bits 14-15: shutdown notification.
    #[bits(2)]
    pub shn: u8,
    /// Bits 16-19: submission queue entry size, as `2 ^ IOSQES`.
    #[bits(4)]
    pub iosqes: u8,
    /// Bits 20-23: completion queue entry size, as `2 ^ IOCQES`.
    #[bits(4)]
    pub iocqes: u8,
    #[bits(8)]
    __: u8,
}

impl Register32 for Cc {
    const OFFSET: usize = 0x14;
}

/// Controller Status (`CSTS`, offset `0x1C`).
#[bitfield(u32)]
pub struct Csts {
    /// Bit 0: ready.
    pub rdy: bool,
    /// Bit 1: controller fatal status.
    pub cfs: bool,
    #[bits(2)]
    pub shst: u8,
    pub nssro: bool,
    pub pp: bool,
    #[bits(26)]
    __: u32,
}

impl Csts {
    /// Reads of a surprise-removed PCIe device return all ones.
    #[must_use]
    pub const fn is_device_gone(&self) -> bool {
        self.0 == u32::MAX
    }
}

impl Register32 for Csts {
    const OFFSET: usize = 0x1C;
}

/// Admin Queue Attributes (`AQA`, offset `0x24`).
#[bitfield(u32)]
pub struct Aqa {
    /// Bits 0-11: admin submission queue size, zero-based.
    #[bits(12)]
    pub asqs_z: u16,
    #[bits(4)]
    __: u8,
    /// Bits 16-27: admin completion queue size, zero-based.
    #[bits(12)]
    pub acqs_z: u16,
    #[bits(4)]
    __: u8,
}

impl Register32 for Aqa {
    const OFFSET: usize = 0x24;
}

macro_rules! address_register {
    ($(#[$meta:meta])* $name:ident = $offset:literal) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq)]
        pub struct $name(pub u64);

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl Register64 for $name {
            const OFFSET: usize = $offset;
        }
    };
}

address_register!(
    /// Admin Submission Queue Base Address (`ASQ`, offset `0x28`).
    Asq = 0x28
);
address_register!(
    /// Admin Completion Queue Base Address (`ACQ`, offset `0x30`).
    Acq = 0x30
);

macro_rules! opcodes {
    ($(#[$meta:meta])* $vis:vis enum $name:ident { $($variant:ident = $value:literal,)* }) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq)]
        #[repr(u8)]
        $vis enum $name {
            $($variant = $value,)*
        }

        impl TryFrom<u8> for $name {
            type Error = u8;

            fn try_from(value: u8) -> Result<Self, u8> {
                match value {
                    $($value => Ok(Self::$variant),)*
                    other => Err(other),
                }
            }
        }
    };
}

opcodes! {
    /// Admin command set opcodes.
    pub enum AdminOpcode {
        DeleteIoSubmissionQueue = 0x00,
        CreateIoSubmissionQueue = 0x01,
        GetLogPage = 0x02,
        DeleteIoCompletionQueue = 0x04,
        CreateIoCompletionQueue = 0x05,
        Identify = 0x06,
        Abort = 0x08,
        SetFeatures = 0x09,
        GetFeatures = 0x0A,
        AsynchronousEventRequest = 0x0C,
        NamespaceManagement = 0x0D,
        FirmwareCommit = 0x10,
        FirmwareImageDownload = 0x11,
        NamespaceAttachment = 0x15,
        KeepAlive = 0x18,
    }
}

opcodes! {
    /// NVM command set opcodes.
    pub enum NvmOpcode {
        Flush = 0x00,
        Write = 0x01,
        Read = 0x02,
        WriteUncorrectable = 0x04,
        Compare = 0x05,
        WriteZeroes = 0x08,
        DatasetManagement = 0x09,
        ReservationRegister = 0x0D,
        ReservationReport = 0x0E,
        ReservationAcquire = 0x11,
        ReservationRelease = 0x15,
    }
}

opcodes! {
    /// Feature identifiers for Get/Set Features.
    pub enum FeatureId {
        Arbitration = 0x01,
        PowerManagement = 0x02,
        TemperatureThreshold = 0x04,
        VolatileWriteCache = 0x06,
        NumberOfQueues = 0x07,
        InterruptCoalescing = 0x08,
        HostMemoryBuffer = 0x0D,
    }
}

opcodes! {
    /// Identify controller-or-namespace structure selector (`CNS`).
    pub enum IdentifyCns {
        Namespace = 0x00,
        Controller = 0x01,
        ActiveNamespaces = 0x02,
    }
}

/// Status codes the driver and its tests care about.
pub mod status {
    pub const TYPE_GENERIC: u8 = 0;
    pub const TYPE_COMMAND_SPECIFIC: u8 = 1;

    pub const SUCCESS: u8 = 0x00;
    pub const INVALID_OPCODE: u8 = 0x01;
    pub const INVALID_FIELD: u8 = 0x02;
    pub const DATA_TRANSFER_ERROR: u8 = 0x04;
    pub const LBA_OUT_OF_RANGE: u8 = 0x80;

    /// Command specific: Create I/O SQ named a completion queue that does
    /// not exist.
    pub const COMPLETION_QUEUE_INVALID: u8 = 0x00;
    pub const INVALID_QUEUE_IDENTIFIER: u8 = 0x01;
}

/// Command Dword 0.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cdw0 {
    pub opcode: u8,
    /// Fused operation.
    #[bits(2)]
    pub fuse: u8,
    #[bits(4)]
    __: u8,
    /// PRP or SGL for data transfer (0 = PRPs).
    #[bits(2)]
    pub psdt: u8,
    /// Command identifier; the queue pair stamps the submission slot here.
    pub cid: u16,
}

/// Submission queue entry.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Command {
    pub cdw0: Cdw0,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub mptr: u64,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

const _: () = assert!(size_of::<Command>() == COMMAND_SIZE);
const _: () = assert!(offset_of!(Command, prp1) == 24);
const _: () = assert!(offset_of!(Command, cdw10) == 40);

/// Completion status field (upper half of completion dword 3).
#[bitfield(u16)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CompletionStatus {
    /// Toggled by the controller on every pass through the completion queue.
    pub phase: bool,
    /// Status code.
    pub sc: u8,
    /// Status code type.
    #[bits(3)]
    pub sct: u8,
    /// Command retry delay.
    #[bits(2)]
    pub crd: u8,
    pub more: bool,
    /// Do not retry.
    pub dnr: bool,
}

/// Completion queue entry.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Completion {
    /// Command specific result.
    pub dw0: u32,
    pub dw1: u32,
    /// How far the controller has consumed the submission queue `sqid`.
    pub sqhd: u16,
    pub sqid: u16,
    pub cid: u16,
    pub status: CompletionStatus,
}

const _: () = assert!(size_of::<Completion>() == COMPLETION_SIZE);

impl Completion {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status.sct() == status::TYPE_GENERIC && self.status.sc() == status::SUCCESS
    }
}

/// Read / Write command dword 12.
#[bitfield(u32)]
pub struct Cdw12ReadWrite {
    /// Number of logical blocks, zero-based.
    pub nlb_z: u16,
    #[bits(14)]
    __: u16,
    /// Force unit access.
    pub fua: bool,
    /// Limited retry.
    pub lr: bool,
}

/// Create I/O Completion / Submission Queue dword 10.
#[bitfield(u32)]
pub struct Cdw10CreateQueue {
    pub qid: u16,
    /// Queue size in entries, zero-based.
    pub qsize_z: u16,
}

/// Create I/O Completion Queue dword 11.
#[bitfield(u32)]
pub struct Cdw11CreateCompletionQueue {
    /// Physically contiguous.
    pub pc: bool,
    /// Interrupts enabled.
    pub ien: bool,
    #[bits(14)]
    __: u16,
    /// Interrupt vector (MSI-X table index).
    pub iv: u16,
}

/// Create I/O Submission Queue dword 11.
#[bitfield(u32)]
pub struct Cdw11CreateSubmissionQueue {
    pub pc: bool,
    /// Queue priority for weighted round robin arbitration.
    #[bits(2)]
    pub qprio: u8,
    #[bits(13)]
    __: u16,
    pub cqid: u16,
}

/// Set / Get Features dword 10.
#[bitfield(u32)]
pub struct Cdw10Features {
    pub fid: u8,
    #[bits(23)]
    __: u32,
    /// Save across power cycles.
    pub sv: bool,
}

/// Number of Queues feature value, in dword 11 of Set Features and dword 0
/// of its completion.
#[bitfield(u32)]
pub struct NumberOfQueues {
    /// Submission queues requested / allocated, zero-based.
    pub nsq_z: u16,
    /// Completion queues requested / allocated, zero-based.
    pub ncq_z: u16,
}

/// Host Memory Buffer feature dword 11.
#[bitfield(u32)]
pub struct Cdw11HostMemoryBuffer {
    /// Enable host memory.
    pub ehm: bool,
    /// Memory return: the buffer contents are the same as when last
    /// disabled.
    pub mr: bool,
    #[bits(30)]
    __: u32,
}

/// Identify dword 10.
#[bitfield(u32)]
pub struct Cdw10Identify {
    pub cns: u8,
    __: u8,
    pub cntid: u16,
}

/// Dataset Management dword 11.
#[bitfield(u32)]
pub struct Cdw11DatasetManagement {
    /// Integral dataset for read.
    pub idr: bool,
    /// Integral dataset for write.
    pub idw: bool,
    /// Deallocate.
    pub ad: bool,
    #[bits(29)]
    __: u32,
}

/// One range of a Dataset Management command.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct DatasetRange {
    pub context_attributes: u32,
    pub lba_count: u32,
    pub starting_lba: u64,
}

const _: () = assert!(size_of::<DatasetRange>() == 16);

/// Host Memory Buffer descriptor list entry.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HostMemoryDescriptor {
    /// Buffer address, page aligned.
    pub badd: u64,
    /// Buffer size in memory pages.
    pub bsize: u32,
    pub rsvd: u32,
}

const _: () = assert!(size_of::<HostMemoryDescriptor>() == 16);

/// Identify Controller data structure (`CNS = 01h`).
#[repr(C)]
#[derive(Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IdentifyController {
    pub vid: u16,
    pub ssvid: u16,
    /// Serial number, ASCII, space padded.
    pub sn: [u8; 20],
    /// Model number, ASCII, space padded.
    pub mn: [u8; 40],
    /// Firmware revision.
    pub fr: [u8; 8],
    pub rab: u8,
    pub ieee: [u8; 3],
    pub cmic: u8,
    /// Maximum data transfer size, as a power of two multiple of the minimum
    /// page size. Zero means no limit.
    pub mdts: u8,
    pub cntlid: u16,
    pub ver: u32,
    pub rtd3r: u32,
    pub rtd3e: u32,
    pub oaes: u32,
    pub ctratt: u32,
    pub rsvd0: [u8; 156],
    pub oacs: u16,
    pub acl: u8,
    pub aerl: u8,
    pub frmw: u8,
    pub lpa: u8,
    pub elpe: u8,
    pub npss: u8,
    pub avscc: u8,
    pub apsta: u8,
    pub wctemp: u16,
    pub cctemp: u16,
    pub mtfa: u16,
    /// Host memory buffer preferred size, in 4 KiB units.
    pub hmpre: u32,
    /// Host memory buffer minimum size, in 4 KiB units.
    pub hmmin: u32,
    pub rsvd1: [u8; 232],
    pub sqes: u8,
    pub cqes: u8,
    pub maxcmd: u16,
    /// Number of namespaces.
    pub nn: u32,
    /// Optional NVM command support.
    pub oncs: u16,
    pub fuses: u16,
    pub fna: u8,
    pub vwc: u8,
    pub awun: u16,
    pub awupf: u16,
    pub rsvd2: [u8; 3566],
}

const _: () = assert!(size_of::<IdentifyController>() == 4096);
const _: () = assert!(offset_of!(IdentifyController, sn) == 4);
const _: () = assert!(offset_of!(IdentifyController, mn) == 24);
const _: () = assert!(offset_of!(IdentifyController, mdts) == 77);
const _: () = assert!(offset_of!(IdentifyController, oacs) == 256);
const _: () = assert!(offset_of!(IdentifyController, hmpre) == 272);
const _: () = assert!(offset_of!(IdentifyController, sqes) == 512);
const _: () = assert!(offset_of!(IdentifyController, nn) == 516);
const _: () = assert!(offset_of!(IdentifyController, oncs) == 520);

/// `ONCS` bit 2: Dataset Management supported.
pub const ONCS_DATASET_MANAGEMENT: u16 = 1 << 2;

impl IdentifyController {
    #[must_use]
    pub fn serial(&self) -> &str {
        ascii_field(&self.sn)
    }

    #[must_use]
    pub fn model(&self) -> &str {
        ascii_field(&self.mn)
    }

    #[must_use]
    pub fn firmware(&self) -> &str {
        ascii_field(&self.fr)
    }

    #[must_use]
    pub const fn supports_dataset_management(&self) -> bool {
        self.oncs & ONCS_DATASET_MANAGEMENT != 0
    }
}

fn ascii_field(raw: &[u8]) -> &str {
    core::str::from_utf8(raw)
        .unwrap_or_default()
        .trim_end_matches([' ', '\0'])
}

/// LBA format descriptor.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct LbaFormat {
    /// Metadata bytes per block.
    pub ms: u16,
    /// LBA data size, as a power of two.
    pub lbads: u8,
    /// Relative performance.
    #[bits(2)]
    pub rp: u8,
    #[bits(6)]
    __: u8,
}

/// Identify Namespace data structure (`CNS = 00h`).
#[repr(C)]
#[derive(Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IdentifyNamespace {
    /// Namespace size in logical blocks.
    pub nsze: u64,
    pub ncap: u64,
    pub nuse: u64,
    pub nsfeat: u8,
    /// Number of LBA formats, zero-based.
    pub nlbaf: u8,
    /// Formatted LBA size; bits 0-3 index `lbaf`.
    pub flbas: u8,
    pub mc: u8,
    pub dpc: u8,
    pub dps: u8,
    pub nmic: u8,
    pub rescap: u8,
    pub fpi: u8,
    pub dlfeat: u8,
    pub nawun: u16,
    pub nawupf: u16,
    pub nacwu: u16,
    pub nabsn: u16,
    pub nabo: u16,
    pub nabspf: u16,
    pub noiob: u16,
    pub nvmcap: [u8; 16],
    pub rsvd0: [u8; 64],
    pub lbaf: [LbaFormat; 16],
    pub rsvd1: [u8; 3904],
}

const _: () = assert!(size_of::<IdentifyNamespace>() == 4096);
const _: () = assert!(offset_of!(IdentifyNamespace, flbas) == 26);
const _: () = assert!(offset_of!(IdentifyNamespace, lbaf) == 128);

impl IdentifyNamespace {
    /// The LBA format the namespace is currently formatted with.
    #[must_use]
    pub fn lba_format(&self) -> LbaFormat {
        self.lbaf[usize::from(self.flbas & 0xF)]
    }
}

/// Active namespace ID list (`CNS = 02h`): up to 1024 ids, zero terminated.
pub type NamespaceList = [u32; 1024];

impl Command {
    fn with_opcode(opcode: u8, nsid: u32) -> Self {
        let mut command = Self::new_zeroed();
        command.cdw0 = Cdw0::new().with_opcode(opcode);
        command.nsid = nsid;
        command
    }

    #[must_use]
    pub fn opcode(&self) -> u8 {
        self.cdw0.opcode()
    }

    /// Read `blocks` (1..=65536) logical blocks starting at `lba`.
    #[must_use]
    pub fn read(nsid: u32, lba: u64, blocks: u32) -> Self {
        Self::read_write(NvmOpcode::Read, nsid, lba, blocks, false)
    }

    /// Write `blocks` (1..=65536) logical blocks starting at `lba`.
    #[must_use]
    pub fn write(nsid: u32, lba: u64, blocks: u32, fua: bool) -> Self {
        Self::read_write(NvmOpcode::Write, nsid, lba, blocks, fua)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read_write(opcode: NvmOpcode, nsid: u32, lba: u64, blocks: u32, fua: bool) -> Self {
        debug_assert!((1..=0x1_0000).contains(&blocks), "invalid block count {blocks}");
        let mut command = Self::with_opcode(opcode as u8, nsid);
        command.cdw10 = lba as u32;
        command.cdw11 = (lba >> 32) as u32;
        command.cdw12 = Cdw12ReadWrite::new()
            .with_nlb_z((blocks - 1) as u16)
            .with_fua(fua)
            .into();
        command
    }

    #[must_use]
    pub fn flush(nsid: u32) -> Self {
        Self::with_opcode(NvmOpcode::Flush as u8, nsid)
    }

    /// Deallocate a single range; the [`DatasetRange`] itself travels in the
    /// data buffer.
    #[must_use]
    pub fn deallocate(nsid: u32) -> Self {
        let mut command = Self::with_opcode(NvmOpcode::DatasetManagement as u8, nsid);
        // Number of ranges, zero-based.
        command.cdw10 = 0;
        command.cdw11 = Cdw11DatasetManagement::new().with_ad(true).into();
        command
    }

    #[must_use]
    pub fn identify(cns: IdentifyCns, nsid: u32) -> Self {
        let mut command = Self::with_opcode(AdminOpcode::Identify as u8, nsid);
        command.cdw10 = Cdw10Identify::new().with_cns(cns as u8).into();
        command
    }

    /// Create an I/O completion queue of `entries` entries that signals
    /// interrupt vector `vector`.
    #[must_use]
    pub fn create_io_completion_queue(qid: u16, entries: u32, vector: u16) -> Self {
        let mut command = Self::with_opcode(AdminOpcode::CreateIoCompletionQueue as u8, 0);
        command.cdw10 = Self::queue_dword(qid, entries);
        command.cdw11 = Cdw11CreateCompletionQueue::new()
            .with_pc(true)
            .with_ien(true)
            .with_iv(vector)
            .into();
        command
    }

    #[must_use]
    pub fn create_io_submission_queue(qid: u16, entries: u32, cqid: u16) -> Self {
        let mut command = Self::with_opcode(AdminOpcode::CreateIoSubmissionQueue as u8, 0);
        command.cdw10 = Self::queue_dword(qid, entries);
        command.cdw11 = Cdw11CreateSubmissionQueue::new()
            .with_pc(true)
            .with_cqid(cqid)
            .into();
        command
    }

    #[allow(clippy::cast_possible_truncation)]
    fn queue_dword(qid: u16, entries: u32) -> u32 {
        debug_assert!((2..=0x1_0000).contains(&entries));
        Cdw10CreateQueue::new()
            .with_qid(qid)
            .with_qsize_z((entries - 1) as u16)
            .into()
    }

    fn set_features(fid: FeatureId) -> Self {
        let mut command = Self::with_opcode(AdminOpcode::SetFeatures as u8, 0);
        command.cdw10 = Cdw10Features::new().with_fid(fid as u8).into();
        command
    }

    /// Request `io_queues` (1..=65535) I/O submission and completion queues.
    #[must_use]
    pub fn set_number_of_queues(io_queues: u16) -> Self {
        debug_assert!(io_queues >= 1);
        let mut command = Self::set_features(FeatureId::NumberOfQueues);
        command.cdw11 = NumberOfQueues::new()
            .with_nsq_z(io_queues - 1)
            .with_ncq_z(io_queues - 1)
            .into();
        command
    }

    /// Hand the controller `pages` pages of host memory described by
    /// `descriptor_count` [`HostMemoryDescriptor`]s at `descriptors`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn set_host_memory_buffer(pages: u32, descriptors: u64, descriptor_count: u32) -> Self {
        let mut command = Self::set_features(FeatureId::HostMemoryBuffer);
        command.cdw11 = Cdw11HostMemoryBuffer::new().with_ehm(true).into();
        command.cdw12 = pages;
        command.cdw13 = descriptors as u32;
        command.cdw14 = (descriptors >> 32) as u32;
        command.cdw15 = descriptor_count;
        command
    }
}
