//! Virtual-Machine Control State (VMCS) region management and field access.
//!
//! ## Details
//! See Intel® 64 and IA-32 Architectures Software Developer's Manual,
//! 24.2 FORMAT OF THE VMCS REGION.

use crate::{
    intrinsics::{MemoryOps, VmxIntrinsics},
    vm_control::IA32_VMX_BASIC,
    VmxError, VmxInstruction,
};
use alloc::boxed::Box;
use static_assertions::const_assert_eq;

/// Size of the exit-handler stack owned by the coordinator, in bytes.
pub const STACK_SIZE: usize = 0x6000;

/// The 4 KiB VMCS page.
///
/// Only the first two words have an architecturally defined layout; the rest
/// is in an implementation-specific format reached through VMREAD/VMWRITE.
#[repr(align(4096))]
pub struct Vmcs {
    /// Bits 30:0: VMCS revision identifier.
    /// Bit 31: shadow-VMCS indicator.
    rev_id: u32,
    /// VMX-abort indicator.
    indicator: u32,
    /// VMCS data (implementation-specific format).
    _data: [u8; 0x1000 - 8],
}

const_assert_eq!(core::mem::size_of::<Vmcs>(), 0x1000);

impl Vmcs {
    fn new(intrinsics: &dyn VmxIntrinsics) -> Self {
        // Bit 31 of IA32_VMX_BASIC is reserved; an ordinary (non-shadow)
        // VMCS keeps the shadow indicator clear.
        let rev_id = (intrinsics.read_msr(IA32_VMX_BASIC) & 0x7FFF_FFFF) as u32;
        Self {
            rev_id,
            indicator: 0,
            _data: [0; 0x1000 - 8],
        }
    }
}

/// Possible errors for vm-related instructions.
///
/// # Details
/// See Intel® 64 and IA-32 Architectures Software Developer's Manual,
/// Table 30-1. VM-Instruction Error Numbers.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Copy)]
pub enum InstructionError {
    /// VMCALL executed in VMX root operation
    VmcallInVmxRoot,
    /// VMCLEAR with invalid physical address
    VmclearWithInvAddr,
    /// VMCLEAR with VMXON pointer
    VmclearWithVmxon,
    /// VMLAUNCH with non-clear VMCS
    VmresumeWithNonclearVmcs,
    /// VMRESUME with non-launched VMCS
    VmresumeWithNonlaunchedVmcs,
    /// VMRESUME after VMXOFF
    VmresumeAfterVmxoff,
    /// VM entry with invalid control field(s)
    InvalidControlState,
    /// VM entry with invalid host-state field(s)
    InvalidHostState,
    /// VMPTRLD with invalid physical address
    VmPtrLdWithInvAddr,
    /// VMPTRLD with VMXON pointer
    VmPtrLdWithVmxOn,
    /// VMPTRLD with incorrect VMCS revision identifier
    VmPtrLdWithIncorrectRevId,
    /// VMREAD/VMWRITE from/to unsupported VMCS component
    UnsupportedVmcsField,
    /// VMWRITE to read-only VMCS component
    WriteToRoField,
    /// VMXON executed in VMX root operation
    VmxonInVmxRoot,
    /// VM entry with invalid executive-VMCS pointer
    VmEntryWithInvalidExecVmcs,
    /// VM entry with non-launched executive VMCS
    VmEntryWithNonlaunchedExecVmcs,
    /// VM entry with executive-VMCS pointer not VMXON pointer
    VmEntryWithExecVmcs,
    /// VMCALL with non-clear VMCS
    VmcallWithNonclearVmcs,
    /// VMCALL with invalid VM-exit control fields
    VmcallWithInvVmexitCs,
    /// VMCALL with incorrect MSEG revision identifier
    VmcallWithIncorrectMsegRevId,
    /// VMXOFF under dual-monitor treatment of SMIs and SMM
    VmxoffUnderDualMonitorTreatment,
    /// VMCALL with invalid SMM-monitor features
    VmcallWithInvSmmMonitor,
    /// VM entry with invalid VM-execution control fields in executive VMCS
    VmentryWithInvVmExecCs,
    /// VM entry with events blocked by MOV SS.
    VmentryWithEventBlockedByMovss,
    /// Invalid operand to INVEPT/INVVPID.
    InvalidOperandToInveptInvvpid,
    /// Unknown error.
    Unknown,
}

impl InstructionError {
    /// Decode a raw `VM_INSTRUCTION_ERROR` field value.
    pub fn from_raw(v: u64) -> Self {
        match v {
            1 => InstructionError::VmcallInVmxRoot,
            2 => InstructionError::VmclearWithInvAddr,
            3 => InstructionError::VmclearWithVmxon,
            4 => InstructionError::VmresumeWithNonclearVmcs,
            5 => InstructionError::VmresumeWithNonlaunchedVmcs,
            6 => InstructionError::VmresumeAfterVmxoff,
            7 => InstructionError::InvalidControlState,
            8 => InstructionError::InvalidHostState,
            9 => InstructionError::VmPtrLdWithInvAddr,
            10 => InstructionError::VmPtrLdWithVmxOn,
            11 => InstructionError::VmPtrLdWithIncorrectRevId,
            12 => InstructionError::UnsupportedVmcsField,
            13 => InstructionError::WriteToRoField,
            15 => InstructionError::VmxonInVmxRoot,
            16 => InstructionError::VmEntryWithInvalidExecVmcs,
            17 => InstructionError::VmEntryWithNonlaunchedExecVmcs,
            18 => InstructionError::VmEntryWithExecVmcs,
            19 => InstructionError::VmcallWithNonclearVmcs,
            20 => InstructionError::VmcallWithInvVmexitCs,
            22 => InstructionError::VmcallWithIncorrectMsegRevId,
            23 => InstructionError::VmxoffUnderDualMonitorTreatment,
            24 => InstructionError::VmcallWithInvSmmMonitor,
            25 => InstructionError::VmentryWithInvVmExecCs,
            26 => InstructionError::VmentryWithEventBlockedByMovss,
            28 => InstructionError::InvalidOperandToInveptInvvpid,
            _ => InstructionError::Unknown,
        }
    }
}

/// Vmcs field.
#[allow(missing_docs)]
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    // 16bit fields
    Vpid = 0x00000000,
    PostedInterruptVector = 0x00000002,
    EptpIndex = 0x00000004,
    GuestEsSelector = 0x00000800,
    GuestCsSelector = 0x00000802,
    GuestSsSelector = 0x00000804,
    GuestDsSelector = 0x00000806,
    GuestFsSelector = 0x00000808,
    GuestGsSelector = 0x0000080A,
    GuestLdtrSelector = 0x0000080C,
    GuestTrSelector = 0x0000080E,
    GuestInterruptStatus = 0x00000810,
    HostEsSelector = 0x00000C00,
    HostCsSelector = 0x00000C02,
    HostSsSelector = 0x00000C04,
    HostDsSelector = 0x00000C06,
    HostFsSelector = 0x00000C08,
    HostGsSelector = 0x00000C0A,
    HostTrSelector = 0x00000C0C,
    // 64bit fields
    IoBitmapA = 0x00002000,
    IoBitmapAHi = 0x00002001,
    IoBitmapB = 0x00002002,
    IoBitmapBHi = 0x00002003,
    MsrBitmaps = 0x00002004,
    MsrBitmapsHi = 0x00002005,
    VmexitMsrStoreAddr = 0x00002006,
    VmexitMsrStoreAddrHi = 0x00002007,
    VmexitMsrLoadAddr = 0x00002008,
    VmexitMsrLoadAddrHi = 0x00002009,
    VmentryMsrLoadAddr = 0x0000200A,
    VmentryMsrLoadAddrHi = 0x0000200B,
    ExecutiveVmcsPtr = 0x0000200C,
    ExecutiveVmcsPtrHi = 0x0000200D,
    PmlAddress = 0x0000200E,
    PmlAddressHi = 0x0000200F,
    TscOffset = 0x00002010,
    TscOffsetHi = 0x00002011,
    VirtualApicPageAddr = 0x00002012,
    VirtualApicPageAddrHi = 0x00002013,
    ApicAccessAddr = 0x00002014,
    ApicAccessAddrHi = 0x00002015,
    PostedInterruptDescAddr = 0x00002016,
    PostedInterruptDescAddrHi = 0x00002017,
    VmfuncCtrls = 0x00002018,
    VmfuncCtrlsHi = 0x00002019,
    Eptptr = 0x0000201A,
    EptptrHi = 0x0000201B,
    EoiExitBitmap0 = 0x0000201C,
    EoiExitBitmap0Hi = 0x0000201D,
    EoiExitBitmap1 = 0x0000201E,
    EoiExitBitmap1Hi = 0x0000201F,
    EoiExitBitmap2 = 0x00002020,
    EoiExitBitmap2Hi = 0x00002021,
    EoiExitBitmap3 = 0x00002022,
    EoiExitBitmap3Hi = 0x00002023,
    EptpListAddress = 0x00002024,
    EptpListAddressHi = 0x00002025,
    VmreadBitmapAddr = 0x00002026,
    VmreadBitmapAddrHi = 0x00002027,
    VmwriteBitmapAddr = 0x00002028,
    VmwriteBitmapAddrHi = 0x00002029,
    VeExceptionInfoAddr = 0x0000202A,
    VeExceptionInfoAddrHi = 0x0000202B,
    GuestPhysicalAddr = 0x00002400,
    GuestPhysicalAddrHi = 0x00002401,
    GuestLinkPointer = 0x00002800,
    GuestLinkPointerHi = 0x00002801,
    GuestIa32Debugctl = 0x00002802,
    GuestIa32DebugctlHi = 0x00002803,
    GuestIa32Pat = 0x00002804,
    GuestIa32PatHi = 0x00002805,
    GuestIa32Efer = 0x00002806,
    GuestIa32EferHi = 0x00002807,
    GuestIa32PerfGlobalCtrl = 0x00002808,
    GuestIa32PerfGlobalCtrlHi = 0x00002809,
    GuestIa32Pdpte0 = 0x0000280A,
    GuestIa32Pdpte0Hi = 0x0000280B,
    GuestIa32Pdpte1 = 0x0000280C,
    GuestIa32Pdpte1Hi = 0x0000280D,
    GuestIa32Pdpte2 = 0x0000280E,
    GuestIa32Pdpte2Hi = 0x0000280F,
    GuestIa32Pdpte3 = 0x00002810,
    GuestIa32Pdpte3Hi = 0x00002811,
    HostIa32Pat = 0x00002C00,
    HostIa32PatHi = 0x00002C01,
    HostIa32Efer = 0x00002C02,
    HostIa32EferHi = 0x00002C03,
    HostIa32PerfGlobalCtrl = 0x00002C04,
    HostIa32PerfGlobalCtrlHi = 0x00002C05,
    // 32bit fields
    PinBasedExecControls = 0x00004000,
    ProcessorBasedVmexecControls = 0x00004002,
    ExceptionBitmap = 0x00004004,
    PageFaultErrCodeMask = 0x00004006,
    PageFaultErrCodeMatch = 0x00004008,
    Cr3TargetCount = 0x0000400A,
    VmexitControls = 0x0000400C,
    VmexitMsrStoreCount = 0x0000400E,
    VmexitMsrLoadCount = 0x00004010,
    VmentryControls = 0x00004012,
    VmentryMsrLoadCount = 0x00004014,
    VmentryInterruptionInfo = 0x00004016,
    VmentryExceptionErrCode = 0x00004018,
    VmentryInstructionLength = 0x0000401A,
    TprThreshold = 0x0000401C,
    SecondaryVmexecControls = 0x0000401E,
    PauseLoopExitingGap = 0x00004020,
    PauseLoopExitingWindow = 0x00004022,
    InstructionError = 0x00004400,
    VmexitReason = 0x00004402,
    VmexitInterruptionInfo = 0x00004404,
    VmexitInterruptionErrCode = 0x00004406,
    IdtVectoringInfo = 0x00004408,
    IdtVectoringErrCode = 0x0000440A,
    VmexitInstructionLength = 0x0000440C,
    VmexitInstructionInfo = 0x0000440E,
    GuestEsLimit = 0x00004800,
    GuestCsLimit = 0x00004802,
    GuestSsLimit = 0x00004804,
    GuestDsLimit = 0x00004806,
    GuestFsLimit = 0x00004808,
    GuestGsLimit = 0x0000480A,
    GuestLdtrLimit = 0x0000480C,
    GuestTrLimit = 0x0000480E,
    GuestGdtrLimit = 0x00004810,
    GuestIdtrLimit = 0x00004812,
    GuestEsAccessRights = 0x00004814,
    GuestCsAccessRights = 0x00004816,
    GuestSsAccessRights = 0x00004818,
    GuestDsAccessRights = 0x0000481A,
    GuestFsAccessRights = 0x0000481C,
    GuestGsAccessRights = 0x0000481E,
    GuestLdtrAccessRights = 0x00004820,
    GuestTrAccessRights = 0x00004822,
    GuestInterruptibilityState = 0x00004824,
    GuestActivityState = 0x00004826,
    GuestSmbase = 0x00004828,
    GuestIa32SysenterCsMsr = 0x0000482A,
    GuestPreemptionTimerValue = 0x0000482E,
    HostIa32SysenterCsMsr = 0x00004C00,
    // Natural-width fields
    Cr0GuestHostMask = 0x00006000,
    Cr4GuestHostMask = 0x00006002,
    Cr0ReadShadow = 0x00006004,
    Cr4ReadShadow = 0x00006006,
    Cr3Target0 = 0x00006008,
    Cr3Target1 = 0x0000600A,
    Cr3Target2 = 0x0000600C,
    Cr3Target3 = 0x0000600E,
    VmexitQualification = 0x00006400,
    IoRcx = 0x00006402,
    IoRsi = 0x00006404,
    IoRdi = 0x00006406,
    IoRip = 0x00006408,
    GuestLinearAddr = 0x0000640A,
    GuestCr0 = 0x00006800,
    GuestCr3 = 0x00006802,
    GuestCr4 = 0x00006804,
    GuestEsBase = 0x00006806,
    GuestCsBase = 0x00006808,
    GuestSsBase = 0x0000680A,
    GuestDsBase = 0x0000680C,
    GuestFsBase = 0x0000680E,
    GuestGsBase = 0x00006810,
    GuestLdtrBase = 0x00006812,
    GuestTrBase = 0x00006814,
    GuestGdtrBase = 0x00006816,
    GuestIdtrBase = 0x00006818,
    GuestDr7 = 0x0000681A,
    GuestRsp = 0x0000681C,
    GuestRip = 0x0000681E,
    GuestRflags = 0x00006820,
    GuestPendingDbgExceptions = 0x00006822,
    GuestIa32SysenterEspMsr = 0x00006824,
    GuestIa32SysenterEipMsr = 0x00006826,
    HostCr0 = 0x00006C00,
    HostCr3 = 0x00006C02,
    HostCr4 = 0x00006C04,
    HostFsBase = 0x00006C06,
    HostGsBase = 0x00006C08,
    HostTrBase = 0x00006C0A,
    HostGdtrBase = 0x00006C0C,
    HostIdtrBase = 0x00006C0E,
    HostIa32SysenterEspMsr = 0x00006C10,
    HostIa32SysenterEipMsr = 0x00006C12,
    HostRsp = 0x00006C14,
    HostRip = 0x00006C16,
}

/// The VMCS page together with its recorded physical address.
///
/// The physical address is non-zero for the whole lifetime of the value;
/// creation fails instead of publishing an untranslatable region.
pub struct VmcsRegion {
    page: Box<Vmcs>,
    phys: u64,
}

impl VmcsRegion {
    /// Allocate a region, stamp the revision identifier and record the
    /// physical address of the page.
    pub fn create(
        intrinsics: &dyn VmxIntrinsics,
        memory: &dyn MemoryOps,
    ) -> Result<Self, VmxError> {
        let page = Box::new(Vmcs::new(intrinsics));
        let phys = memory.virt_to_phys(&*page as *const Vmcs as *const u8);
        if phys == 0 {
            return Err(VmxError::RegionAllocationFailed);
        }
        log::debug!("vmcs region at {:p}, phys {:#x}", &*page, phys);
        Ok(Self { page, phys })
    }

    /// Physical address of the page.
    pub fn phys(&self) -> u64 {
        self.phys
    }

    /// Revision identifier stamped at offset 0.
    pub fn revision(&self) -> u32 {
        self.page.rev_id
    }

    /// `VMCLEAR` this region.
    pub fn clear(&self, intrinsics: &dyn VmxIntrinsics) -> Result<(), VmxError> {
        if intrinsics.vmclear(&self.phys) {
            Ok(())
        } else {
            Err(VmxError::VmxInstructionFailed(VmxInstruction::Clear))
        }
    }

    /// `VMPTRLD` this region, making it the current VMCS of the logical CPU.
    pub fn load(&self, intrinsics: &dyn VmxIntrinsics) -> Result<(), VmxError> {
        if intrinsics.vmptrld(&self.phys) {
            Ok(())
        } else {
            Err(VmxError::VmxInstructionFailed(VmxInstruction::Load))
        }
    }
}

/// Host-side stack the exit handler runs on.
///
/// Lives exactly as long as the VMCS region it accompanies. The top, rounded
/// down to 16 bytes, is what `HOST_RSP` receives.
pub struct ExitHandlerStack {
    buf: Box<[u8]>,
}

impl ExitHandlerStack {
    /// Allocate a `STACK_SIZE`-byte stack.
    pub fn create() -> Self {
        Self {
            buf: alloc::vec![0u8; STACK_SIZE].into_boxed_slice(),
        }
    }

    /// Base address of the buffer.
    pub fn base(&self) -> *const u8 {
        self.buf.as_ptr()
    }

    /// Value for `HOST_RSP`: one past the end of the buffer, 16-byte aligned.
    pub fn top(&self) -> u64 {
        stack_top(self.buf.as_ptr() as u64, STACK_SIZE as u64)
    }
}

pub(crate) fn stack_top(base: u64, size: u64) -> u64 {
    (base + size) & !0xF
}

/// A loaded, current VMCS, reachable through VMREAD/VMWRITE.
///
/// These two accessors are the only way the rest of the crate touches VMCS
/// contents.
pub struct ActiveVmcs<'a> {
    intrinsics: &'a dyn VmxIntrinsics,
}

impl<'a> ActiveVmcs<'a> {
    pub(crate) fn new(intrinsics: &'a dyn VmxIntrinsics) -> Self {
        Self { intrinsics }
    }

    /// Read from the vmcs field of the activated vmcs.
    pub fn read(&self, field: Field) -> Result<u64, VmxError> {
        self.intrinsics
            .vmread(field as u64)
            .ok_or(VmxError::VmreadFailed(field))
    }

    /// Write to the vmcs field of the activated vmcs.
    pub fn write(&self, field: Field, v: u64) -> Result<(), VmxError> {
        if self.intrinsics.vmwrite(field as u64, v) {
            Ok(())
        } else {
            Err(VmxError::VmwriteFailed(field))
        }
    }

    /// Decode the last VM-instruction error of this VMCS.
    ///
    /// An unreadable error field degrades to [`InstructionError::Unknown`]
    /// rather than failing, since this is only reached on diagnostic paths.
    pub fn instruction_error(&self) -> InstructionError {
        match self.read(Field::InstructionError) {
            Ok(v) => InstructionError::from_raw(v),
            Err(_) => InstructionError::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockIntrinsics, MockMemory};
    use crate::VmxError;

    #[test]
    fn field_encodings_match_sdm() {
        assert_eq!(Field::GuestCsSelector as i32, 0x0802);
        assert_eq!(Field::GuestLinkPointer as i32, 0x2800);
        assert_eq!(Field::PmlAddress as i32, 0x200E);
        assert_eq!(Field::PinBasedExecControls as i32, 0x4000);
        assert_eq!(Field::InstructionError as i32, 0x4400);
        assert_eq!(Field::HostRsp as i32, 0x6C14);
        assert_eq!(Field::HostRip as i32, 0x6C16);
    }

    #[test]
    fn region_is_stamped_with_revision_id() {
        let intr = MockIntrinsics::new();
        let mem = MockMemory::new();
        intr.set_msr(crate::vm_control::IA32_VMX_BASIC, 0x8000_0012);
        let region = VmcsRegion::create(&intr, &mem).unwrap();
        // Bit 31 (shadow indicator) is masked off.
        assert_eq!(region.revision(), 0x12);
        assert_eq!(
            region.revision() as u64,
            intr.read_msr_value(crate::vm_control::IA32_VMX_BASIC) & 0x7FFF_FFFF
        );
        assert_ne!(region.phys(), 0);
    }

    #[test]
    fn unmappable_region_fails_creation() {
        let intr = MockIntrinsics::new();
        let mem = MockMemory::new();
        mem.fail_virt_to_phys.set(true);
        assert_eq!(
            VmcsRegion::create(&intr, &mem).err(),
            Some(VmxError::RegionAllocationFailed)
        );
    }

    #[test]
    fn clear_and_load_map_instruction_failures() {
        let intr = MockIntrinsics::new();
        let mem = MockMemory::new();
        let region = VmcsRegion::create(&intr, &mem).unwrap();

        intr.fail_vmclear.set(true);
        assert_eq!(
            region.clear(&intr).err(),
            Some(VmxError::VmxInstructionFailed(crate::VmxInstruction::Clear))
        );
        intr.fail_vmclear.set(false);
        assert!(region.clear(&intr).is_ok());

        intr.fail_vmptrld.set(true);
        assert_eq!(
            region.load(&intr).err(),
            Some(VmxError::VmxInstructionFailed(crate::VmxInstruction::Load))
        );
        intr.fail_vmptrld.set(false);
        assert!(region.load(&intr).is_ok());
        assert_eq!(intr.loaded_phys.get(), region.phys());
    }

    #[test]
    fn stack_top_rounds_down_to_16_bytes() {
        assert_eq!(stack_top(0x1000, 0x4000), 0x5000);
        assert_eq!(stack_top(0x1001, 0x4000), 0x5000);
        assert_eq!(stack_top(0x100F, 0x4000), 0x5000);
    }

    #[test]
    fn stack_top_is_aligned_and_inside_buffer() {
        let stack = ExitHandlerStack::create();
        let top = stack.top();
        let base = stack.base() as u64;
        assert_eq!(top & 0xF, 0);
        assert!(top > base);
        assert!(top <= base + STACK_SIZE as u64);
    }

    #[test]
    fn instruction_error_decodes_table_30_1() {
        assert_eq!(
            InstructionError::from_raw(7),
            InstructionError::InvalidControlState
        );
        assert_eq!(
            InstructionError::from_raw(8),
            InstructionError::InvalidHostState
        );
        assert_eq!(
            InstructionError::from_raw(12),
            InstructionError::UnsupportedVmcsField
        );
        assert_eq!(InstructionError::from_raw(14), InstructionError::Unknown);
        assert_eq!(InstructionError::from_raw(0xBEEF), InstructionError::Unknown);
    }

    #[test]
    fn active_vmcs_maps_read_write_failures() {
        let intr = MockIntrinsics::new();
        let vmcs = ActiveVmcs::new(&intr);

        vmcs.write(Field::GuestRip, 0x1234).unwrap();
        assert_eq!(vmcs.read(Field::GuestRip).unwrap(), 0x1234);

        intr.fail_vmwrite.set(true);
        assert_eq!(
            vmcs.write(Field::GuestRsp, 0).err(),
            Some(VmxError::VmwriteFailed(Field::GuestRsp))
        );
        intr.fail_vmwrite.set(false);

        intr.fail_vmread_field.set(Some(Field::GuestRsp as u64));
        assert_eq!(
            vmcs.read(Field::GuestRsp).err(),
            Some(VmxError::VmreadFailed(Field::GuestRsp))
        );
    }
}
