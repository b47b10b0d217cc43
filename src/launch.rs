//! Launch, resume, and promote orchestration.
//!
//! `VmxCoordinator::launch` walks the whole pipeline: region and stack
//! acquisition, `VMCLEAR`/`VMPTRLD`, the guest/host/control field writers,
//! control synthesis against the capability MSRs, and finally `VMLAUNCH`.
//! Every failure path releases what was acquired, in reverse order, before
//! the error propagates.

use crate::{
    checks::Checker,
    diag,
    intrinsics::{MemoryOps, VmxIntrinsics},
    state::{CpuState, GeneralPurposeRegisters},
    vm_control::*,
    vmcs::{ActiveVmcs, ExitHandlerStack, Field, VmcsRegion},
    Never, VmxError,
};

/// Trampoline the resume path tails into. Not expected to return.
pub type ResumeTrampoline = unsafe extern "C" fn(*mut GeneralPurposeRegisters);

/// Trampoline the promotion path tails into. Not expected to return.
pub type PromoteTrampoline = unsafe extern "C" fn(u64);

/// Code addresses outside the core that the coordinator transfers into.
#[derive(Clone, Copy)]
pub struct EntryPoints {
    /// Address written verbatim to `HOST_RIP`; the CPU jumps here on VM exit.
    pub exit_handler: u64,
    /// Restores a saved guest context and issues `VMRESUME`.
    pub resume: ResumeTrampoline,
    /// Restores the host state as a regular, non-VMX context.
    pub promote: PromoteTrampoline,
}

/// Progress of the launch pipeline, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// No launch attempted yet, or resources released.
    Idle,
    /// VMCS region allocated and translated.
    RegionCreated,
    /// Exit-handler stack allocated.
    StackCreated,
    /// `VMCLEAR` done.
    Cleared,
    /// `VMPTRLD` done; the region is current.
    Loaded,
    /// Guest and host state written.
    StateWritten,
    /// Execution controls seeded and synthesized.
    ControlsWritten,
    /// `VMLAUNCH` accepted; the guest is running.
    Launched,
    /// The pipeline raised; resources are released.
    Failed,
}

/// Owner of the VMCS region and exit stack across a launch.
///
/// Borrows the ports for its own lifetime and stores nothing else about the
/// environment. A mock implementation of the ports drives the same code in
/// tests.
pub struct VmxCoordinator<'a> {
    intrinsics: &'a dyn VmxIntrinsics,
    memory: &'a dyn MemoryOps,
    entries: EntryPoints,
    checker: Checker,
    region: Option<VmcsRegion>,
    stack: Option<ExitHandlerStack>,
    stage: Stage,
}

impl<'a> VmxCoordinator<'a> {
    /// Create an idle coordinator over the given ports and entry points.
    pub fn new(
        intrinsics: &'a dyn VmxIntrinsics,
        memory: &'a dyn MemoryOps,
        entries: EntryPoints,
    ) -> Self {
        Self {
            intrinsics,
            memory,
            entries,
            checker: Checker::new(),
            region: None,
            stack: None,
            stage: Stage::Idle,
        }
    }

    /// The pre-launch checker, for registering guest-state checks.
    pub fn checker_mut(&mut self) -> &mut Checker {
        &mut self.checker
    }

    /// Current pipeline stage.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Physical address of the live VMCS region, 0 when none is held.
    pub fn region_phys(&self) -> u64 {
        self.region.as_ref().map_or(0, |r| r.phys())
    }

    /// Base of the live exit-handler stack, null when none is held.
    pub fn stack_base(&self) -> *const u8 {
        self.stack
            .as_ref()
            .map_or(core::ptr::null(), |s| s.base())
    }

    /// Release held resources in reverse order of acquisition. Idempotent.
    pub fn release(&mut self) {
        if let Some(stack) = self.stack.take() {
            drop(stack);
        }
        if let Some(region) = self.region.take() {
            drop(region);
        }
        self.stage = Stage::Idle;
    }

    /// Build the VMCS from the two snapshots and enter the guest.
    ///
    /// On success the region and stack stay alive, owned by the coordinator,
    /// and conceptually in the hands of the exit handler. On any failure both
    /// are released before the error is returned; a failure of `VMLAUNCH`
    /// itself additionally runs the checker and dumps diagnostics.
    pub fn launch(&mut self, host: &CpuState, guest: &CpuState) -> Result<(), VmxError> {
        self.release();

        let region = match VmcsRegion::create(self.intrinsics, self.memory) {
            Ok(region) => region,
            Err(err) => {
                self.stage = Stage::Failed;
                return Err(err);
            }
        };
        self.stage = Stage::RegionCreated;
        let stack = ExitHandlerStack::create();
        self.stage = Stage::StackCreated;

        match self.enter(&region, &stack, host, guest) {
            Ok(()) => {
                self.region = Some(region);
                self.stack = Some(stack);
                self.stage = Stage::Launched;
                Ok(())
            }
            Err(err) => {
                // Reverse order of acquisition.
                drop(stack);
                drop(region);
                log::error!("launch failed at {:?}: {}", self.stage, err);
                self.stage = Stage::Failed;
                Err(err)
            }
        }
    }

    fn enter(
        &mut self,
        region: &VmcsRegion,
        stack: &ExitHandlerStack,
        host: &CpuState,
        guest: &CpuState,
    ) -> Result<(), VmxError> {
        // A newly allocated region must be VMCLEARed before VMPTRLD.
        region.clear(self.intrinsics)?;
        self.stage = Stage::Cleared;
        region.load(self.intrinsics)?;
        self.stage = Stage::Loaded;

        let vmcs = ActiveVmcs::new(self.intrinsics);
        write_guest_state(&vmcs, guest)?;
        write_host_state(&vmcs, host, stack, self.entries.exit_handler)?;
        self.stage = Stage::StateWritten;
        seed_control_state(&vmcs, self.intrinsics)?;
        synthesize_controls(&vmcs, self.intrinsics)?;
        self.stage = Stage::ControlsWritten;

        if self.intrinsics.vmlaunch() {
            return Ok(());
        }

        // The CPU refused the entry. Reconstruct which architectural check
        // it tripped on, then dump everything a post-mortem needs.
        if let Err(err) = self.checker.run(self.intrinsics) {
            log::error!("vm-entry check failed: {}", err);
        }
        diag::dump_controls(&vmcs);
        host.dump();
        guest.dump();
        Err(VmxError::LaunchFailed(vmcs.instruction_error()))
    }

    /// Re-enter a launched guest through the resume trampoline.
    ///
    /// The trampoline restores `saved_state` and issues `VMRESUME`; control
    /// only comes back here when the entry failed.
    pub fn resume(&self, saved_state: *mut GeneralPurposeRegisters) -> Result<Never, VmxError> {
        unsafe { (self.entries.resume)(saved_state) };
        log::error!("resume trampoline returned");
        Err(VmxError::ResumeReturned)
    }

    /// Leave VMX operation and continue as a regular context.
    ///
    /// The trampoline reloads the host state with `host_gs_base` in place;
    /// control only comes back here when promotion failed.
    pub fn promote(&self, host_gs_base: u64) -> Result<Never, VmxError> {
        unsafe { (self.entries.promote)(host_gs_base) };
        log::error!("promotion trampoline returned");
        Err(VmxError::PromoteReturned)
    }
}

/// 24.4 GUEST-STATE AREA.
pub(crate) fn write_guest_state(vmcs: &ActiveVmcs<'_>, s: &CpuState) -> Result<(), VmxError> {
    // 16-bit fields.
    vmcs.write(Field::GuestEsSelector, s.es_selector as u64)?;
    vmcs.write(Field::GuestCsSelector, s.cs_selector as u64)?;
    vmcs.write(Field::GuestSsSelector, s.ss_selector as u64)?;
    vmcs.write(Field::GuestDsSelector, s.ds_selector as u64)?;
    vmcs.write(Field::GuestFsSelector, s.fs_selector as u64)?;
    vmcs.write(Field::GuestGsSelector, s.gs_selector as u64)?;
    vmcs.write(Field::GuestLdtrSelector, s.ldtr_selector as u64)?;
    vmcs.write(Field::GuestTrSelector, s.tr_selector as u64)?;

    // 64-bit fields. A VMCS that does not use shadowing keeps the link
    // pointer at all-ones.
    vmcs.write(Field::GuestLinkPointer, !0u64)?;
    vmcs.write(Field::GuestIa32Debugctl, s.debugctl)?;
    vmcs.write(Field::GuestIa32Pat, s.pat)?;
    vmcs.write(Field::GuestIa32Efer, s.efer)?;
    vmcs.write(Field::GuestIa32PerfGlobalCtrl, s.perf_global_ctrl)?;

    // 32-bit fields.
    vmcs.write(Field::GuestEsLimit, s.es_limit as u64)?;
    vmcs.write(Field::GuestCsLimit, s.cs_limit as u64)?;
    vmcs.write(Field::GuestSsLimit, s.ss_limit as u64)?;
    vmcs.write(Field::GuestDsLimit, s.ds_limit as u64)?;
    vmcs.write(Field::GuestFsLimit, s.fs_limit as u64)?;
    vmcs.write(Field::GuestGsLimit, s.gs_limit as u64)?;
    vmcs.write(Field::GuestLdtrLimit, s.ldtr_limit as u64)?;
    vmcs.write(Field::GuestTrLimit, s.tr_limit as u64)?;
    vmcs.write(Field::GuestEsAccessRights, s.es_access_rights as u64)?;
    vmcs.write(Field::GuestCsAccessRights, s.cs_access_rights as u64)?;
    vmcs.write(Field::GuestSsAccessRights, s.ss_access_rights as u64)?;
    vmcs.write(Field::GuestDsAccessRights, s.ds_access_rights as u64)?;
    vmcs.write(Field::GuestFsAccessRights, s.fs_access_rights as u64)?;
    vmcs.write(Field::GuestGsAccessRights, s.gs_access_rights as u64)?;
    vmcs.write(Field::GuestLdtrAccessRights, s.ldtr_access_rights as u64)?;
    vmcs.write(Field::GuestTrAccessRights, s.tr_access_rights as u64)?;
    vmcs.write(Field::GuestGdtrLimit, s.gdtr_limit as u64)?;
    vmcs.write(Field::GuestIdtrLimit, s.idtr_limit as u64)?;
    vmcs.write(Field::GuestIa32SysenterCsMsr, s.sysenter_cs)?;

    // Natural-width fields.
    vmcs.write(Field::GuestCr0, s.cr0)?;
    vmcs.write(Field::GuestCr3, s.cr3)?;
    vmcs.write(Field::GuestCr4, s.cr4)?;
    vmcs.write(Field::GuestEsBase, s.es_base)?;
    vmcs.write(Field::GuestCsBase, s.cs_base)?;
    vmcs.write(Field::GuestSsBase, s.ss_base)?;
    vmcs.write(Field::GuestDsBase, s.ds_base)?;
    vmcs.write(Field::GuestFsBase, s.fs_base)?;
    vmcs.write(Field::GuestGsBase, s.gs_base)?;
    vmcs.write(Field::GuestLdtrBase, s.ldtr_base)?;
    vmcs.write(Field::GuestTrBase, s.tr_base)?;
    vmcs.write(Field::GuestGdtrBase, s.gdtr_base)?;
    vmcs.write(Field::GuestIdtrBase, s.idtr_base)?;
    vmcs.write(Field::GuestDr7, s.dr7)?;
    vmcs.write(Field::GuestRflags, s.rflags)?;
    vmcs.write(Field::GuestIa32SysenterEspMsr, s.sysenter_esp)?;
    vmcs.write(Field::GuestIa32SysenterEipMsr, s.sysenter_eip)?;
    Ok(())
}

/// 24.5 HOST-STATE AREA.
pub(crate) fn write_host_state(
    vmcs: &ActiveVmcs<'_>,
    s: &CpuState,
    stack: &ExitHandlerStack,
    exit_handler: u64,
) -> Result<(), VmxError> {
    // 16-bit fields.
    vmcs.write(Field::HostEsSelector, s.es_selector as u64)?;
    vmcs.write(Field::HostCsSelector, s.cs_selector as u64)?;
    vmcs.write(Field::HostSsSelector, s.ss_selector as u64)?;
    vmcs.write(Field::HostDsSelector, s.ds_selector as u64)?;
    vmcs.write(Field::HostFsSelector, s.fs_selector as u64)?;
    vmcs.write(Field::HostGsSelector, s.gs_selector as u64)?;
    vmcs.write(Field::HostTrSelector, s.tr_selector as u64)?;

    // 64-bit fields.
    vmcs.write(Field::HostIa32Pat, s.pat)?;
    vmcs.write(Field::HostIa32Efer, s.efer)?;
    vmcs.write(Field::HostIa32PerfGlobalCtrl, s.perf_global_ctrl)?;

    // 32-bit fields.
    vmcs.write(Field::HostIa32SysenterCsMsr, s.sysenter_cs)?;

    // Natural-width fields.
    vmcs.write(Field::HostCr0, s.cr0)?;
    vmcs.write(Field::HostCr3, s.cr3)?;
    vmcs.write(Field::HostCr4, s.cr4)?;
    vmcs.write(Field::HostFsBase, s.fs_base)?;
    vmcs.write(Field::HostGsBase, s.gs_base)?;
    vmcs.write(Field::HostTrBase, s.tr_base)?;
    vmcs.write(Field::HostGdtrBase, s.gdtr_base)?;
    vmcs.write(Field::HostIdtrBase, s.idtr_base)?;
    vmcs.write(Field::HostIa32SysenterEspMsr, s.sysenter_esp)?;
    vmcs.write(Field::HostIa32SysenterEipMsr, s.sysenter_eip)?;
    vmcs.write(Field::HostRsp, stack.top())?;
    vmcs.write(Field::HostRip, exit_handler)?;
    Ok(())
}

/// Seed the four true-capability control fields with every bit the processor
/// forces on. The secondary controls have no true-capability MSR and start at
/// zero, populated only through synthesis.
pub(crate) fn seed_control_state(
    vmcs: &ActiveVmcs<'_>,
    intrinsics: &dyn VmxIntrinsics,
) -> Result<(), VmxError> {
    vmcs.write(
        Field::PinBasedExecControls,
        seed(intrinsics.read_msr(IA32_VMX_TRUE_PINBASED_CTLS)) as u64,
    )?;
    vmcs.write(
        Field::ProcessorBasedVmexecControls,
        seed(intrinsics.read_msr(IA32_VMX_TRUE_PROC_BASED_CTLS)) as u64,
    )?;
    vmcs.write(
        Field::VmexitControls,
        seed(intrinsics.read_msr(IA32_VMX_TRUE_EXIT_CTLS)) as u64,
    )?;
    vmcs.write(
        Field::VmentryControls,
        seed(intrinsics.read_msr(IA32_VMX_TRUE_ENTRY_CTLS)) as u64,
    )?;
    Ok(())
}

/// Merge the desired feature bits into each seeded control field and
/// reconcile the result with the capability MSRs.
///
/// Unsupported desired bits are silently cleared and hardware-forced bits
/// silently set; the filter reports both to the debug log.
pub(crate) fn synthesize_controls(
    vmcs: &ActiveVmcs<'_>,
    intrinsics: &dyn VmxIntrinsics,
) -> Result<(), VmxError> {
    let desired_exit = VmcsExitCtl::SAVE_DEBUG_CTLS
        | VmcsExitCtl::HOST_ADDRESS_SPACE_SIZE
        | VmcsExitCtl::LOAD_IA32_PERF_GLOBAL_CTRL
        | VmcsExitCtl::ACK_INTR_ON_EXIT
        | VmcsExitCtl::SAVE_IA32_PAT
        | VmcsExitCtl::LOAD_IA32_PAT
        | VmcsExitCtl::SAVE_IA32_EFER
        | VmcsExitCtl::LOAD_IA32_EFER;
    let desired_entry = VmcsEntryCtl::LOAD_DEBUG_CTL
        | VmcsEntryCtl::IA32E_MODE_GUEST
        | VmcsEntryCtl::LOAD_IA32_PERF_GLOBAL_CTRL
        | VmcsEntryCtl::LOAD_IA32_PAT
        | VmcsEntryCtl::LOAD_IA32_EFER;
    let desired_proc2 = VmcsProcBasedSecondaryVmexecCtl::ENABLE_RDTSCP
        | VmcsProcBasedSecondaryVmexecCtl::ENABLE_INVPCID
        | VmcsProcBasedSecondaryVmexecCtl::ENABLE_XSAVES_XRSTORS;

    synthesize(
        vmcs,
        intrinsics,
        Field::PinBasedExecControls,
        IA32_VMX_TRUE_PINBASED_CTLS,
        VmcsPinBasedVmexecCtl::empty().bits(),
    )?;
    synthesize(
        vmcs,
        intrinsics,
        Field::ProcessorBasedVmexecControls,
        IA32_VMX_TRUE_PROC_BASED_CTLS,
        VmcsProcBasedVmexecCtl::ACTIVATE_SECONDARY_CTL.bits(),
    )?;
    synthesize(
        vmcs,
        intrinsics,
        Field::SecondaryVmexecControls,
        IA32_VMX_PROC_BASED_CTLS2,
        desired_proc2.bits(),
    )?;
    synthesize(
        vmcs,
        intrinsics,
        Field::VmexitControls,
        IA32_VMX_TRUE_EXIT_CTLS,
        desired_exit.bits(),
    )?;
    synthesize(
        vmcs,
        intrinsics,
        Field::VmentryControls,
        IA32_VMX_TRUE_ENTRY_CTLS,
        desired_entry.bits(),
    )?;
    Ok(())
}

fn synthesize(
    vmcs: &ActiveVmcs<'_>,
    intrinsics: &dyn VmxIntrinsics,
    field: Field,
    capability_msr: u32,
    desired: u32,
) -> Result<(), VmxError> {
    let current = vmcs.read(field)? as u32;
    let filtered = filter_unsupported(intrinsics.read_msr(capability_msr), current | desired);
    vmcs.write(field, filtered as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::vmcs::STACK_SIZE;
    use crate::{VmxError, VmxInstruction};

    fn coordinator<'a>(
        intr: &'a MockIntrinsics,
        mem: &'a MockMemory,
    ) -> VmxCoordinator<'a> {
        VmxCoordinator::new(intr, mem, entry_points())
    }

    #[test]
    fn happy_launch_keeps_resources_alive() {
        let intr = MockIntrinsics::new();
        let mem = MockMemory::new();
        let mut coord = coordinator(&intr, &mem);

        coord
            .launch(&sane_host_state(), &sane_guest_state())
            .unwrap();

        assert_eq!(coord.stage(), Stage::Launched);
        assert_ne!(coord.region_phys(), 0);
        assert!(!coord.stack_base().is_null());
        assert_eq!(intr.vmclear_calls.get(), 1);
        assert_eq!(intr.vmptrld_calls.get(), 1);
        assert_eq!(intr.loaded_phys.get(), coord.region_phys());
    }

    #[test]
    fn happy_launch_populates_the_field_set() {
        let intr = MockIntrinsics::new();
        let mem = MockMemory::new();
        let mut coord = coordinator(&intr, &mem);
        let host = sane_host_state();

        coord.launch(&host, &sane_guest_state()).unwrap();

        assert_eq!(intr.field(Field::GuestLinkPointer), !0u64);
        assert_eq!(intr.field(Field::HostCr0), host.cr0);
        assert_eq!(intr.field(Field::HostRip), entry_points().exit_handler);
        // Secondary controls were activated and carry the requested features.
        let proc = intr.field(Field::ProcessorBasedVmexecControls) as u32;
        assert_ne!(proc & VmcsProcBasedVmexecCtl::ACTIVATE_SECONDARY_CTL.bits(), 0);
        let proc2 = intr.field(Field::SecondaryVmexecControls) as u32;
        assert_ne!(proc2 & VmcsProcBasedSecondaryVmexecCtl::ENABLE_RDTSCP.bits(), 0);
    }

    #[test]
    fn host_rsp_is_aligned_and_within_the_stack() {
        let intr = MockIntrinsics::new();
        let mem = MockMemory::new();
        let mut coord = coordinator(&intr, &mem);

        coord
            .launch(&sane_host_state(), &sane_guest_state())
            .unwrap();

        let rsp = intr.field(Field::HostRsp);
        let base = coord.stack_base() as u64;
        assert_eq!(rsp & 0xF, 0);
        assert!(rsp > base);
        assert!(rsp <= base + STACK_SIZE as u64);
    }

    #[test]
    fn seeded_controls_equal_forced_capability_bits() {
        let intr = MockIntrinsics::new();
        let vmcs = ActiveVmcs::new(&intr);
        seed_control_state(&vmcs, &intr).unwrap();

        for (field, msr) in [
            (Field::PinBasedExecControls, IA32_VMX_TRUE_PINBASED_CTLS),
            (
                Field::ProcessorBasedVmexecControls,
                IA32_VMX_TRUE_PROC_BASED_CTLS,
            ),
            (Field::VmexitControls, IA32_VMX_TRUE_EXIT_CTLS),
            (Field::VmentryControls, IA32_VMX_TRUE_ENTRY_CTLS),
        ] {
            let cap = intr.read_msr_value(msr);
            assert_eq!(intr.field(field), seed(cap) as u64);
        }
    }

    #[test]
    fn unsupported_desired_bits_are_dropped() {
        let intr = MockIntrinsics::new();
        // Processor without XSAVES/INVPCID: allowed-1 only covers RDTSCP.
        intr.set_msr(
            IA32_VMX_PROC_BASED_CTLS2,
            (VmcsProcBasedSecondaryVmexecCtl::ENABLE_RDTSCP.bits() as u64) << 32,
        );
        let vmcs = ActiveVmcs::new(&intr);
        seed_control_state(&vmcs, &intr).unwrap();
        synthesize_controls(&vmcs, &intr).unwrap();
        assert_eq!(
            intr.field(Field::SecondaryVmexecControls) as u32,
            VmcsProcBasedSecondaryVmexecCtl::ENABLE_RDTSCP.bits()
        );
    }

    #[test]
    fn allocation_failure_releases_everything_before_any_write() {
        let intr = MockIntrinsics::new();
        let mem = MockMemory::new();
        mem.fail_virt_to_phys.set(true);
        let mut coord = coordinator(&intr, &mem);

        let err = coord
            .launch(&sane_host_state(), &sane_guest_state())
            .unwrap_err();

        assert_eq!(err, VmxError::RegionAllocationFailed);
        assert_eq!(coord.stage(), Stage::Failed);
        assert_eq!(coord.region_phys(), 0);
        assert!(coord.stack_base().is_null());
        assert!(intr.writes.borrow().is_empty());
    }

    #[test]
    fn vmclear_failure_stops_before_vmptrld() {
        let intr = MockIntrinsics::new();
        let mem = MockMemory::new();
        intr.fail_vmclear.set(true);
        let mut coord = coordinator(&intr, &mem);

        let err = coord
            .launch(&sane_host_state(), &sane_guest_state())
            .unwrap_err();

        assert_eq!(err, VmxError::VmxInstructionFailed(VmxInstruction::Clear));
        assert_eq!(intr.vmptrld_calls.get(), 0);
        assert_eq!(coord.region_phys(), 0);
        assert!(coord.stack_base().is_null());
    }

    #[test]
    fn vmwrite_failure_is_surfaced_with_the_field() {
        let intr = MockIntrinsics::new();
        let mem = MockMemory::new();
        intr.fail_vmwrite.set(true);
        let mut coord = coordinator(&intr, &mem);

        let err = coord
            .launch(&sane_host_state(), &sane_guest_state())
            .unwrap_err();

        // The guest selector block is written first.
        assert_eq!(err, VmxError::VmwriteFailed(Field::GuestEsSelector));
        assert_eq!(coord.region_phys(), 0);
    }

    #[test]
    fn rejected_vmlaunch_runs_checker_and_carries_instruction_error() {
        let intr = MockIntrinsics::new();
        let mem = MockMemory::new();
        intr.fail_vmlaunch.set(true);
        // The CPU reports "invalid host-state field(s)".
        intr.set_field(Field::InstructionError, 8);
        let mut coord = coordinator(&intr, &mem);

        // Host CR0 misses PE/PG, which IA32_VMX_CR0_FIXED0 forces on.
        let mut host = sane_host_state();
        host.cr0 = 0x32;

        let err = coord.launch(&host, &sane_guest_state()).unwrap_err();

        assert_eq!(
            err,
            VmxError::LaunchFailed(crate::vmcs::InstructionError::InvalidHostState)
        );
        assert_eq!(coord.stage(), Stage::Failed);
        assert_eq!(coord.region_phys(), 0);
        assert!(coord.stack_base().is_null());
        // The checker agrees with the CPU about the offending group.
        assert_eq!(
            coord.checker_mut().run(&intr).err(),
            Some(VmxError::ArchCheckFailed("host_cr0"))
        );
    }

    #[test]
    fn returning_trampolines_raise() {
        let intr = MockIntrinsics::new();
        let mem = MockMemory::new();
        let coord = coordinator(&intr, &mem);
        let mut gprs = GeneralPurposeRegisters::default();

        assert_eq!(
            coord.resume(&mut gprs as *mut _).err(),
            Some(VmxError::ResumeReturned)
        );
        assert_eq!(
            coord.promote(0xFFFF_8000_0000_4000).err(),
            Some(VmxError::PromoteReturned)
        );
    }
}
