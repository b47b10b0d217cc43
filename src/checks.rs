//! Architectural vm-entry checks, run after a rejected `VMLAUNCH`.
//!
//! The processor validates the control- and host-state areas before any VM
//! entry and reports failure through nothing more than RFLAGS and a small
//! error number. This module re-runs those checks in software so a rejected
//! launch can be traced to the first violated invariant. The checker never
//! repairs state; each check either passes silently or names itself.
//!
//! ## Details
//! See Intel® 64 and IA-32 Architectures Software Developer's Manual,
//! 26.2 CHECKS ON VMX CONTROLS AND HOST-STATE AREA.

use crate::{
    intrinsics::VmxIntrinsics,
    vm_control::*,
    vmcs::{ActiveVmcs, Field},
    VmxError,
};
use alloc::vec::Vec;

/// Read-only view of the loaded VMCS and platform capabilities, shared by
/// every check.
pub struct CheckContext<'a> {
    intrinsics: &'a dyn VmxIntrinsics,
    vmcs: ActiveVmcs<'a>,
    /// Address bits above the CPUID-reported physical-address width.
    phys_mask: u64,
}

impl<'a> CheckContext<'a> {
    pub(crate) fn new(intrinsics: &'a dyn VmxIntrinsics) -> Self {
        // CPUID.80000008H:EAX[7:0] is MAXPHYADDR.
        let width = intrinsics.cpuid_eax(0x8000_0008) & 0xFF;
        let phys_mask = if width >= 64 { 0 } else { !0u64 << width };
        Self {
            intrinsics,
            vmcs: ActiveVmcs::new(intrinsics),
            phys_mask,
        }
    }

    /// Read a VMCS field of the loaded VMCS.
    pub fn read(&self, field: Field) -> Result<u64, VmxError> {
        self.vmcs.read(field)
    }

    /// Read a model-specific register.
    pub fn read_msr(&self, msr: u32) -> u64 {
        self.intrinsics.read_msr(msr)
    }

    fn exceeds_phys_width(&self, addr: u64) -> bool {
        addr & self.phys_mask != 0
    }

    fn valid_page(&self, addr: u64) -> bool {
        addr & 0xFFF == 0 && !self.exceeds_phys_width(addr)
    }

    /// Validate one VM-exit/VM-entry MSR area: 16-byte aligned and entirely
    /// below the physical-address ceiling.
    fn valid_msr_area(&self, addr: u64, count: u64) -> bool {
        addr & 0xF == 0
            && !self.exceeds_phys_width(addr)
            && !self.exceeds_phys_width(addr + count * 16 - 1)
    }
}

fn verify(ok: bool, name: &'static str) -> Result<(), VmxError> {
    if ok {
        Ok(())
    } else {
        Err(VmxError::ArchCheckFailed(name))
    }
}

fn is_canonical(addr: u64) -> bool {
    // Bits 63:47 sign-extend bit 47.
    (((addr as i64) << 16) >> 16) as u64 == addr
}

fn respects_capability(ctrl: u32, cap: u64) -> bool {
    let (allowed0, allowed1) = split_capability(cap);
    ctrl & allowed0 == allowed0 && ctrl & !allowed1 == 0
}

/// A caller-registered check on the guest-state area.
pub type GuestStateCheck = fn(&CheckContext<'_>) -> Result<(), VmxError>;

/// Pre-launch checker over the loaded VMCS.
///
/// The control-state and host-state groups are fixed; guest-state checks are
/// an open registry and may be empty.
pub struct Checker {
    guest_checks: Vec<GuestStateCheck>,
}

impl Default for Checker {
    fn default() -> Self {
        Self::new()
    }
}

impl Checker {
    /// Create a checker with no guest-state checks registered.
    pub fn new() -> Self {
        Self {
            guest_checks: Vec::new(),
        }
    }

    /// Register an additional guest-state check, run after the fixed groups
    /// in registration order.
    pub fn register_guest_check(&mut self, check: GuestStateCheck) {
        self.guest_checks.push(check);
    }

    /// Run every check group, stopping at the first violation.
    pub fn run(&self, intrinsics: &dyn VmxIntrinsics) -> Result<(), VmxError> {
        let ctx = CheckContext::new(intrinsics);
        check_control_state(&ctx)?;
        check_host_state(&ctx)?;
        for check in &self.guest_checks {
            check(&ctx)?;
        }
        Ok(())
    }
}

/// 26.2.1 Checks on VMX Controls.
fn check_control_state(ctx: &CheckContext<'_>) -> Result<(), VmxError> {
    let pin = ctx.read(Field::PinBasedExecControls)? as u32;
    let proc = ctx.read(Field::ProcessorBasedVmexecControls)? as u32;
    let exit = ctx.read(Field::VmexitControls)? as u32;
    let entry = ctx.read(Field::VmentryControls)? as u32;

    let pin_flags = VmcsPinBasedVmexecCtl::from_bits_truncate(pin);
    let proc_flags = VmcsProcBasedVmexecCtl::from_bits_truncate(proc);
    let exit_flags = VmcsExitCtl::from_bits_truncate(exit);

    // Reserved bits in the pin-based and processor-based VM-execution
    // controls must be set properly per the capability MSRs (Appendix A.3).
    verify(
        respects_capability(pin, ctx.read_msr(IA32_VMX_TRUE_PINBASED_CTLS)),
        "pin_based_controls_reserved_bits",
    )?;
    verify(
        respects_capability(proc, ctx.read_msr(IA32_VMX_TRUE_PROC_BASED_CTLS)),
        "proc_based_controls_reserved_bits",
    )?;

    // The secondary controls are checked only when activated; otherwise the
    // field is ignored by the processor.
    let proc2 = if proc_flags.contains(VmcsProcBasedVmexecCtl::ACTIVATE_SECONDARY_CTL) {
        let proc2 = ctx.read(Field::SecondaryVmexecControls)? as u32;
        verify(
            respects_capability(proc2, ctx.read_msr(IA32_VMX_PROC_BASED_CTLS2)),
            "secondary_controls_reserved_bits",
        )?;
        proc2
    } else {
        0
    };
    let proc2_flags = VmcsProcBasedSecondaryVmexecCtl::from_bits_truncate(proc2);

    verify(
        ctx.read(Field::Cr3TargetCount)? <= 4,
        "cr3_target_count",
    )?;

    if proc_flags.contains(VmcsProcBasedVmexecCtl::USEIOBMP) {
        verify(
            ctx.valid_page(ctx.read(Field::IoBitmapA)?),
            "io_bitmap_a_address",
        )?;
        verify(
            ctx.valid_page(ctx.read(Field::IoBitmapB)?),
            "io_bitmap_b_address",
        )?;
    }

    if proc_flags.contains(VmcsProcBasedVmexecCtl::USEMSRBMP) {
        verify(
            ctx.valid_page(ctx.read(Field::MsrBitmaps)?),
            "msr_bitmap_address",
        )?;
    }

    // TPR shadow: with the shadow on, the virtual-APIC page must be usable;
    // with it off, none of the APIC virtualization features may be on.
    if proc_flags.contains(VmcsProcBasedVmexecCtl::USETPRSHADOW) {
        let apic_page = ctx.read(Field::VirtualApicPageAddr)?;
        verify(
            apic_page != 0 && ctx.valid_page(apic_page),
            "tpr_shadow_virtual_apic_page",
        )?;
    } else {
        verify(
            !proc2_flags.intersects(
                VmcsProcBasedSecondaryVmexecCtl::VIRTUALIZED_X2APIC_MODE
                    | VmcsProcBasedSecondaryVmexecCtl::APIC_REGISTER_VIRTUALIZATION
                    | VmcsProcBasedSecondaryVmexecCtl::VIRTUAL_INTERRUPT_DELIVERY,
            ),
            "tpr_shadow_virtual_apic_page",
        )?;
    }

    verify(
        pin_flags.contains(VmcsPinBasedVmexecCtl::NMI_EXITING)
            || !pin_flags.contains(VmcsPinBasedVmexecCtl::VIRTUAL_NMIS),
        "nmi_exiting_virtual_nmis",
    )?;
    verify(
        pin_flags.contains(VmcsPinBasedVmexecCtl::VIRTUAL_NMIS)
            || !proc_flags.contains(VmcsProcBasedVmexecCtl::NMIWINEXIT),
        "virtual_nmis_nmi_window",
    )?;

    if proc2_flags.contains(VmcsProcBasedSecondaryVmexecCtl::VIRTUALIZE_APIC_ACCESSES) {
        verify(
            ctx.valid_page(ctx.read(Field::ApicAccessAddr)?),
            "apic_access_address",
        )?;
    }
    verify(
        !proc2_flags.contains(VmcsProcBasedSecondaryVmexecCtl::VIRTUALIZED_X2APIC_MODE)
            || !proc2_flags.contains(VmcsProcBasedSecondaryVmexecCtl::VIRTUALIZE_APIC_ACCESSES),
        "x2apic_mode_apic_accesses",
    )?;
    verify(
        !proc2_flags.contains(VmcsProcBasedSecondaryVmexecCtl::VIRTUAL_INTERRUPT_DELIVERY)
            || pin_flags.contains(VmcsPinBasedVmexecCtl::EXTERNAL_INTERRUPT_EXITING),
        "virtual_interrupt_delivery",
    )?;

    if pin_flags.contains(VmcsPinBasedVmexecCtl::PROCESS_POSTED_INTERRUPT) {
        let vector = ctx.read(Field::PostedInterruptVector)?;
        let desc = ctx.read(Field::PostedInterruptDescAddr)?;
        verify(
            proc2_flags.contains(VmcsProcBasedSecondaryVmexecCtl::VIRTUAL_INTERRUPT_DELIVERY)
                && exit_flags.contains(VmcsExitCtl::ACK_INTR_ON_EXIT)
                && vector & !0xFF == 0
                && desc & 0x3F == 0
                && !ctx.exceeds_phys_width(desc),
            "posted_interrupt_processing",
        )?;
    }

    verify(
        !proc2_flags.contains(VmcsProcBasedSecondaryVmexecCtl::ENABLE_VPID)
            || ctx.read(Field::Vpid)? != 0,
        "vpid_nonzero",
    )?;

    if proc2_flags.contains(VmcsProcBasedSecondaryVmexecCtl::ENABLE_EPT) {
        let eptp = ctx.read(Field::Eptptr)?;
        let memtype = eptp & 0x7;
        let walk = (eptp >> 3) & 0x7;
        verify(
            (memtype == 0 || memtype == 6)
                && walk == 3
                && eptp & 0xF80 == 0
                && !ctx.exceeds_phys_width(eptp & !0xFFF),
            "ept_pointer",
        )?;
    }

    if proc2_flags.contains(VmcsProcBasedSecondaryVmexecCtl::ENABLE_PML) {
        verify(
            proc2_flags.contains(VmcsProcBasedSecondaryVmexecCtl::ENABLE_EPT)
                && ctx.valid_page(ctx.read(Field::PmlAddress)?),
            "pml_address",
        )?;
    }

    verify(
        !proc2_flags.contains(VmcsProcBasedSecondaryVmexecCtl::UNRESTRICTED_GUEST)
            || proc2_flags.contains(VmcsProcBasedSecondaryVmexecCtl::ENABLE_EPT),
        "unrestricted_guest_requires_ept",
    )?;

    if proc2_flags.contains(VmcsProcBasedSecondaryVmexecCtl::ENABLE_VM_FUNCTIONS) {
        let vmfunc = ctx.read(Field::VmfuncCtrls)?;
        // Only EPTP switching (bit 0) is defined.
        verify(vmfunc & !0x1 == 0, "vm_function_controls")?;
        if vmfunc & 0x1 != 0 {
            verify(
                proc2_flags.contains(VmcsProcBasedSecondaryVmexecCtl::ENABLE_EPT)
                    && ctx.valid_page(ctx.read(Field::EptpListAddress)?),
                "vm_function_controls",
            )?;
        }
    }

    if proc2_flags.contains(VmcsProcBasedSecondaryVmexecCtl::VMCS_SHADOWING) {
        verify(
            ctx.valid_page(ctx.read(Field::VmreadBitmapAddr)?)
                && ctx.valid_page(ctx.read(Field::VmwriteBitmapAddr)?),
            "vmcs_shadowing_bitmaps",
        )?;
    }

    if proc2_flags.contains(VmcsProcBasedSecondaryVmexecCtl::EPT_VIOLATION_VE) {
        verify(
            ctx.valid_page(ctx.read(Field::VeExceptionInfoAddr)?),
            "ve_information_address",
        )?;
    }

    // 26.2.1.2 VM-Exit Control Fields.
    verify(
        respects_capability(exit, ctx.read_msr(IA32_VMX_TRUE_EXIT_CTLS)),
        "vmexit_controls_reserved_bits",
    )?;
    verify(
        pin_flags.contains(VmcsPinBasedVmexecCtl::ACTIVE_VMX_PREEMPTION_TIMER)
            || !exit_flags.contains(VmcsExitCtl::SAVE_VMX_PREEMPTION_TIMER_VALUE),
        "preemption_timer_save",
    )?;

    let store_count = ctx.read(Field::VmexitMsrStoreCount)?;
    if store_count != 0 {
        verify(
            ctx.valid_msr_area(ctx.read(Field::VmexitMsrStoreAddr)?, store_count),
            "vmexit_msr_store_address",
        )?;
    }
    let load_count = ctx.read(Field::VmexitMsrLoadCount)?;
    if load_count != 0 {
        verify(
            ctx.valid_msr_area(ctx.read(Field::VmexitMsrLoadAddr)?, load_count),
            "vmexit_msr_load_address",
        )?;
    }

    // 26.2.1.3 VM-Entry Control Fields.
    let entry_load_count = ctx.read(Field::VmentryMsrLoadCount)?;
    if entry_load_count != 0 {
        verify(
            ctx.valid_msr_area(ctx.read(Field::VmentryMsrLoadAddr)?, entry_load_count),
            "vmentry_msr_load_address",
        )?;
    }

    check_event_injection(ctx)?;

    verify(
        respects_capability(entry, ctx.read_msr(IA32_VMX_TRUE_ENTRY_CTLS)),
        "vmentry_controls_reserved_bits",
    )?;

    Ok(())
}

/// Validity of the VM-entry interruption-information field (Table 24-14).
fn check_event_injection(ctx: &CheckContext<'_>) -> Result<(), VmxError> {
    let info = ctx.read(Field::VmentryInterruptionInfo)? as u32;
    if info & (1 << 31) == 0 {
        return Ok(());
    }
    let vector = info & 0xFF;
    let itype = (info >> 8) & 0x7;
    let deliver_error_code = info & (1 << 11) != 0;

    // Interruption type 1 is reserved.
    verify(itype != 1, "event_injection")?;
    // An injected NMI uses vector 2; hardware exceptions stay below 32.
    verify(itype != 2 || vector == 2, "event_injection")?;
    verify(itype != 3 || vector <= 31, "event_injection")?;
    // The error code may be delivered only with contributory hardware
    // exceptions (#DF, #TS, #NP, #SS, #GP, #PF, #AC).
    verify(
        !deliver_error_code || (itype == 3 && matches!(vector, 8 | 10..=14 | 17)),
        "event_injection",
    )?;
    // Bits 30:12 are reserved.
    verify(info & 0x7FFF_F000 == 0, "event_injection")?;
    if deliver_error_code {
        verify(
            ctx.read(Field::VmentryExceptionErrCode)? & !0x7FFF == 0,
            "event_injection",
        )?;
    }
    // Software interrupts and exceptions carry an instruction length.
    if matches!(itype, 4 | 5 | 6) {
        verify(
            ctx.read(Field::VmentryInstructionLength)? <= 15,
            "event_injection",
        )?;
    }
    Ok(())
}

/// 26.2.2 Checks on Host Control Registers and MSRs,
/// 26.2.3 Checks on Host Segment and Descriptor-Table Registers,
/// 26.2.4 Checks Related to Address-Space Size.
fn check_host_state(ctx: &CheckContext<'_>) -> Result<(), VmxError> {
    let exit = VmcsExitCtl::from_bits_truncate(ctx.read(Field::VmexitControls)? as u32);

    // CR0 and CR4 must not set any bit to a value not supported in VMX
    // operation (Section 23.8).
    let cr0 = ctx.read(Field::HostCr0)?;
    let fixed0 = ctx.read_msr(IA32_VMX_CR0_FIXED0);
    let fixed1 = ctx.read_msr(IA32_VMX_CR0_FIXED1);
    verify(cr0 & fixed0 == fixed0 && cr0 & !fixed1 == 0, "host_cr0")?;

    let cr4 = ctx.read(Field::HostCr4)?;
    let fixed0 = ctx.read_msr(IA32_VMX_CR4_FIXED0);
    let fixed1 = ctx.read_msr(IA32_VMX_CR4_FIXED1);
    verify(cr4 & fixed0 == fixed0 && cr4 & !fixed1 == 0, "host_cr4")?;

    verify(
        !ctx.exceeds_phys_width(ctx.read(Field::HostCr3)?),
        "host_cr3",
    )?;

    verify(
        is_canonical(ctx.read(Field::HostIa32SysenterEspMsr)?),
        "host_sysenter_esp_canonical",
    )?;
    verify(
        is_canonical(ctx.read(Field::HostIa32SysenterEipMsr)?),
        "host_sysenter_eip_canonical",
    )?;

    if exit.contains(VmcsExitCtl::LOAD_IA32_PERF_GLOBAL_CTRL) {
        // Three fixed-function and eight programmable counters.
        verify(
            ctx.read(Field::HostIa32PerfGlobalCtrl)? & !0x7_0000_00FF == 0,
            "host_perf_global_ctrl",
        )?;
    }
    if exit.contains(VmcsExitCtl::LOAD_IA32_PAT) {
        let pat = ctx.read(Field::HostIa32Pat)?;
        verify(
            (0..8).all(|i| matches!((pat >> (i * 8)) & 0xFF, 0 | 1 | 4 | 5 | 6 | 7)),
            "host_pat",
        )?;
    }
    let host_size = exit.contains(VmcsExitCtl::HOST_ADDRESS_SPACE_SIZE);
    if exit.contains(VmcsExitCtl::LOAD_IA32_EFER) {
        let efer = ctx.read(Field::HostIa32Efer)?;
        // Valid bits: SCE, LME, LMA, NXE; LMA and LME must agree with the
        // host-address-space-size exit control.
        verify(
            efer & !0xD01 == 0
                && (efer & (1 << 10) != 0) == host_size
                && (efer & (1 << 8) != 0) == host_size,
            "host_efer",
        )?;
    }

    // Selector fields: RPL and TI must be zero.
    verify(
        ctx.read(Field::HostEsSelector)? & 0x7 == 0,
        "host_es_selector",
    )?;
    verify(
        ctx.read(Field::HostCsSelector)? & 0x7 == 0,
        "host_cs_selector",
    )?;
    verify(
        ctx.read(Field::HostSsSelector)? & 0x7 == 0,
        "host_ss_selector",
    )?;
    verify(
        ctx.read(Field::HostDsSelector)? & 0x7 == 0,
        "host_ds_selector",
    )?;
    verify(
        ctx.read(Field::HostFsSelector)? & 0x7 == 0,
        "host_fs_selector",
    )?;
    verify(
        ctx.read(Field::HostGsSelector)? & 0x7 == 0,
        "host_gs_selector",
    )?;
    verify(
        ctx.read(Field::HostTrSelector)? & 0x7 == 0,
        "host_tr_selector",
    )?;
    verify(ctx.read(Field::HostCsSelector)? != 0, "host_cs_not_null")?;
    verify(ctx.read(Field::HostTrSelector)? != 0, "host_tr_not_null")?;
    verify(ctx.read(Field::HostSsSelector)? != 0, "host_ss_not_null")?;

    verify(
        is_canonical(ctx.read(Field::HostFsBase)?),
        "host_fs_base_canonical",
    )?;
    verify(
        is_canonical(ctx.read(Field::HostGsBase)?),
        "host_gs_base_canonical",
    )?;
    verify(
        is_canonical(ctx.read(Field::HostGdtrBase)?),
        "host_gdtr_base_canonical",
    )?;
    verify(
        is_canonical(ctx.read(Field::HostIdtrBase)?),
        "host_idtr_base_canonical",
    )?;
    verify(
        is_canonical(ctx.read(Field::HostTrBase)?),
        "host_tr_base_canonical",
    )?;

    // Address-space size: outside IA-32e the host-address-space-size control
    // must be 0; in IA-32e it must be 1, with CR4.PAE set and RIP canonical.
    let ia32e = ctx.read_msr(IA32_EFER) & (1 << 10) != 0;
    verify(
        if ia32e {
            host_size && cr4 & (1 << 5) != 0 && is_canonical(ctx.read(Field::HostRip)?)
        } else {
            !host_size
        },
        "host_address_space_size",
    )?;

    Ok(())
}
