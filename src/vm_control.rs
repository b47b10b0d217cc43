//! Flags and MSRs for VMX capabilities.

// VMX Capability MSRs
/// MSR - IA32_VMX_BASIC.
pub const IA32_VMX_BASIC: u32 = 0x480;
/// MSR - IA32_VMX_PINBASED_CTLS.
pub const IA32_VMX_PINBASED_CTLS: u32 = 0x481;
/// MSR - IA32_VMX_PROC_BASED_CTLS.
pub const IA32_VMX_PROC_BASED_CTLS: u32 = 0x482;
/// MSR - IA32_VMX_EXIT_CTLS.
pub const IA32_VMX_EXIT_CTLS: u32 = 0x483;
/// MSR - IA32_VMX_ENTRY_CTLS.
pub const IA32_VMX_ENTRY_CTLS: u32 = 0x484;
/// MSR - IA32_VMX_MISC.
pub const IA32_VMX_MISC: u32 = 0x485;
/// MSR - IA32_VMX_CR0_FIXED0.
pub const IA32_VMX_CR0_FIXED0: u32 = 0x486;
/// MSR - IA32_VMX_CR0_FIXED1.
pub const IA32_VMX_CR0_FIXED1: u32 = 0x487;
/// MSR - IA32_VMX_CR4_FIXED0.
pub const IA32_VMX_CR4_FIXED0: u32 = 0x488;
/// MSR - IA32_VMX_CR4_FIXED1.
pub const IA32_VMX_CR4_FIXED1: u32 = 0x489;
/// MSR - IA32_VMX_VMCS_ENUM.
pub const IA32_VMX_VMCS_ENUM: u32 = 0x48A;
/// MSR - IA32_VMX_PROC_BASED_CTLS2.
pub const IA32_VMX_PROC_BASED_CTLS2: u32 = 0x48B;
/// MSR - IA32_VMX_EPT_VPID_CAP.
pub const IA32_VMX_EPT_VPID_CAP: u32 = 0x48C;
/// MSR - IA32_VMX_TRUE_PINBASED_CTLS.
pub const IA32_VMX_TRUE_PINBASED_CTLS: u32 = 0x48D;
/// MSR - IA32_VMX_TRUE_PROC_BASED_CTLS.
pub const IA32_VMX_TRUE_PROC_BASED_CTLS: u32 = 0x48E;
/// MSR - IA32_VMX_TRUE_EXIT_CTLS.
pub const IA32_VMX_TRUE_EXIT_CTLS: u32 = 0x48F;
/// MSR - IA32_VMX_TRUE_ENTRY_CTLS.
pub const IA32_VMX_TRUE_ENTRY_CTLS: u32 = 0x490;
/// MSR - IA32_FEATURE_CONTROL.
pub const IA32_FEATURE_CONTROL: u32 = 0x03A;
/// MSR - IA32_EFER.
pub const IA32_EFER: u32 = 0xC000_0080;

bitflags::bitflags! {
    /// Table 24-5. Definitions of Pin-Based VM-Execution Controls.
    pub struct VmcsPinBasedVmexecCtl: u32 {
        /// If this control is 1, external interrupts cause VM exits.
        /// Otherwise, they are delivered normally through the guest interrupt-descriptor table (IDT).
        const EXTERNAL_INTERRUPT_EXITING = 1 << 0;
        /// If this control is 1, non-maskable interrupts (NMIs) cause VM exits.
        /// Otherwise, they are delivered normally using descriptor 2 of the IDT.
        const NMI_EXITING = 1 << 3;
        /// If this control is 1, NMIs are never blocked and the "blocking by NMI" bit (bit 3) in the
        /// interruptibility-state field indicates "virtual-NMI blocking".
        const VIRTUAL_NMIS = 1 << 5;
        /// If this control is 1, the VMX-preemption timer counts down in VMX non-root operation.
        /// A VM exit occurs when the timer counts down to zero.
        const ACTIVE_VMX_PREEMPTION_TIMER = 1 << 6;
        /// If this control is 1, the processor treats interrupts with the posted-interrupt notification
        /// vector specially, updating the virtual-APIC page with posted-interrupt requests.
        const PROCESS_POSTED_INTERRUPT = 1 << 7;
    }
}

bitflags::bitflags! {
    /// Table 24-6. Definitions of Primary Processor-Based VM-Execution Controls.
    pub struct VmcsProcBasedVmexecCtl: u32 {
        /// If this control is 1, a VM exit occurs at the beginning of any instruction if RFLAGS.IF = 1 and
        /// there are no other blocking of interrupts.
        const INTRWINEXIT = 1 << 2;
        /// This control determines whether executions of RDTSC, executions of RDTSCP, and executions
        /// of RDMSR that read from the IA32_TIME_STAMP_COUNTER MSR return a value modified by
        /// the TSC offset field.
        const USETSCOFF = 1 << 3;
        /// This control determines whether executions of HLT cause VM exits.
        const HLT_EXITING = 1 << 7;
        /// This determines whether executions of INVLPG cause VM exits.
        const INVLPGEXIT = 1 << 9;
        /// This control determines whether executions of MWAIT cause VM exits.
        const MWAITEXIT = 1 << 10;
        /// This control determines whether executions of RDPMC cause VM exits.
        const RDPMCEXIT = 1 << 11;
        /// This control determines whether executions of RDTSC and RDTSCP cause VM exits.
        const RDTSCEXIT = 1 << 12;
        /// In conjunction with the CR3-target controls, this control determines whether executions of
        /// MOV to CR3 cause VM exits.
        const CR3LOADEXIT = 1 << 15;
        /// This control determines whether executions of MOV from CR3 cause VM exits.
        const CR3STOREXIT = 1 << 16;
        /// This control determines whether the tertiary processor-based VM-execution controls are used.
        const ACTIVETETCTL = 1 << 17;
        /// This control determines whether executions of MOV to CR8 cause VM exits.
        const CR8LOADEXIT = 1 << 19;
        /// This control determines whether executions of MOV from CR8 cause VM exits.
        const CR8STOREEXIT = 1 << 20;
        /// Setting this control to 1 enables TPR virtualization and other APIC-virtualization features.
        const USETPRSHADOW = 1 << 21;
        /// If this control is 1, a VM exit occurs at the beginning of any instruction if there is no
        /// virtual NMI blocking.
        const NMIWINEXIT = 1 << 22;
        /// This control determines whether executions of MOV DR cause VM exits.
        const MOVDREXIT = 1 << 23;
        /// This control determines whether executions of I/O instructions cause VM exits.
        const UNCONDIOEXIT = 1 << 24;
        /// This control determines whether I/O bitmaps are used to restrict executions of I/O
        /// instructions. If the I/O bitmaps are used, the setting of the "unconditional I/O exiting"
        /// control is ignored.
        const USEIOBMP = 1 << 25;
        /// If this control is 1, the monitor trap flag debugging feature is enabled.
        const MTF = 1 << 27;
        /// This control determines whether MSR bitmaps are used to control execution of the RDMSR and
        /// WRMSR instructions. If the MSR bitmaps are not used, all executions of the RDMSR and WRMSR
        /// instructions cause VM exits.
        const USEMSRBMP = 1 << 28;
        /// This control determines whether executions of MONITOR cause VM exits.
        const MONITOREXIT = 1 << 29;
        /// This control determines whether executions of PAUSE cause VM exits.
        const PAUSEEXIT = 1 << 30;
        /// This control determines whether the secondary processor-based VM-execution controls are
        /// used. If this control is 0, the logical processor operates as if all the secondary
        /// processor-based VM-execution controls were also 0.
        const ACTIVATE_SECONDARY_CTL = 1 << 31;
    }
}

bitflags::bitflags! {
    /// Table 24-7. Definitions of Secondary Processor-Based VM-Execution Controls.
    pub struct VmcsProcBasedSecondaryVmexecCtl: u32 {
        /// If this control is 1, the logical processor treats specially accesses to the page with the
        /// APIC-access address.
        const VIRTUALIZE_APIC_ACCESSES = 1 << 0;
        /// If this control is 1, extended page tables (EPT) are enabled.
        const ENABLE_EPT = 1 << 1;
        /// This control determines whether executions of LGDT, LIDT, LLDT, LTR, SGDT, SIDT, SLDT,
        /// and STR cause VM exits.
        const DESCRIPTOR_TABLE_EXITING = 1 << 2;
        /// If this control is 0, any execution of RDTSCP causes an invalid-opcode exception (#UD).
        const ENABLE_RDTSCP = 1 << 3;
        /// If this control is 1, the logical processor treats specially RDMSR and WRMSR to APIC MSRs
        /// (in the range 800H-8FFH).
        const VIRTUALIZED_X2APIC_MODE = 1 << 4;
        /// If this control is 1, cached translations of linear addresses are associated with a
        /// virtual-processor identifier (VPID).
        const ENABLE_VPID = 1 << 5;
        /// This control determines whether executions of WBINVD and WBNOINVD cause VM exits.
        const WBINVD_EXITING = 1 << 6;
        /// This control determines whether guest software may run in unpaged protected mode or in
        /// real-address mode.
        const UNRESTRICTED_GUEST = 1 << 7;
        /// If this control is 1, the logical processor virtualizes certain APIC accesses.
        const APIC_REGISTER_VIRTUALIZATION = 1 << 8;
        /// This controls enables the evaluation and delivery of pending virtual interrupts as well as
        /// the emulation of writes to the APIC registers that control interrupt prioritization.
        const VIRTUAL_INTERRUPT_DELIVERY = 1 << 9;
        /// This control determines whether a series of executions of PAUSE can cause a VM exit.
        const PAUSE_LOOP_EXITING = 1 << 10;
        /// This control determines whether executions of RDRAND cause VM exits.
        const RDRAND_EXITING = 1 << 11;
        /// If this control is 0, any execution of INVPCID causes a #UD.
        const ENABLE_INVPCID = 1 << 12;
        /// Setting this control to 1 enables use of the VMFUNC instruction in VMX non-root operation.
        const ENABLE_VM_FUNCTIONS = 1 << 13;
        /// If this control is 1, executions of VMREAD and VMWRITE in VMX non-root operation may access
        /// a shadow VMCS (instead of causing VM exits).
        const VMCS_SHADOWING = 1 << 14;
        /// If this control is 1, executions of ENCLS consult the ENCLS-exiting bitmap to determine
        /// whether the instruction causes a VM exit.
        const ENABLE_ENCLS_EXITING = 1 << 15;
        /// This control determines whether executions of RDSEED cause VM exits.
        const RDSEED_EXITING = 1 << 16;
        /// If this control is 1, an access to a guest-physical address that sets an EPT dirty bit
        /// first adds an entry to the page-modification log.
        const ENABLE_PML = 1 << 17;
        /// If this control is 1, EPT violations may cause virtualization exceptions (#VE) instead of
        /// VM exits.
        const EPT_VIOLATION_VE = 1 << 18;
        /// If this control is 1, Intel Processor Trace suppresses from PIPs an indication that the
        /// processor was in VMX non-root operation.
        const CONCEAL_VMX_FROM_PT = 1 << 19;
        /// If this control is 0, any execution of XSAVES or XRSTORS causes a #UD.
        const ENABLE_XSAVES_XRSTORS = 1 << 20;
        /// If this control is 1, EPT execute permissions are based on whether the linear address being
        /// accessed is supervisor mode or user mode.
        const MODE_BASED_EXEC_CTL_FOR_EPT = 1 << 22;
        /// If this control is 1, EPT write permissions may be specified at the granularity of 128 bytes.
        const SUBPAGE_WRITE_PERM_FOR_EPT = 1 << 23;
        /// If this control is 1, all output addresses used by Intel Processor Trace are treated as
        /// guest physical addresses and translated using EPT.
        const INTEL_PT_USES_GPA = 1 << 24;
        /// This control determines whether RDTSC/RDTSCP/RDMSR of IA32_TIME_STAMP_COUNTER return a
        /// value modified by the TSC multiplier field.
        const USE_TSC_SCALING = 1 << 25;
        /// If this control is 0, any execution of TPAUSE, UMONITOR, or UMWAIT causes a #UD.
        const ENABLE_UWAIT_PAUSE = 1 << 26;
        /// If this control is 0, any execution of PCONFIG causes a #UD.
        const ENABLE_PCONFIG = 1 << 27;
        /// If this control is 1, executions of ENCLV consult the ENCLV-exiting bitmap.
        const ENABLE_ENCLV_EXITING = 1 << 28;
    }
}

bitflags::bitflags! {
    /// Table 24-13. Definitions of Primary VM-Exit Controls.
    pub struct VmcsExitCtl: u32 {
        /// This control determines whether DR7 and the IA32_DEBUGCTL MSR are saved on VM exit.
        const SAVE_DEBUG_CTLS = 1 << 2;
        /// On processors that support Intel 64 architecture, this control determines whether a logical
        /// processor is in 64-bit mode after the next VM exit. Its value is loaded into CS.L,
        /// IA32_EFER.LME, and IA32_EFER.LMA on every VM exit.
        const HOST_ADDRESS_SPACE_SIZE = 1 << 9;
        /// This control determines whether the IA32_PERF_GLOBAL_CTRL MSR is loaded on VM exit.
        const LOAD_IA32_PERF_GLOBAL_CTRL = 1 << 12;
        /// This control affects VM exits due to external interrupts: if such a VM exit occurs and this
        /// control is 1, the logical processor acknowledges the interrupt controller, acquiring the
        /// interrupt's vector, and stores it in the VM-exit interruption-information field.
        const ACK_INTR_ON_EXIT = 1 << 15;
        /// This control determines whether the IA32_PAT MSR is saved on VM exit.
        const SAVE_IA32_PAT = 1 << 18;
        /// This control determines whether the IA32_PAT MSR is loaded on VM exit.
        const LOAD_IA32_PAT = 1 << 19;
        /// This control determines whether the IA32_EFER MSR is saved on VM exit.
        const SAVE_IA32_EFER = 1 << 20;
        /// This control determines whether the IA32_EFER MSR is loaded on VM exit.
        const LOAD_IA32_EFER = 1 << 21;
        /// This control determines whether the value of the VMX-preemption timer is saved on VM exit.
        const SAVE_VMX_PREEMPTION_TIMER_VALUE = 1 << 22;
        /// This control determines whether the IA32_BNDCFGS MSR is cleared on VM exit.
        const CLEAR_IA32_BNDCFGS = 1 << 23;
        /// If this control is 1, Intel Processor Trace does not produce a paging information packet
        /// (PIP) on a VM exit or a VMCS packet on an SMM VM exit.
        const CONCEAL_VMX_FROM_PT = 1 << 24;
        /// This control determines whether the IA32_RTIT_CTL MSR is cleared on VM exit.
        const CLEAR_IA32_RTIT_CTL = 1 << 25;
        /// This control determines whether CET-related MSRs and SPP are loaded on VM exit.
        const LOAD_CET_STATE = 1 << 28;
        /// This control determines whether the IA32_PKRS MSR is loaded on VM exit.
        const LOAD_PKRS = 1 << 29;
        /// This control determines whether the IA32_PERF_GLOBAL_CTL MSR is saved on VM exit.
        const SAVE_IA32_PERF_GLOBAL_CTL = 1 << 30;
        /// This control determines whether the secondary VM-exit controls are used.
        const ACTIVATE_SECONDARY_CTL = 1 << 31;
    }
}

bitflags::bitflags! {
    /// Table 24-15. Definitions of VM-Entry Controls.
    pub struct VmcsEntryCtl: u32 {
        /// This control determines whether DR7 and the IA32_DEBUGCTL MSR are loaded on VM entry.
        const LOAD_DEBUG_CTL = 1 << 2;
        /// On processors that support Intel 64 architecture, this control determines whether the
        /// logical processor is in IA-32e mode after VM entry. Its value is loaded into IA32_EFER.LMA
        /// as part of VM entry.
        const IA32E_MODE_GUEST = 1 << 9;
        /// This control determines whether the logical processor is in system-management mode (SMM)
        /// after VM entry. This control must be 0 for any VM entry from outside SMM.
        const ENTRY_TO_SMM = 1 << 10;
        /// If set to 1, the default treatment of SMIs and SMM is in effect after the VM entry.
        /// This control must be 0 for any VM entry from outside SMM.
        const DEACTIVATE_DUAL_MONITOR_TREATMENT = 1 << 11;
        /// This control determines whether the IA32_PERF_GLOBAL_CTRL MSR is loaded on VM entry.
        const LOAD_IA32_PERF_GLOBAL_CTRL = 1 << 13;
        /// This control determines whether the IA32_PAT MSR is loaded on VM entry.
        const LOAD_IA32_PAT = 1 << 14;
        /// This control determines whether the IA32_EFER MSR is loaded on VM entry.
        const LOAD_IA32_EFER = 1 << 15;
        /// This control determines whether the IA32_BNDCFGS MSR is loaded on VM entry.
        const LOAD_IA32_BNDCFGS = 1 << 16;
        /// If this control is 1, Intel Processor Trace does not produce a paging information packet
        /// (PIP) on a VM entry or a VMCS packet on a VM entry that returns from SMM.
        const CONCEAL_VMX_FROM_PT = 1 << 17;
        /// This control determines whether the IA32_RTIT_CTL MSR is loaded on VM entry.
        const LOAD_IA32_RTIT_CTL = 1 << 18;
        /// This control determines whether CET-related MSRs and SPP are loaded on VM entry.
        const LOAD_CET_STATE = 1 << 20;
        /// This control determines whether the IA32_LBR_CTL MSR is loaded on VM entry.
        const LOAD_GUEST_IA32_LBR_CTL = 1 << 21;
        /// This control determines whether the IA32_PKRS MSR is loaded on VM entry.
        const LOAD_PKRS = 1 << 22;
    }
}

/// Split a capability MSR value into its (allowed-0, allowed-1) halves.
///
/// Allowed-0 bits must be 1 in the control; allowed-1 bits may be 1.
#[inline]
pub fn split_capability(cap: u64) -> (u32, u32) {
    (cap as u32, (cap >> 32) as u32)
}

/// Initial value of a control field sourced from a true-capability MSR:
/// exactly the bits the processor forces on.
#[inline]
pub fn seed(cap: u64) -> u32 {
    let (allowed0, allowed1) = split_capability(cap);
    allowed0 & allowed1
}

/// Reconcile a candidate control word with the capability MSR `cap`.
///
/// Allowed-0 bits that the caller left clear are forced on, then bits outside
/// allowed-1 are masked off, in that order. Neither mutation is an error; both
/// are reported to the debug log so a dropped feature bit can be traced.
pub fn filter_unsupported(cap: u64, ctrl: u32) -> u32 {
    let (allowed0, allowed1) = split_capability(cap);
    let mut filtered = ctrl;
    if (allowed0 & filtered) != allowed0 {
        log::debug!(
            "control {:#010x} lacks required bits {:#010x}, forcing",
            filtered,
            allowed0 & !filtered
        );
        filtered |= allowed0;
    }
    if filtered & !allowed1 != 0 {
        log::debug!(
            "control {:#010x} carries unsupported bits {:#010x}, masking",
            filtered,
            filtered & !allowed1
        );
        filtered &= allowed1;
    }
    filtered
}
