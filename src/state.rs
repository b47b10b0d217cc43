//! CPU state snapshots consumed by the field writers.

/// Read-only snapshot of one execution context.
///
/// The caller captures this for both roles before calling `launch`: the host
/// variant describes the context the CPU returns to on VM exit, the guest
/// variant the context entered by `VMLAUNCH`. The limit, access-rights and
/// descriptor-table-limit fields are consumed for the guest role only; the
/// host equivalents are rebuilt by the processor from the architectural
/// defaults. FS and GS bases carry the `IA32_FS_BASE`/`IA32_GS_BASE` MSR
/// values rather than descriptor-derived bases.
#[allow(missing_docs)]
#[derive(Debug, Default, Clone)]
pub struct CpuState {
    // Segment selectors.
    pub es_selector: u16,
    pub cs_selector: u16,
    pub ss_selector: u16,
    pub ds_selector: u16,
    pub fs_selector: u16,
    pub gs_selector: u16,
    pub ldtr_selector: u16,
    pub tr_selector: u16,
    // Segment limits (guest role).
    pub es_limit: u32,
    pub cs_limit: u32,
    pub ss_limit: u32,
    pub ds_limit: u32,
    pub fs_limit: u32,
    pub gs_limit: u32,
    pub ldtr_limit: u32,
    pub tr_limit: u32,
    // Segment access rights (guest role).
    pub es_access_rights: u32,
    pub cs_access_rights: u32,
    pub ss_access_rights: u32,
    pub ds_access_rights: u32,
    pub fs_access_rights: u32,
    pub gs_access_rights: u32,
    pub ldtr_access_rights: u32,
    pub tr_access_rights: u32,
    // Descriptor tables.
    pub gdtr_base: u64,
    pub gdtr_limit: u32,
    pub idtr_base: u64,
    pub idtr_limit: u32,
    // Segment bases. fs_base/gs_base are the IA32_FS_BASE/IA32_GS_BASE MSRs.
    pub es_base: u64,
    pub cs_base: u64,
    pub ss_base: u64,
    pub ds_base: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub ldtr_base: u64,
    pub tr_base: u64,
    // Control registers.
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    // Debug state (guest role).
    pub dr7: u64,
    pub rflags: u64,
    // MSRs.
    pub debugctl: u64,
    pub pat: u64,
    pub efer: u64,
    pub perf_global_ctrl: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
}

impl CpuState {
    /// Dump the snapshot for post-mortem use.
    pub fn dump(&self) {
        log::error!(
            "cr0: {:#x} cr3: {:#x} cr4: {:#x} efer: {:#x} rflags: {:#x}",
            self.cr0,
            self.cr3,
            self.cr4,
            self.efer,
            self.rflags
        );
        log::error!(
            "CS: {:#06x} base: {:#x}, limit: {:#x}, rights: {:#x}",
            self.cs_selector,
            self.cs_base,
            self.cs_limit,
            self.cs_access_rights
        );
        log::error!(
            "SS: {:#06x} base: {:#x}, limit: {:#x}, rights: {:#x}",
            self.ss_selector,
            self.ss_base,
            self.ss_limit,
            self.ss_access_rights
        );
        log::error!(
            "DS: {:#06x} base: {:#x}, limit: {:#x}, rights: {:#x}",
            self.ds_selector,
            self.ds_base,
            self.ds_limit,
            self.ds_access_rights
        );
        log::error!(
            "ES: {:#06x} base: {:#x}, limit: {:#x}, rights: {:#x}",
            self.es_selector,
            self.es_base,
            self.es_limit,
            self.es_access_rights
        );
        log::error!(
            "FS: {:#06x} base: {:#x} GS: {:#06x} base: {:#x}",
            self.fs_selector,
            self.fs_base,
            self.gs_selector,
            self.gs_base
        );
        log::error!(
            "TR: {:#06x} base: {:#x} LDTR: {:#06x} base: {:#x}",
            self.tr_selector,
            self.tr_base,
            self.ldtr_selector,
            self.ldtr_base
        );
        log::error!(
            "GDTR: {:#x}/{:#x} IDTR: {:#x}/{:#x}",
            self.gdtr_base,
            self.gdtr_limit,
            self.idtr_base,
            self.idtr_limit
        );
    }
}

/// Register block the resume trampoline restores, laid out r15-first.
///
/// The trampoline indexes this block by fixed byte offsets; reordering the
/// fields changes the ABI.
#[allow(missing_docs)]
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct GeneralPurposeRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub cr2: u64,
}
