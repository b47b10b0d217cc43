//! Shared mock ports and state builders for unit tests.
//!
//! All mock state is owned by the test that creates it and injected through
//! the ports; nothing here is process-wide.

use crate::{
    intrinsics::{MemoryOps, VmxIntrinsics},
    launch::{self, EntryPoints},
    state::{CpuState, GeneralPurposeRegisters},
    vm_control::*,
    vmcs::{ActiveVmcs, ExitHandlerStack, Field},
};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;

/// Canonical dummy address standing in for the exit-handler entry symbol.
pub const EXIT_HANDLER_ADDR: u64 = 0xFFFF_8000_0000_3000;

/// In-memory stand-in for the VMX instruction set.
///
/// VMCS fields live in a hash map keyed by encoding; capability MSRs default
/// to a self-consistent 4-level-paging processor with a 40-bit physical
/// address width.
pub struct MockIntrinsics {
    pub msrs: RefCell<HashMap<u32, u64>>,
    pub fields: RefCell<HashMap<u64, u64>>,
    /// Every successful vmwrite, in order.
    pub writes: RefCell<Vec<(u64, u64)>>,
    pub fail_vmclear: Cell<bool>,
    pub fail_vmptrld: Cell<bool>,
    pub fail_vmlaunch: Cell<bool>,
    pub fail_vmwrite: Cell<bool>,
    /// When set, vmread of exactly this encoding fails.
    pub fail_vmread_field: Cell<Option<u64>>,
    pub vmclear_calls: Cell<usize>,
    pub vmptrld_calls: Cell<usize>,
    pub loaded_phys: Cell<u64>,
}

impl MockIntrinsics {
    pub fn new() -> Self {
        let mut msrs = HashMap::new();
        msrs.insert(IA32_VMX_BASIC, 0x12);
        msrs.insert(IA32_VMX_TRUE_PINBASED_CTLS, 0x0000_00FF_0000_0016);
        msrs.insert(IA32_VMX_TRUE_PROC_BASED_CTLS, 0xFFFF_FFFF_0001_E172);
        msrs.insert(IA32_VMX_PROC_BASED_CTLS2, 0xFFFF_FFFF_0000_0000);
        msrs.insert(IA32_VMX_TRUE_EXIT_CTLS, 0xFFFF_FFFF_0003_6DFF);
        msrs.insert(IA32_VMX_TRUE_ENTRY_CTLS, 0xFFFF_FFFF_0000_11FF);
        msrs.insert(IA32_VMX_CR0_FIXED0, 0x8000_0021);
        msrs.insert(IA32_VMX_CR0_FIXED1, 0xFFFF_FFFF);
        msrs.insert(IA32_VMX_CR4_FIXED0, 0x2000);
        msrs.insert(IA32_VMX_CR4_FIXED1, 0x003F_FFFF);
        msrs.insert(IA32_EFER, 0xD01);
        Self {
            msrs: RefCell::new(msrs),
            fields: RefCell::new(HashMap::new()),
            writes: RefCell::new(Vec::new()),
            fail_vmclear: Cell::new(false),
            fail_vmptrld: Cell::new(false),
            fail_vmlaunch: Cell::new(false),
            fail_vmwrite: Cell::new(false),
            fail_vmread_field: Cell::new(None),
            vmclear_calls: Cell::new(0),
            vmptrld_calls: Cell::new(0),
            loaded_phys: Cell::new(0),
        }
    }

    pub fn set_msr(&self, msr: u32, value: u64) {
        self.msrs.borrow_mut().insert(msr, value);
    }

    pub fn read_msr_value(&self, msr: u32) -> u64 {
        self.msrs.borrow().get(&msr).copied().unwrap_or(0)
    }

    pub fn set_field(&self, field: Field, value: u64) {
        self.fields.borrow_mut().insert(field as u64, value);
    }

    /// Current value of a field; 0 when never written (VMCLEAR semantics).
    pub fn field(&self, field: Field) -> u64 {
        self.fields.borrow().get(&(field as u64)).copied().unwrap_or(0)
    }
}

impl VmxIntrinsics for MockIntrinsics {
    fn read_msr(&self, msr: u32) -> u64 {
        self.read_msr_value(msr)
    }

    fn cpuid_eax(&self, leaf: u32) -> u32 {
        match leaf {
            // 48-bit linear, 40-bit physical.
            0x8000_0008 => 0x3028,
            _ => 0,
        }
    }

    fn vmread(&self, field: u64) -> Option<u64> {
        if self.fail_vmread_field.get() == Some(field) {
            return None;
        }
        Some(self.fields.borrow().get(&field).copied().unwrap_or(0))
    }

    fn vmwrite(&self, field: u64, value: u64) -> bool {
        if self.fail_vmwrite.get() {
            return false;
        }
        self.fields.borrow_mut().insert(field, value);
        self.writes.borrow_mut().push((field, value));
        true
    }

    fn vmptrld(&self, phys: &u64) -> bool {
        self.vmptrld_calls.set(self.vmptrld_calls.get() + 1);
        if self.fail_vmptrld.get() {
            return false;
        }
        self.loaded_phys.set(*phys);
        true
    }

    fn vmclear(&self, phys: &u64) -> bool {
        self.vmclear_calls.set(self.vmclear_calls.get() + 1);
        let _ = phys;
        !self.fail_vmclear.get()
    }

    fn vmlaunch(&self) -> bool {
        !self.fail_vmlaunch.get()
    }
}

/// Identity-mapped translation that can be told to fail.
pub struct MockMemory {
    pub fail_virt_to_phys: Cell<bool>,
}

impl MockMemory {
    pub fn new() -> Self {
        Self {
            fail_virt_to_phys: Cell::new(false),
        }
    }
}

impl MemoryOps for MockMemory {
    fn virt_to_phys(&self, va: *const u8) -> u64 {
        if self.fail_virt_to_phys.get() {
            0
        } else {
            va as u64
        }
    }

    fn phys_to_virt(&self, pa: u64) -> *const u8 {
        pa as *const u8
    }
}

unsafe extern "C" fn resume_stub(_saved_state: *mut GeneralPurposeRegisters) {}
unsafe extern "C" fn promote_stub(_host_gs_base: u64) {}

/// Entry points whose trampolines return immediately.
pub fn entry_points() -> EntryPoints {
    EntryPoints {
        exit_handler: EXIT_HANDLER_ADDR,
        resume: resume_stub,
        promote: promote_stub,
    }
}

/// Host snapshot that satisfies every host-state check against the mock
/// capability MSRs.
pub fn sane_host_state() -> CpuState {
    CpuState {
        es_selector: 0x10,
        cs_selector: 0x08,
        ss_selector: 0x10,
        ds_selector: 0x10,
        fs_selector: 0x10,
        gs_selector: 0x10,
        ldtr_selector: 0,
        tr_selector: 0x40,
        gdtr_base: 0xFFFF_8000_0000_1000,
        gdtr_limit: 0x7F,
        idtr_base: 0xFFFF_8000_0000_1800,
        idtr_limit: 0xFFF,
        fs_base: 0,
        gs_base: 0xFFFF_8000_0000_2000,
        tr_base: 0xFFFF_8000_0000_0080,
        cr0: 0x8005_0033,
        cr3: 0x10_0000,
        cr4: 0x2020,
        dr7: 0x400,
        rflags: 0x2,
        pat: 0x0007_0406_0007_0406,
        efer: 0xD01,
        perf_global_ctrl: 0x3,
        ..CpuState::default()
    }
}

/// Guest snapshot for a 64-bit flat-model guest.
pub fn sane_guest_state() -> CpuState {
    CpuState {
        es_selector: 0x10,
        cs_selector: 0x08,
        ss_selector: 0x10,
        ds_selector: 0x10,
        fs_selector: 0x10,
        gs_selector: 0x10,
        ldtr_selector: 0,
        tr_selector: 0x40,
        es_limit: 0xFFFF_FFFF,
        cs_limit: 0xFFFF_FFFF,
        ss_limit: 0xFFFF_FFFF,
        ds_limit: 0xFFFF_FFFF,
        fs_limit: 0xFFFF_FFFF,
        gs_limit: 0xFFFF_FFFF,
        ldtr_limit: 0,
        tr_limit: 0x67,
        es_access_rights: 0xC093,
        cs_access_rights: 0xA09B,
        ss_access_rights: 0xC093,
        ds_access_rights: 0xC093,
        fs_access_rights: 0xC093,
        gs_access_rights: 0xC093,
        ldtr_access_rights: 0x1_0000,
        tr_access_rights: 0x8B,
        gdtr_base: 0xFFFF_8000_0001_1000,
        gdtr_limit: 0x7F,
        idtr_base: 0xFFFF_8000_0001_1800,
        idtr_limit: 0xFFF,
        fs_base: 0,
        gs_base: 0,
        tr_base: 0xFFFF_8000_0001_0080,
        cr0: 0x8005_0033,
        cr3: 0x20_0000,
        cr4: 0x2020,
        dr7: 0x400,
        rflags: 0x2,
        pat: 0x0007_0406_0007_0406,
        efer: 0xD01,
        perf_global_ctrl: 0,
        ..CpuState::default()
    }
}

/// Run the real writers and control synthesis against the mock so the
/// checker sees a VMCS a successful launch would produce.
pub fn populate_sane_vmcs(intr: &MockIntrinsics) {
    let vmcs = ActiveVmcs::new(intr);
    let stack = ExitHandlerStack::create();
    launch::write_guest_state(&vmcs, &sane_guest_state()).unwrap();
    launch::write_host_state(&vmcs, &sane_host_state(), &stack, EXIT_HANDLER_ADDR).unwrap();
    launch::seed_control_state(&vmcs, intr).unwrap();
    launch::synthesize_controls(&vmcs, intr).unwrap();
}
