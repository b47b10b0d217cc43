//! Ports into the privileged execution environment.
//!
//! The core never touches hardware directly; every `VMREAD`/`VMWRITE`, MSR
//! access and address translation goes through the two traits below. The
//! hardware implementations live here as well, behind `target_arch`, so a
//! kernel embedding this crate wires them in with no extra glue. Tests
//! substitute mock implementations.

/// Capability surface over the VMX instruction set.
///
/// Every method completes synchronously; a `bool`/`Option` result carries
/// the CF/ZF outcome of the underlying instruction.
pub trait VmxIntrinsics {
    /// Read a model-specific register.
    fn read_msr(&self, msr: u32) -> u64;
    /// Execute CPUID for `leaf` and return EAX.
    fn cpuid_eax(&self, leaf: u32) -> u32;
    /// `VMREAD` of the field encoding; `None` when the instruction fails.
    fn vmread(&self, field: u64) -> Option<u64>;
    /// `VMWRITE` of the field encoding; `false` when the instruction fails.
    fn vmwrite(&self, field: u64, value: u64) -> bool;
    /// `VMPTRLD` of the physical address behind the reference.
    fn vmptrld(&self, phys: &u64) -> bool;
    /// `VMCLEAR` of the physical address behind the reference.
    fn vmclear(&self, phys: &u64) -> bool;
    /// `VMLAUNCH`. Only reached as the final step of the launch pipeline.
    fn vmlaunch(&self) -> bool;
}

/// Translation between host-virtual and host-physical addresses.
pub trait MemoryOps {
    /// Physical address backing `va`, or 0 when the address is unmappable.
    fn virt_to_phys(&self, va: *const u8) -> u64;
    /// Virtual alias of `pa`, or null when the address is unmappable.
    fn phys_to_virt(&self, pa: u64) -> *const u8;
}

/// Intrinsics backed by the real instructions.
///
/// Usable only in VMX root operation at CPL 0.
#[cfg(target_arch = "x86_64")]
pub struct HardwareIntrinsics;

#[cfg(target_arch = "x86_64")]
impl VmxIntrinsics for HardwareIntrinsics {
    fn read_msr(&self, msr: u32) -> u64 {
        let (lo, hi): (u32, u32);
        unsafe {
            core::arch::asm!(
                "rdmsr",
                in("ecx") msr,
                out("eax") lo,
                out("edx") hi,
                options(nomem, nostack),
            );
        }
        ((hi as u64) << 32) | lo as u64
    }

    fn cpuid_eax(&self, leaf: u32) -> u32 {
        let eax: u32;
        unsafe {
            // RBX is reserved by LLVM.
            core::arch::asm!(
                "push rbx",
                "cpuid",
                "pop rbx",
                inout("eax") leaf => eax,
                inout("ecx") 0u32 => _,
                out("edx") _,
                options(nomem),
            );
        }
        eax
    }

    fn vmread(&self, field: u64) -> Option<u64> {
        unsafe {
            let err: i8;
            let v: u64;
            core::arch::asm!(
                "clc",
                "vmread {}, {}",
                "setna {}",
                out(reg) v,
                in(reg) field,
                out(reg_byte) err,
            );
            if err != 0 {
                None
            } else {
                Some(v)
            }
        }
    }

    fn vmwrite(&self, field: u64, value: u64) -> bool {
        unsafe {
            let err: i8;
            core::arch::asm!(
                "clc",
                "vmwrite {}, {}",
                "setna {}",
                in(reg) field,
                in(reg) value,
                out(reg_byte) err,
            );
            err == 0
        }
    }

    fn vmptrld(&self, phys: &u64) -> bool {
        unsafe {
            let err: i8;
            core::arch::asm!(
                "clc",
                "vmptrld [{}]",
                "setna {}",
                in(reg) phys as *const u64,
                out(reg_byte) err,
            );
            err == 0
        }
    }

    fn vmclear(&self, phys: &u64) -> bool {
        unsafe {
            let err: i8;
            core::arch::asm!(
                "clc",
                "vmclear [{}]",
                "setna {}",
                in(reg) phys as *const u64,
                out(reg_byte) err,
            );
            err == 0
        }
    }

    fn vmlaunch(&self) -> bool {
        unsafe {
            let err: i8;
            core::arch::asm!(
                "clc",
                "vmlaunch",
                "setna {}",
                out(reg_byte) err,
            );
            err == 0
        }
    }
}
