//! VMCS construction and validation core for Intel VT-x.
//!
//! This crate owns the part of a hypervisor that turns a captured CPU state
//! into a running VMX non-root context: it allocates and stamps the VMCS
//! region, copies the caller-supplied host and guest state into the
//! architectural field set, derives the five execution-control words under
//! the allowed-0/allowed-1 semantics of the VMX capability MSRs, and issues
//! `VMLAUNCH`. When the processor rejects the entry, the crate re-runs the
//! checks the CPU performed (SDM Vol. 3C, Chapter 27 "VM Entries") to name
//! the first violated invariant and dumps the control state for post-mortem
//! use.
//!
//! Everything privileged is reached through two narrow ports,
//! [`intrinsics::VmxIntrinsics`] and [`intrinsics::MemoryOps`], so the whole
//! pipeline runs unmodified against mock ports in unit tests.
//!
//! ## Details
//! See Intel® 64 and IA-32 Architectures Software Developer's Manual,
//! 24.2 FORMAT OF THE VMCS REGION and Chapter 27 VM ENTRIES.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod checks;
pub mod diag;
pub mod intrinsics;
pub mod launch;
pub mod state;
#[cfg(test)]
pub(crate) mod test_support;
pub mod vm_control;
pub mod vmcs;

use vmcs::{Field, InstructionError};

/// Witness that a transfer of control is not expected to come back.
///
/// `resume` and `promote` hand the CPU to a trampoline that restores another
/// context; a value of this type cannot be constructed, so the only way those
/// calls return is through their error variant.
pub enum Never {}

/// The VMX instruction a failed region operation was executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxInstruction {
    /// `VMCLEAR`
    Clear,
    /// `VMPTRLD`
    Load,
    /// `VMLAUNCH`
    Launch,
}

/// Possible errors of the VMCS core.
///
/// Nothing in this crate retries: every failure is surfaced to the caller
/// after the coordinator has released the resources it acquired, in reverse
/// order of acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxError {
    /// The VMCS page could not be translated to a physical address.
    RegionAllocationFailed,
    /// `VMCLEAR`, `VMPTRLD` or `VMLAUNCH` reported failure.
    VmxInstructionFailed(VmxInstruction),
    /// `VMREAD` of the given field reported failure.
    VmreadFailed(Field),
    /// `VMWRITE` of the given field reported failure.
    VmwriteFailed(Field),
    /// A pre-launch architectural check did not hold.
    ArchCheckFailed(&'static str),
    /// `VMLAUNCH` was rejected; carries the decoded VM-instruction error.
    LaunchFailed(InstructionError),
    /// The resume trampoline came back.
    ResumeReturned,
    /// The promotion trampoline came back.
    PromoteReturned,
}

impl core::fmt::Display for VmxError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::RegionAllocationFailed => write!(f, "failed to allocate the VMCS region"),
            Self::VmxInstructionFailed(which) => write!(f, "{:?} failed", which),
            Self::VmreadFailed(field) => write!(f, "VMREAD of {:?} failed", field),
            Self::VmwriteFailed(field) => write!(f, "VMWRITE of {:?} failed", field),
            Self::ArchCheckFailed(name) => write!(f, "architectural check {} failed", name),
            Self::LaunchFailed(err) => write!(f, "VMLAUNCH rejected: {:?}", err),
            Self::ResumeReturned => write!(f, "resume trampoline returned"),
            Self::PromoteReturned => write!(f, "promotion trampoline returned"),
        }
    }
}
