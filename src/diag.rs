//! Post-mortem dump of the control state.

use crate::{
    vm_control::{
        VmcsEntryCtl, VmcsExitCtl, VmcsPinBasedVmexecCtl, VmcsProcBasedSecondaryVmexecCtl,
        VmcsProcBasedVmexecCtl,
    },
    vmcs::{ActiveVmcs, Field},
};

/// Dump the five execution-control words and the last VM-instruction error.
///
/// Best effort: a field that cannot be read is skipped rather than turning a
/// diagnostic path into another failure.
pub fn dump_controls(vmcs: &ActiveVmcs<'_>) {
    if let Ok(v) = vmcs.read(Field::PinBasedExecControls) {
        log::error!(
            "pin-based controls: {:?}",
            VmcsPinBasedVmexecCtl::from_bits_truncate(v as u32)
        );
    }
    if let Ok(v) = vmcs.read(Field::ProcessorBasedVmexecControls) {
        log::error!(
            "proc-based controls: {:?}",
            VmcsProcBasedVmexecCtl::from_bits_truncate(v as u32)
        );
    }
    if let Ok(v) = vmcs.read(Field::SecondaryVmexecControls) {
        log::error!(
            "proc-based controls2: {:?}",
            VmcsProcBasedSecondaryVmexecCtl::from_bits_truncate(v as u32)
        );
    }
    if let Ok(v) = vmcs.read(Field::VmexitControls) {
        log::error!(
            "vm-exit controls: {:?}",
            VmcsExitCtl::from_bits_truncate(v as u32)
        );
    }
    if let Ok(v) = vmcs.read(Field::VmentryControls) {
        log::error!(
            "vm-entry controls: {:?}",
            VmcsEntryCtl::from_bits_truncate(v as u32)
        );
    }
    log::error!("vm-instruction error: {:?}", vmcs.instruction_error());
}
