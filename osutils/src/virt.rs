//! This module contains helper functions for working with virtualized environments.

const HYPERVISOR_VENDORS: &[&str] = &[
    "QEMU",
    "KVM",
    "VMware",
    "VirtualBox",
    "Microsoft Corporation",
    "Xen",
    "Amazon EC2",
];

/// Does a best-effort check to determine whether we are running inside a
/// virtual machine. Defaults to false when no evidence is found.
///
/// Checks:
///
/// - DMI information (sys_vendor and product_name) for known hypervisors.
/// - `/sys/hypervisor/type` (populated by Xen and some paravirt guests).
pub fn is_virtual_machine() -> bool {
    for dmi in ["sys_vendor", "product_name"] {
        if let Ok(value) = std::fs::read_to_string(format!("/sys/class/dmi/id/{dmi}")) {
            if HYPERVISOR_VENDORS.iter().any(|v| value.contains(v)) {
                return true;
            }
        }
    }

    if std::fs::read_to_string("/sys/hypervisor/type")
        .map(|s| !s.trim().is_empty())
        .unwrap_or_default()
    {
        return true;
    }

    // We have no more ways to check, so we assume bare metal.
    false
}
