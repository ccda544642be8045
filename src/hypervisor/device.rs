//! Performance hints for cloned device strings
//!
//! Cloned VMs inherit the base template's device lines. These helpers return
//! the upgraded line, or `None` when the hint is already present.

/// Config key of the primary disk
pub const PRIMARY_DISK: &str = "virtio0";

/// Config key of the primary NIC
pub const PRIMARY_NIC: &str = "net0";

fn append_option(device: &str, key: &str, option: &str) -> Option<String> {
    if device.is_empty() || device.split(',').any(|part| part.starts_with(key)) {
        return None;
    }
    Some(format!("{},{}", device, option))
}

/// Add `aio=native` to a disk line unless an `aio=` setting already exists.
pub fn upgrade_disk(device: &str) -> Option<String> {
    append_option(device, "aio=", "aio=native")
}

/// Add `queues=2` to a NIC line unless a `queues=` setting already exists.
pub fn upgrade_nic(device: &str) -> Option<String> {
    append_option(device, "queues=", "queues=2")
}

/// Extract the MAC address from a NIC line such as
/// `virtio=BC:24:11:AA:BB:CC,bridge=vmbr0`.
pub fn nic_mac(device: &str) -> Option<&str> {
    device.split(',').find_map(|part| {
        let (_, value) = part.split_once('=')?;
        let octets: Vec<&str> = value.split(':').collect();
        let is_mac = octets.len() == 6
            && octets
                .iter()
                .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
        is_mac.then_some(value)
    })
}
