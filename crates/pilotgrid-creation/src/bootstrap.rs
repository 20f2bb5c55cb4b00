//! Context bootstrap file handed to the guest.
//!
//! One `name;ip;hostname` line per NIC (at most two), followed by the
//! caller's context document if there is one.

use pilotgrid_core::{FileCopyNeed, VirtualMachine};
use tracing::warn;

const MAX_BOOTSTRAP_NICS: usize = 2;

/// Build the bootstrap file for `vm`, or `None` if its NIC layout does not
/// fit the format.
pub fn bootstrap_file(
    vm: &VirtualMachine,
    context: Option<&str>,
    dest_path: &str,
) -> Option<FileCopyNeed> {
    if vm.nics.is_empty() || vm.nics.len() > MAX_BOOTSTRAP_NICS {
        warn!(
            vm = %vm.name,
            nics = vm.nics.len(),
            "nic count unsupported for context bootstrap, skipping"
        );
        return None;
    }

    let mut contents = String::new();
    for nic in &vm.nics {
        contents.push_str(&format!(
            "{};{};{}\n",
            nic.name,
            nic.ip.as_deref().unwrap_or(""),
            nic.hostname.as_deref().unwrap_or("")
        ));
    }
    if let Some(context) = context {
        contents.push_str(context);
        if !context.ends_with('\n') {
            contents.push('\n');
        }
    }

    Some(FileCopyNeed {
        contents,
        dest_path: dest_path.to_string(),
    })
}
