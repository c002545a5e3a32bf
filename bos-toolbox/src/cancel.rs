//! Ctrl+C cancellation handling.

use bos_workflow::CancelFlag;

/// Route Ctrl+C to `flag`. Workflows stop at the next step boundary.
pub fn install_ctrlc_handler(flag: &CancelFlag) -> anyhow::Result<()> {
    let flag = flag.clone();
    ctrlc::set_handler(move || {
        flag.cancel();
        log::warn!("Cancellation requested (Ctrl+C).");
    })?;
    Ok(())
}
