//! Host collaborators: the abort sink.
//!
//! The trace sink is just the `log` crate's global logger — a host installs
//! one (or leaves the default no-op logger in place) the same way
//! `logk::init` wires a `log::Log` impl up for the teacher's kernel. This
//! crate only ever calls `log::trace!`/`log::debug!`/`log::warn!`/
//! `log::error!`; it never implements `log::Log` itself.

use crate::error::AbortReason;

/// Reports `reason` and then diverges. The default implementation logs at
/// `error` level and panics, which under `no_std` invokes whatever
/// `#[panic_handler]` the host linked in — mirroring the teacher's own
/// `main.rs`, which prints the panic message over UART and then spins on
/// `wfi`. A host that wants a different abort path can replace this by
/// linking its own `#[panic_handler]`; this module never touches hardware
/// directly.
#[cold]
#[inline(never)]
pub fn abort(reason: AbortReason) -> ! {
    log::error!("fixed_malloc: aborting: {}", reason);
    panic!("fixed_malloc: {}", reason);
}
