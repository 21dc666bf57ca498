//! Helper for driving process signal handling from a dedicated thread.
//! Handlers must stay small: set a flag, bump a counter, poke a latch.

pub use signal_hook::consts::signal::*;
use signal_hook::iterator::Signals;

/// Blocks the calling thread iterating over the given signals, invoking the
/// handler for each delivery. Returns only if the handler errors.
pub fn handle(
    signals: &[i32],
    mut handler: impl FnMut(i32) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    for raw_signal in Signals::new(signals)?.forever() {
        handler(raw_signal)?;
    }
    Ok(())
}
