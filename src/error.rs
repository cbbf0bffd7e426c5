use crate::backend::BackendError;
use crate::guest_memory::GuestMemoryError;

/// Top-level error type for the command processor.
///
/// Unsupported guest input is *not* represented here: unrecognized methods,
/// formats, and blend modes are logged and discarded at the dispatch layer,
/// because guest software must never be able to halt emulation. Everything
/// that does surface as an error is either a guest-visible fault latched into
/// the pushbuffer state machine or a host-side invariant violation.
#[derive(Debug, thiserror::Error)]
pub enum KelvinError {
    #[error(transparent)]
    GuestMemory(#[from] GuestMemoryError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The pushbuffer decoder latched an error (reserved command word,
    /// nested call, return without call). The channel is suspended until
    /// reset, matching hardware behavior.
    #[error("pushbuffer error latched: {0:?}")]
    PushbufferError(crate::pushbuffer::PushbufferFault),
}
