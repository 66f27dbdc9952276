//! Pluggable record security for stream connections.

use crate::{stream_buffer::StreamBuffer, Error};

/// Framing bytes a sealed record adds around its plaintext.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Overhead {
    pub header: usize,
    pub trailer: usize,
}

impl Overhead {
    pub const fn total(&self) -> usize {
        self.header + self.trailer
    }
}

/// Result of feeding received ciphertext to a [SecurityContext].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    /// The handshake has completed.
    pub established: bool,
    /// Handshake output is waiting in [SecurityContext::pending_token].
    pub token: bool,
}

/// Per-connection security state.
///
/// The receive pipeline feeds every received chunk (in order) to
/// [SecurityContext::receive] and then drains decrypted bytes with
/// [SecurityContext::read_plaintext] into descriptor-backed buffers. Outgoing
/// bytes are sealed into a [StreamBuffer] before they are written.
pub trait SecurityContext: Send {
    fn overhead(&self) -> Overhead;

    /// Consumes received ciphertext.
    fn receive(&mut self, ciphertext: &[u8]) -> Result<Progress, Error>;

    /// Copies decrypted bytes into `out`, returning how many were written.
    /// Returns zero when nothing is buffered.
    fn read_plaintext(&mut self, out: &mut [u8]) -> Result<usize, Error>;

    /// Moves pending handshake output into `out`, returning its length.
    fn pending_token(&mut self, out: &mut StreamBuffer) -> Result<usize, Error>;

    /// Encrypts `plaintext` and appends the resulting records to `out`.
    fn seal(&mut self, plaintext: &[u8], out: &mut StreamBuffer) -> Result<(), Error>;

    fn is_established(&self) -> bool;
}
