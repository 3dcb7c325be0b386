//! The state-based sync seam shared by both replicated stores.

use crate::error::CollabResult;

/// A replica that can take part in the two-step state vector handshake.
///
/// Step 1 sends `state_vector()`; the peer answers with
/// `encode_diff(received_vector)`; the receiver merges it with
/// `merge_update`. Merging is commutative, associative and idempotent.
pub trait Replica {
    fn state_vector(&self) -> Vec<u8>;

    /// Everything this replica knows that the owner of `remote_state_vector`
    /// may be missing.
    fn encode_diff(&self, remote_state_vector: &[u8]) -> CollabResult<Vec<u8>>;

    /// Merge an update. Returns `true` if the visible state changed.
    fn merge_update(&mut self, update: &[u8]) -> CollabResult<bool>;
}
