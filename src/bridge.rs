use crate::session::Leg;
use tracing::debug;

/// propagate_compression applies the threshold the backend announced to the
/// client leg's outbound side.
///
/// Must run as soon as the announcement is observed: legs apply parameter
/// changes in order with their sends, so every later client-bound packet is
/// framed under the new threshold.
pub fn propagate_compression<L: Leg + ?Sized>(client: &mut L, threshold: i32) {
    debug!(threshold, "backend announced compression threshold");
    client.set_compression_threshold(threshold);
}
