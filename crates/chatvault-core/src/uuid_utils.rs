//! UUID v7 helpers.
//!
//! Jobs, documents and event envelopes use UUIDv7 so ids sort by creation time.

use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}
