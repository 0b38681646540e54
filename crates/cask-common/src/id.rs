//! Random identifier generation.

/// Generate `len` random lowercase hex characters from a UUID v4.
///
/// Used for anonymous volume names and temporary interface names.
#[must_use]
pub fn random_hex(len: usize) -> String {
    let uuid = uuid::Uuid::new_v4();
    let mut hex = hex::encode(uuid.as_bytes());
    hex.truncate(len.min(32));
    hex
}
