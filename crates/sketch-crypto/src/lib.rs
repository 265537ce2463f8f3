/// Sketch key material
///
/// Every credential the server hands out is an opaque random token:
/// - room secret keys (shared join credential, shown to the creator once)
/// - participant recovery keys (re-entry without the room secret)
/// - the process-wide admin key (stored only as an argon2 hash once acknowledged)

pub mod keys;
