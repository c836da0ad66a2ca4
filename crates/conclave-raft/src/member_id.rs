//! Stable member identifiers.
//!
//! Every member is known to the consensus layer by a `u64` derived
//! from its advertised peer URL, so any node can compute the id of a
//! peer it has never talked to.

/// Derive the member id for an advertised peer URL (FNV-1a 64-bit).
///
/// Never returns 0; openraft treats 0 as "no node" in several places.
pub fn member_id(peer_url: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in peer_url.trim_end_matches('/').bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    if hash == 0 {
        hash = 1;
    }
    hash
}
