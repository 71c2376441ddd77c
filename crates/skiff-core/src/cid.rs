use cid::Cid;
use multihash::Multihash;
use sha2::{Digest, Sha256};

use crate::error::{Result, SkiffError};

/// Multicodec code for raw binary content.
const RAW_CODEC: u64 = 0x55;
/// Multicodec code for SHA2-256.
const SHA2_256: u64 = 0x12;

/// Compute the content identifier for a chunk of uncompressed bytes.
///
/// The identifier is a CIDv1 over a SHA2-256 multihash with the raw codec,
/// rendered in canonical base32-lower form. Identical input bytes always
/// yield the same string, across platforms and versions.
pub fn generate(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mh = Multihash::<64>::wrap(SHA2_256, &digest)
        .expect("a 32-byte digest fits the 64-byte multihash");
    Cid::new_v1(RAW_CODEC, mh).to_string()
}

/// Whether `s` parses as a CID.
pub fn validate(s: &str) -> bool {
    Cid::try_from(s).is_ok()
}

/// Parse a CID string, returning a typed error for malformed input.
pub fn parse(s: &str) -> Result<Cid> {
    Cid::try_from(s).map_err(|e| SkiffError::InvalidCid(format!("{s}: {e}")))
}
