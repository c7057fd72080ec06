//! Name hashing and the optional hash → name registry.
//!
//! Every name stored in a TAF file (shaders, audio nodes, parameters) is a
//! 64-bit FNV-1a hash. The registry maps hashes back to the strings that
//! produced them for diagnostics; save and load never depend on it.
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

use log::warn;

const FNV_OFFSET_BASIS: u64 = 0xCBF29CE484222325;
const FNV_PRIME: u64 = 0x100000001B3;

/// 64-bit FNV-1a over raw bytes.
pub const fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}

/// 64-bit FNV-1a of a name string.
///
/// # Examples
/// ```rust
/// assert_eq!(0x390A02F104C147E1, taf_lib::hash::hash_name("frequency"));
/// ```
pub const fn hash_name(name: &str) -> u64 {
    fnv1a_64(name.as_bytes())
}

/// CRC32 (ISO-HDLC) over raw payload bytes, as stored in directory entries.
pub fn crc32(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

static NAME_REGISTRY: LazyLock<Mutex<HashMap<u64, String>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Hashes `name` and records the hash → string mapping.
///
/// Two distinct strings hashing to the same value are logged as a collision
/// but not rejected; the first registered string stays canonical.
pub fn register_name(name: &str) -> u64 {
    let hash = hash_name(name);
    let mut names = NAME_REGISTRY.lock().unwrap();
    match names.get(&hash) {
        Some(existing) if existing != name => {
            warn!("hash collision: {hash:#018X} maps to both {existing:?} and {name:?}");
        }
        Some(_) => (),
        None => {
            names.insert(hash, name.to_string());
        }
    }
    hash
}

/// The canonical string for `hash`, or a synthetic placeholder if the hash
/// was never registered.
pub fn lookup_name(hash: u64) -> String {
    NAME_REGISTRY
        .lock()
        .unwrap()
        .get(&hash)
        .cloned()
        .unwrap_or_else(|| format!("UNKNOWN_HASH_0x{hash:016X}"))
}

/// All registered hash → name pairs, sorted by hash.
pub fn dump_names() -> Vec<(u64, String)> {
    let names = NAME_REGISTRY.lock().unwrap();
    let mut entries: Vec<_> = names.iter().map(|(h, n)| (*h, n.clone())).collect();
    entries.sort_by_key(|(h, _)| *h);
    entries
}
