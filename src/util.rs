use core::str;
use std::ascii;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rand::distr::{Alphanumeric, SampleString};

pub const PEER_ID_PREFIX: &str = "-PW0100-";

/// Locks a mutex, recovering the data if a holder panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn force_string(v: &[u8]) -> String {
    match str::from_utf8(v) {
        Ok(s) => s.to_string(),
        Err(_) => format!(
            "<non_utf-8>{}",
            v.iter()
                .flat_map(|b| ascii::escape_default(*b))
                .map(char::from)
                .collect::<String>()
        ),
    }
}

pub fn pretty_info_hash(info_hash: [u8; 20]) -> String {
    hex::encode(info_hash)
}

pub fn generate_peer_id() -> [u8; 20] {
    let suffix = Alphanumeric.sample_string(&mut rand::rng(), 20 - PEER_ID_PREFIX.len());
    let mut peer_id = [0; 20];
    peer_id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX.as_bytes());
    peer_id[PEER_ID_PREFIX.len()..].copy_from_slice(suffix.as_bytes());
    peer_id
}
