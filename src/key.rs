use std::cmp::Ordering;

use bytes::{Bytes, BytesMut};

use crate::{
    device::Device,
    env::{DbState, EnvInner},
    error::{BurrowError, BurrowResult},
    flags::{AllocFlags, EnvFlags},
    io::get_u64,
};

/// Entry flag: only the first `keysize - 8` key bytes are inline; the last
/// 8 bytes hold the blob id of the key's tail.
pub(crate) const KEY_IS_EXTENDED: u8 = 0x01;
/// Entry flag: the entry's rid points at a duplicate table, not a record.
pub(crate) const KEY_HAS_DUPLICATES: u8 = 0x02;

/// A key as the caller sees it. With `KEY_USER_ALLOC` the engine fills the
/// existing buffer in place instead of swapping in its own.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Key {
    pub data: Vec<u8>,
    pub flags: AllocFlags,
}

impl Key {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            flags: AllocFlags::empty(),
        }
    }

    pub(crate) fn fill(&mut self, bytes: &[u8]) {
        if !self.flags.contains(AllocFlags::KEY_USER_ALLOC) {
            self.data = Vec::with_capacity(bytes.len());
        } else {
            self.data.clear();
        }
        self.data.extend_from_slice(bytes);
    }
}

/// A record payload, symmetric to [`Key`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Record {
    pub data: Vec<u8>,
    pub flags: AllocFlags,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            flags: AllocFlags::empty(),
        }
    }

    pub(crate) fn fill(&mut self, bytes: &[u8]) {
        if !self.flags.contains(AllocFlags::RECORD_USER_ALLOC) {
            self.data = Vec::with_capacity(bytes.len());
        } else {
            self.data.clear();
        }
        self.data.extend_from_slice(bytes);
    }
}

/// Internal key view: flags, the full key length, and the inline bytes.
/// For an extended key `data` holds exactly `keysize` bytes (prefix plus
/// blob-id tail); otherwise it holds the whole key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BtKey {
    pub flags: u8,
    pub len: usize,
    pub data: Vec<u8>,
}

impl BtKey {
    pub fn from_user(key: &[u8]) -> Self {
        Self {
            flags: 0,
            len: key.len(),
            data: key.to_vec(),
        }
    }

    pub fn is_extended(&self) -> bool {
        self.flags & KEY_IS_EXTENDED != 0
    }

    pub fn tail_blobid(&self, keysize: usize) -> u64 {
        get_u64(&self.data, keysize - 8)
    }
}

/// Result of a user prefix-compare function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixCompare {
    Lesser,
    Equal,
    Greater,
    /// The prefixes do not decide the ordering; the engine must compare the
    /// full keys.
    RequestFullKey,
}

/// Full-key compare: both slices are complete key bodies.
pub type CompareFunc = fn(&[u8], &[u8]) -> Ordering;

/// Prefix compare: each side is the available prefix plus the real length
/// of the full key.
pub type PrefixCompareFunc = fn(&[u8], usize, &[u8], usize) -> PrefixCompare;

/// The default full compare is lexicographic with "shorter is lesser",
/// which is exactly slice ordering.
pub fn default_compare(lhs: &[u8], rhs: &[u8]) -> Ordering {
    lhs.cmp(rhs)
}

/// Default prefix compare: decide on the common prefix length, request the
/// full keys when the prefixes tie.
pub fn default_prefix_compare(
    lhs: &[u8],
    _lhs_real_length: usize,
    rhs: &[u8],
    _rhs_real_length: usize,
) -> PrefixCompare {
    let min_length = lhs.len().min(rhs.len());
    match lhs[..min_length].cmp(&rhs[..min_length]) {
        Ordering::Less => PrefixCompare::Lesser,
        Ordering::Greater => PrefixCompare::Greater,
        Ordering::Equal => PrefixCompare::RequestFullKey,
    }
}

/// Bring the full body of an extended key into memory: consult the
/// extended-key cache first (on-disk environments only), otherwise read the
/// tail blob and assemble `inline prefix ++ tail`. The assembled body is
/// inserted into the cache; a full cache is not an error, the key is still
/// usable.
pub(crate) fn materialize_extended(
    db: &mut DbState,
    device: &Device,
    in_memory: bool,
    page_cache_used: usize,
    cachesize: usize,
    key: &BtKey,
) -> BurrowResult<Bytes> {
    let keysize = db.keysize as usize;
    let blobid = key.tail_blobid(keysize);

    if !in_memory {
        if let Some(body) = db.extkeys.fetch(blobid) {
            debug_assert_eq!(body.len(), key.len, "invalid cached key length");
            return Ok(body);
        }
    }

    let tail = device.blob_read(blobid)?;

    let mut full = BytesMut::with_capacity(key.len);
    full.extend_from_slice(&key.data[..keysize - 8]);
    full.extend_from_slice(&tail);
    let full = full.freeze();
    debug_assert_eq!(full.len(), key.len, "invalid key length");

    if !in_memory {
        let _ = db.extkeys.insert(blobid, full.clone(), page_cache_used, cachesize);
    }

    Ok(full)
}

impl EnvInner {
    /// Compare two keys per the database's compare functions, pulling in
    /// extended-key bodies when the prefixes cannot decide.
    pub(crate) fn compare_keys(
        &mut self,
        dbid: u16,
        lhs: &BtKey,
        rhs: &BtKey,
    ) -> BurrowResult<Ordering> {
        // stage 1: no extended key involved, compare directly
        if !lhs.is_extended() && !rhs.is_extended() {
            let db = self.dbs.get(&dbid).ok_or(BurrowError::InvalidParameter)?;
            return Ok((db.compare)(&lhs.data, &rhs.data));
        }

        let in_memory = self.flags.contains(EnvFlags::IN_MEMORY_DB);
        let cachesize = self.cachesize;
        let page_cache_used = self.cache.usedsize();
        let (dbs, device) = (&mut self.dbs, &self.device);
        let db = dbs.get_mut(&dbid).ok_or(BurrowError::InvalidParameter)?;
        let keysize = db.keysize as usize;

        // stage 2: let the prefix compare function decide on the available
        // prefixes, if one is installed
        if let Some(prefix_compare) = db.prefix_compare {
            let lhs_prefix = if lhs.is_extended() {
                keysize - 8
            } else {
                lhs.data.len()
            };
            let rhs_prefix = if rhs.is_extended() {
                keysize - 8
            } else {
                rhs.data.len()
            };
            match prefix_compare(
                &lhs.data[..lhs_prefix],
                lhs.len,
                &rhs.data[..rhs_prefix],
                rhs.len,
            ) {
                PrefixCompare::Lesser => return Ok(Ordering::Less),
                PrefixCompare::Equal => return Ok(Ordering::Equal),
                PrefixCompare::Greater => return Ok(Ordering::Greater),
                PrefixCompare::RequestFullKey => {}
            }
        }

        // stage 3: materialize every extended side, then run the full
        // compare over the assembled bodies
        let lhs_full;
        let lhs_bytes: &[u8] = if lhs.is_extended() {
            lhs_full = materialize_extended(db, device, in_memory, page_cache_used, cachesize, lhs)?;
            &lhs_full
        } else {
            &lhs.data
        };
        let rhs_full;
        let rhs_bytes: &[u8] = if rhs.is_extended() {
            rhs_full = materialize_extended(db, device, in_memory, page_cache_used, cachesize, rhs)?;
            &rhs_full
        } else {
            &rhs.data
        };

        Ok((db.compare)(lhs_bytes, rhs_bytes))
    }

    /// The full body of a key, assembling extended keys through the cache.
    pub(crate) fn full_key_bytes(&mut self, dbid: u16, key: &BtKey) -> BurrowResult<Bytes> {
        if !key.is_extended() {
            return Ok(Bytes::copy_from_slice(&key.data));
        }
        let in_memory = self.flags.contains(EnvFlags::IN_MEMORY_DB);
        let cachesize = self.cachesize;
        let page_cache_used = self.cache.usedsize();
        let (dbs, device) = (&mut self.dbs, &self.device);
        let db = dbs.get_mut(&dbid).ok_or(BurrowError::InvalidParameter)?;
        materialize_extended(db, device, in_memory, page_cache_used, cachesize, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_compare_shorter_is_lesser() {
        assert_eq!(default_compare(b"abc", b"abcd"), Ordering::Less);
        assert_eq!(default_compare(b"abcd", b"abc"), Ordering::Greater);
        assert_eq!(default_compare(b"abc", b"abc"), Ordering::Equal);
        assert_eq!(default_compare(b"abd", b"abc"), Ordering::Greater);
    }

    #[test]
    fn test_default_prefix_compare() {
        assert_eq!(
            default_prefix_compare(b"abc", 10, b"abd", 12),
            PrefixCompare::Lesser
        );
        assert_eq!(
            default_prefix_compare(b"abd", 10, b"abc", 12),
            PrefixCompare::Greater
        );
        // ties on the available prefix always escalate
        assert_eq!(
            default_prefix_compare(b"abc", 10, b"abc", 12),
            PrefixCompare::RequestFullKey
        );
        assert_eq!(
            default_prefix_compare(b"abc", 3, b"abcd", 4),
            PrefixCompare::RequestFullKey
        );
    }
}
