//! Cache keys: fingerprints of a source file's identity, the converter
//! format version and any auxiliary inputs that affect the output.
//!
//! Two sources with equal keys must convert to byte-identical artifacts, so
//! every input that can change a converter's output has to be fed in here.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::storage::FileStat;

/// Zip and FAT timestamps only keep even seconds.
const MTIME_MASK: i64 = !1;

/// A source file as seen by the cache. Recomputed on every resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceIdentity {
    pub path: String,
    pub mtime: i64,
    pub size: u64,
}

impl SourceIdentity {
    pub fn from_stat(path: impl Into<String>, stat: FileStat) -> Self {
        Self {
            path: path.into(),
            mtime: stat.mtime & MTIME_MASK,
            size: stat.size,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; CacheKey::LEN]);

impl CacheKey {
    pub const LEN: usize = 16;

    /// Pure function of its inputs. Aux entries are hashed in the order
    /// given; set-like inputs must be sorted by the caller.
    pub fn build(identity: &SourceIdentity, version: u32, aux: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(identity.mtime.to_le_bytes());
        hasher.update(identity.size.to_le_bytes());
        hasher.update(version.to_le_bytes());
        for entry in aux {
            hasher.update((entry.len() as u64).to_le_bytes());
            hasher.update(*entry);
        }
        Self::from_hasher(hasher)
    }

    pub(crate) fn from_hasher(hasher: Sha256) -> Self {
        let digest = hasher.finalize();
        let mut bytes = [0u8; Self::LEN];
        bytes.copy_from_slice(&digest[..Self::LEN]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Leading `digits` hex characters, clamped to the full key length.
    pub fn prefix_hex(&self, digits: usize) -> String {
        let mut text = self.to_hex();
        text.truncate(digits.min(Self::LEN * 2));
        text
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.to_hex())
    }
}

/// Everything that goes into a key except the source identity.
///
/// The resolver stats the source first and only then finishes the key, so
/// one builder describes a whole asset kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheKeyBuilder {
    version: u32,
    aux: Vec<Vec<u8>>,
}

impl CacheKeyBuilder {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            aux: Vec::new(),
        }
    }

    pub fn with_aux(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.push_aux(bytes);
        self
    }

    pub fn push_aux(&mut self, bytes: impl Into<Vec<u8>>) {
        self.aux.push(bytes.into());
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn aux_len(&self) -> usize {
        self.aux.len()
    }

    pub fn build(&self, identity: &SourceIdentity) -> CacheKey {
        let aux: Vec<&[u8]> = self.aux.iter().map(Vec::as_slice).collect();
        CacheKey::build(identity, self.version, &aux)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(mtime: i64, size: u64) -> SourceIdentity {
        SourceIdentity::from_stat("art/meshes/model.dae", FileStat { mtime, size })
    }

    #[test]
    fn mtime_low_bit_is_masked() {
        assert_eq!(identity(1001, 512).mtime, 1000);
        assert_eq!(identity(1000, 512).mtime, 1000);
        assert_eq!(
            CacheKey::build(&identity(1001, 512), 3, &[]),
            CacheKey::build(&identity(1000, 512), 3, &[])
        );
    }

    #[test]
    fn build_is_deterministic() {
        let aux: [&[u8]; 2] = [b"skeletons", b"settings"];
        let first = CacheKey::build(&identity(1000, 512), 3, &aux);
        let second = CacheKey::build(&identity(1000, 512), 3, &aux);
        assert_eq!(first, second);
        assert_eq!(first.to_hex().len(), 32);
    }

    #[test]
    fn every_input_changes_the_key() {
        let base = CacheKey::build(&identity(1000, 512), 3, &[b"a".as_slice()]);
        assert_ne!(base, CacheKey::build(&identity(1002, 512), 3, &[b"a".as_slice()]));
        assert_ne!(base, CacheKey::build(&identity(1000, 513), 3, &[b"a".as_slice()]));
        assert_ne!(base, CacheKey::build(&identity(1000, 512), 4, &[b"a".as_slice()]));
        assert_ne!(base, CacheKey::build(&identity(1000, 512), 3, &[b"b".as_slice()]));
        assert_ne!(base, CacheKey::build(&identity(1000, 512), 3, &[]));
    }

    #[test]
    fn aux_boundaries_do_not_alias() {
        let split: [&[u8]; 2] = [b"ab", b"c"];
        let joined: [&[u8]; 2] = [b"a", b"bc"];
        let split = CacheKey::build(&identity(1000, 512), 3, &split);
        let joined = CacheKey::build(&identity(1000, 512), 3, &joined);
        assert_ne!(split, joined);
    }

    #[test]
    fn builder_matches_direct_build() {
        let builder = CacheKeyBuilder::new(3).with_aux(b"x".to_vec());
        assert_eq!(builder.aux_len(), 1);
        assert_eq!(
            builder.build(&identity(1000, 512)),
            CacheKey::build(&identity(1000, 512), 3, &[b"x".as_slice()])
        );
    }

    #[test]
    fn prefix_is_clamped() {
        let key = CacheKey::build(&identity(1000, 512), 3, &[]);
        assert_eq!(key.prefix_hex(8).len(), 8);
        assert!(key.to_hex().starts_with(&key.prefix_hex(8)));
        assert_eq!(key.prefix_hex(100), key.to_hex());
    }
}
