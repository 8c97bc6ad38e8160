use std::{
    fmt,
    path::{Component, Path, PathBuf},
};

use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::store::StoreError;

/// Length of the hash part of a store path base name.
pub const HASH_LEN: usize = 32;
const MAX_NAME_LEN: usize = 211;
const NIX32_CHARS: &[u8; 32] = b"0123456789abcdfghijklmnpqrsvwxyz";
pub const DRV_EXTENSION: &str = ".drv";

/// Immutable identifier of a store object: `<hash>-<name>`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePath {
    base_name: String,
}

impl StorePath {
    /// Parse the base name of a store path (`<hash>-<name>`, no directory).
    pub fn parse_base_name(base_name: &str) -> Result<Self, StoreError> {
        let bad = |reason: &str| StoreError::BadStorePath {
            path: base_name.to_string(),
            reason: reason.to_string(),
        };
        if base_name.len() < HASH_LEN + 2 {
            return Err(bad("name is too short"));
        }
        let bytes = base_name.as_bytes();
        if bytes[HASH_LEN] != b'-' {
            return Err(bad("missing '-' after the hash part"));
        }
        if !bytes[..HASH_LEN]
            .iter()
            .all(|byte| NIX32_CHARS.contains(byte))
        {
            return Err(bad("hash part is not nix-base32"));
        }
        let name = &base_name[HASH_LEN + 1..];
        validate_name(name).map_err(bad)?;
        Ok(Self {
            base_name: base_name.to_string(),
        })
    }

    /// Build a path whose hash part is derived from `data`.
    pub fn from_digest(name: &str, data: &[u8]) -> Result<Self, StoreError> {
        validate_name(name).map_err(|reason| StoreError::BadStorePath {
            path: name.to_string(),
            reason: reason.to_string(),
        })?;
        let digest = Sha256::digest(data);
        let mut compressed = [0u8; 20];
        for (idx, byte) in digest.iter().enumerate() {
            compressed[idx % compressed.len()] ^= byte;
        }
        Ok(Self {
            base_name: format!("{}-{name}", nix32_encode(&compressed)),
        })
    }

    #[must_use]
    pub fn hash_part(&self) -> &str {
        &self.base_name[..HASH_LEN]
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.base_name[HASH_LEN + 1..]
    }

    #[must_use]
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    #[must_use]
    pub fn is_derivation(&self) -> bool {
        self.name().ends_with(DRV_EXTENSION)
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base_name)
    }
}

impl Serialize for StorePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.base_name)
    }
}

fn validate_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("name is empty");
    }
    if name.len() > MAX_NAME_LEN {
        return Err("name is too long");
    }
    if name.starts_with('.') {
        return Err("name starts with '.'");
    }
    let valid = name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.' | b'_' | b'?' | b'='));
    if valid {
        Ok(())
    } else {
        Err("name contains an illegal character")
    }
}

/// Nix-flavoured base32 (no padding, reversed bit order).
pub(crate) fn nix32_encode(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }
    let len = (bytes.len() * 8 - 1) / 5 + 1;
    let mut out = String::with_capacity(len);
    for n in (0..len).rev() {
        let bit = n * 5;
        let idx = bit / 8;
        let shift = bit % 8;
        let low = u16::from(bytes[idx]) >> shift;
        let high = bytes
            .get(idx + 1)
            .map_or(0, |next| u16::from(*next) << (8 - shift));
        out.push(char::from(NIX32_CHARS[usize::from((low | high) & 0x1f)]));
    }
    out
}

/// The directory holding store objects, used to print and parse full paths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreDir {
    path: PathBuf,
}

impl StoreDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn path_of(&self, path: &StorePath) -> PathBuf {
        self.path.join(path.base_name())
    }

    #[must_use]
    pub fn print(&self, path: &StorePath) -> String {
        self.path_of(path).display().to_string()
    }

    /// Parse the full textual form of a store path. The path must name a
    /// top-level entry of this store.
    pub fn parse_store_path(&self, text: &str) -> Result<StorePath, StoreError> {
        let path = Path::new(text);
        match (path.parent(), path.file_name().and_then(|name| name.to_str())) {
            (Some(parent), Some(base)) if parent == self.path => StorePath::parse_base_name(base),
            _ => Err(StoreError::NotInStore(text.to_string())),
        }
    }

    pub fn maybe_parse_store_path(&self, text: &str) -> Option<StorePath> {
        self.parse_store_path(text).ok()
    }

    /// Whether `path` points into (not at) the store directory.
    #[must_use]
    pub fn is_in_store(&self, path: &Path) -> bool {
        path != self.path && path.starts_with(&self.path)
    }

    /// Resolve a path inside a store object to the object and the remainder.
    pub fn to_store_path(&self, path: &Path) -> Result<(StorePath, PathBuf), StoreError> {
        let not_in_store = || StoreError::NotInStore(path.display().to_string());
        let rest = path.strip_prefix(&self.path).map_err(|_| not_in_store())?;
        let mut components = rest.components();
        let base = match components.next() {
            Some(Component::Normal(base)) => base.to_str().ok_or_else(not_in_store)?,
            _ => return Err(not_in_store()),
        };
        Ok((
            StorePath::parse_base_name(base)?,
            components.as_path().to_path_buf(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "7rjj86a15146cq1d3qy068lml7n8ykzm";

    #[test]
    fn parses_valid_base_names() {
        let path = StorePath::parse_base_name(&format!("{HASH}-hello-2.12")).expect("parse");
        assert_eq!(path.hash_part(), HASH);
        assert_eq!(path.name(), "hello-2.12");
        assert!(!path.is_derivation());

        let drv = StorePath::parse_base_name(&format!("{HASH}-hello.drv")).expect("parse drv");
        assert!(drv.is_derivation());
    }

    #[test]
    fn rejects_malformed_base_names() {
        let cases = vec![
            "short".to_string(),
            format!("{HASH}hello"),
            format!("{}-hello", "E".repeat(HASH_LEN)),
            format!("{HASH}-.hidden"),
            format!("{HASH}-with space"),
            format!("{HASH}-"),
        ];
        for bad in &cases {
            assert!(
                StorePath::parse_base_name(bad).is_err(),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn digest_paths_are_stable_and_valid() {
        let a = StorePath::from_digest("pkg", b"contents").expect("digest");
        let b = StorePath::from_digest("pkg", b"contents").expect("digest");
        let c = StorePath::from_digest("pkg", b"other").expect("digest");
        assert_eq!(a, b);
        assert_ne!(a.hash_part(), c.hash_part());
        assert_eq!(a.hash_part().len(), HASH_LEN);
        StorePath::parse_base_name(a.base_name()).expect("round trips through the parser");
    }

    #[test]
    fn nix32_matches_known_vector() {
        assert_eq!(nix32_encode(&[0u8; 20]), "0".repeat(32));
        assert_eq!(nix32_encode(&[0xff]), "7z");
    }

    #[test]
    fn store_dir_resolves_nested_paths() {
        let dir = StoreDir::new("/sx/store");
        let base = format!("{HASH}-tool");
        let nested = PathBuf::from(format!("/sx/store/{base}/bin/tool"));
        let (path, rest) = dir.to_store_path(&nested).expect("nested path");
        assert_eq!(path.base_name(), base);
        assert_eq!(rest, PathBuf::from("bin/tool"));

        assert!(dir.is_in_store(&nested));
        assert!(!dir.is_in_store(Path::new("/sx/store")));
        assert!(!dir.is_in_store(Path::new("/sx/storefront/x")));
        assert!(dir.parse_store_path(&nested.display().to_string()).is_err());
        assert_eq!(
            dir.parse_store_path(&format!("/sx/store/{base}"))
                .expect("top-level"),
            path
        );
    }
}
