//! Resource-path manifest (C11).
//!
//! Maps the 64-bit path hash carried by `CStrongHandle<...>` fields back to
//! the asset path string, as rebuilt from compressed manifest messages in
//! the stream. This crate treats the manifest message's own decoding as an
//! external protobuf collaborator's job; here we only own the resulting
//! lookup table.

use hashbrown::HashMap;

#[derive(Debug, Default)]
pub struct ResourceManifest {
    paths: HashMap<u64, String>,
}

impl ResourceManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, hash: u64, path: String) {
        self.paths.insert(hash, path);
    }

    pub fn lookup(&self, hash: u64) -> Option<String> {
        self.paths.get(&hash).cloned()
    }

    pub fn clear(&mut self) {
        self.paths.clear();
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_path() {
        let mut m = ResourceManifest::new();
        m.insert(42, "particles/foo.vpcf".to_string());
        assert_eq!(m.lookup(42).as_deref(), Some("particles/foo.vpcf"));
        assert_eq!(m.lookup(7), None);
    }
}
