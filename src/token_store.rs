//! Payment token persistence boundary (C11). The secret-at-rest blob
//! format is external to the core per spec; this module is just the
//! get/put interface the supervisor calls, plus a plain-file
//! implementation suitable for the reference binary (mode 0600).

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

pub trait TokenStore: Send + Sync {
    fn save(&self, token: &str) -> Result<(), io::Error>;
    fn load(&self) -> Option<String>;
}

/// Stores the token as plain UTF-8 at a fixed path, mode 0600. Real
/// deployments should supply an encrypted-at-rest implementation instead;
/// the supervisor only depends on the `TokenStore` trait.
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl TokenStore for FileTokenStore {
    fn save(&self, token: &str) -> Result<(), io::Error> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, token)?;
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
    }

    fn load(&self) -> Option<String> {
        std::fs::read_to_string(&self.path).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_utf8() {
        let dir = tempfile_dir();
        let store = FileTokenStore::new(dir.join("token.store"));
        store.save("hello-token-🔒").unwrap();
        assert_eq!(store.load().as_deref(), Some("hello-token-🔒"));
    }

    #[test]
    fn load_before_save_returns_none() {
        let dir = tempfile_dir();
        let store = FileTokenStore::new(dir.join("missing.store"));
        assert_eq!(store.load(), None);
    }

    fn tempfile_dir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("dvpn-token-store-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
