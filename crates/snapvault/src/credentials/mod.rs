//! Repository passphrase resolution.
//!
//! Order: explicit override, then `SNAPVAULT_PASSPHRASE`, then the secret
//! store. Nothing is cached; each call walks the chain again.

use std::path::Path;

use tracing::{debug, warn};

use crate::error::{Error, Result};

mod file;
mod keychain;

pub use file::FileStore;
pub use keychain::{KeychainStore, KeychainTool};
pub(crate) use keychain::find_in_path;

pub const PASSPHRASE_ENV: &str = "SNAPVAULT_PASSPHRASE";

/// Minimal contract over wherever the passphrase is persisted.
pub trait SecretBackend {
    fn name(&self) -> &'static str;
    fn is_available(&self) -> bool;
    fn get(&self) -> Option<String>;
    fn set(&self, secret: &str) -> Result<()>;
    /// Returns whether anything was removed.
    fn delete(&self) -> Result<bool>;
}

#[derive(Debug, Clone)]
pub enum SecretStore {
    Keychain(KeychainStore),
    File(FileStore),
}

impl SecretStore {
    /// Prefer the OS keychain; fall back to a mode-0600 file next to the config.
    pub fn detect(config_dir: &Path) -> Self {
        let keychain = KeychainStore::default();
        if keychain.is_available() {
            return Self::Keychain(keychain);
        }
        debug!(dir = %config_dir.display(), "no keychain tool found; using file secret store");
        Self::File(FileStore::in_dir(config_dir))
    }

    fn backend(&self) -> &dyn SecretBackend {
        match self {
            Self::Keychain(k) => k,
            Self::File(f) => f,
        }
    }
}

impl SecretBackend for SecretStore {
    fn name(&self) -> &'static str {
        self.backend().name()
    }

    fn is_available(&self) -> bool {
        self.backend().is_available()
    }

    fn get(&self) -> Option<String> {
        self.backend().get()
    }

    fn set(&self, secret: &str) -> Result<()> {
        self.backend().set(secret)
    }

    fn delete(&self) -> Result<bool> {
        self.backend().delete()
    }
}

pub struct CredentialResolver<'a> {
    env_key: &'a str,
    store: &'a dyn SecretBackend,
}

impl<'a> CredentialResolver<'a> {
    pub fn new(store: &'a dyn SecretBackend) -> Self {
        Self {
            env_key: PASSPHRASE_ENV,
            store,
        }
    }

    /// Read a different environment variable in place of `SNAPVAULT_PASSPHRASE`.
    pub fn with_env_key(store: &'a dyn SecretBackend, env_key: &'a str) -> Self {
        Self { env_key, store }
    }

    pub fn resolve(&self, explicit: Option<&str>) -> Result<String> {
        if let Some(p) = non_blank(explicit) {
            debug!("passphrase from command line");
            return Ok(p);
        }
        if let Some(p) = non_blank(std::env::var(self.env_key).ok().as_deref()) {
            debug!(var = self.env_key, "passphrase from environment");
            return Ok(p);
        }
        if self.store.is_available() {
            if let Some(p) = non_blank(self.store.get().as_deref()) {
                debug!(store = self.store.name(), "passphrase from secret store");
                return Ok(p);
            }
        } else {
            warn!(store = self.store.name(), "secret store unavailable; skipping");
        }
        Err(Error::MissingCredential(format!(
            "no repository passphrase found; pass --passphrase, set {}, \
             or run `snapvault passphrase set`",
            self.env_key
        )))
    }
}

// Blank values count as absent; otherwise the secret is passed through untouched.
fn non_blank(v: Option<&str>) -> Option<String> {
    v.filter(|s| !s.trim().is_empty()).map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    struct MemStore {
        available: bool,
        value: RefCell<Option<String>>,
        gets: Cell<usize>,
    }

    impl MemStore {
        fn new(available: bool, value: Option<&str>) -> Self {
            Self {
                available,
                value: RefCell::new(value.map(ToOwned::to_owned)),
                gets: Cell::new(0),
            }
        }
    }

    impl SecretBackend for MemStore {
        fn name(&self) -> &'static str {
            "memory"
        }
        fn is_available(&self) -> bool {
            self.available
        }
        fn get(&self) -> Option<String> {
            self.gets.set(self.gets.get() + 1);
            self.value.borrow().clone()
        }
        fn set(&self, secret: &str) -> Result<()> {
            *self.value.borrow_mut() = Some(secret.to_string());
            Ok(())
        }
        fn delete(&self) -> Result<bool> {
            Ok(self.value.borrow_mut().take().is_some())
        }
    }

    #[test]
    fn explicit_override_wins() {
        unsafe {
            std::env::set_var("SNAPVAULT_TEST_CRED_EXPLICIT", "from-env");
        }
        let store = MemStore::new(true, Some("from-store"));
        let r = CredentialResolver::with_env_key(&store, "SNAPVAULT_TEST_CRED_EXPLICIT");
        assert_eq!(r.resolve(Some("from-flag")).unwrap(), "from-flag");
        assert_eq!(store.gets.get(), 0);
    }

    #[test]
    fn env_beats_store() {
        unsafe {
            std::env::set_var("SNAPVAULT_TEST_CRED_ENV", "from-env");
        }
        let store = MemStore::new(true, Some("from-store"));
        let r = CredentialResolver::with_env_key(&store, "SNAPVAULT_TEST_CRED_ENV");
        assert_eq!(r.resolve(None).unwrap(), "from-env");
        assert_eq!(r.resolve(Some("   ")).unwrap(), "from-env");
    }

    #[test]
    fn store_is_queried_once_when_env_blank() {
        unsafe {
            std::env::set_var("SNAPVAULT_TEST_CRED_BLANK", "  ");
        }
        let store = MemStore::new(true, Some("from-store"));
        let r = CredentialResolver::with_env_key(&store, "SNAPVAULT_TEST_CRED_BLANK");
        assert_eq!(r.resolve(None).unwrap(), "from-store");
        assert_eq!(store.gets.get(), 1);
    }

    #[test]
    fn unavailable_store_is_skipped() {
        let store = MemStore::new(false, Some("never-read"));
        let r = CredentialResolver::with_env_key(&store, "SNAPVAULT_TEST_CRED_UNSET_1");
        let err = r.resolve(None).unwrap_err();
        assert!(matches!(err, Error::MissingCredential(_)));
        assert_eq!(store.gets.get(), 0);
    }

    #[test]
    fn missing_credential_names_every_remedy() {
        let store = MemStore::new(true, None);
        let r = CredentialResolver::with_env_key(&store, "SNAPVAULT_TEST_CRED_UNSET_2");
        let msg = r.resolve(None).unwrap_err().to_string();
        assert!(msg.contains("--passphrase"), "{msg}");
        assert!(msg.contains("SNAPVAULT_TEST_CRED_UNSET_2"), "{msg}");
        assert!(msg.contains("snapvault passphrase set"), "{msg}");
    }

    #[test]
    fn resolver_does_not_cache() {
        let store = MemStore::new(true, Some("first"));
        let r = CredentialResolver::with_env_key(&store, "SNAPVAULT_TEST_CRED_UNSET_3");
        assert_eq!(r.resolve(None).unwrap(), "first");
        store.set("second").unwrap();
        assert_eq!(r.resolve(None).unwrap(), "second");
        assert!(store.delete().unwrap());
        assert!(r.resolve(None).is_err());
    }
}
