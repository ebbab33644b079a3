//! In-memory user registry and the identity permission checks are evaluated against.

use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use rand_core::OsRng;

use crate::error::{FsError, FsResult};

/// Hashes a clear-text password, generating a fresh salt.
pub fn hash_password(pass: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(pass.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Tells whether `pass` corresponds to the Argon2 hash `hash`.
pub fn check_password(hash: &str, pass: &str) -> bool {
    let Ok(parsed_hash) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default().verify_password(pass.as_bytes(), &parsed_hash).is_ok()
}

/// The resolved caller used for permission checks and file ownership. Not persisted: it is
/// derived fresh from a successful login.
#[derive(Clone)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub username: String,
}

/// One registered account.
pub struct UserRecord {
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    password_hash: String,
}

/// The set of accounts a session can log into. Lives only for the lifetime of the `Session` that
/// owns it; there is no on-disk passwd file.
pub struct UserRegistry {
    users: Vec<UserRecord>,
}

impl UserRegistry {
    /// Builds a registry seeded with a single `root` account (uid 0, gid 0).
    pub fn new(root_password: &str) -> Self {
        let password_hash = hash_password(root_password).expect("argon2 hashing failed");
        Self {
            users: vec![UserRecord { username: "root".into(), uid: 0, gid: 0, password_hash }],
        }
    }

    /// Registers an additional account. Returns `FsError::Exists` if the username is taken.
    pub fn add(&mut self, username: &str, uid: u32, gid: u32, password: &str) -> FsResult<()> {
        if self.users.iter().any(|u| u.username == username) {
            return Err(FsError::Exists);
        }
        let password_hash = hash_password(password).map_err(|_| FsError::BadCredentials)?;
        self.users.push(UserRecord { username: username.into(), uid, gid, password_hash });
        Ok(())
    }

    /// Verifies credentials and, on success, returns the resolved identity. Unknown username and
    /// wrong password are reported identically to avoid a username-enumeration oracle.
    pub fn authenticate(&self, username: &str, password: &str) -> FsResult<Identity> {
        let record = self.users.iter().find(|u| u.username == username).ok_or(FsError::BadCredentials)?;
        if !check_password(&record.password_hash, password) {
            return Err(FsError::BadCredentials);
        }
        Ok(Identity { uid: record.uid, gid: record.gid, username: record.username.clone() })
    }

    /// All registered accounts, in registration order.
    pub fn list(&self) -> &[UserRecord] {
        &self.users
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn correct_password_authenticates() {
        let registry = UserRegistry::new("hunter2");
        let identity = registry.authenticate("root", "hunter2").unwrap();
        assert_eq!(identity.uid, 0);
    }

    #[test]
    fn wrong_password_rejected() {
        let registry = UserRegistry::new("hunter2");
        assert!(matches!(
            registry.authenticate("root", "wrong"),
            Err(FsError::BadCredentials)
        ));
    }

    #[test]
    fn unknown_user_rejected_identically() {
        let registry = UserRegistry::new("hunter2");
        assert!(matches!(
            registry.authenticate("nobody", "hunter2"),
            Err(FsError::BadCredentials)
        ));
    }

    #[test]
    fn duplicate_username_rejected() {
        let mut registry = UserRegistry::new("hunter2");
        registry.add("alice", 1, 1, "pw").unwrap();
        assert!(matches!(
            registry.add("alice", 2, 2, "pw2"),
            Err(FsError::Exists)
        ));
    }
}
