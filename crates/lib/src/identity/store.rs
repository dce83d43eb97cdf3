//! JSON-file backed user store.
//!
//! Every call re-reads the file so that the CLI and a running gateway can share it.
//! Mutations hold an exclusive `fs2` lock on a sidecar `.lock` file for the whole
//! read-modify-write and replace the store with an atomic rename. All file I/O and
//! password hashing runs on the blocking pool.

use super::{validate_password, validate_username, IdentityError, TokenError, TokenSigner};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One user account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub user_id: String,
    pub username: String,
    pub password_hash: String,
    /// Platform name -> external id (at most one per platform).
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    users: Vec<UserRecord>,
}

/// Handle to the user store file. Cheap to clone.
#[derive(Clone)]
pub struct IdentityStore {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    params: Option<argon2::Params>,
    /// Hash checked when the username is unknown, so both failure paths cost one verify.
    dummy_hash: String,
    signer: Option<TokenSigner>,
}

impl IdentityStore {
    /// Open (or lazily create) the store at `path` with default Argon2id parameters.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, IdentityError> {
        Self::open_with_params(path, None).await
    }

    /// Open with explicit Argon2 cost parameters (lower costs are useful in tests).
    pub async fn open_with_params(
        path: impl Into<PathBuf>,
        params: Option<argon2::Params>,
    ) -> Result<Self, IdentityError> {
        let path = path.into();
        let hash_params = params.clone();
        let dummy_hash = blocking(move || {
            let salt = SaltString::generate(&mut OsRng);
            hash_password(&hash_params, "caduceus-dummy-password", &salt)
        })
        .await?;
        Ok(Self {
            inner: Arc::new(Inner {
                path,
                params,
                dummy_hash,
                signer: None,
            }),
        })
    }

    /// Attach a token signer; without one, token calls fail with `SecretMissing`.
    pub fn with_signer(self, signer: TokenSigner) -> Self {
        let inner = Inner {
            path: self.inner.path.clone(),
            params: self.inner.params.clone(),
            dummy_hash: self.inner.dummy_hash.clone(),
            signer: Some(signer),
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Lifetime of issued tokens, when a signer is attached.
    pub fn token_ttl(&self) -> Option<chrono::Duration> {
        self.inner.signer.as_ref().map(|s| s.ttl())
    }

    /// Create a user and return its new random id.
    pub async fn create_user(&self, username: &str, password: &str) -> Result<String, IdentityError> {
        validate_username(username)?;
        validate_password(password)?;
        let path = self.inner.path.clone();
        let params = self.inner.params.clone();
        let username = username.to_string();
        let password = password.to_string();
        blocking(move || {
            let salt = SaltString::generate(&mut OsRng);
            let password_hash = hash_password(&params, &password, &salt)?;
            update(&path, |file| {
                if file.users.iter().any(|u| u.username == username) {
                    return Err(IdentityError::Conflict(format!("username '{}' is taken", username)));
                }
                let user_id = uuid::Uuid::new_v4().to_string();
                file.users.push(UserRecord {
                    user_id: user_id.clone(),
                    username: username.clone(),
                    password_hash,
                    external_ids: BTreeMap::new(),
                    created_at: Utc::now(),
                });
                Ok((true, user_id))
            })
        })
        .await
    }

    /// Check a username and password. Unknown users and wrong passwords both give `Auth`.
    pub async fn verify_credentials(&self, username: &str, password: &str) -> Result<String, IdentityError> {
        let path = self.inner.path.clone();
        let dummy = self.inner.dummy_hash.clone();
        let username = username.to_string();
        let password = password.to_string();
        blocking(move || {
            let file = read_store(&path)?;
            let user = file.users.iter().find(|u| u.username == username);
            let hash = user.map(|u| u.password_hash.as_str()).unwrap_or(dummy.as_str());
            let ok = verify_password(hash, &password);
            match user {
                Some(u) if ok => Ok(u.user_id.clone()),
                _ => Err(IdentityError::Auth),
            }
        })
        .await
    }

    /// Link `external_id` on `platform` to the user. Re-linking the same id is a no-op;
    /// a different id replaces the previous one for that platform.
    pub async fn link_external_identity(
        &self,
        user_id: &str,
        platform: &str,
        external_id: &str,
    ) -> Result<(), IdentityError> {
        let platform = platform.trim().to_string();
        let external_id = external_id.trim().to_string();
        if platform.is_empty() || external_id.is_empty() {
            return Err(IdentityError::Validation(
                "platform and external id must not be empty".to_string(),
            ));
        }
        let path = self.inner.path.clone();
        let user_id = user_id.to_string();
        blocking(move || {
            update(&path, |file| {
                if let Some(owner) = file.users.iter().find(|u| {
                    u.user_id != user_id && u.external_ids.get(&platform) == Some(&external_id)
                }) {
                    return Err(IdentityError::Conflict(format!(
                        "{} id {} is linked to another user ({})",
                        platform, external_id, owner.username
                    )));
                }
                let user = file
                    .users
                    .iter_mut()
                    .find(|u| u.user_id == user_id)
                    .ok_or_else(|| IdentityError::NotFound(user_id.clone()))?;
                if user.external_ids.get(&platform) == Some(&external_id) {
                    return Ok((false, ()));
                }
                user.external_ids.insert(platform.clone(), external_id.clone());
                Ok((true, ()))
            })
        })
        .await
    }

    /// User id linked to `external_id` on `platform`, if any.
    pub async fn resolve_external(&self, platform: &str, external_id: &str) -> Result<Option<String>, IdentityError> {
        let platform = platform.to_string();
        let external_id = external_id.to_string();
        self.read_with(move |file| {
            file.users
                .iter()
                .find(|u| u.external_ids.get(&platform) == Some(&external_id))
                .map(|u| u.user_id.clone())
        })
        .await
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, IdentityError> {
        let user_id = user_id.to_string();
        self.read_with(move |file| file.users.iter().find(|u| u.user_id == user_id).cloned())
            .await
    }

    pub async fn get_by_username(&self, username: &str) -> Result<Option<UserRecord>, IdentityError> {
        let username = username.to_string();
        self.read_with(move |file| file.users.iter().find(|u| u.username == username).cloned())
            .await
    }

    /// All users, ordered by creation time.
    pub async fn list_users(&self) -> Result<Vec<UserRecord>, IdentityError> {
        self.read_with(|file| {
            let mut users = file.users.clone();
            users.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            users
        })
        .await
    }

    /// Remove a user and its links. Returns false when no such user existed.
    pub async fn remove_user(&self, user_id: &str) -> Result<bool, IdentityError> {
        let path = self.inner.path.clone();
        let user_id = user_id.to_string();
        blocking(move || {
            update(&path, |file| {
                let before = file.users.len();
                file.users.retain(|u| u.user_id != user_id);
                let removed = file.users.len() != before;
                Ok((removed, removed))
            })
        })
        .await
    }

    /// Issue a token for an existing user.
    pub async fn issue_token(&self, user_id: &str) -> Result<String, IdentityError> {
        let signer = self.inner.signer.as_ref().ok_or(TokenError::SecretMissing)?;
        let user = self
            .get_user(user_id)
            .await?
            .ok_or_else(|| IdentityError::NotFound(user_id.to_string()))?;
        Ok(signer.issue(&user.user_id, &user.username)?)
    }

    /// Verify a token and return its user id. Tokens for removed users are rejected.
    pub async fn verify_token(&self, token: &str) -> Result<String, TokenError> {
        let signer = self.inner.signer.as_ref().ok_or(TokenError::SecretMissing)?;
        let claims = signer.verify(token)?;
        match self.get_user(&claims.sub).await {
            Ok(Some(user)) => Ok(user.user_id),
            Ok(None) => Err(TokenError::UnknownSubject),
            Err(e) => {
                log::warn!("identity store unreadable during token check: {}", e);
                Err(TokenError::UnknownSubject)
            }
        }
    }

    async fn read_with<T, F>(&self, f: F) -> Result<T, IdentityError>
    where
        T: Send + 'static,
        F: FnOnce(&StoreFile) -> T + Send + 'static,
    {
        let path = self.inner.path.clone();
        blocking(move || read_store(&path).map(|file| f(&file))).await
    }
}

async fn blocking<T, F>(f: F) -> Result<T, IdentityError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, IdentityError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| IdentityError::Storage(format!("blocking task failed: {}", e)))?
}

fn hasher(params: &Option<argon2::Params>) -> Argon2<'static> {
    match params {
        Some(p) => Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, p.clone()),
        None => Argon2::default(),
    }
}

fn hash_password(params: &Option<argon2::Params>, password: &str, salt: &SaltString) -> Result<String, IdentityError> {
    hasher(params)
        .hash_password(password.as_bytes(), salt)
        .map(|h| h.to_string())
        .map_err(|e| IdentityError::Storage(format!("password hashing failed: {}", e)))
}

fn verify_password(hash: &str, password: &str) -> bool {
    // Parameters come from the PHC string, so the default instance verifies any cost.
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

fn storage_err(context: &str, path: &Path, e: impl std::fmt::Display) -> IdentityError {
    IdentityError::Storage(format!("{} {}: {}", context, path.display(), e))
}

fn read_store(path: &Path) -> Result<StoreFile, IdentityError> {
    match std::fs::read_to_string(path) {
        Ok(s) if s.trim().is_empty() => Ok(StoreFile::default()),
        Ok(s) => serde_json::from_str(&s).map_err(|e| storage_err("parsing", path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreFile::default()),
        Err(e) => Err(storage_err("reading", path, e)),
    }
}

fn write_store(path: &Path, file: &StoreFile) -> Result<(), IdentityError> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| storage_err("creating", parent, e))?;
    let json = serde_json::to_string_pretty(file).map_err(|e| storage_err("encoding", path, e))?;
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("users.json");
    let tmp = parent.join(format!(".{}.tmp-{}", name, uuid::Uuid::new_v4()));
    let result = (|| {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(json.as_bytes())?;
        f.sync_all()?;
        std::fs::rename(&tmp, path)
    })();
    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(storage_err("writing", path, e));
    }
    Ok(())
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// Locked read-modify-write. `f` returns `(changed, value)`; the file is only rewritten when changed.
fn update<T>(path: &Path, f: impl FnOnce(&mut StoreFile) -> Result<(bool, T), IdentityError>) -> Result<T, IdentityError> {
    let lock = lock_path(path);
    if let Some(parent) = lock.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| storage_err("creating", parent, e))?;
    }
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&lock)
        .map_err(|e| storage_err("opening", &lock, e))?;
    lock_file.lock_exclusive().map_err(|e| storage_err("locking", &lock, e))?;
    let result = (|| {
        let mut file = read_store(path)?;
        let (changed, value) = f(&mut file)?;
        if changed {
            write_store(path, &file)?;
        }
        Ok(value)
    })();
    let _ = lock_file.unlock();
    result
}
