//! # mcphub-secrets
//!
//! File-backed authenticated-encryption store for upstream credentials.
//!
//! The master key lives at `<base>/master.key` with mode 0600. Each secret
//! is one JSON record under `<base>/secrets/`, encrypted with AES-256-GCM
//! and bound to its key name through the AAD. Plaintext records are only
//! allowed by explicit policy and still carry an HMAC so tampering is
//! detected on read. A `.gitignore` guarding the store is written
//! automatically.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Record type tag
const RECORD_TYPE: &str = "mcphub/secret";

/// Record format version
const RECORD_VERSION: u32 = 1;

/// Master key length (AES-256)
const MASTER_KEY_LEN: usize = 32;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, SecretError>;

/// Errors from the secrets store
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    /// Filesystem failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Key does not exist
    #[error("secret not found: {0}")]
    NotFound(String),

    /// Stored data failed its integrity check
    #[error("integrity-check-failed: {0}")]
    IntegrityCheckFailed(String),

    /// Cryptographic operation failed
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Record is malformed
    #[error("malformed record for '{key}': {reason}")]
    Malformed {
        /// Secret key name
        key: String,
        /// What was wrong
        reason: String,
    },

    /// Operation denied by store policy
    #[error("policy violation: {0}")]
    Policy(String),

    /// Invalid key name
    #[error("invalid secret key name: {0}")]
    InvalidKey(String),

    /// Serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<SecretError> for mcphub_core::HubError {
    fn from(err: SecretError) -> Self {
        match &err {
            SecretError::IntegrityCheckFailed(_) => {
                mcphub_core::HubError::integrity(err.to_string())
            }
            SecretError::NotFound(_) | SecretError::InvalidKey(_) => {
                mcphub_core::HubError::config(err.to_string())
            }
            SecretError::Policy(_) => mcphub_core::HubError::security_policy(err.to_string()),
            _ => mcphub_core::HubError::internal(err.to_string()),
        }
    }
}

/// Store policy
#[derive(Debug, Clone, Default)]
pub struct StorePolicy {
    /// Whether plaintext records may be written
    pub allow_plain: bool,
}

/// Export format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// One JSON object `{key: value}`
    Json,
    /// `KEY=value` lines
    Env,
}

/// On-disk record
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    #[serde(rename = "type")]
    record_type: String,
    version: u32,
    enc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    iv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ct: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    integrity: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    labels: Option<BTreeMap<String, String>>,
}

/// Metadata about one stored secret
#[derive(Debug, Clone, Serialize)]
pub struct SecretInfo {
    /// Key name
    pub key: String,
    /// Whether the record is encrypted
    pub encrypted: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
    /// Optional labels
    pub labels: Option<BTreeMap<String, String>>,
}

/// File-backed secrets store
pub struct SecretsStore {
    base_dir: PathBuf,
    policy: StorePolicy,
    master: RwLock<Zeroizing<Vec<u8>>>,
    rng: SystemRandom,
}

impl std::fmt::Debug for SecretsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsStore")
            .field("base_dir", &self.base_dir)
            .finish()
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > 128 {
        return Err(SecretError::InvalidKey(key.to_string()));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(SecretError::InvalidKey(key.to_string()));
    }
    // Path traversal is impossible with the charset above; dot-only names
    // are still rejected.
    if key.chars().all(|c| c == '.') {
        return Err(SecretError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[cfg(unix)]
fn restrict_mode(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_mode(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

impl SecretsStore {
    /// Open (or initialise) a store under `base_dir`
    pub fn open(base_dir: impl Into<PathBuf>, policy: StorePolicy) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(base_dir.join("secrets"))?;

        // Keep the store out of version control.
        let gitignore = base_dir.join(".gitignore");
        if !gitignore.exists() {
            std::fs::write(&gitignore, "master.key\nsecrets/\n")?;
        }

        let rng = SystemRandom::new();
        let key_path = base_dir.join("master.key");
        let master = if key_path.exists() {
            let encoded = std::fs::read_to_string(&key_path)?;
            let bytes = BASE64
                .decode(encoded.trim())
                .map_err(|e| SecretError::Crypto(format!("master key corrupt: {e}")))?;
            if bytes.len() != MASTER_KEY_LEN {
                return Err(SecretError::Crypto(format!(
                    "master key has wrong length: {}",
                    bytes.len()
                )));
            }
            Zeroizing::new(bytes)
        } else {
            let mut bytes = vec![0u8; MASTER_KEY_LEN];
            rng.fill(&mut bytes)
                .map_err(|_| SecretError::Crypto("random generation failed".to_string()))?;
            std::fs::write(&key_path, BASE64.encode(&bytes))?;
            restrict_mode(&key_path)?;
            info!(path = %key_path.display(), "generated new master key");
            Zeroizing::new(bytes)
        };

        Ok(Self {
            base_dir,
            policy,
            master: RwLock::new(master),
            rng,
        })
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.base_dir.join("secrets").join(format!("{key}.json"))
    }

    fn aead_key(master: &[u8]) -> Result<LessSafeKey> {
        let unbound = UnboundKey::new(&AES_256_GCM, master)
            .map_err(|_| SecretError::Crypto("invalid AEAD key".to_string()))?;
        Ok(LessSafeKey::new(unbound))
    }

    fn hmac_key(master: &[u8]) -> hmac::Key {
        hmac::Key::new(hmac::HMAC_SHA256, master)
    }

    fn encrypt_with(
        &self,
        master: &[u8],
        key: &str,
        value: &str,
        labels: Option<BTreeMap<String, String>>,
        created_at: DateTime<Utc>,
    ) -> Result<Record> {
        let aead = Self::aead_key(master)?;

        let mut iv = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut iv)
            .map_err(|_| SecretError::Crypto("nonce generation failed".to_string()))?;
        let nonce = Nonce::assume_unique_for_key(iv);

        let mut in_out = value.as_bytes().to_vec();
        let tag = aead
            .seal_in_place_separate_tag(nonce, Aad::from(key.as_bytes()), &mut in_out)
            .map_err(|_| SecretError::Crypto("encryption failed".to_string()))?;

        Ok(Record {
            record_type: RECORD_TYPE.to_string(),
            version: RECORD_VERSION,
            enc: "A256GCM".to_string(),
            iv: Some(BASE64.encode(iv)),
            tag: Some(BASE64.encode(tag.as_ref())),
            ct: Some(BASE64.encode(&in_out)),
            data: None,
            integrity: None,
            created_at,
            updated_at: Utc::now(),
            labels,
        })
    }

    fn decrypt_with(&self, master: &[u8], key: &str, record: &Record) -> Result<String> {
        let aead = Self::aead_key(master)?;

        let field = |value: &Option<String>, name: &str| -> Result<Vec<u8>> {
            let encoded = value.as_ref().ok_or_else(|| SecretError::Malformed {
                key: key.to_string(),
                reason: format!("missing field '{name}'"),
            })?;
            BASE64
                .decode(encoded)
                .map_err(|_| SecretError::IntegrityCheckFailed(key.to_string()))
        };

        let iv = field(&record.iv, "iv")?;
        let tag = field(&record.tag, "tag")?;
        let ct = field(&record.ct, "ct")?;

        let iv: [u8; NONCE_LEN] = iv
            .try_into()
            .map_err(|_| SecretError::IntegrityCheckFailed(key.to_string()))?;
        let nonce = Nonce::assume_unique_for_key(iv);

        let mut buffer = ct;
        buffer.extend_from_slice(&tag);
        let plaintext = aead
            .open_in_place(nonce, Aad::from(key.as_bytes()), &mut buffer)
            .map_err(|_| SecretError::IntegrityCheckFailed(key.to_string()))?;

        String::from_utf8(plaintext.to_vec())
            .map_err(|_| SecretError::IntegrityCheckFailed(key.to_string()))
    }

    fn read_record(&self, key: &str) -> Result<Record> {
        let path = self.record_path(key);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SecretError::NotFound(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let record: Record = serde_json::from_slice(&bytes)?;
        if record.record_type != RECORD_TYPE {
            return Err(SecretError::Malformed {
                key: key.to_string(),
                reason: format!("unexpected record type '{}'", record.record_type),
            });
        }
        Ok(record)
    }

    fn write_record(&self, key: &str, record: &Record) -> Result<()> {
        let path = self.record_path(key);
        std::fs::write(&path, serde_json::to_vec_pretty(record)?)?;
        restrict_mode(&path)?;
        Ok(())
    }

    /// Store a secret, encrypting it under the master key
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.set_labeled(key, value, None)
    }

    /// Store a secret with labels
    pub fn set_labeled(
        &self,
        key: &str,
        value: &str,
        labels: Option<BTreeMap<String, String>>,
    ) -> Result<()> {
        validate_key(key)?;
        let created_at = self
            .read_record(key)
            .map(|r| r.created_at)
            .unwrap_or_else(|_| Utc::now());

        let master = self.master.read();
        let record = self.encrypt_with(&master, key, value, labels, created_at)?;
        drop(master);

        self.write_record(key, &record)?;
        debug!(key, "secret stored");
        Ok(())
    }

    /// Store a plaintext record; only allowed by policy. The record still
    /// carries an HMAC over its data.
    pub fn set_plain(&self, key: &str, value: &str) -> Result<()> {
        if !self.policy.allow_plain {
            return Err(SecretError::Policy(
                "plaintext records are not allowed by store policy".to_string(),
            ));
        }
        validate_key(key)?;

        let mut data = BTreeMap::new();
        data.insert(key.to_string(), value.to_string());
        let payload = serde_json::to_vec(&data)?;

        let master = self.master.read();
        let mac = hmac::sign(&Self::hmac_key(&master), &payload);
        drop(master);

        let created_at = self
            .read_record(key)
            .map(|r| r.created_at)
            .unwrap_or_else(|_| Utc::now());
        let record = Record {
            record_type: RECORD_TYPE.to_string(),
            version: RECORD_VERSION,
            enc: "none".to_string(),
            iv: None,
            tag: None,
            ct: None,
            data: Some(data),
            integrity: Some(hex::encode(mac.as_ref())),
            created_at,
            updated_at: Utc::now(),
            labels: None,
        };
        self.write_record(key, &record)
    }

    /// Read a secret, verifying integrity.
    ///
    /// A failed check surfaces [`SecretError::IntegrityCheckFailed`] and the
    /// record stays unreadable.
    pub fn get(&self, key: &str) -> Result<String> {
        validate_key(key)?;
        let record = self.read_record(key)?;
        let master = self.master.read();

        match record.enc.as_str() {
            "A256GCM" => self.decrypt_with(&master, key, &record),
            "none" => {
                let data = record.data.as_ref().ok_or_else(|| SecretError::Malformed {
                    key: key.to_string(),
                    reason: "plain record without data".to_string(),
                })?;
                let payload = serde_json::to_vec(data)?;
                let mac = record
                    .integrity
                    .as_ref()
                    .and_then(|h| hex::decode(h).ok())
                    .ok_or_else(|| SecretError::IntegrityCheckFailed(key.to_string()))?;
                hmac::verify(&Self::hmac_key(&master), &payload, &mac)
                    .map_err(|_| SecretError::IntegrityCheckFailed(key.to_string()))?;
                data.get(key)
                    .cloned()
                    .ok_or_else(|| SecretError::IntegrityCheckFailed(key.to_string()))
            }
            other => Err(SecretError::Malformed {
                key: key.to_string(),
                reason: format!("unknown enc '{other}'"),
            }),
        }
    }

    /// List stored secrets with metadata
    pub fn list(&self) -> Result<Vec<SecretInfo>> {
        let dir = self.base_dir.join("secrets");
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(key) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            let Ok(record) = self.read_record(key) else {
                continue;
            };
            out.push(SecretInfo {
                key: key.to_string(),
                encrypted: record.enc != "none",
                created_at: record.created_at,
                updated_at: record.updated_at,
                labels: record.labels,
            });
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    /// Remove a secret, returning whether it existed
    pub fn remove(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        match std::fs::remove_file(self.record_path(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every secret
    pub fn clear(&self) -> Result<()> {
        for info in self.list()? {
            self.remove(&info.key)?;
        }
        Ok(())
    }

    /// Export every secret in the given format.
    ///
    /// The output contains decrypted values; callers own its handling.
    pub fn export(&self, format: ExportFormat) -> Result<String> {
        let mut pairs = BTreeMap::new();
        for info in self.list()? {
            pairs.insert(info.key.clone(), self.get(&info.key)?);
        }

        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&pairs)?),
            ExportFormat::Env => {
                let mut out = String::new();
                for (key, value) in pairs {
                    out.push_str(&format!("{}={}\n", key.to_uppercase().replace(['-', '.'], "_"), value));
                }
                Ok(out)
            }
        }
    }

    /// Import secrets from a JSON object `{key: value}`
    pub fn import(&self, json: &str) -> Result<usize> {
        let pairs: BTreeMap<String, String> = serde_json::from_str(json)?;
        let count = pairs.len();
        for (key, value) in pairs {
            self.set(&key, &value)?;
        }
        Ok(count)
    }

    /// Rotate the master key: generate a fresh key and re-encrypt every
    /// record under it.
    pub fn rotate(&self) -> Result<usize> {
        // Decrypt everything under the old key first so a failure leaves
        // the store untouched.
        let mut decrypted = Vec::new();
        for info in self.list()? {
            let value = self.get(&info.key)?;
            let record = self.read_record(&info.key)?;
            decrypted.push((info.key, value, record.created_at, record.labels));
        }

        let mut new_master = vec![0u8; MASTER_KEY_LEN];
        self.rng
            .fill(&mut new_master)
            .map_err(|_| SecretError::Crypto("random generation failed".to_string()))?;

        for (key, value, created_at, labels) in &decrypted {
            let record =
                self.encrypt_with(new_master.as_slice(), key, value, labels.clone(), *created_at)?;
            self.write_record(key, &record)?;
        }

        let key_path = self.base_dir.join("master.key");
        std::fs::write(&key_path, BASE64.encode(&new_master))?;
        restrict_mode(&key_path)?;
        *self.master.write() = Zeroizing::new(new_master);

        info!(records = decrypted.len(), "master key rotated");
        Ok(decrypted.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SecretsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretsStore::open(dir.path(), StorePolicy::default()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_set_get_roundtrip() {
        let (_dir, store) = store();
        store.set("api-token", "s3cret-value").unwrap();
        assert_eq!(store.get("api-token").unwrap(), "s3cret-value");
    }

    #[test]
    fn test_record_shape_on_disk() {
        let (dir, store) = store();
        store.set("api-token", "value").unwrap();

        let raw =
            std::fs::read_to_string(dir.path().join("secrets").join("api-token.json")).unwrap();
        let record: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(record["type"], "mcphub/secret");
        assert_eq!(record["version"], 1);
        assert_eq!(record["enc"], "A256GCM");
        assert!(record["iv"].is_string());
        assert!(record["tag"].is_string());
        assert!(record["ct"].is_string());
        assert!(record.get("data").is_none());
    }

    #[test]
    fn test_missing_key_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.get("absent"),
            Err(SecretError::NotFound(_))
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails_integrity() {
        let (dir, store) = store();
        store.set("token", "value").unwrap();

        let path = dir.path().join("secrets").join("token.json");
        let mut record: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        record["ct"] = serde_json::json!(BASE64.encode(b"tampered!"));
        std::fs::write(&path, record.to_string()).unwrap();

        assert!(matches!(
            store.get("token"),
            Err(SecretError::IntegrityCheckFailed(_))
        ));
    }

    #[test]
    fn test_plain_records_require_policy() {
        let (_dir, store) = store();
        assert!(matches!(
            store.set_plain("k", "v"),
            Err(SecretError::Policy(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        let permissive =
            SecretsStore::open(dir.path(), StorePolicy { allow_plain: true }).unwrap();
        permissive.set_plain("k", "v").unwrap();
        assert_eq!(permissive.get("k").unwrap(), "v");
    }

    #[test]
    fn test_plain_record_tamper_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretsStore::open(dir.path(), StorePolicy { allow_plain: true }).unwrap();
        store.set_plain("k", "v").unwrap();

        let path = dir.path().join("secrets").join("k.json");
        let mut record: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        record["data"]["k"] = serde_json::json!("changed");
        std::fs::write(&path, record.to_string()).unwrap();

        assert!(matches!(
            store.get("k"),
            Err(SecretError::IntegrityCheckFailed(_))
        ));
    }

    #[test]
    fn test_list_remove_clear() {
        let (_dir, store) = store();
        store.set("a", "1").unwrap();
        store.set("b", "2").unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].key, "a");
        assert!(listed[0].encrypted);

        assert!(store.remove("a").unwrap());
        assert!(!store.remove("a").unwrap());

        store.clear().unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_export_import() {
        let (_dir, store) = store();
        store.set("api-token", "one").unwrap();
        store.set("db.pass", "two").unwrap();

        let json = store.export(ExportFormat::Json).unwrap();
        assert!(json.contains("\"api-token\": \"one\""));

        let env = store.export(ExportFormat::Env).unwrap();
        assert!(env.contains("API_TOKEN=one"));
        assert!(env.contains("DB_PASS=two"));

        let dir = tempfile::tempdir().unwrap();
        let other = SecretsStore::open(dir.path(), StorePolicy::default()).unwrap();
        assert_eq!(other.import(&json).unwrap(), 2);
        assert_eq!(other.get("api-token").unwrap(), "one");
    }

    #[test]
    fn test_rotate_reencrypts_under_new_key() {
        let (dir, store) = store();
        store.set("token", "value").unwrap();

        let old_key = std::fs::read_to_string(dir.path().join("master.key")).unwrap();
        let old_ct = std::fs::read_to_string(dir.path().join("secrets").join("token.json")).unwrap();

        assert_eq!(store.rotate().unwrap(), 1);

        let new_key = std::fs::read_to_string(dir.path().join("master.key")).unwrap();
        let new_ct = std::fs::read_to_string(dir.path().join("secrets").join("token.json")).unwrap();
        assert_ne!(old_key, new_key);
        assert_ne!(old_ct, new_ct);

        // Still readable, and readable by a fresh handle on the same dir.
        assert_eq!(store.get("token").unwrap(), "value");
        let reopened = SecretsStore::open(dir.path(), StorePolicy::default()).unwrap();
        assert_eq!(reopened.get("token").unwrap(), "value");
    }

    #[test]
    fn test_key_name_validation() {
        let (_dir, store) = store();
        assert!(store.set("../escape", "v").is_err());
        assert!(store.set("", "v").is_err());
        assert!(store.set("ok-key.name_1", "v").is_ok());
    }

    #[test]
    fn test_gitignore_written() {
        let (dir, _store) = store();
        let gitignore = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert!(gitignore.contains("master.key"));
        assert!(gitignore.contains("secrets/"));
    }

    #[cfg(unix)]
    #[test]
    fn test_master_key_mode() {
        use std::os::unix::fs::PermissionsExt;
        let (dir, _store) = store();
        let mode = std::fs::metadata(dir.path().join("master.key"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
