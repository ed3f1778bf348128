use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition, TableError};
use zeroize::Zeroizing;

use super::index::IndexType;
use super::keymanager::KeyManager;
use super::StorageError;

/// File name used when the configured persist path is a directory
pub const DATABASE_FILE_NAME: &str = "vault-agent-cache.db";

pub const STORAGE_VERSION: &str = "1";

const VERSION_KEY: &str = "version";
const AUTO_AUTH_TOKEN_KEY: &str = "auto-auth-token";
const RETRIEVAL_TOKEN_KEY: &str = "retrieval-token-material";

/// meta: version, retrieval-token-material, auto-auth-token
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const TOKEN: TableDefinition<&str, &[u8]> = TableDefinition::new("token");
const AUTH_LEASE: TableDefinition<&str, &[u8]> = TableDefinition::new("auth-lease");
const SECRET_LEASE: TableDefinition<&str, &[u8]> = TableDefinition::new("secret-lease");

fn table(ty: IndexType) -> TableDefinition<'static, &'static str, &'static [u8]> {
    match ty {
        IndexType::Token => TOKEN,
        IndexType::AuthLease => AUTH_LEASE,
        IndexType::SecretLease => SECRET_LEASE,
    }
}

/// Resolve the database file for a configured persist path
pub fn database_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(DATABASE_FILE_NAME)
    } else {
        path.to_path_buf()
    }
}

/// Encrypted persistent cache of the auto-auth token and lease indexes.
pub struct BoltStorage {
    db: Database,
    path: PathBuf,
    key_manager: Arc<KeyManager>,
}

impl BoltStorage {
    /// Open or create the database file and bootstrap the schema
    pub fn open(path: &Path, key_manager: Arc<KeyManager>) -> Result<Self, StorageError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let mut meta = write_txn.open_table(META)?;
            let existing = meta
                .get(VERSION_KEY)?
                .map(|v| String::from_utf8_lossy(v.value()).into_owned());
            match existing {
                Some(ref v) if v != STORAGE_VERSION => {
                    return Err(StorageError::UnsupportedVersion(v.clone()));
                }
                Some(_) => {}
                None => {
                    meta.insert(VERSION_KEY, STORAGE_VERSION.as_bytes())?;
                }
            }
            for ty in IndexType::ALL {
                let _ = write_txn.open_table(table(ty))?;
            }
        }
        write_txn.commit()?;

        tracing::debug!(path = %path.display(), "opened persistent cache");
        Ok(Self {
            db,
            path: path.to_path_buf(),
            key_manager,
        })
    }

    /// Read the retrieval material of an existing file without a key
    pub fn read_retrieval_token(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
        let db = Database::open(path)?;
        let read_txn = db.begin_read()?;
        let meta = match read_txn.open_table(META) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let material = meta.get(RETRIEVAL_TOKEN_KEY)?.map(|v| v.value().to_vec());
        Ok(material)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key_manager(&self) -> &Arc<KeyManager> {
        &self.key_manager
    }

    pub fn store_retrieval_token(&self, material: &[u8]) -> Result<(), StorageError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut meta = write_txn.open_table(META)?;
            meta.insert(RETRIEVAL_TOKEN_KEY, material)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_retrieval_token(&self) -> Result<Option<Vec<u8>>, StorageError> {
        let read_txn = self.db.begin_read()?;
        let meta = read_txn.open_table(META)?;
        let material = meta.get(RETRIEVAL_TOKEN_KEY)?.map(|v| v.value().to_vec());
        Ok(material)
    }

    /// Encrypt and store `plaintext` under `id`. A token record also becomes
    /// the auto-auth token, in the same transaction.
    pub fn set(&self, id: &str, plaintext: &[u8], ty: IndexType) -> Result<(), StorageError> {
        let blob = self.key_manager.encrypt(plaintext, ty.bucket().as_bytes())?;

        let write_txn = self.db.begin_write()?;
        {
            let mut bucket = write_txn.open_table(table(ty))?;
            bucket.insert(id, blob.as_slice())?;

            if ty == IndexType::Token {
                let mut meta = write_txn.open_table(META)?;
                meta.insert(AUTO_AUTH_TOKEN_KEY, blob.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Remove `id` from every data bucket; missing keys are not an error
    pub fn delete(&self, id: &str) -> Result<(), StorageError> {
        let write_txn = self.db.begin_write()?;
        {
            for ty in IndexType::ALL {
                let mut bucket = write_txn.open_table(table(ty))?;
                bucket.remove(id)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Decrypt every record of a bucket. Records that fail to decrypt are
    /// reported in the second list and do not stop the enumeration.
    pub fn get_by_type(
        &self,
        ty: IndexType,
    ) -> Result<(Vec<Zeroizing<Vec<u8>>>, Vec<StorageError>), StorageError> {
        let read_txn = self.db.begin_read()?;
        let bucket = read_txn.open_table(table(ty))?;
        let aad = ty.bucket().as_bytes();

        let mut items = Vec::new();
        let mut errors: Vec<StorageError> = Vec::new();
        for entry in bucket.iter()? {
            let (key, value) = match entry {
                Ok(kv) => kv,
                Err(e) => {
                    errors.push(e.into());
                    continue;
                }
            };
            match self.key_manager.decrypt(value.value(), aad) {
                Ok(plaintext) => items.push(plaintext),
                Err(e) => errors.push(StorageError::Decrypt {
                    id: key.value().to_string(),
                    source: e,
                }),
            }
        }
        Ok((items, errors))
    }

    pub fn get_auto_auth_token(&self) -> Result<Option<Zeroizing<Vec<u8>>>, StorageError> {
        let read_txn = self.db.begin_read()?;
        let meta = read_txn.open_table(META)?;
        let Some(blob) = meta.get(AUTO_AUTH_TOKEN_KEY)? else {
            return Ok(None);
        };
        let plaintext = self
            .key_manager
            .decrypt(blob.value(), IndexType::Token.bucket().as_bytes())
            .map_err(|e| StorageError::Decrypt {
                id: AUTO_AUTH_TOKEN_KEY.to_string(),
                source: e,
            })?;
        Ok(Some(plaintext))
    }

    /// Drop every data bucket and recreate the schema
    pub fn clear(&self) -> Result<(), StorageError> {
        let write_txn = self.db.begin_write()?;
        {
            for ty in IndexType::ALL {
                write_txn.delete_table(table(ty))?;
                let _ = write_txn.open_table(table(ty))?;
            }
            let mut meta = write_txn.open_table(META)?;
            meta.remove(AUTO_AUTH_TOKEN_KEY)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}
