use std::io::Write;
use hmac::{NewMac, Mac};
use crate::crypto::{Sealer, hash_hex};
use crate::{Error, Result};

type HmacSha512 = hmac::Hmac<sha2::Sha512>;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StoredObject {
    pub bucket: String,
    pub path: String,
    pub content_hash: String,
    pub size: i64,
}

pub struct Retrieved {
    pub data: Vec<u8>,
    pub content_hash: String,
}

/// Encrypted, write-once object store rooted at `{root}/{bucket}`.
pub struct ContentStore {
    root: std::path::PathBuf,
    bucket: String,
    sealer: std::sync::Arc<Sealer>,
    link_key: Vec<u8>,
}

impl ContentStore {
    pub fn new<P: Into<std::path::PathBuf>>(
        root: P, bucket: &str, sealer: std::sync::Arc<Sealer>, link_key: &[u8],
    ) -> Result<Self> {
        if bucket.is_empty() || bucket.contains(|c| c == '/' || c == '\\') || bucket == ".." {
            return Err(Error::validation("files.bucket", "bucket must be a single path segment"));
        }
        let root = root.into();
        std::fs::create_dir_all(root.join(bucket))?;
        Ok(ContentStore {
            root,
            bucket: bucket.to_string(),
            sealer,
            link_key: link_key.to_vec(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn resolve(&self, path: &str) -> Result<std::path::PathBuf> {
        let rel = std::path::Path::new(path);
        if path.is_empty() || !rel.components().all(|c| matches!(c, std::path::Component::Normal(_))) {
            return Err(Error::validation("path", format!("'{}' is not a relative object path", path)));
        }
        Ok(self.root.join(&self.bucket).join(rel))
    }

    /// Hashes the plaintext, seals it and writes it under `path`. Objects are
    /// never overwritten.
    pub fn put(&self, payload: &[u8], path: &str) -> Result<StoredObject> {
        let target = self.resolve(path)?;
        let content_hash = hash_hex(payload);
        let sealed = self.sealer.seal(payload)?;

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = match std::fs::OpenOptions::new().write(true).create_new(true).open(&target) {
            Ok(f) => f,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::Conflict(format!("object {} already exists", path)));
            }
            Err(err) => return Err(err.into()),
        };
        if let Err(err) = file.write_all(&sealed).and_then(|_| file.sync_all()) {
            drop(file);
            let _ = std::fs::remove_file(&target);
            return Err(err.into());
        }
        debug!("Stored {} ({} bytes, sha256 {})", path, payload.len(), content_hash);

        Ok(StoredObject {
            bucket: self.bucket.clone(),
            path: path.to_string(),
            content_hash,
            size: payload.len() as i64,
        })
    }

    pub fn get(&self, path: &str) -> Result<Retrieved> {
        let sealed = match std::fs::read(self.resolve(path)?) {
            Ok(b) => b,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Err(Error::NotFound),
            Err(err) => return Err(err.into()),
        };
        let data = match self.sealer.open(&sealed) {
            Ok(d) => d,
            Err(err) => {
                error!("Integrity failure reading {}: {}", path, err.detail());
                return Err(err);
            }
        };

        Ok(Retrieved {
            content_hash: hash_hex(&data),
            data,
        })
    }

    pub fn get_verified(&self, path: &str, expected_hash: &str) -> Result<Vec<u8>> {
        let retrieved = self.get(path)?;
        if retrieved.content_hash != expected_hash {
            error!("Integrity failure reading {}: expected {}, got {}", path, expected_hash, retrieved.content_hash);
            return Err(Error::Integrity(format!(
                "expected {}, got {}", expected_hash, retrieved.content_hash
            )));
        }
        Ok(retrieved.data)
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.resolve(path)?.is_file())
    }

    pub fn delete(&self, path: &str) -> Result<()> {
        match std::fs::remove_file(self.resolve(path)?) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn presign(&self, path: &str, ttl: chrono::Duration) -> String {
        FileKey::new(path, &self.link_key, ttl).to_string()
    }

    pub fn open_presigned(&self, path: &str, key: &str) -> Result<Retrieved> {
        FileKey::verify(path, key, &self.link_key, chrono::Utc::now())?;
        self.get(path)
    }
}

/// Expiring HMAC over an object path, handed out in download links.
pub struct FileKey<'a> {
    file_path: &'a str,
    key: &'a [u8],
    ttl: chrono::Duration,
}

impl<'a> FileKey<'a> {
    pub fn new(file_path: &'a str, key: &'a [u8], ttl: chrono::Duration) -> FileKey<'a> {
        FileKey {
            file_path,
            key,
            ttl,
        }
    }

    fn mac(file_path: &str, expiry: &str, key: &[u8]) -> HmacSha512 {
        let file_path = base64::encode_config(file_path.as_bytes(), base64::URL_SAFE_NO_PAD);
        let mut mac = HmacSha512::new_from_slice(key).expect("HMAC accepts keys of any length");
        mac.update(format!("{};{}", file_path, expiry).as_bytes());
        mac
    }

    pub fn verify(file_path: &str, key_str: &str, key: &[u8], now: chrono::DateTime<chrono::Utc>) -> Result<()> {
        let (expiry, code) = key_str.split_once(';')
            .ok_or_else(|| Error::validation("key", "malformed file key"))?;
        let expires_at = expiry.parse::<i64>().ok()
            .and_then(|c| chrono::NaiveDateTime::from_timestamp_opt(c, 0))
            .ok_or_else(|| Error::validation("key", "malformed file key expiry"))?;
        let code_bytes = base64::decode_config(code, base64::URL_SAFE_NO_PAD)
            .map_err(|_| Error::validation("key", "malformed file key signature"))?;

        if Self::mac(file_path, expiry, key).verify(&code_bytes).is_err() {
            return Err(Error::Permission("invalid file key".to_string()));
        }
        if expires_at < now.naive_utc() {
            return Err(Error::Permission("file key expired".to_string()));
        }
        Ok(())
    }
}

impl std::fmt::Display for FileKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let expiry = (chrono::Utc::now() + self.ttl).timestamp().to_string();
        let code_bytes = base64::encode_config(
            Self::mac(self.file_path, &expiry, self.key).finalize().into_bytes(),
            base64::URL_SAFE_NO_PAD,
        );
        write!(f, "{};{}", expiry, code_bytes)
    }
}

#[cfg(test)]
pub(crate) fn test_store(dir: &std::path::Path) -> ContentStore {
    ContentStore::new(dir, "esign", std::sync::Arc::new(crate::crypto::test_sealer()), b"link-key").unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_returns_plaintext_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let payload = b"%PDF-1.4 contract body".to_vec();

        let stored = store.put(&payload, "templates/1/ws/a.pdf").unwrap();
        assert_eq!(stored.content_hash, hash_hex(&payload));
        assert_eq!(stored.size, payload.len() as i64);
        assert_eq!(stored.bucket, "esign");

        let on_disk = std::fs::read(dir.path().join("esign/templates/1/ws/a.pdf")).unwrap();
        assert_ne!(on_disk, payload);

        let got = store.get("templates/1/ws/a.pdf").unwrap();
        assert_eq!(got.data, payload);
        assert_eq!(got.content_hash, stored.content_hash);
    }

    #[test]
    fn tampered_object_never_yields_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        store.put(b"signed agreement", "documents/d.pdf").unwrap();

        let path = dir.path().join("esign/documents/d.pdf");
        let mut raw = std::fs::read(&path).unwrap();
        raw[20] ^= 0xff;
        std::fs::write(&path, raw).unwrap();

        match store.get("documents/d.pdf") {
            Err(Error::Integrity(_)) => {}
            Err(other) => panic!("expected integrity error, got {:?}", other),
            Ok(_) => panic!("tampered object decrypted"),
        }
    }

    #[test]
    fn objects_are_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        store.put(b"first", "x/obj").unwrap();
        assert!(matches!(store.put(b"second", "x/obj"), Err(Error::Conflict(_))));
        assert_eq!(store.get("x/obj").unwrap().data, b"first");
    }

    #[test]
    fn rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        for path in ["../outside", "/etc/passwd", "a/../../b", ""] {
            assert!(matches!(store.put(b"x", path), Err(Error::Validation { .. })), "{}", path);
        }
    }

    #[test]
    fn verified_get_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let stored = store.put(b"payload", "p").unwrap();

        assert_eq!(store.get_verified("p", &stored.content_hash).unwrap(), b"payload");
        assert!(matches!(store.get_verified("p", &hash_hex(b"other")), Err(Error::Integrity(_))));

        assert!(store.exists("p").unwrap());
        store.delete("p").unwrap();
        store.delete("p").unwrap();
        assert!(!store.exists("p").unwrap());
        assert!(matches!(store.get("p"), Err(Error::NotFound)));
    }

    #[test]
    fn presigned_keys_expire_and_bind_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        store.put(b"final", "documents/final.pdf").unwrap();

        let key = store.presign("documents/final.pdf", chrono::Duration::minutes(5));
        assert_eq!(store.open_presigned("documents/final.pdf", &key).unwrap().data, b"final");
        assert!(matches!(store.open_presigned("documents/other.pdf", &key), Err(Error::Permission(_))));

        let later = chrono::Utc::now() + chrono::Duration::minutes(10);
        assert!(matches!(
            FileKey::verify("documents/final.pdf", &key, b"link-key", later),
            Err(Error::Permission(_))
        ));
        assert!(matches!(
            FileKey::verify("documents/final.pdf", "garbage", b"link-key", chrono::Utc::now()),
            Err(Error::Validation { .. })
        ));
    }
}
