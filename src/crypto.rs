use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::Rng;
use sha2::Digest;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;

/// AES-256-GCM with one process-wide key. Every sealed blob is the random
/// nonce followed by the ciphertext and tag, so opening needs nothing else.
pub struct Sealer {
    cipher: Aes256Gcm,
    key_id: String,
}

impl Sealer {
    pub fn new(key: &[u8]) -> crate::Result<Self> {
        if key.len() != KEY_SIZE {
            return Err(crate::Error::validation(
                "files.key", format!("encryption key must be {} bytes, got {}", KEY_SIZE, key.len()),
            ));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| crate::Error::validation("files.key", "invalid encryption key"))?;

        Ok(Sealer {
            cipher,
            key_id: hex::encode(&hash_slice(key)[..4]),
        })
    }

    /// Short fingerprint of the key, recorded next to sealed values so a
    /// rotated key can be told apart.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn seal(&self, plaintext: &[u8]) -> crate::Result<Vec<u8>> {
        let nonce_bytes: [u8; NONCE_SIZE] = rand::thread_rng().gen();
        let ciphertext = self.cipher.encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|err| crate::Error::Storage(format!("Encryption failed: {}", err)))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(&self, sealed: &[u8]) -> crate::Result<Vec<u8>> {
        if sealed.len() < NONCE_SIZE {
            return Err(crate::Error::Integrity("sealed data too short".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher.decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| crate::Error::Integrity("authentication tag mismatch".to_string()))
    }

    pub fn seal_str(&self, plaintext: &str) -> crate::Result<String> {
        Ok(base64::encode(self.seal(plaintext.as_bytes())?))
    }

    pub fn open_str(&self, sealed: &str) -> crate::Result<String> {
        let bytes = base64::decode(sealed)
            .map_err(|err| crate::Error::Integrity(format!("invalid sealed encoding: {}", err)))?;
        String::from_utf8(self.open(&bytes)?)
            .map_err(|err| crate::Error::Integrity(format!("sealed value is not UTF-8: {}", err)))
    }
}

pub fn hash_slice(data: &[u8]) -> Vec<u8> {
    let mut hasher = sha2::Sha256::new();
    hasher.update(data);
    hasher.finalize().as_slice().into()
}

pub fn hash_hex(data: &[u8]) -> String {
    hex::encode(hash_slice(data))
}

/// Opaque recipient credential: 64 random bytes, URL-safe.
pub fn make_access_token() -> String {
    base64::encode_config(
        rand::thread_rng()
            .sample_iter(rand::distributions::Standard)
            .take(64)
            .collect::<Vec<u8>>(),
        base64::URL_SAFE_NO_PAD,
    )
}

pub fn access_token_is_valid(token: &str) -> bool {
    base64::decode_config(token, base64::URL_SAFE_NO_PAD)
        .map_or(false, |raw| raw.len() >= 32)
}

#[cfg(test)]
pub(crate) fn test_sealer() -> Sealer {
    Sealer::new(&[7u8; KEY_SIZE]).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_prepends_unique_nonces() {
        let sealer = test_sealer();
        let a = sealer.seal(b"same payload").unwrap();
        let b = sealer.seal(b"same payload").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
        assert_eq!(sealer.open(&a).unwrap(), b"same payload");
    }

    #[test]
    fn tampered_ciphertext_is_an_integrity_error() {
        let sealer = test_sealer();
        let mut sealed = sealer.seal(b"Buyer: Jane Doe").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(sealer.open(&sealed), Err(crate::Error::Integrity(_))));
        assert!(matches!(sealer.open(&sealed[..4]), Err(crate::Error::Integrity(_))));
    }

    #[test]
    fn wrong_key_cannot_open() {
        let sealed = test_sealer().seal_str("secret").unwrap();
        let other = Sealer::new(&[9u8; KEY_SIZE]).unwrap();
        assert!(matches!(other.open_str(&sealed), Err(crate::Error::Integrity(_))));
        assert_ne!(other.key_id(), test_sealer().key_id());
    }

    #[test]
    fn rejects_short_keys() {
        assert!(Sealer::new(&[1u8; 16]).is_err());
    }

    #[test]
    fn access_tokens_carry_enough_randomness() {
        let token = make_access_token();
        assert!(access_token_is_valid(&token));
        assert_ne!(token, make_access_token());
        assert!(!access_token_is_valid("c2hvcnQ"));
    }

    #[test]
    fn hash_is_sha256_hex() {
        assert_eq!(hash_hex(b"abc"), "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
    }
}
