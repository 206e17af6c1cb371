use rand::RngCore;
use sha2::{Digest, Sha256};

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 16;

/// Prefix mixed into the passphrase before hashing the MAC key.
const MAC_KEY_PREFIX: &[u8] = b"HMAC";

/// Encryption and MAC keys derived from a single passphrase.
pub struct DerivedKeys {
    pub enc_key: [u8; KEY_SIZE],
    pub mac_key: [u8; KEY_SIZE],
}

impl Drop for DerivedKeys {
    fn drop(&mut self) {
        self.enc_key.fill(0);
        self.mac_key.fill(0);
    }
}

/// `enc_key = SHA-256(pass)`, `mac_key = SHA-256("HMAC" || pass)`.
pub fn derive_keys(passphrase: &str) -> DerivedKeys {
    let enc_key: [u8; KEY_SIZE] = Sha256::digest(passphrase.as_bytes()).into();

    let mut hasher = Sha256::new();
    hasher.update(MAC_KEY_PREFIX);
    hasher.update(passphrase.as_bytes());
    let mac_key: [u8; KEY_SIZE] = hasher.finalize().into();

    DerivedKeys { enc_key, mac_key }
}

/// Fresh random IV for one message.
pub fn random_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::rng().fill_bytes(&mut iv);
    iv
}

/// Random 32-bit value rendered as lowercase hex. Carried in request
/// plaintext so the server can discard replays.
pub fn random_nonce() -> String {
    hex::encode(rand::random::<u32>().to_be_bytes())
}
