/// Telemetry Crypto Library
///
/// Envelope codec used for every uplink message:
/// `[16-byte IV][AES-256-CBC ciphertext][32-byte HMAC-SHA256 tag]`.
///
/// Both keys are derived from one configured passphrase with
/// domain-separated SHA-256, so confidentiality and integrity never share
/// a key. Envelopes are authenticated before any decryption is attempted.

pub mod envelope;
pub mod keys;

pub use envelope::{Envelope, EnvelopeError, decrypt, encrypt, open, seal};
pub use keys::{DerivedKeys, derive_keys, random_nonce};
