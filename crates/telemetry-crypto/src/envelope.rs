use aes::Aes256;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::keys::{IV_SIZE, derive_keys, random_iv};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub const BLOCK_SIZE: usize = 16;
pub const TAG_SIZE: usize = 32;

/// IV plus tag. Anything shorter cannot be an envelope.
pub const MIN_ENVELOPE_LEN: usize = IV_SIZE + TAG_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// Key or IV had the wrong length for the cipher.
    #[error("cipher setup failed")]
    Cipher,
    /// Malformed layout, tag mismatch or bad padding. Deliberately opaque.
    #[error("envelope rejected")]
    Rejected,
}

/// One sealed message: `iv || ciphertext || tag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub iv: [u8; IV_SIZE],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_SIZE],
}

impl Envelope {
    /// Split wire bytes into their parts. Only the layout is checked here;
    /// the tag is verified by [`decrypt`].
    pub fn parse(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() < MIN_ENVELOPE_LEN {
            return Err(EnvelopeError::Rejected);
        }
        let ct_len = bytes.len() - MIN_ENVELOPE_LEN;
        if ct_len % BLOCK_SIZE != 0 {
            return Err(EnvelopeError::Rejected);
        }

        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&bytes[..IV_SIZE]);
        let ciphertext = bytes[IV_SIZE..IV_SIZE + ct_len].to_vec();
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&bytes[IV_SIZE + ct_len..]);

        Ok(Self { iv, ciphertext, tag })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(IV_SIZE + self.ciphertext.len() + TAG_SIZE);
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }
}

fn compute_tag(mac_key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<HmacSha256, EnvelopeError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key).map_err(|_| EnvelopeError::Cipher)?;
    mac.update(iv);
    mac.update(ciphertext);
    Ok(mac)
}

/// Encrypt `plaintext` under keys derived from `passphrase`.
///
/// PKCS#7 padding is always applied, so an input that is already a multiple
/// of the block size gains a full block of `0x10` bytes.
pub fn encrypt(passphrase: &str, plaintext: &[u8]) -> Result<Envelope, EnvelopeError> {
    let keys = derive_keys(passphrase);
    let iv = random_iv();

    let ciphertext = Aes256CbcEnc::new_from_slices(&keys.enc_key, &iv)
        .map_err(|_| EnvelopeError::Cipher)?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let tag: [u8; TAG_SIZE] = compute_tag(&keys.mac_key, &iv, &ciphertext)?
        .finalize()
        .into_bytes()
        .into();

    Ok(Envelope { iv, ciphertext, tag })
}

/// Verify and decrypt wire bytes. The tag is checked in constant time
/// before the cipher is touched; no plaintext is returned on any failure.
pub fn decrypt(passphrase: &str, bytes: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let envelope = Envelope::parse(bytes)?;
    open(passphrase, &envelope)
}

/// [`decrypt`] for an already parsed envelope.
pub fn open(passphrase: &str, envelope: &Envelope) -> Result<Vec<u8>, EnvelopeError> {
    let keys = derive_keys(passphrase);

    compute_tag(&keys.mac_key, &envelope.iv, &envelope.ciphertext)?
        .verify_slice(&envelope.tag)
        .map_err(|_| EnvelopeError::Rejected)?;

    if envelope.ciphertext.is_empty() || envelope.ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(EnvelopeError::Rejected);
    }

    Aes256CbcDec::new_from_slices(&keys.enc_key, &envelope.iv)
        .map_err(|_| EnvelopeError::Cipher)?
        .decrypt_padded_vec_mut::<Pkcs7>(&envelope.ciphertext)
        .map_err(|_| EnvelopeError::Rejected)
}

/// Encrypt and serialize in one step; this is the request body format.
pub fn seal(passphrase: &str, plaintext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    Ok(encrypt(passphrase, plaintext)?.to_bytes())
}
