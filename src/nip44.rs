//! NIP-44 v2 payload encryption.
//!
//! `conversation_key = HKDF-extract(salt = "nip44-v2", ikm = ECDH x-coordinate)`.
//! Each message draws a 32 byte nonce, expands `chacha_key || chacha_nonce ||
//! hmac_key` from it, pads the plaintext, encrypts with ChaCha20 and
//! authenticates `nonce || ciphertext` with HMAC-SHA256. The wire form is
//! `base64(0x02 || nonce || ciphertext || mac)`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20::{
    cipher::{KeyIvInit, StreamCipher},
    ChaCha20,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use secp256k1::{ecdh, PublicKey, SecretKey};
use sha2::Sha256;
use thiserror::Error;

const VERSION: u8 = 2;
const SALT: &[u8] = b"nip44-v2";
const MAX_PLAINTEXT: usize = 65535;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("plaintext length {0} outside 1..=65535")]
    PlaintextLength(usize),

    #[error("unknown payload version")]
    UnknownVersion,

    #[error("invalid base64: {0}")]
    Base64(String),

    #[error("invalid payload length {0}")]
    PayloadLength(usize),

    #[error("invalid MAC")]
    Mac,

    #[error("invalid padding")]
    Padding,

    #[error("plaintext is not utf-8")]
    Utf8,

    #[error("key derivation failed")]
    Kdf,
}

/// Shared key between `secret` and `public`; symmetric in the two parties.
pub fn conversation_key(secret: &SecretKey, public: &PublicKey) -> [u8; 32] {
    let point = ecdh::shared_secret_point(public, secret);
    let (prk, _) = Hkdf::<Sha256>::extract(Some(SALT), &point[..32]);
    let mut key = [0u8; 32];
    key.copy_from_slice(&prk);
    key
}

pub fn encrypt(secret: &SecretKey, public: &PublicKey, plaintext: &str) -> Result<String, CryptoError> {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    encrypt_with_nonce(&conversation_key(secret, public), &nonce, plaintext)
}

pub fn decrypt(secret: &SecretKey, public: &PublicKey, payload: &str) -> Result<String, CryptoError> {
    decrypt_with_key(&conversation_key(secret, public), payload)
}

fn encrypt_with_nonce(
    conversation_key: &[u8; 32],
    nonce: &[u8; 32],
    plaintext: &str,
) -> Result<String, CryptoError> {
    let (chacha_key, chacha_nonce, hmac_key) = message_keys(conversation_key, nonce)?;
    let mut buf = pad(plaintext.as_bytes())?;
    ChaCha20::new(
        chacha20::Key::from_slice(&chacha_key),
        chacha20::Nonce::from_slice(&chacha_nonce),
    )
    .apply_keystream(&mut buf);
    let mac = hmac_tag(&hmac_key, nonce, &buf)?;

    let mut out = Vec::with_capacity(1 + 32 + buf.len() + 32);
    out.push(VERSION);
    out.extend_from_slice(nonce);
    out.extend_from_slice(&buf);
    out.extend_from_slice(&mac);
    Ok(STANDARD.encode(out))
}

fn decrypt_with_key(conversation_key: &[u8; 32], payload: &str) -> Result<String, CryptoError> {
    if payload.is_empty() || payload.starts_with('#') {
        return Err(CryptoError::UnknownVersion);
    }
    if !(132..=87472).contains(&payload.len()) {
        return Err(CryptoError::PayloadLength(payload.len()));
    }
    let data = STANDARD
        .decode(payload)
        .map_err(|e| CryptoError::Base64(e.to_string()))?;
    if !(99..=65603).contains(&data.len()) {
        return Err(CryptoError::PayloadLength(data.len()));
    }
    if data[0] != VERSION {
        return Err(CryptoError::UnknownVersion);
    }
    let mut nonce = [0u8; 32];
    nonce.copy_from_slice(&data[1..33]);
    let (ciphertext, mac) = data[33..].split_at(data.len() - 33 - 32);

    let (chacha_key, chacha_nonce, hmac_key) = message_keys(conversation_key, &nonce)?;
    let mut verifier =
        <HmacSha256 as Mac>::new_from_slice(&hmac_key).map_err(|_| CryptoError::Kdf)?;
    verifier.update(&nonce);
    verifier.update(ciphertext);
    verifier.verify_slice(mac).map_err(|_| CryptoError::Mac)?;

    let mut buf = ciphertext.to_vec();
    ChaCha20::new(
        chacha20::Key::from_slice(&chacha_key),
        chacha20::Nonce::from_slice(&chacha_nonce),
    )
    .apply_keystream(&mut buf);
    let plain = unpad(&buf)?;
    String::from_utf8(plain.to_vec()).map_err(|_| CryptoError::Utf8)
}

fn message_keys(
    conversation_key: &[u8; 32],
    nonce: &[u8; 32],
) -> Result<([u8; 32], [u8; 12], [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha256>::from_prk(conversation_key).map_err(|_| CryptoError::Kdf)?;
    let mut okm = [0u8; 76];
    hk.expand(nonce, &mut okm).map_err(|_| CryptoError::Kdf)?;
    let mut chacha_key = [0u8; 32];
    let mut chacha_nonce = [0u8; 12];
    let mut hmac_key = [0u8; 32];
    chacha_key.copy_from_slice(&okm[0..32]);
    chacha_nonce.copy_from_slice(&okm[32..44]);
    hmac_key.copy_from_slice(&okm[44..76]);
    Ok((chacha_key, chacha_nonce, hmac_key))
}

fn hmac_tag(key: &[u8; 32], nonce: &[u8; 32], ciphertext: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| CryptoError::Kdf)?;
    mac.update(nonce);
    mac.update(ciphertext);
    let mut tag = [0u8; 32];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    Ok(tag)
}

fn padded_len(len: usize) -> usize {
    if len <= 32 {
        return 32;
    }
    let next_power = 1usize << (usize::BITS - (len - 1).leading_zeros());
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };
    chunk * ((len - 1) / chunk + 1)
}

fn pad(plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let len = plaintext.len();
    if len == 0 || len > MAX_PLAINTEXT {
        return Err(CryptoError::PlaintextLength(len));
    }
    let mut out = Vec::with_capacity(2 + padded_len(len));
    out.extend_from_slice(&(len as u16).to_be_bytes());
    out.extend_from_slice(plaintext);
    out.resize(2 + padded_len(len), 0);
    Ok(out)
}

fn unpad(padded: &[u8]) -> Result<&[u8], CryptoError> {
    if padded.len() < 2 {
        return Err(CryptoError::Padding);
    }
    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if len == 0 || padded.len() != 2 + padded_len(len) {
        return Err(CryptoError::Padding);
    }
    Ok(&padded[2..2 + len])
}
