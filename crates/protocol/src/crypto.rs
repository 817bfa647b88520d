//! RSA credential material for daemon authentication.
//!
//! The daemon authenticates hosts with 2048-bit RSA keys. This module
//! provides PKCS#1 v1.5 signing of the daemon's token and the daemon's
//! binary public key format.
//!
//! ## Public key blob
//!
//! ```text
//! u32 len       modulus size in 32-bit words (64)
//! u32 n0inv     -(n^-1) mod 2^32
//! u32 n[64]     modulus, little-endian words
//! u32 rr[64]    R^2 mod n with R = 2^2048, little-endian words
//! u32 exponent  65537
//! ```
//!
//! All words are little-endian. The blob is sent base64-encoded, followed by
//! a space, a human-readable name and a NUL.

use base64::Engine;
use rand::rngs::OsRng;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey};
use sha2::{Digest, Sha256};

use crate::error::{ProtocolError, Result};

/// Modulus size in bits.
pub const RSA_KEY_BITS: usize = 2048;

/// Modulus size in bytes.
pub const RSA_KEY_BYTES: usize = RSA_KEY_BITS / 8;

/// Public exponent used for every key.
pub const RSA_PUBLIC_EXPONENT: u32 = 65537;

/// Size of the binary public key blob.
pub const PUBLIC_KEY_BLOB_SIZE: usize = 4 + 4 + RSA_KEY_BYTES + RSA_KEY_BYTES + 4;

/// Length of the token the daemon asks us to sign.
pub const TOKEN_SIZE: usize = 20;

/// DER-encoded DigestInfo prefix for a SHA-1 digest.
pub const SHA1_DIGEST_INFO: [u8; 15] = [
    0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00, 0x04, 0x14,
];

/// Byte offset of the modulus inside a private key blob.
pub const PRIVATE_KEY_N_OFFSET: usize = 38;

/// Byte offset of the private exponent inside a private key blob.
pub const PRIVATE_KEY_D_OFFSET: usize = 303;

/// Size of private key blobs produced by this crate.
pub const PRIVATE_KEY_BLOB_SIZE: usize = 768;

const MODULUS_WORDS: u32 = (RSA_KEY_BYTES / 4) as u32;

/// Minimum run of 0xFF padding bytes required by PKCS#1 v1.5.
const MIN_PADDING: usize = 8;

/// An RSA private key usable for signing daemon tokens.
///
/// The key is carried as a fixed-layout blob from which the modulus and
/// private exponent are read at [`PRIVATE_KEY_N_OFFSET`] and
/// [`PRIVATE_KEY_D_OFFSET`]. These match a PKCS#8 DER encoding of an
/// RSA-2048 key only when `d` encodes to exactly 256 bytes with no sign
/// byte, so arbitrary DER keys must go through [`AdbPrivateKey::from_rsa`].
#[derive(Clone)]
pub struct AdbPrivateKey {
    blob: Vec<u8>,
    n: BigUint,
    d: BigUint,
    name: Option<String>,
}

impl AdbPrivateKey {
    /// Generates a new 2048-bit key with exponent 65537.
    pub fn generate() -> Result<Self> {
        let key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)?;
        Self::from_rsa(&key)
    }

    /// Builds a key from an `rsa` private key.
    pub fn from_rsa(key: &RsaPrivateKey) -> Result<Self> {
        if key.e() != &BigUint::from(RSA_PUBLIC_EXPONENT) {
            return Err(ProtocolError::InvalidKey(format!(
                "public exponent must be {RSA_PUBLIC_EXPONENT}"
            )));
        }
        Self::from_components(key.n(), key.d())
    }

    /// Builds a key blob from the modulus and private exponent.
    pub fn from_components(n: &BigUint, d: &BigUint) -> Result<Self> {
        let mut blob = vec![0u8; PRIVATE_KEY_BLOB_SIZE];
        write_be(&mut blob[PRIVATE_KEY_N_OFFSET..][..RSA_KEY_BYTES], n)?;
        write_be(&mut blob[PRIVATE_KEY_D_OFFSET..][..RSA_KEY_BYTES], d)?;
        Self::from_blob(blob)
    }

    /// Reads a key from its wire blob.
    ///
    /// Only the two fixed windows are interpreted; all other bytes are
    /// ignored.
    pub fn from_blob(blob: impl Into<Vec<u8>>) -> Result<Self> {
        let blob = blob.into();
        if blob.len() < PRIVATE_KEY_D_OFFSET + RSA_KEY_BYTES {
            return Err(ProtocolError::InvalidKey(format!(
                "private key blob too short: {} bytes",
                blob.len()
            )));
        }

        let n = BigUint::from_bytes_be(&blob[PRIVATE_KEY_N_OFFSET..][..RSA_KEY_BYTES]);
        let d = BigUint::from_bytes_be(&blob[PRIVATE_KEY_D_OFFSET..][..RSA_KEY_BYTES]);
        if n.bits() != RSA_KEY_BITS {
            return Err(ProtocolError::InvalidKey(format!(
                "modulus must be {} bits, got {}",
                RSA_KEY_BITS,
                n.bits()
            )));
        }

        Ok(Self {
            blob,
            n,
            d,
            name: None,
        })
    }

    /// Attaches a display name used when offering the public key.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Display name, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Raw key blob.
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// Signs a daemon token: `(PKCS#1 v1.5 padded SHA-1 DigestInfo || token)^d mod n`.
    ///
    /// The token is treated as an already-computed digest.
    pub fn sign(&self, token: &[u8]) -> Result<Vec<u8>> {
        let padded = pkcs1_sha1_pad(token)?;
        let m = BigUint::from_bytes_be(&padded);
        let signature = m.modpow(&self.d, &self.n);

        let mut out = vec![0u8; RSA_KEY_BYTES];
        write_be(&mut out, &signature)?;
        Ok(out)
    }

    /// Derives the public key.
    pub fn public_key(&self) -> AdbPublicKey {
        AdbPublicKey::from_modulus(&self.n)
    }
}

impl std::fmt::Debug for AdbPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdbPrivateKey")
            .field("name", &self.name)
            .field("fingerprint", &self.public_key().fingerprint())
            .field("private_exponent", &"[REDACTED]")
            .finish()
    }
}

/// Public key in the daemon's binary format.
#[derive(Clone, PartialEq, Eq)]
pub struct AdbPublicKey {
    blob: Vec<u8>,
}

impl AdbPublicKey {
    fn from_modulus(n: &BigUint) -> Self {
        let mut n_le = n.to_bytes_le();
        n_le.resize(RSA_KEY_BYTES, 0);

        let n0 = u32::from_le_bytes([n_le[0], n_le[1], n_le[2], n_le[3]]);
        let r_squared = (BigUint::from(1u32) << (2 * RSA_KEY_BITS)) % n;
        let mut rr_le = r_squared.to_bytes_le();
        rr_le.resize(RSA_KEY_BYTES, 0);

        let mut blob = Vec::with_capacity(PUBLIC_KEY_BLOB_SIZE);
        blob.extend_from_slice(&MODULUS_WORDS.to_le_bytes());
        blob.extend_from_slice(&negated_inverse(n0).to_le_bytes());
        blob.extend_from_slice(&n_le);
        blob.extend_from_slice(&rr_le);
        blob.extend_from_slice(&RSA_PUBLIC_EXPONENT.to_le_bytes());

        Self { blob }
    }

    /// Parses a binary public key blob.
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        if blob.len() != PUBLIC_KEY_BLOB_SIZE {
            return Err(ProtocolError::InvalidKey(format!(
                "public key blob must be {} bytes, got {}",
                PUBLIC_KEY_BLOB_SIZE,
                blob.len()
            )));
        }
        let words = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]);
        if words != MODULUS_WORDS {
            return Err(ProtocolError::InvalidKey(format!(
                "unsupported modulus size: {words} words"
            )));
        }
        Ok(Self {
            blob: blob.to_vec(),
        })
    }

    /// Binary blob.
    pub fn as_bytes(&self) -> &[u8] {
        &self.blob
    }

    /// Modulus.
    pub fn modulus(&self) -> BigUint {
        BigUint::from_bytes_le(&self.blob[8..8 + RSA_KEY_BYTES])
    }

    /// Payload for an Auth(PublicKey) packet: `base64(blob) + " " + name + "\0"`.
    pub fn to_auth_payload(&self, name: &str) -> Vec<u8> {
        let mut payload = base64::engine::general_purpose::STANDARD
            .encode(&self.blob)
            .into_bytes();
        payload.push(b' ');
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        payload
    }

    /// Checks a token signature produced by the matching private key.
    pub fn verify(&self, token: &[u8], signature: &[u8]) -> Result<()> {
        if signature.len() != RSA_KEY_BYTES {
            return Err(ProtocolError::InvalidKey(format!(
                "signature must be {} bytes, got {}",
                RSA_KEY_BYTES,
                signature.len()
            )));
        }

        let n = self.modulus();
        let s = BigUint::from_bytes_be(signature);
        let recovered = s.modpow(&BigUint::from(RSA_PUBLIC_EXPONENT), &n);
        let expected = BigUint::from_bytes_be(&pkcs1_sha1_pad(token)?);

        if recovered != expected {
            return Err(ProtocolError::InvalidKey(
                "signature does not match token".to_string(),
            ));
        }
        Ok(())
    }

    /// Human-readable fingerprint: SHA-256 of the blob, first 16 bytes in
    /// colon-separated groups of four hex characters.
    pub fn fingerprint(&self) -> String {
        let hash = Sha256::digest(&self.blob);
        hex::encode(&hash[..16])
            .as_bytes()
            .chunks(4)
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl std::fmt::Debug for AdbPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AdbPublicKey")
            .field(&self.fingerprint())
            .finish()
    }
}

/// Builds the 256-byte block `00 01 FF.. 00 DigestInfo token`.
fn pkcs1_sha1_pad(token: &[u8]) -> Result<[u8; RSA_KEY_BYTES]> {
    let fixed = 3 + SHA1_DIGEST_INFO.len();
    if token.len() + fixed + MIN_PADDING > RSA_KEY_BYTES {
        return Err(ProtocolError::InvalidKey(format!(
            "token of {} bytes is too long to sign",
            token.len()
        )));
    }

    let mut block = [0xFFu8; RSA_KEY_BYTES];
    block[0] = 0x00;
    block[1] = 0x01;
    let digest_start = RSA_KEY_BYTES - token.len();
    let info_start = digest_start - SHA1_DIGEST_INFO.len();
    block[info_start - 1] = 0x00;
    block[info_start..digest_start].copy_from_slice(&SHA1_DIGEST_INFO);
    block[digest_start..].copy_from_slice(token);
    Ok(block)
}

/// `-(a^-1) mod 2^32` for odd `a`, by Newton iteration.
fn negated_inverse(a: u32) -> u32 {
    let mut inverse: u32 = 1;
    for _ in 0..5 {
        inverse = inverse.wrapping_mul(2u32.wrapping_sub(a.wrapping_mul(inverse)));
    }
    inverse.wrapping_neg()
}

/// Writes `value` big-endian, right-aligned into `out`.
fn write_be(out: &mut [u8], value: &BigUint) -> Result<()> {
    let bytes = value.to_bytes_be();
    if bytes.len() > out.len() {
        return Err(ProtocolError::InvalidKey(format!(
            "value of {} bytes does not fit in {} bytes",
            bytes.len(),
            out.len()
        )));
    }
    let start = out.len() - bytes.len();
    out[..start].fill(0);
    out[start..].copy_from_slice(&bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// PKCS#8 DER encoding of a fixed RSA-2048 test key.
    const TEST_KEY_DER: &[u8] = include_bytes!("../testdata/adbkey_a.der");

    /// Signature of bytes 0..20 under the test key, produced by an
    /// independent PKCS#1 v1.5 implementation with a prehashed SHA-1 digest.
    const EXPECTED_SIGNATURE: &str = "a6a3893bd49c39edc2643a555b5458b5e97529c70334252a1e608fe4e4c36f85\
f767f073e2fa33017718ed548e0b22c1fee8b60e5842bcdfd48a2ae4e690f24dc8116715244bd51bca42254ec4498230b7\
d5ed498ee2cf98a47f0ce62d16a4b196508b79b80414205e4142addcf9c1bccf8488ecf00bcf3cf9afdb2121d63986f72d\
e54efe66b63366011e45189b0f23b6e843da5a64273709826d00d936405cdcaa03deb26c3dcffde129092890af80c08e17\
179cd163123dd101a6a7388fc85918e94978097649a50bad97ec7de40a1e69fe538c42035d35534cec384ec195b9461c34\
e7892ab7f5a867e6bee75ce8579dd507f5bc95e1704bf79e39929de4";

    fn test_token() -> Vec<u8> {
        (0u8..TOKEN_SIZE as u8).collect()
    }

    #[test]
    fn test_from_pkcs8_der_blob() {
        let key = AdbPrivateKey::from_blob(TEST_KEY_DER).unwrap();
        assert_eq!(key.n.bits(), RSA_KEY_BITS);
        assert_eq!(key.blob().len(), TEST_KEY_DER.len());
    }

    #[test]
    fn test_from_rsa_agrees_with_fixed_layout() {
        use rsa::pkcs8::DecodePrivateKey;

        // This fixture's `d` happens to encode to 256 bytes, so both paths
        // must yield the same key.
        let rsa_key = RsaPrivateKey::from_pkcs8_der(TEST_KEY_DER).unwrap();
        let via_rsa = AdbPrivateKey::from_rsa(&rsa_key).unwrap();
        let via_blob = AdbPrivateKey::from_blob(TEST_KEY_DER).unwrap();
        assert_eq!(via_rsa.d, *rsa_key.d());
        assert_eq!(via_rsa.d, via_blob.d);
        assert_eq!(
            via_rsa.sign(&test_token()).unwrap(),
            via_blob.sign(&test_token()).unwrap()
        );
    }

    #[test]
    fn test_sign_matches_reference_signature() {
        let key = AdbPrivateKey::from_blob(TEST_KEY_DER).unwrap();
        let signature = key.sign(&test_token()).unwrap();
        assert_eq!(hex::encode(signature), EXPECTED_SIGNATURE);
    }

    #[test]
    fn test_signature_verifies_with_public_key() {
        let key = AdbPrivateKey::from_blob(TEST_KEY_DER).unwrap();
        let token = test_token();
        let signature = key.sign(&token).unwrap();

        let public = key.public_key();
        assert!(public.verify(&token, &signature).is_ok());

        let mut other = token.clone();
        other[0] ^= 1;
        assert!(public.verify(&other, &signature).is_err());
    }

    #[test]
    fn test_from_components_roundtrip() {
        let key = AdbPrivateKey::from_blob(TEST_KEY_DER).unwrap();
        let rebuilt = AdbPrivateKey::from_components(&key.n, &key.d).unwrap();

        assert_eq!(rebuilt.blob().len(), PRIVATE_KEY_BLOB_SIZE);
        assert_eq!(
            rebuilt.sign(&test_token()).unwrap(),
            key.sign(&test_token()).unwrap()
        );
    }

    #[test]
    fn test_blob_too_short() {
        let err = AdbPrivateKey::from_blob(vec![0u8; 100]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidKey(_)));
    }

    #[test]
    fn test_blob_with_small_modulus_rejected() {
        let blob = vec![0u8; PRIVATE_KEY_BLOB_SIZE];
        assert!(AdbPrivateKey::from_blob(blob).is_err());
    }

    #[test]
    fn test_public_key_blob_layout() {
        let key = AdbPrivateKey::from_blob(TEST_KEY_DER).unwrap();
        let public = key.public_key();
        let blob = public.as_bytes();

        assert_eq!(blob.len(), PUBLIC_KEY_BLOB_SIZE);
        assert_eq!(&blob[0..4], &64u32.to_le_bytes());
        assert_eq!(&blob[4..8], &0xbe42_5991u32.to_le_bytes());
        assert_eq!(&blob[520..524], &65537u32.to_le_bytes());
        assert_eq!(public.modulus(), key.n);

        let n0 = u32::from_le_bytes([blob[8], blob[9], blob[10], blob[11]]);
        let n0inv = u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]);
        assert_eq!(n0.wrapping_mul(n0inv), u32::MAX);

        let rr = BigUint::from_bytes_le(&blob[264..520]);
        assert_eq!(rr, (BigUint::from(1u32) << 4096usize) % &key.n);
    }

    #[test]
    fn test_public_key_blob_matches_reference_digest() {
        let key = AdbPrivateKey::from_blob(TEST_KEY_DER).unwrap();
        let hash = Sha256::digest(key.public_key().as_bytes());
        assert_eq!(
            hex::encode(hash),
            "0a2bcadbea4042aa0404a0c8565557af39767630d342020aec095bdb5d1b0914"
        );
    }

    #[test]
    fn test_auth_payload_format() {
        let key = AdbPrivateKey::from_blob(TEST_KEY_DER).unwrap();
        let payload = key.public_key().to_auth_payload("tester@host");

        assert_eq!(payload.last(), Some(&0));
        let text = std::str::from_utf8(&payload[..payload.len() - 1]).unwrap();
        let (encoded, name) = text.split_once(' ').unwrap();
        assert_eq!(name, "tester@host");

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        assert_eq!(AdbPublicKey::from_blob(&decoded).unwrap(), key.public_key());
    }

    #[test]
    fn test_fingerprint_format() {
        let key = AdbPrivateKey::from_blob(TEST_KEY_DER).unwrap();
        let fingerprint = key.public_key().fingerprint();
        assert_eq!(fingerprint, "0a2b:cadb:ea40:42aa:0404:a0c8:5655:57af");
    }

    #[test]
    fn test_pkcs1_padding_layout() {
        let block = pkcs1_sha1_pad(&test_token()).unwrap();
        assert_eq!(&block[..2], &[0x00, 0x01]);
        assert!(block[2..220].iter().all(|&b| b == 0xFF));
        assert_eq!(block[220], 0x00);
        assert_eq!(&block[221..236], &SHA1_DIGEST_INFO);
        assert_eq!(&block[236..], test_token().as_slice());
    }

    #[test]
    fn test_oversized_token_rejected() {
        assert!(pkcs1_sha1_pad(&[0u8; 240]).is_err());
    }

    #[test]
    fn test_negated_inverse() {
        for a in [1u32, 3, 0xFFFF_FFFF, 0x1234_5679] {
            assert_eq!(a.wrapping_mul(negated_inverse(a)), u32::MAX);
        }
    }

    #[test]
    fn test_debug_redacts_private_exponent() {
        let key = AdbPrivateKey::from_blob(TEST_KEY_DER).unwrap().with_name("k");
        let debug = format!("{key:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains(&key.d.to_string()));
    }
}
