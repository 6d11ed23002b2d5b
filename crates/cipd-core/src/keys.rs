//! RSA public key PEM handling and fingerprinting.
//!
//! A fingerprint is the hex SHA-1 of the key's PEM encoding. It is what a
//! [`SignatureBlock`](cipd_schema::SignatureBlock) records as `SignatureKey`,
//! letting a verifier pick the right key without parsing the signature.

use cipd_schema::SignatureError;
use cipd_schema::pem_block::{is_blank, split_pem_block};
use rsa::RsaPublicKey;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use sha1::{Digest, Sha1};
use thiserror::Error;

/// PEM label of an RSA public key.
pub const PUBLIC_KEY_PEM_TAG: &str = "PUBLIC KEY";

/// Errors from key parsing, encoding, signing and verification.
#[derive(Error, Debug)]
pub enum KeyError {
    /// An I/O error occurred while reading key material or writing signatures.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The input does not contain a PEM block.
    #[error("No PEM block found")]
    NoPemBlock,

    /// The PEM framing is malformed.
    #[error("Invalid PEM: {0}")]
    Pem(#[from] pem::PemError),

    /// The PEM block carries the wrong label.
    #[error("Unexpected PEM block '{found}', expected '{expected}'", expected = PUBLIC_KEY_PEM_TAG)]
    WrongBlockType {
        /// The label that was found.
        found: String,
    },

    /// Non-whitespace bytes follow the PEM block.
    #[error("Unexpected data after the PEM block")]
    TrailingData,

    /// The DER body is not an RSA public key.
    #[error("Not an RSA public key: {0}")]
    InvalidKey(String),

    /// The key could not be DER-encoded.
    #[error("Failed to encode public key: {0}")]
    Encode(String),

    /// An RSA signing or verification operation failed.
    #[error("RSA error: {0}")]
    Rsa(#[from] rsa::Error),

    /// A signature block could not be encoded.
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// The signature block uses algorithms this code does not implement.
    #[error("Unsupported signature algorithms: hash '{hash_algo}', signature '{signature_algo}'")]
    UnsupportedAlgorithm {
        /// Hash algorithm named by the block.
        hash_algo: String,
        /// Signature algorithm named by the block.
        signature_algo: String,
    },

    /// The digest recorded in the block does not match the payload.
    #[error("Payload hash mismatch for signature by key {fingerprint}")]
    HashMismatch {
        /// Fingerprint of the signing key.
        fingerprint: String,
    },

    /// No trusted key has the fingerprint named by the block.
    #[error("Unknown signing key {fingerprint}")]
    UnknownKey {
        /// Fingerprint named by the block.
        fingerprint: String,
    },
}

/// Parse a single `PUBLIC KEY` PEM block holding a DER-encoded RSA key.
///
/// # Errors
///
/// Returns an error if there is no block, the block has a different label,
/// data follows the block, or the body is not an RSA public key.
pub fn public_key_from_pem(data: &[u8]) -> Result<RsaPublicKey, KeyError> {
    let (raw, rest) = split_pem_block(data).ok_or(KeyError::NoPemBlock)?;
    if !is_blank(rest) {
        return Err(KeyError::TrailingData);
    }
    let block = pem::parse(raw)?;
    if block.tag() != PUBLIC_KEY_PEM_TAG {
        return Err(KeyError::WrongBlockType {
            found: block.tag().to_string(),
        });
    }
    RsaPublicKey::from_public_key_der(block.contents())
        .map_err(|e| KeyError::InvalidKey(e.to_string()))
}

/// Encode an RSA public key as a `PUBLIC KEY` PEM block.
///
/// Output is deterministic: LF line endings, 64-column body.
///
/// # Errors
///
/// Returns [`KeyError::Encode`] if the key cannot be DER-encoded.
pub fn public_key_to_pem(key: &RsaPublicKey) -> Result<String, KeyError> {
    let der = key
        .to_public_key_der()
        .map_err(|e| KeyError::Encode(e.to_string()))?;
    let block = pem::Pem::new(PUBLIC_KEY_PEM_TAG, der.as_bytes().to_vec());
    Ok(pem::encode_config(
        &block,
        pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
    ))
}

/// Hex SHA-1 of the key's PEM encoding.
///
/// # Errors
///
/// Returns [`KeyError::Encode`] if the key cannot be encoded.
pub fn public_key_fingerprint(key: &RsaPublicKey) -> Result<String, KeyError> {
    let pem = public_key_to_pem(key)?;
    Ok(hex::encode(Sha1::digest(pem.as_bytes())))
}
