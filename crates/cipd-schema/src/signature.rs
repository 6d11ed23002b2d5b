//! Detached signature blocks appended after a package payload.
//!
//! A package file is the deterministic zip followed by zero or more PEM
//! blocks of type [`SIGNATURE_PEM_TAG`]. Each block wraps a JSON-encoded
//! [`SignatureBlock`] whose binary fields are base64.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pem_block::{is_blank, split_pem_block};

/// PEM label of a signature block.
pub const SIGNATURE_PEM_TAG: &str = "CIPD SIGNATURE";

/// Hash algorithm name recorded for SHA-512 payload digests.
pub const HASH_ALGO_SHA512: &str = "SHA512";

/// Signature algorithm name recorded for RSA PKCS#1 v1.5 signatures.
pub const SIGNATURE_ALGO_PKCS1V15: &str = "PKCS1v15";

/// Errors that can occur when encoding or decoding signature blocks.
#[derive(Error, Debug)]
pub enum SignatureError {
    /// The JSON body of a block is malformed.
    #[error("Invalid signature JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The PEM framing of a block is malformed.
    #[error("Invalid PEM: {0}")]
    Pem(#[from] pem::PemError),

    /// A PEM block with an unexpected label was found.
    #[error("Unexpected PEM block '{tag}', expected '{expected}'", expected = SIGNATURE_PEM_TAG)]
    UnexpectedBlock {
        /// The label that was found.
        tag: String,
    },

    /// Non-PEM bytes follow the payload.
    #[error("Unexpected data after signature block {index}")]
    TrailingData {
        /// Number of blocks successfully parsed before the garbage.
        index: usize,
    },
}

/// Hash and signature metadata for one signer of a package payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SignatureBlock {
    /// Symbolic name of the hash algorithm, e.g. [`HASH_ALGO_SHA512`].
    pub hash_algo: String,
    /// Digest of the archive payload.
    #[serde(with = "base64_bytes")]
    pub hash: Vec<u8>,
    /// Symbolic name of the signature algorithm, e.g. [`SIGNATURE_ALGO_PKCS1V15`].
    pub signature_algo: String,
    /// Hex fingerprint of the signer's public key.
    pub signature_key: String,
    /// Raw signature bytes.
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

impl SignatureBlock {
    /// Encode the block as a PEM string with LF line endings.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError::Json`] if the block cannot be serialized.
    pub fn to_pem(&self) -> Result<String, SignatureError> {
        let body = serde_json::to_vec(self)?;
        let block = pem::Pem::new(SIGNATURE_PEM_TAG, body);
        Ok(pem::encode_config(
            &block,
            pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
        ))
    }

    /// Decode a block from a parsed PEM.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError::UnexpectedBlock`] for a wrong label or
    /// [`SignatureError::Json`] for a malformed body.
    pub fn from_pem(block: &pem::Pem) -> Result<Self, SignatureError> {
        if block.tag() != SIGNATURE_PEM_TAG {
            return Err(SignatureError::UnexpectedBlock {
                tag: block.tag().to_string(),
            });
        }
        Ok(serde_json::from_slice(block.contents())?)
    }
}

/// Parse every signature block in the bytes following a package payload.
///
/// Whitespace between and after blocks is tolerated; anything else is not.
///
/// # Errors
///
/// Returns an error if a block is malformed, carries the wrong label, or
/// if non-PEM bytes are present.
pub fn parse_signature_blocks(mut tail: &[u8]) -> Result<Vec<SignatureBlock>, SignatureError> {
    let mut blocks = Vec::new();
    while !is_blank(tail) {
        let Some((raw, rest)) = split_pem_block(tail) else {
            return Err(SignatureError::TrailingData {
                index: blocks.len(),
            });
        };
        let parsed = pem::parse(raw)?;
        blocks.push(SignatureBlock::from_pem(&parsed)?);
        tail = rest;
    }
    Ok(blocks)
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
