//! Signing and verification of package payloads.
//!
//! Thin wrappers over RSA PKCS#1 v1.5 with SHA-512 that produce and check
//! [`SignatureBlock`]s. The payload is the deterministic zip only; blocks
//! already appended to a package file are never part of what gets signed.

use std::io::Write;

use cipd_schema::{HASH_ALGO_SHA512, SIGNATURE_ALGO_PKCS1V15, SignatureBlock};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha512};

use crate::keys::{KeyError, public_key_fingerprint};

/// Sign `payload` with `key`, producing a signature block.
///
/// # Errors
///
/// Returns an error if the key cannot be fingerprinted or the RSA operation
/// fails (e.g. the key is too small for a SHA-512 digest).
pub fn sign_payload(payload: &[u8], key: &RsaPrivateKey) -> Result<SignatureBlock, KeyError> {
    let digest = Sha512::digest(payload);
    let signature = key.sign(Pkcs1v15Sign::new::<Sha512>(), &digest)?;
    Ok(SignatureBlock {
        hash_algo: HASH_ALGO_SHA512.to_string(),
        hash: digest.to_vec(),
        signature_algo: SIGNATURE_ALGO_PKCS1V15.to_string(),
        signature_key: public_key_fingerprint(&key.to_public_key())?,
        signature,
    })
}

/// Append `block` in PEM form to a package file being written.
///
/// # Errors
///
/// Returns an error if the block cannot be encoded or written.
pub fn append_signature<W: Write>(mut writer: W, block: &SignatureBlock) -> Result<(), KeyError> {
    writer.write_all(block.to_pem()?.as_bytes())?;
    Ok(())
}

/// Check `block` against `payload` using one of `trusted_keys`.
///
/// The key is selected by fingerprint; the recorded hash must equal the
/// payload's SHA-512 digest before the signature itself is checked.
///
/// # Errors
///
/// Returns [`KeyError::UnsupportedAlgorithm`], [`KeyError::HashMismatch`],
/// [`KeyError::UnknownKey`] or [`KeyError::Rsa`] for a bad signature.
pub fn verify_signature(
    block: &SignatureBlock,
    payload: &[u8],
    trusted_keys: &[RsaPublicKey],
) -> Result<(), KeyError> {
    if block.hash_algo != HASH_ALGO_SHA512 || block.signature_algo != SIGNATURE_ALGO_PKCS1V15 {
        return Err(KeyError::UnsupportedAlgorithm {
            hash_algo: block.hash_algo.clone(),
            signature_algo: block.signature_algo.clone(),
        });
    }

    let digest = Sha512::digest(payload);
    if block.hash.as_slice() != digest.as_slice() {
        return Err(KeyError::HashMismatch {
            fingerprint: block.signature_key.clone(),
        });
    }

    for key in trusted_keys {
        if public_key_fingerprint(key)? == block.signature_key {
            key.verify(Pkcs1v15Sign::new::<Sha512>(), &digest, &block.signature)?;
            return Ok(());
        }
    }

    Err(KeyError::UnknownKey {
        fingerprint: block.signature_key.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::tests::test_private_key;
    use cipd_schema::parse_signature_blocks;

    #[test]
    fn test_sign_then_verify() {
        let key = test_private_key();
        let block = sign_payload(b"payload", key).unwrap();
        assert_eq!(block.hash_algo, "SHA512");
        assert_eq!(block.signature_algo, "PKCS1v15");
        assert_eq!(
            block.signature_key,
            public_key_fingerprint(&key.to_public_key()).unwrap()
        );
        verify_signature(&block, b"payload", &[key.to_public_key()]).unwrap();
    }

    #[test]
    fn test_verify_rejects_tampered_payload() {
        let key = test_private_key();
        let block = sign_payload(b"payload", key).unwrap();
        assert!(matches!(
            verify_signature(&block, b"tampered", &[key.to_public_key()]),
            Err(KeyError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_verify_rejects_forged_signature() {
        let key = test_private_key();
        let mut block = sign_payload(b"payload", key).unwrap();
        block.signature[0] ^= 0xff;
        assert!(matches!(
            verify_signature(&block, b"payload", &[key.to_public_key()]),
            Err(KeyError::Rsa(_))
        ));
    }

    #[test]
    fn test_verify_requires_trusted_key() {
        let block = sign_payload(b"payload", test_private_key()).unwrap();
        assert!(matches!(
            verify_signature(&block, b"payload", &[]),
            Err(KeyError::UnknownKey { .. })
        ));
    }

    #[test]
    fn test_verify_rejects_unknown_algorithm() {
        let key = test_private_key();
        let mut block = sign_payload(b"payload", key).unwrap();
        block.hash_algo = "MD5".to_string();
        assert!(matches!(
            verify_signature(&block, b"payload", &[key.to_public_key()]),
            Err(KeyError::UnsupportedAlgorithm { .. })
        ));
    }

    #[test]
    fn test_appended_block_parses_back() {
        let block = sign_payload(b"payload", test_private_key()).unwrap();
        let mut tail = Vec::new();
        append_signature(&mut tail, &block).unwrap();
        append_signature(&mut tail, &block).unwrap();
        assert_eq!(parse_signature_blocks(&tail).unwrap(), vec![block.clone(), block]);
    }
}
