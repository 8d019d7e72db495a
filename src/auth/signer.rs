use alloy_primitives::{Address, Signature};
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("invalid signer address: {0}")]
    InvalidAddress(String),
    #[error("invalid signature encoding: {0}")]
    InvalidSignature(String),
    #[error("recovered {recovered}, expected {expected}")]
    Mismatch { recovered: Address, expected: Address },
}

/// Parses a `0x`-prefixed (or bare) hex address.
pub fn parse_address(raw: &str) -> Result<Address, SignerError> {
    Address::from_str(raw.trim()).map_err(|e| SignerError::InvalidAddress(e.to_string()))
}

/// Checks that `signature_hex` is an EIP-191 personal-message signature of `message`
/// made by `expected`.
///
/// Address comparison is on the 20 raw bytes, so checksum casing never matters.
pub fn verify_personal_signature(
    message: &[u8],
    signature_hex: &str,
    expected: Address,
) -> Result<(), SignerError> {
    let raw = signature_hex.trim();
    let raw = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes = hex::decode(raw).map_err(|e| SignerError::InvalidSignature(e.to_string()))?;
    let signature =
        Signature::from_raw(&bytes).map_err(|e| SignerError::InvalidSignature(e.to_string()))?;
    let recovered = signature
        .recover_address_from_msg(message)
        .map_err(|e| SignerError::InvalidSignature(e.to_string()))?;
    if recovered == expected {
        Ok(())
    } else {
        Err(SignerError::Mismatch {
            recovered,
            expected,
        })
    }
}
