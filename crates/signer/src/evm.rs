use k256::ecdsa::SigningKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha3::{Digest, Keccak256};

use crate::error::SignerError;
use crate::signature::{
    EvmSignature, PriceSignature, Signature, SignatureType, Signer, TimestampedSignature,
};

const ETH_MESSAGE_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n32";

/// secp256k1 signer producing Ethereum personal-message signatures
pub struct EvmSigner {
    signing_key: SigningKey,
    address: [u8; 20],
    publisher_key: String,
}

impl EvmSigner {
    /// Create a signer from a hex private key, with or without `0x`
    pub fn new(private_key: &str) -> Result<Self, SignerError> {
        let trimmed = private_key.trim();
        let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let key_bytes =
            hex::decode(trimmed).map_err(|e| SignerError::InvalidPrivateKey(e.to_string()))?;
        let signing_key = SigningKey::from_slice(&key_bytes)
            .map_err(|e| SignerError::InvalidPrivateKey(e.to_string()))?;

        let address = address_of(&signing_key);
        Ok(Self {
            signing_key,
            address,
            publisher_key: checksum_address(&address),
        })
    }

    /// Keccak digest of the signed payload, as reported in `msg_hash`
    fn payload_hash(
        &self,
        timestamp_ns: i64,
        asset: &str,
        quantized_price: &str,
    ) -> Result<[u8; 32], SignerError> {
        let timestamp_word = i64_word(timestamp_ns / 1_000_000_000);
        let price_word = decimal_word(quantized_price)?;

        let digest = Keccak256::new()
            .chain_update(self.address)
            .chain_update(asset.as_bytes())
            .chain_update(timestamp_word)
            .chain_update(price_word)
            .finalize();

        let mut hash = [0u8; 32];
        hash.copy_from_slice(&digest);
        Ok(hash)
    }
}

impl Signer for EvmSigner {
    fn sign_publisher_price(
        &self,
        timestamp_ns: i64,
        asset: &str,
        quantized_price: &str,
    ) -> Result<PriceSignature, SignerError> {
        let payload_hash = self.payload_hash(timestamp_ns, asset, quantized_price)?;
        let prefixed = Keccak256::new()
            .chain_update(ETH_MESSAGE_PREFIX)
            .chain_update(payload_hash)
            .finalize();

        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(&prefixed)
            .map_err(|e| SignerError::Signing(e.to_string()))?;
        let rs = signature.to_bytes();

        Ok(PriceSignature {
            timestamped_signature: TimestampedSignature {
                signature: Signature::Evm(EvmSignature {
                    r: format!("0x{}", hex::encode(&rs[..32])),
                    s: format!("0x{}", hex::encode(&rs[32..])),
                    v: format!("0x{}", hex::encode([recovery_id.to_byte() + 27])),
                }),
                timestamp: timestamp_ns,
                msg_hash: format!("0x{}", hex::encode(payload_hash)),
            },
            external_asset_id: asset.to_string(),
        })
    }

    fn publisher_key(&self) -> &str {
        &self.publisher_key
    }

    fn signature_type(&self) -> SignatureType {
        SignatureType::Evm
    }
}

impl std::fmt::Debug for EvmSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvmSigner")
            .field("publisher_key", &self.publisher_key)
            .field("signing_key", &"<redacted>")
            .finish()
    }
}

fn address_of(signing_key: &SigningKey) -> [u8; 20] {
    let point = signing_key.verifying_key().as_affine().to_encoded_point(false);
    // skip the 0x04 uncompressed-point tag
    let hash = Keccak256::digest(&point.as_bytes()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    address
}

/// EIP-55 mixed-case hex encoding
fn checksum_address(address: &[u8; 20]) -> String {
    let lower = hex::encode(address);
    let hash = Keccak256::digest(lower.as_bytes());

    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, c) in lower.chars().enumerate() {
        let nibble = if i % 2 == 0 {
            hash[i / 2] >> 4
        } else {
            hash[i / 2] & 0x0f
        };
        if c.is_ascii_alphabetic() && nibble >= 8 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn i64_word(value: i64) -> [u8; 32] {
    let fill = if value < 0 { 0xff } else { 0x00 };
    let mut word = [fill; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Encode a base-10 integer string as a 32-byte big-endian two's complement word
pub(crate) fn decimal_word(value: &str) -> Result<[u8; 32], SignerError> {
    let (negative, digits) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SignerError::InvalidPrice(value.to_string()));
    }

    let mut word = [0u8; 32];
    for digit in digits.bytes() {
        let mut carry = u32::from(digit - b'0');
        for byte in word.iter_mut().rev() {
            let acc = u32::from(*byte) * 10 + carry;
            *byte = (acc & 0xff) as u8;
            carry = acc >> 8;
        }
        if carry != 0 {
            return Err(SignerError::InvalidPrice(format!("{} overflows 256 bits", value)));
        }
    }

    if negative {
        for byte in word.iter_mut() {
            *byte = !*byte;
        }
        for byte in word.iter_mut().rev() {
            let (sum, overflow) = byte.overflowing_add(1);
            *byte = sum;
            if !overflow {
                break;
            }
        }
    }
    Ok(word)
}
