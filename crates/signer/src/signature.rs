use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SignerError;

pub type PublisherKey = String;

/// Signature scheme a pipeline signs with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureType {
    Evm,
    Stark,
}

impl SignatureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureType::Evm => "evm",
            SignatureType::Stark => "stark",
        }
    }
}

impl fmt::Display for SignatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignatureType {
    type Err = SignerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "evm" => Ok(SignatureType::Evm),
            "stark" => Ok(SignatureType::Stark),
            other => Err(SignerError::UnknownSignatureType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvmSignature {
    pub r: String,
    pub s: String,
    pub v: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StarkSignature {
    pub r: String,
    pub s: String,
}

/// Scheme-specific signature body, serialized without a tag so the wire
/// shape is `{r, s, v}` for EVM and `{r, s}` for Stark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Signature {
    Evm(EvmSignature),
    Stark(StarkSignature),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampedSignature {
    pub signature: Signature,
    pub timestamp: i64,
    pub msg_hash: String,
}

/// Output of a single signing call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceSignature {
    pub timestamped_signature: TimestampedSignature,
    pub external_asset_id: String,
}

/// Signing capability.
///
/// Implementations are called concurrently from the processor's signing
/// threads and must be cheap to share behind an `Arc`.
pub trait Signer: Send + Sync {
    /// Sign a quantized price (base-10 integer string) observed at
    /// `timestamp_ns` for `asset`.
    fn sign_publisher_price(
        &self,
        timestamp_ns: i64,
        asset: &str,
        quantized_price: &str,
    ) -> Result<PriceSignature, SignerError>;

    fn publisher_key(&self) -> &str;

    fn signature_type(&self) -> SignatureType;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_type_roundtrip() {
        assert_eq!("evm".parse::<SignatureType>().unwrap(), SignatureType::Evm);
        assert_eq!("stark".parse::<SignatureType>().unwrap(), SignatureType::Stark);
        assert!("ed25519".parse::<SignatureType>().is_err());
        assert_eq!(
            serde_json::to_string(&SignatureType::Stark).unwrap(),
            "\"stark\""
        );
    }

    #[test]
    fn test_untagged_signature_shape() {
        let evm = Signature::Evm(EvmSignature {
            r: "0x01".into(),
            s: "0x02".into(),
            v: "0x1b".into(),
        });
        let json = serde_json::to_value(&evm).unwrap();
        assert_eq!(json, serde_json::json!({"r": "0x01", "s": "0x02", "v": "0x1b"}));

        let parsed: Signature = serde_json::from_str(r#"{"r":"0x03","s":"0x04"}"#).unwrap();
        assert!(matches!(parsed, Signature::Stark(_)));
    }
}
