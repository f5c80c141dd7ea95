//! Wire envelopes and in-flight pipeline types

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use publisher_signer::{PublisherKey, SignatureType, TimestampedSignature};

use crate::error::ValueError;

pub type AssetId = String;
pub type OracleId = String;
pub type BrokerUrl = String;
pub type AuthToken = String;
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Assets a broker wants; containing `*` means all of them
pub type AssetFilter = HashSet<AssetId>;

pub const WILDCARD_ASSET: &str = "*";

/// Price scaled by 10^18, as a base-10 integer string
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuantizedPrice(pub String);

impl QuantizedPrice {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QuantizedPrice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Latest raw observation for one asset
#[derive(Debug, Clone, PartialEq)]
pub struct ValueUpdate {
    pub publish_timestamp_ns: i64,
    pub asset: AssetId,
    pub value: Decimal,
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Clock,
    Delta,
    Unspecified,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueUpdateWithTrigger {
    pub update: ValueUpdate,
    pub trigger: TriggerType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedPrice {
    pub publisher_key: PublisherKey,
    pub external_asset_id: String,
    pub signature_type: SignatureType,
    #[serde(rename = "price")]
    pub quantized_price: QuantizedPrice,
    pub timestamped_signature: TimestampedSignature,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedPriceUpdate {
    pub oracle_id: OracleId,
    pub asset_id: AssetId,
    pub trigger: TriggerType,
    pub signed_price: SignedPrice,
}

/// Most recently signed update per asset within one flush window
pub type SignedPriceUpdateBatch = HashMap<AssetId, SignedPriceUpdate>;

/// `{type, error?, trace_id?, data?}` envelope used on every socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebsocketMessage<T> {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> WebsocketMessage<T> {
    pub fn data(msg_type: impl Into<String>, data: T) -> Self {
        Self {
            msg_type: msg_type.into(),
            error: None,
            trace_id: None,
            data: Some(data),
        }
    }

    pub fn error(msg_type: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
            error: Some(error.into()),
            trace_id: None,
            data: None,
        }
    }
}

/// One element of a pushed `prices` message
#[derive(Debug, Clone, Deserialize)]
pub struct ValueUpdatePushWebsocket {
    #[serde(rename = "t")]
    pub publish_timestamp_ns: i64,
    #[serde(rename = "a")]
    pub asset: AssetId,
    #[serde(rename = "v")]
    pub value: serde_json::Value,
    #[serde(rename = "m", default)]
    pub metadata: Option<Metadata>,
}

impl TryFrom<ValueUpdatePushWebsocket> for ValueUpdate {
    type Error = ValueError;

    fn try_from(msg: ValueUpdatePushWebsocket) -> Result<Self, Self::Error> {
        let value = match &msg.value {
            serde_json::Value::Number(n) => parse_decimal(&n.to_string())?,
            serde_json::Value::String(s) if s.is_empty() => return Err(ValueError::EmptyString),
            serde_json::Value::String(s) => parse_decimal(s)?,
            serde_json::Value::Null => return Err(ValueError::UnsupportedType("null")),
            serde_json::Value::Bool(_) => return Err(ValueError::UnsupportedType("bool")),
            serde_json::Value::Array(_) => return Err(ValueError::UnsupportedType("array")),
            serde_json::Value::Object(_) => return Err(ValueError::UnsupportedType("object")),
        };
        Ok(ValueUpdate {
            publish_timestamp_ns: msg.publish_timestamp_ns,
            asset: msg.asset,
            value,
            metadata: msg.metadata,
        })
    }
}

/// One element of a message read from a pull-based upstream feed
#[derive(Debug, Clone, Deserialize)]
pub struct PriceUpdatePullWebsocket {
    #[serde(rename = "t")]
    pub publish_timestamp_ns: i64,
    #[serde(rename = "a")]
    pub asset: AssetId,
    #[serde(rename = "p")]
    pub price: f64,
    #[serde(rename = "m", default)]
    pub metadata: Option<Metadata>,
}

impl TryFrom<PriceUpdatePullWebsocket> for ValueUpdate {
    type Error = ValueError;

    fn try_from(msg: PriceUpdatePullWebsocket) -> Result<Self, Self::Error> {
        // f64 Display never uses exponent notation
        let value = parse_decimal(&msg.price.to_string())?;
        Ok(ValueUpdate {
            publish_timestamp_ns: msg.publish_timestamp_ns,
            asset: msg.asset,
            value,
            metadata: msg.metadata,
        })
    }
}

/// Parse plain or scientific decimal notation.
///
/// Values are held as `rust_decimal::Decimal`: a 96-bit mantissa with at most
/// 28 fractional digits. Magnitudes above about 7.9e28 are rejected as
/// `NotDecimal`; fractional digits past 28 are rounded, well below the 18
/// places a quantized price keeps.
pub fn parse_decimal(s: &str) -> Result<Decimal, ValueError> {
    let trimmed = s.trim();
    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .map_err(|_| ValueError::NotDecimal(s.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConnectionConfig {
    pub publish_url: BrokerUrl,
    pub asset_ids: Vec<AssetId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryErrorResponse {
    pub error: String,
}

#[cfg(test)]
pub(crate) fn sample_signed_update(asset: &str, price: &str) -> SignedPriceUpdate {
    use publisher_signer::{EvmSignature, Signature};

    SignedPriceUpdate {
        oracle_id: "czowx".into(),
        asset_id: asset.into(),
        trigger: TriggerType::Delta,
        signed_price: SignedPrice {
            publisher_key: "0xabc".into(),
            external_asset_id: asset.into(),
            signature_type: SignatureType::Evm,
            quantized_price: QuantizedPrice(price.into()),
            timestamped_signature: TimestampedSignature {
                signature: Signature::Evm(EvmSignature {
                    r: "0x1".into(),
                    s: "0x2".into(),
                    v: "0x1b".into(),
                }),
                timestamp: 10,
                msg_hash: "0xff".into(),
            },
            metadata: None,
        },
    }
}
