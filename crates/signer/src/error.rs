use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignerError {
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),
    #[error("invalid quantized price: {0}")]
    InvalidPrice(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("unknown signature type: {0}")]
    UnknownSignatureType(String),
}
