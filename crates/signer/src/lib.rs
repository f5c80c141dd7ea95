//! publisher-signer: Signing capability consumed by the publisher agent
//!
//! The agent never touches curve math directly. It holds an `Arc<dyn Signer>`
//! and asks it to sign `(timestamp, asset, quantized price)` triples.

pub mod error;
pub mod evm;
pub mod signature;

pub use error::SignerError;
pub use evm::EvmSigner;
pub use signature::{
    EvmSignature, PriceSignature, PublisherKey, Signature, SignatureType, Signer, StarkSignature,
    TimestampedSignature,
};
