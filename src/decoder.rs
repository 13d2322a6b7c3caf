//! Transaction Decoder
//!
//! Resolves the protocol a pending transaction targets and decodes its
//! calldata through a layered fallback: registry-fetched contract interface
//! first, then a 4-byte selector lookup. Decoding never fails — anything
//! unresolvable degrades to a partially-populated [`DecodedTransaction`].

use crate::registry::ProtocolRegistry;
use crate::types::{DecodedTransaction, MempoolTransaction};
use alloy::dyn_abi::JsonAbiExt;
use alloy::json_abi::JsonAbi;
use alloy::primitives::U256;
use std::sync::Arc;
use tracing::debug;

/// Synthetic method for transactions with no recipient
pub const METHOD_CONTRACT_CREATION: &str = "contractCreation";

/// Synthetic method for empty-calldata transactions carrying value
pub const METHOD_NATIVE_TRANSFER: &str = "nativeTransfer";

/// Synthetic method for empty-calldata transactions without value
pub const METHOD_PLAIN_CALL: &str = "call";

/// Extract the method ID (first 4 bytes) from transaction input data
///
/// # Returns
/// `Some([u8; 4])` if input has at least 4 bytes, `None` otherwise
pub fn extract_method_id(input: &[u8]) -> Option<[u8; 4]> {
    if input.len() < 4 {
        return None;
    }
    let mut method_id = [0u8; 4];
    method_id.copy_from_slice(&input[..4]);
    Some(method_id)
}

/// Format a selector as 0x-prefixed hex
pub fn selector_hex(selector: [u8; 4]) -> String {
    format!("0x{}", hex::encode(selector))
}

/// Derive a short method name from a full `name(type,...)` signature
pub fn method_name_of(signature: &str) -> &str {
    signature.split('(').next().unwrap_or(signature)
}

/// Protocol-aware calldata decoder
pub struct Decoder {
    protocols: Arc<dyn ProtocolRegistry>,
}

impl Decoder {
    pub fn new(protocols: Arc<dyn ProtocolRegistry>) -> Self {
        Self { protocols }
    }

    /// Decode calldata against a contract interface; `None` when the
    /// selector has no match or argument decoding fails.
    fn decode_against_interface(
        abi: &JsonAbi,
        selector: [u8; 4],
        input: &[u8],
    ) -> Option<(String, String, Vec<alloy::dyn_abi::DynSolValue>)> {
        let function = abi
            .functions()
            .find(|f| f.selector().as_slice() == selector.as_slice())?;

        match function.abi_decode_input(&input[4..], false) {
            Ok(args) => Some((function.name.clone(), function.signature(), args)),
            Err(e) => {
                debug!(
                    selector = %selector_hex(selector),
                    error = %e,
                    "calldata did not decode against matched interface entry"
                );
                None
            }
        }
    }

    /// Turn a canonical transaction into a decoded one.
    ///
    /// Never returns an error: protocol lookup, interface fetch and selector
    /// resolution are all best-effort, and any failure leaves the
    /// corresponding fields unset.
    pub async fn decode(&self, tx: MempoolTransaction) -> DecodedTransaction {
        let mut decoded = DecodedTransaction {
            tx,
            protocol: None,
            method: None,
            function_signature: None,
            raw_method_signature: None,
            args: None,
            abi_name: None,
        };

        let Some(to) = decoded.tx.to else {
            decoded.method = Some(METHOD_CONTRACT_CREATION.to_string());
            return decoded;
        };

        if decoded.tx.input.is_empty() {
            decoded.method = Some(
                if decoded.tx.value > U256::ZERO {
                    METHOD_NATIVE_TRANSFER
                } else {
                    METHOD_PLAIN_CALL
                }
                .to_string(),
            );
            return decoded;
        }

        let chain_id = decoded.tx.chain_id;
        decoded.protocol = self.protocols.lookup(to, chain_id);

        let Some(selector) = extract_method_id(&decoded.tx.input) else {
            return decoded;
        };
        decoded.function_signature = Some(selector_hex(selector));

        if let Some(abi) = self.protocols.interface(to, chain_id).await {
            if let Some((name, signature, args)) =
                Self::decode_against_interface(&abi, selector, &decoded.tx.input)
            {
                decoded.method = Some(name);
                decoded.raw_method_signature = Some(signature);
                decoded.args = Some(args);
                decoded.abi_name = decoded.protocol.as_ref().map(|p| p.name.clone());
                return decoded;
            }
        }

        if let Some(signature) = self.protocols.function_signature(selector).await {
            decoded.method = Some(method_name_of(&signature).to_string());
            decoded.raw_method_signature = Some(signature);
        }

        decoded
    }
}
