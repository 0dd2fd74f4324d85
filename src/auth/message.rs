//! Challenge text and the ledger's signed-message framing.

use crate::network::Network;

/// Prefix wallets prepend before signing an arbitrary message.
pub const SIGNED_MESSAGE_PREFIX: &str = "\x19Hedera Signed Message:\n";

/// Build the human-readable challenge the account holder signs.
///
/// The output is byte-identical for identical inputs; verification rebuilds
/// it from the stored challenge rather than trusting client text.
pub fn create_challenge_message(
    nonce: &str,
    timestamp_ms: i64,
    account_id: &str,
    network: Network,
    service: &str,
) -> String {
    format!(
        "Sign this message to authenticate with {service}\n\n\
         Challenge: {nonce}\n\
         Nonce: {nonce}\n\
         Timestamp: {timestamp_ms}\n\
         Account: {account_id}\n\
         Network: {network}"
    )
}

/// `"\x19Hedera Signed Message:\n" + len(message) + message`, where the
/// length is the decimal byte length of the UTF-8 message.
pub fn prefix_message(message: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(SIGNED_MESSAGE_PREFIX.len() + 20 + message.len());
    out.extend_from_slice(SIGNED_MESSAGE_PREFIX.as_bytes());
    out.extend_from_slice(message.len().to_string().as_bytes());
    out.extend_from_slice(message.as_bytes());
    out
}
