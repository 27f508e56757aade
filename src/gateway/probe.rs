use super::RelayFormat;
use super::relay_request::{RelayRequest, TokenCountMeta};

/// Marker injected by third-party relay scanners to fingerprint gateways.
pub const DEFAULT_PROBE_STRING: &str = "PRIVNODE_DETECT_MAGIC_STRING_A7096E87DEA7C73165775EBE9F748D9311D7C16AFA981EA0DBE58DF92D941C32";

/// Only conversational formats are answered with a rejection; the others
/// cannot echo the probe back.
pub fn should_reject_probe(format: RelayFormat) -> bool {
    format.is_chat_capable()
}

/// Looks in the token-accounting text first and falls back to the whole
/// serialized request, which also covers fields the tokenizer skips.
pub fn request_contains_probe(
    probe: &str,
    request: &dyn RelayRequest,
    meta: Option<&TokenCountMeta>,
) -> bool {
    if probe.is_empty() {
        return false;
    }
    if meta.is_some_and(|meta| meta.combine_text.contains(probe)) {
        return true;
    }
    match request.to_json() {
        Ok(body) => body.to_string().contains(probe),
        Err(err) => {
            tracing::warn!(error = %err, "failed to serialize request for probe detection");
            false
        }
    }
}
