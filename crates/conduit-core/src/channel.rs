//! Channel name derivation.
//!
//! Every function here is pure and peer-computable from `(component name,
//! device IP)` alone, except [`component_channel`], which the manager uses
//! as an internal bookkeeping key and which is never published to a peer as
//! a channel to subscribe on. See SPEC_FULL.md §6 for why both forms exist.

use base64::Engine;
use sha2::{Digest, Sha256};

/// The single well-known channel every opted-in log subscriber listens on.
pub const LOG_CHANNEL: &str = "conduit:logging";

/// The channel a per-device component manager listens for requests on.
pub fn manager_channel(device_ip: &str) -> String {
    device_ip.to_string()
}

/// The channel a component instance publishes its output on.
pub fn output_channel(component_name: &str, device_ip: &str) -> String {
    format!("{component_name}:{device_ip}")
}

/// The channel a component instance (and its manager) accepts requests on.
pub fn request_reply_channel(component_name: &str, device_ip: &str) -> String {
    format!("{component_name}:reqreply:{device_ip}")
}

/// The channel a connector publishes unsolicited `SendMessage` traffic on.
pub fn input_channel(component_name: &str, device_ip: &str) -> String {
    format!("{component_name}:input:{device_ip}")
}

/// `"{component_name}:{device_ip}"`, used as the stable identity of a
/// component instance in reservation keys and factory lookups.
pub fn component_id(component_name: &str, device_ip: &str) -> String {
    output_channel(component_name, device_ip)
}

/// The reservation key for a given component instance.
pub fn reservation_key(component_id: &str) -> String {
    format!("reservation:{component_id}")
}

/// A short, deterministic, collision-resistant identifier for a single
/// `(component instance, caller-supplied input stream)` pairing, used only
/// as the key under which the manager records a data-stream descriptor.
/// Never use this as a pub/sub channel name — see [`request_reply_channel`].
pub fn component_channel(component_id: &str, input_channel: &str) -> String {
    let combined = format!("{component_id}|{input_channel}");
    let digest = Sha256::digest(combined.as_bytes());
    let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);
    encoded[..16.min(encoded.len())].to_string()
}

/// Companion form of [`component_channel`] kept for API completeness with
/// the wire spec's `componentChannel + ":request_reply"` clause. Not used
/// by this implementation's actual request/reply routing — see SPEC_FULL.md
/// §6 for the resolved Open Question.
pub fn component_request_reply_channel(component_id: &str, input_channel: &str) -> String {
    format!("{}:request_reply", component_channel(component_id, input_channel))
}

/// The key a data-stream descriptor is stored under for a given
/// `component_channel` fingerprint.
pub fn data_stream_key(component_channel: &str) -> String {
    format!("data_stream:{component_channel}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_channels_are_peer_computable() {
        assert_eq!(output_channel("Echo", "10.0.0.2"), "Echo:10.0.0.2");
        assert_eq!(
            request_reply_channel("Echo", "10.0.0.2"),
            "Echo:reqreply:10.0.0.2"
        );
        assert_eq!(input_channel("Echo", "10.0.0.2"), "Echo:input:10.0.0.2");
        assert_eq!(manager_channel("10.0.0.2"), "10.0.0.2");
    }

    #[test]
    fn component_channel_is_deterministic_and_short() {
        let id = component_id("Echo", "10.0.0.2");
        let a = component_channel(&id, "client-1");
        let b = component_channel(&id, "client-1");
        let c = component_channel(&id, "client-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn data_stream_key_wraps_component_channel() {
        let ch = component_channel("Echo:10.0.0.2", "client-1");
        assert_eq!(data_stream_key(&ch), format!("data_stream:{ch}"));
    }
}
