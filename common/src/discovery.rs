use serde::Serialize;

pub const DISCOVERY_PREFIX: &[u8] = b"alpacadiscovery";

#[derive(Debug, Serialize)]
struct DiscoveryReply {
    #[serde(rename = "AlpacaPort")]
    alpaca_port: u16,
}

/// Recognises `alpacadiscovery<version>` with a protocol version of 1 or later.
pub fn is_discovery_request(packet: &[u8]) -> bool {
    let Some(rest) = packet.strip_prefix(DISCOVERY_PREFIX) else {
        return false;
    };
    matches!(rest.first(), Some(version) if (b'1'..=b'9').contains(version))
}

/// Reply payload for a discovery packet, or `None` if the packet is not one.
pub fn discovery_reply(packet: &[u8], http_port: u16) -> Option<Vec<u8>> {
    if !is_discovery_request(packet) {
        return None;
    }
    serde_json::to_vec(&DiscoveryReply {
        alpaca_port: http_port,
    })
    .ok()
}
