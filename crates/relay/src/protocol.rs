// Protocol version negotiation.
//
// Clients announce a protocol version in their `hello` frame. Anything not
// listed in SUPPORTED_PROTOCOL_VERSIONS is rejected with UPGRADE_REQUIRED and
// the socket is closed.

use workshop_chat_common::protocol::ws::SUPPORTED_PROTOCOL_VERSIONS;

/// Returns true if the given protocol version string is supported.
pub fn is_supported(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}
