use crate::broker::message::Format;

/// Length of the role tag a client sends immediately after connecting.
pub const ROLE_TAG_LEN: usize = 7;
pub const ROLE_PUBLISHER: &[u8; ROLE_TAG_LEN] = b"PUBLISH";
pub const ROLE_SUBSCRIBER: &[u8; ROLE_TAG_LEN] = b"SUBSCRI";

/// Keepalive reply to a subscriber PING.
pub const PONG_FRAME: &str = "PONG\n";

const FORMAT_PREFIX: &str = "FORMAT:";

/// Splits a publisher line into its declared format and body.
///
/// Lines without a recognizable `FORMAT:<fmt>|` prefix are treated as RAW
/// with the whole line as the body, matching what publishers that skip the
/// prefix expect.
pub fn parse_frame(line: &str) -> (Format, String) {
    if let Some(rest) = line.strip_prefix(FORMAT_PREFIX) {
        if let Some((tag, body)) = rest.split_once('|') {
            if let Some(format) = Format::parse(tag) {
                return (format, body.to_string());
            }
        }
    }
    (Format::Raw, line.to_string())
}

/// Encodes an outbound frame, newline included.
pub fn encode_frame(format: Format, body: &str) -> String {
    format!("{FORMAT_PREFIX}{}|{body}\n", format.as_str())
}

/// Error frame telling a client this node is not the leader. The payload is
/// the leader's `host:client_port` when known, empty otherwise.
pub fn not_leader_frame(leader: Option<&str>) -> String {
    format!("ERROR:NOT_LEADER|{}\n", leader.unwrap_or(""))
}
