use crate::types::RoomAddress;

/// Wire protocol:
///
///   Plain UTF-8 text, at most `MAX_FRAME` bytes per read, no framing.
///
/// Client → server frames are either `<token> [args...]` or free chat text.
/// The handoff from master to room uses the sentinels below plus a
/// `"<host> <port>"` reply carrying the room address.
pub const MAX_FRAME: usize = 1024;

/// Master → client: the room exists, confirm before the address is sent.
pub const CONNECTION_APPROVED: &str = "connection_approved";
/// Client → master: the only acceptable answer to `CONNECTION_APPROVED`.
pub const READY_FOR_CONNECTION: &str = "ready_for_connection";
/// Master → client: `/connect` named a room that is not registered.
pub const SERVER_NOT_EXIST: &str = "server_is_not_exist";
/// Master → client: `/server_list` with an empty registry.
pub const NO_ROOMS: &str = "no rooms available";
/// Master → client: the room could not be looked up or provisioned.
pub const TRY_LATER: &str = "Internal server error, please try again later";

/// Decode one read into a frame.
///
/// Bytes are decoded lossily, so a multi-byte character cut at the read
/// boundary becomes U+FFFD rather than an error. Trailing line terminators
/// are dropped so line-oriented tools interoperate.
pub fn decode_frame(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.trim_end_matches(['\r', '\n']).to_string()
}

/// Split a frame on the first whitespace run into `(token, remainder)`.
///
/// Borrows from the input: the remainder is passed on to the handler
/// untouched so each command shapes its own arguments.
pub fn split_command(line: &str) -> (&str, &str) {
    let line = line.trim_start();
    match line.split_once(char::is_whitespace) {
        Some((token, rest)) => (token, rest.trim_start()),
        None => (line, ""),
    }
}

/// Format the handoff reply carrying a room address.
pub fn format_address(addr: &RoomAddress) -> String {
    format!("{} {}", addr.host, addr.port)
}

/// Parse a `"<host> <port>"` handoff reply.
pub fn parse_address(frame: &str) -> Option<RoomAddress> {
    let mut parts = frame.split_whitespace();
    let host = parts.next()?;
    let port = parts.next()?.parse::<u16>().ok()?;
    if parts.next().is_some() || port == 0 {
        return None;
    }
    Some(RoomAddress::new(host, port))
}
