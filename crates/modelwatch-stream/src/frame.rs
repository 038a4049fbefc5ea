//! Event-stream wire framing

use bytes::Bytes;

use modelwatch_types::Event;

/// Comment frame sent on idle connections
pub const HEARTBEAT: &[u8] = b": heartbeat\n\n";

pub fn heartbeat() -> Bytes {
    Bytes::from_static(HEARTBEAT)
}

/// Serialize an event into a `data: <json>\n\n` frame
pub fn encode(event: &Event) -> Result<Bytes, serde_json::Error> {
    let json = serde_json::to_string(event)?;
    Ok(Bytes::from(format!("data: {}\n\n", json)))
}
