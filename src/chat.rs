use crate::protocol::Packet;
use serde_json::{Value, json};
use uuid::Uuid;

/// Chat position for ordinary chat lines
pub const POSITION_CHAT: u8 = 0;
/// Chat position the backend uses for system messages
pub const POSITION_SYSTEM: u8 = 1;

/// system_message builds the chat component `[tag] text` used for every
/// message the proxy itself shows a player
pub fn system_message(tag: &str, text: &str) -> String {
    json!({
        "text": "",
        "extra": [
            { "text": "[", "color": "dark_gray" },
            { "text": tag, "color": "green" },
            { "text": "] ", "color": "dark_gray" },
            { "text": text, "color": "gray" },
        ]
    })
    .to_string()
}

/// system_packet wraps a proxy message into a chat packet from the system
/// sender
pub fn system_packet(tag: &str, text: &str) -> Packet {
    Packet::ServerChat {
        message: system_message(tag, text),
        position: POSITION_CHAT,
        sender: Uuid::nil(),
    }
}

/// reason builds the plain component used as a disconnect reason
pub fn reason(text: &str) -> String {
    json!({ "text": text }).to_string()
}

/// plain_text flattens a JSON chat component into readable text.
/// Input that isn't JSON is returned unchanged.
pub fn plain_text(component: &str) -> String {
    match serde_json::from_str::<Value>(component) {
        Ok(value) => {
            let mut out = String::new();
            flatten(&value, &mut out);
            out
        }
        Err(_) => component.to_string(),
    }
}

fn flatten(value: &Value, out: &mut String) {
    match value {
        Value::String(text) => out.push_str(text),
        Value::Array(parts) => parts.iter().for_each(|part| flatten(part, out)),
        Value::Object(map) => {
            if let Some(Value::String(text)) = map.get("text") {
                out.push_str(text);
            } else if let Some(Value::String(key)) = map.get("translate") {
                // No translation tables here; show the key and its arguments
                out.push_str(key);
                if let Some(Value::Array(with)) = map.get("with") {
                    for (i, arg) in with.iter().enumerate() {
                        out.push_str(if i == 0 { " " } else { ", " });
                        flatten(arg, out);
                    }
                }
            }
            if let Some(extra) = map.get("extra") {
                flatten(extra, out);
            }
        }
        _ => {}
    }
}
