use crate::{auth::AuthMethod, config::Config, protocol::offline_uuid, registry::IdentityRegistry};
use serde_json::{Value, json};
use std::time::{SystemTime, UNIX_EPOCH};

/// status_response builds the server list entry a listener reports.
///
/// Player counts come from the registry; the player limit and favicon are
/// display values from the config.
pub fn status_response(config: &Config, registry: &IdentityRegistry, channel: AuthMethod) -> Value {
    let names = registry.snapshot();
    let sample: Vec<Value> = names
        .iter()
        .map(|name| json!({ "name": name, "id": offline_uuid(name).to_string() }))
        .collect();

    let mut response = json!({
        "version": { "name": config.version, "protocol": config.protocol },
        "players": {
            "max": config.max_players.unwrap_or_else(placeholder_max),
            "online": names.len(),
            "sample": sample,
        },
        "description": { "text": format!("{} ({channel} auth)", config.motd) },
    });

    if let Some(favicon) = &config.favicon {
        response["favicon"] = json!(favicon);
    }
    response
}

// Without a configured limit the list shows a meaningless negative number
fn placeholder_max() -> i64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    -i64::from(nanos % 10_000)
}
