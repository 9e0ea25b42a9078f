// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Messages exchanged between clients, the manager and workers.
//!
//! Every message that crosses a control stream is an adjacently tagged
//! serde enum: the variant's `$tag` becomes the event type and the variant's
//! fields become the JSON body.

pub mod management;
pub mod worker;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};

use crate::error::{ProjectionError, Result};

/// Split a tagged message into its event type and JSON body.
pub(crate) fn encode_tagged<T: Serialize>(message: &T) -> Result<(String, Vec<u8>)> {
    let Value::Object(mut fields) = serde_json::to_value(message)? else {
        return Err(ProjectionError::Protocol {
            reason: "message is not a tagged object".to_string(),
        });
    };
    let tag = match fields.remove("tag") {
        Some(Value::String(tag)) => tag,
        _ => {
            return Err(ProjectionError::Protocol {
                reason: "message has no tag".to_string(),
            });
        }
    };
    let body = fields
        .remove("body")
        .unwrap_or_else(|| Value::Object(Map::new()));
    Ok((tag, serde_json::to_vec(&body)?))
}

/// Rebuild a tagged message from an event type and JSON body.
pub(crate) fn decode_tagged<T: DeserializeOwned>(tag: &str, body: &[u8]) -> Result<T> {
    let body: Value = if body.is_empty() {
        Value::Object(Map::new())
    } else {
        serde_json::from_slice(body)?
    };
    Ok(serde_json::from_value(json!({ "tag": tag, "body": body }))?)
}
