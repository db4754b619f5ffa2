//! Wire frames: parsing of client messages and builders for relay replies.
//! Everything on the socket is a UTF-8 JSON array whose first element is
//! the command word.

use serde_json::{json, Value};

use crate::event::Event;
use crate::filter::Filter;

#[derive(Debug)]
pub enum ClientFrame {
    Event(Box<Event>),
    Req { sub_id: String, filters: Vec<Filter> },
    Close { sub_id: String },
    Count { sub_id: String, filters: Vec<Filter> },
    Auth(Box<Event>),
    Unsupported(String),
}

/// Parses one inbound text frame. Errors here are protocol-level
/// (malformed JSON, wrong arity, bad types) and answered with a NOTICE.
pub fn parse_frame(text: &str) -> Result<ClientFrame, String> {
    let value: Value = serde_json::from_str(text).map_err(|e| format!("malformed JSON: {e}"))?;
    let Some(arr) = value.as_array() else {
        return Err("frame must be a JSON array".to_string());
    };
    let Some(word) = arr.first().and_then(Value::as_str) else {
        return Err("frame must start with a command word".to_string());
    };

    match word {
        "EVENT" => {
            if arr.len() != 2 {
                return Err("EVENT frame must be [\"EVENT\", event]".to_string());
            }
            Ok(ClientFrame::Event(Box::new(Event::parse(arr[1].clone())?)))
        }
        "REQ" | "COUNT" => {
            if arr.len() < 3 {
                return Err(format!("{word} frame needs a subscription id and at least one filter"));
            }
            let Some(sub_id) = arr[1].as_str() else {
                return Err("subscription id must be a string".to_string());
            };
            let filters = arr[2..]
                .iter()
                .map(|v| {
                    serde_json::from_value::<Filter>(v.clone())
                        .map_err(|e| format!("malformed filter: {e}"))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let sub_id = sub_id.to_string();
            if word == "REQ" {
                Ok(ClientFrame::Req { sub_id, filters })
            } else {
                Ok(ClientFrame::Count { sub_id, filters })
            }
        }
        "CLOSE" => {
            if arr.len() != 2 {
                return Err("CLOSE frame must be [\"CLOSE\", subscription-id]".to_string());
            }
            let Some(sub_id) = arr[1].as_str() else {
                return Err("subscription id must be a string".to_string());
            };
            Ok(ClientFrame::Close { sub_id: sub_id.to_string() })
        }
        "AUTH" => {
            if arr.len() != 2 {
                return Err("AUTH frame must be [\"AUTH\", event]".to_string());
            }
            Ok(ClientFrame::Auth(Box::new(Event::parse(arr[1].clone())?)))
        }
        other => Ok(ClientFrame::Unsupported(other.to_string())),
    }
}

pub fn event_frame(sub_id: &str, event: &Event) -> String {
    json!(["EVENT", sub_id, event]).to_string()
}

pub fn ok_frame(event_id: &str, accepted: bool, message: &str) -> String {
    json!(["OK", event_id, accepted, message]).to_string()
}

pub fn eose_frame(sub_id: &str) -> String {
    json!(["EOSE", sub_id]).to_string()
}

pub fn notice_frame(message: &str) -> String {
    json!(["NOTICE", message]).to_string()
}

pub fn auth_frame(challenge: &str) -> String {
    json!(["AUTH", challenge]).to_string()
}

pub fn count_frame(sub_id: &str, count: u64) -> String {
    json!(["COUNT", sub_id, {"count": count}]).to_string()
}
