use serde_json::{Map, Value};
use tracing::debug;

use crate::error::RelayError;

/// A Freshdesk ticket as the relay understands it, independent of which
/// payload shape it arrived in.
#[derive(Debug, Clone, PartialEq)]
pub struct TicketRecord {
    pub ticket_id: String,
    pub subject: Option<String>,
    pub description: Option<String>,
    pub requester_email: Option<String>,
    pub requester_name: Option<String>,
    pub company_name: Option<String>,
    pub tags: Vec<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub url: String,
    pub name: String,
}

/// A chain of object keys leading to a value.
type FieldPath = &'static [&'static str];

// Candidate locations per field, tried in order. The first one holding a
// non-empty value wins.
const TICKET_ID: &[FieldPath] = &[&["id"], &["ticket_id"], &["ticket", "id"]];
const SUBJECT: &[FieldPath] = &[&["subject"], &["ticket", "subject"]];
const DESCRIPTION: &[FieldPath] = &[
    &["description_text"],
    &["description"],
    &["ticket", "description_text"],
    &["ticket", "description"],
];
const REQUESTER_EMAIL: &[FieldPath] = &[
    &["requester_email"],
    &["requester", "email"],
    &["ticket", "requester", "email"],
    &["email"],
];
const REQUESTER_NAME: &[FieldPath] = &[
    &["requester_name"],
    &["requester", "name"],
    &["ticket", "requester", "name"],
];
const COMPANY_NAME: &[FieldPath] = &[
    &["company_name"],
    &["company", "name"],
    &["ticket", "company", "name"],
];
const TAGS: &[FieldPath] = &[&["tags"], &["ticket", "tags"]];
const STATUS: &[FieldPath] = &[&["status"], &["ticket", "status"]];
const PRIORITY: &[FieldPath] = &[&["priority"], &["ticket", "priority"]];
const ATTACHMENTS: &[FieldPath] = &[&["attachments"], &["ticket", "attachments"]];

const ATTACHMENT_URL_KEYS: [&str; 3] = ["content_url", "attachment_url", "url"];

/// Turns the raw request body into a JSON value.
///
/// Form bodies become a flat object of strings. An empty body is an empty
/// object so that the missing ticket id is reported instead of a parse error.
pub fn decode_body(content_type: Option<&str>, body: &[u8]) -> Result<Value, RelayError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Map::new()));
    }

    let is_form = content_type
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
    if is_form {
        let fields = url::form_urlencoded::parse(body)
            .into_owned()
            .map(|(key, value)| (key, Value::String(value)))
            .collect::<Map<_, _>>();
        return Ok(Value::Object(fields));
    }

    serde_json::from_slice(body)
        .map_err(|e| RelayError::Validation(format!("request body is not valid JSON: {e}")))
}

/// Peels off the envelopes some senders wrap the ticket in: a JSON document
/// sent as a string, or one sent as a string under `payload`.
pub fn unwrap_envelope(body: Value) -> Value {
    let body = match body {
        Value::String(raw) => match serde_json::from_str(&raw) {
            Ok(inner) => inner,
            Err(_) => Value::String(raw),
        },
        other => other,
    };

    if let Some(Value::String(raw)) = body.get("payload") {
        match serde_json::from_str::<Value>(raw) {
            Ok(inner) => return inner,
            Err(e) => debug!("payload field is not JSON, using the outer body: {}", e),
        }
    }
    body
}

/// Extracts the canonical ticket record. Only a missing ticket id fails.
pub fn normalize(payload: &Value) -> Result<TicketRecord, RelayError> {
    let ticket_id = first_text(payload, TICKET_ID)
        .ok_or_else(|| RelayError::Validation("ticket id is missing".to_string()))?;

    Ok(TicketRecord {
        ticket_id,
        subject: first_text(payload, SUBJECT),
        description: first_text(payload, DESCRIPTION),
        requester_email: first_text(payload, REQUESTER_EMAIL),
        requester_name: first_text(payload, REQUESTER_NAME),
        company_name: first_text(payload, COMPANY_NAME),
        tags: first_list(payload, TAGS, parse_tags),
        status: first_text(payload, STATUS),
        priority: first_text(payload, PRIORITY),
        attachments: first_list(payload, ATTACHMENTS, parse_attachments),
    })
}

fn lookup<'a>(payload: &'a Value, path: FieldPath) -> Option<&'a Value> {
    path.iter().try_fold(payload, |value, key| value.get(*key))
}

fn first_text(payload: &Value, candidates: &[FieldPath]) -> Option<String> {
    candidates
        .iter()
        .find_map(|path| lookup(payload, *path).and_then(as_text))
}

fn first_list<T>(
    payload: &Value,
    candidates: &[FieldPath],
    parse: fn(&Value) -> Vec<T>,
) -> Vec<T> {
    candidates
        .iter()
        .filter_map(|path| lookup(payload, *path))
        .map(parse)
        .find(|items| !items.is_empty())
        .unwrap_or_default()
}

/// Scalars as text; empty strings, `null`, `false` and containers count as absent.
fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(true) => Some("true".to_string()),
        _ => None,
    }
}

/// Freshdesk sends tags as an array, or as a comma separated placeholder string.
fn parse_tags(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(as_text).collect(),
        Value::String(joined) => joined
            .split(',')
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_attachments(value: &Value) -> Vec<Attachment> {
    let Value::Array(items) = value else {
        return Vec::new();
    };

    items
        .iter()
        .enumerate()
        .filter_map(|(idx, item)| {
            let fallback_name = || format!("Attachment {}", idx + 1);
            match item {
                Value::String(_) => as_text(item).map(|url| Attachment {
                    url,
                    name: fallback_name(),
                }),
                Value::Object(fields) => {
                    let url = ATTACHMENT_URL_KEYS
                        .iter()
                        .find_map(|key| fields.get(*key).and_then(as_text))?;
                    let name = fields
                        .get("name")
                        .and_then(as_text)
                        .unwrap_or_else(fallback_name);
                    Some(Attachment { url, name })
                }
                _ => None,
            }
        })
        .collect()
}
