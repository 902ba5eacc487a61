//! Tracking query construction.
//!
//! Builds the query string appended to the tracking endpoint:
//!
//! ```text
//! ?url=<enc>&pagename=<enc>&id=<raw>&ref=<enc>&c=<enc>[&pe_data=<raw>]
//! ```
//!
//! Free-text fields are percent-encoded the way a browser's
//! `encodeURIComponent` would. The site identifier is a plain token and is
//! passed through untouched, and the extra-data payload arrives already
//! escaped from [`format_pe_data`].

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::Value;

/// Characters left unescaped by `encodeURIComponent`.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Payload tag for form submissions.
pub const FORM_TAG: &str = "F";

/// Leading characters that mark a pre-formatted text payload.
pub const TEXT_PAYLOAD_TAGS: [char; 4] = ['M', 'A', 'B', 'D'];

/// Separator between form field segments.
const FORM_FIELD_DELIMITER: char = '|';

/// Key of the record field that names the payload type.
const TYPE_FIELD: &str = "type";

/// A fully resolved tracking request, ready to encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingRequest {
    /// Page address being tracked.
    pub url: String,
    /// Page title.
    pub page_name: String,
    /// Site identifier, `"0"` when tracking is disabled.
    pub site_id: String,
    /// Referring page address.
    pub referrer: String,
    /// Whether the visitor's browser accepts cookies.
    pub cookie_enabled: bool,
    /// Pre-escaped extra payload produced by [`format_pe_data`].
    pub extra_data: Option<String>,
}

/// Caller-facing extra payload attached to a tracking request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeData {
    /// Pre-formatted payload whose first character names its type.
    Text(String),
    /// Key/value record; only records typed as forms are understood.
    Record(Vec<(String, String)>),
}

impl PeData {
    /// Converts a JSON value into a payload.
    ///
    /// Strings become [`PeData::Text`] and objects become [`PeData::Record`]
    /// with their values rendered as plain text. Any other shape is not a
    /// payload and yields `None`.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Object(map) => Some(Self::Record(
                map.iter()
                    .map(|(key, value)| (key.clone(), json_to_text(value)))
                    .collect(),
            )),
            _ => None,
        }
    }
}

fn json_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Percent-encodes a free-text value like `encodeURIComponent`.
pub fn escape(value: &str) -> String {
    utf8_percent_encode(value, URI_COMPONENT).to_string()
}

/// Formats an extra payload for the `pe_data` query parameter.
///
/// Returns `None` when the payload has an unrecognized shape; that is not an
/// error, the request is simply sent without extra data.
pub fn format_pe_data(data: &PeData) -> Option<String> {
    match data {
        PeData::Text(text) => text
            .chars()
            .next()
            .filter(|first| TEXT_PAYLOAD_TAGS.contains(first))
            .map(|_| text.clone()),
        PeData::Record(fields) => {
            let kind = fields
                .iter()
                .find(|(key, _)| key == TYPE_FIELD)
                .map(|(_, value)| value.as_str())?;
            if kind != FORM_TAG {
                return None;
            }

            let mut formatted = String::from(FORM_TAG);
            for (key, value) in fields.iter().filter(|(key, _)| key != TYPE_FIELD) {
                formatted.push_str(&escape(&format!("{key}={value}")));
                formatted.push(FORM_FIELD_DELIMITER);
            }
            if formatted.ends_with(FORM_FIELD_DELIMITER) {
                formatted.pop();
            }
            Some(formatted)
        }
    }
}

/// Encodes a request into the tracker query string, leading `?` included.
pub fn encode(request: &TrackingRequest) -> String {
    let mut query = format!(
        "?url={}&pagename={}&id={}&ref={}&c={}",
        escape(&request.url),
        escape(&request.page_name),
        request.site_id,
        escape(&request.referrer),
        escape(if request.cookie_enabled { "true" } else { "false" }),
    );

    if let Some(data) = request.extra_data.as_deref().filter(|d| !d.is_empty()) {
        query.push_str("&pe_data=");
        query.push_str(data);
    }

    query
}
