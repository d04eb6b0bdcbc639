use serde::{Deserialize, Serialize};

/// Default routing topic for payloads that do not carry one.
pub const DEFAULT_TOPIC: &str = "default";

/// Wire format of a published payload.
///
/// The format is declared by the publisher in the frame prefix
/// (`FORMAT:JSON|…`) and preserved end-to-end: subscribers receive the body
/// exactly as it was published, re-framed with the same tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Format {
    Json,
    Xml,
    Raw,
}

impl Format {
    /// Parses a format tag, case-insensitively. Unknown tags are `None`;
    /// callers fall back to `Raw`.
    pub fn parse(tag: &str) -> Option<Format> {
        match tag.to_uppercase().as_str() {
            "JSON" => Some(Format::Json),
            "XML" => Some(Format::Xml),
            "RAW" => Some(Format::Raw),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Json => "JSON",
            Format::Xml => "XML",
            Format::Raw => "RAW",
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a published message in the Pub/Sub system.
///
/// The broker treats `id` as opaque (it is assigned by the publisher) and
/// assigns its own monotone sequence number when the message is committed and
/// stored. `topic` is decoded from the payload at the protocol boundary;
/// everything downstream routes on it without re-parsing the body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub event_name: String,
    pub value: String,
    pub topic: String,
    pub format: Format,
    pub body: String,
}

impl Message {
    /// Decodes a message from a declared format and raw body.
    ///
    /// A body that fails validation for its declared format is demoted to
    /// `Raw` rather than rejected, and a payload without a recognizable topic
    /// routes to [`DEFAULT_TOPIC`]. The body itself is never rewritten.
    pub fn decode(format: Format, body: &str) -> Message {
        let format = if validates(format, body) {
            format
        } else {
            tracing::debug!(declared = %format, "payload failed validation, demoting to RAW");
            Format::Raw
        };

        match format {
            Format::Json => decode_json(body),
            Format::Xml => decode_xml(body),
            Format::Raw => decode_raw(body),
        }
    }
}

/// Checks that a body is well-formed for its declared format. `Raw` always
/// validates.
fn validates(format: Format, body: &str) -> bool {
    match format {
        Format::Json => serde_json::from_str::<serde_json::Value>(body).is_ok(),
        Format::Xml => xml_is_well_formed(body),
        Format::Raw => true,
    }
}

fn decode_json(body: &str) -> Message {
    // Validation already passed, so parse failures cannot happen here; an
    // empty Value keeps the fallback path total anyway.
    let value: serde_json::Value = serde_json::from_str(body).unwrap_or(serde_json::Value::Null);
    Message {
        id: value.get("Id").and_then(|v| v.as_u64()).unwrap_or(0),
        event_name: json_str(&value, "EventName"),
        value: json_str(&value, "Value"),
        topic: match value.get("Topic").and_then(|v| v.as_str()) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => DEFAULT_TOPIC.to_string(),
        },
        format: Format::Json,
        body: body.to_string(),
    }
}

fn json_str(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn decode_xml(body: &str) -> Message {
    Message {
        id: xml_element(body, "Id")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        event_name: xml_element(body, "EventName").unwrap_or_default(),
        value: xml_element(body, "Value").unwrap_or_default(),
        topic: match xml_element(body, "Topic") {
            Some(t) if !t.is_empty() => t,
            _ => DEFAULT_TOPIC.to_string(),
        },
        format: Format::Xml,
        body: body.to_string(),
    }
}

/// Raw payloads may carry a `[topic] ` routing prefix; everything after it is
/// the value.
fn decode_raw(body: &str) -> Message {
    let (topic, value) = match parse_raw_topic(body) {
        Some((topic, rest)) => (topic, rest),
        None => (DEFAULT_TOPIC.to_string(), body.to_string()),
    };
    Message {
        id: 0,
        event_name: String::new(),
        value,
        topic,
        format: Format::Raw,
        body: body.to_string(),
    }
}

fn parse_raw_topic(body: &str) -> Option<(String, String)> {
    let rest = body.strip_prefix('[')?;
    let (topic, value) = rest.split_once("] ")?;
    if topic.is_empty() {
        return None;
    }
    Some((topic.to_string(), value.to_string()))
}

fn xml_is_well_formed(body: &str) -> bool {
    let mut reader = quick_xml::Reader::from_str(body);
    loop {
        match reader.read_event() {
            Ok(quick_xml::events::Event::Eof) => return true,
            Ok(_) => {}
            Err(_) => return false,
        }
    }
}

/// Returns the text content of the first `<name>…</name>` element, scanning
/// the document without requiring any particular schema.
fn xml_element(body: &str, name: &str) -> Option<String> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_str(body);
    let mut inside = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) if start.name().as_ref() == name.as_bytes() => {
                inside = true;
            }
            Ok(Event::Text(text)) if inside => {
                return text.unescape().ok().map(|t| t.trim().to_string());
            }
            Ok(Event::End(end)) if inside && end.name().as_ref() == name.as_bytes() => {
                // Empty element like <Topic></Topic>
                return Some(String::new());
            }
            Ok(Event::Eof) => return None,
            Ok(_) => {}
            Err(_) => return None,
        }
    }
}
