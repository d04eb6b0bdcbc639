use super::frame::{
    encode_frame, not_leader_frame, parse_frame, ROLE_PUBLISHER, ROLE_SUBSCRIBER, ROLE_TAG_LEN,
};
use crate::broker::message::Format;

#[test]
fn test_role_tags_are_seven_bytes() {
    assert_eq!(ROLE_PUBLISHER.len(), ROLE_TAG_LEN);
    assert_eq!(ROLE_SUBSCRIBER.len(), ROLE_TAG_LEN);
    assert_eq!(ROLE_PUBLISHER, b"PUBLISH");
    assert_eq!(ROLE_SUBSCRIBER, b"SUBSCRI");
}

#[test]
fn test_parse_frame_with_declared_formats() {
    let (format, body) = parse_frame(r#"FORMAT:JSON|{"Topic":"news"}"#);
    assert_eq!(format, Format::Json);
    assert_eq!(body, r#"{"Topic":"news"}"#);

    let (format, body) = parse_frame("FORMAT:XML|<Topic>news</Topic>");
    assert_eq!(format, Format::Xml);
    assert_eq!(body, "<Topic>news</Topic>");

    let (format, body) = parse_frame("FORMAT:RAW|[news] hi");
    assert_eq!(format, Format::Raw);
    assert_eq!(body, "[news] hi");
}

#[test]
fn test_parse_frame_tag_is_case_insensitive() {
    let (format, _) = parse_frame("FORMAT:json|{}");
    assert_eq!(format, Format::Json);
}

#[test]
fn test_unprefixed_line_falls_back_to_raw() {
    let (format, body) = parse_frame("just some text");
    assert_eq!(format, Format::Raw);
    assert_eq!(body, "just some text");

    // Unknown tag: the whole line is the raw body.
    let (format, body) = parse_frame("FORMAT:YAML|a: b");
    assert_eq!(format, Format::Raw);
    assert_eq!(body, "FORMAT:YAML|a: b");
}

#[test]
fn test_frame_round_trip() {
    let wire = encode_frame(Format::Json, r#"{"Value":"x"}"#);
    assert!(wire.ends_with('\n'));
    let (format, body) = parse_frame(wire.trim_end());
    assert_eq!(format, Format::Json);
    assert_eq!(body, r#"{"Value":"x"}"#);
}

#[test]
fn test_not_leader_frame_carries_hint() {
    assert_eq!(
        not_leader_frame(Some("127.0.0.1:5001")),
        "ERROR:NOT_LEADER|127.0.0.1:5001\n"
    );
    assert_eq!(not_leader_frame(None), "ERROR:NOT_LEADER|\n");
}
