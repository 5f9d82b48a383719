// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn feed_all(parser: &mut SseParser, input: &str) -> Vec<SseEvent> {
    parser.feed(input.as_bytes())
}

#[test]
fn single_event() {
    let mut p = SseParser::new();
    let events = feed_all(&mut p, "data: hello\n\n");
    assert_eq!(events, vec![SseEvent { data: "hello".to_owned() }]);
}

#[test]
fn multi_line_data_joined_with_newline() {
    let mut p = SseParser::new();
    let events = feed_all(&mut p, "data: line one\ndata: line two\n\n");
    assert_eq!(events, vec![SseEvent { data: "line one\nline two".to_owned() }]);
}

#[test]
fn comments_ignored() {
    let mut p = SseParser::new();
    let events = feed_all(&mut p, ": keep-alive\n\ndata: real\n\n");
    assert_eq!(events, vec![SseEvent { data: "real".to_owned() }]);
}

#[test]
fn event_without_data_skipped() {
    let mut p = SseParser::new();
    let events = feed_all(&mut p, "event: ping\nid: 4\n\n");
    assert!(events.is_empty());
}

#[test]
fn chunk_boundaries_are_transparent() {
    let whole = "data: {\"sessionID\":\"s1\",\"delta\":\"hi\"}\n\ndata: second\n\n";
    let mut reference = SseParser::new();
    let expected = feed_all(&mut reference, whole);
    assert_eq!(expected.len(), 2);

    // Split at every possible byte boundary.
    for split in 1..whole.len() {
        let mut p = SseParser::new();
        let mut events = p.feed(whole.as_bytes()[..split].as_ref());
        events.extend(p.feed(whole.as_bytes()[split..].as_ref()));
        assert_eq!(events, expected, "split at byte {split}");
    }
}

#[test]
fn crlf_lines_accepted() {
    let mut p = SseParser::new();
    let events = feed_all(&mut p, "data: hello\r\n\r\n");
    assert_eq!(events, vec![SseEvent { data: "hello".to_owned() }]);
}

#[test]
fn data_without_space_after_colon() {
    let mut p = SseParser::new();
    let events = feed_all(&mut p, "data:tight\n\n");
    assert_eq!(events, vec![SseEvent { data: "tight".to_owned() }]);
}

#[test]
fn empty_data_line_counts() {
    // `data:` with an empty value still marks the event as carrying data.
    let mut p = SseParser::new();
    let events = feed_all(&mut p, "data:\n\n");
    assert_eq!(events, vec![SseEvent { data: String::new() }]);
}

#[test]
fn incomplete_event_held_until_blank_line() {
    let mut p = SseParser::new();
    assert!(feed_all(&mut p, "data: partial").is_empty());
    assert!(feed_all(&mut p, " still going\n").is_empty());
    let events = feed_all(&mut p, "\n");
    assert_eq!(events, vec![SseEvent { data: "partial still going".to_owned() }]);
}

#[test]
fn non_data_fields_ignored_inside_event() {
    let mut p = SseParser::new();
    let events = feed_all(&mut p, "event: message\ndata: x\nretry: 100\n\n");
    assert_eq!(events, vec![SseEvent { data: "x".to_owned() }]);
}
