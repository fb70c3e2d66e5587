//! Reply model and the parser turning a drained spamd reply into it.

use std::borrow::Cow;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::SpamdError;
use crate::protocol::codec::{StatusCode, RULE_RE, SPAM_RE, STATUS_RE};
use crate::protocol::commands::SpamdCommand;

const MAX_HEADERS: usize = 128;

/// Case-preserving header multi-map with case-insensitive lookup, as used
/// for RFC-822 style header blocks on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value stored under `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One matched spam heuristic. SYMBOLS replies carry names only, so score
/// and description stay textual and may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub score: String,
    pub name: String,
    pub description: String,
}

/// Rewritten message returned by HEADERS and PROCESS.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// A fully materialized reply from the spamd server.
#[derive(Debug, Clone, PartialEq)]
pub struct SpamdReply {
    /// Command the request was issued with, echoed back to the caller
    pub command: SpamdCommand,
    pub status_code: StatusCode,
    /// The matched status line, verbatim
    pub status_line: String,
    /// Protocol version the server answered with
    pub version: String,
    pub is_spam: bool,
    pub score: f64,
    pub base_score: f64,
    pub headers: HeaderMap,
    /// Rewritten message, for the commands that return one
    pub message: Option<Message>,
    /// Reply body bytes, populated only under raw-body capture
    pub raw: Bytes,
    pub rules: Vec<Rule>,
}

impl SpamdReply {
    /// One-line summary of a non-EX_OK reply, used by the status error.
    pub fn status_message(&self) -> String {
        format!(
            "Server returned {}: {}",
            self.status_code,
            self.status_code.description()
        )
    }

    pub(crate) fn new(command: SpamdCommand) -> Self {
        Self {
            command,
            status_code: StatusCode::ExOk,
            status_line: String::new(),
            version: String::new(),
            is_spam: false,
            score: 0.0,
            base_score: 0.0,
            headers: HeaderMap::default(),
            message: None,
            raw: Bytes::new(),
            rules: Vec::new(),
        }
    }
}

/// Parse the fully drained reply bytes for `command`.
///
/// The reply state machine: status line, then MIME-style headers, then a
/// command-specific body shape. PING completes after the status line, TELL
/// after the headers. SKIP tolerates an absent reply. A non-EX_OK status
/// terminates parsing after the header phase, delivering the reply inside
/// the error.
pub(crate) fn parse_reply(
    command: SpamdCommand,
    data: &[u8],
    want_raw: bool,
) -> Result<SpamdReply, SpamdError> {
    if data.is_empty() {
        if command == SpamdCommand::Skip {
            return Ok(SpamdReply::new(command));
        }
        return Err(SpamdError::EmptyResponse);
    }

    let (status, rest) = split_line(data);
    let status = std::str::from_utf8(status)
        .map_err(|_| SpamdError::Protocol(String::from_utf8_lossy(status).into_owned()))?;
    let caps = STATUS_RE
        .captures(status)
        .ok_or_else(|| SpamdError::Protocol(status.to_string()))?;

    let mut reply = SpamdReply::new(command);
    reply.version = caps["version"].to_string();
    reply.status_code = StatusCode::from_mnemonic(&caps["message"]);
    reply.status_line = status.to_string();

    if command == SpamdCommand::Ping {
        return check_status(reply);
    }

    let (header_len, headers) = parse_header_block(rest)?;
    reply.headers = headers;
    let mut reply = check_status(reply)?;

    if command == SpamdCommand::Tell {
        return Ok(reply);
    }

    if command.expects_verdict() {
        parse_spam_header(&mut reply)?;

        let body = &rest[header_len..];
        match command {
            SpamdCommand::Headers | SpamdCommand::Process => {
                parse_message(&mut reply, body, want_raw)?
            }
            SpamdCommand::Report | SpamdCommand::ReportIfSpam => {
                parse_report(&mut reply, body, want_raw)?
            }
            SpamdCommand::Symbols => parse_symbols(&mut reply, body, want_raw),
            // CHECK returns status and headers only.
            _ => {}
        }
    }

    Ok(reply)
}

fn check_status(reply: SpamdReply) -> Result<SpamdReply, SpamdError> {
    if reply.status_code != StatusCode::ExOk {
        return Err(SpamdError::Status {
            reply: Box::new(reply),
        });
    }
    Ok(reply)
}

/// Split off the first line, excluding its terminator.
fn split_line(data: &[u8]) -> (&[u8], &[u8]) {
    match data.iter().position(|&b| b == b'\n') {
        Some(i) => {
            let line = &data[..i];
            (line.strip_suffix(b"\r").unwrap_or(line), &data[i + 1..])
        }
        None => (data, &[]),
    }
}

/// Parse an RFC-822 style header block, returning the number of bytes it
/// occupied (terminating blank line included).
fn parse_header_block(data: &[u8]) -> Result<(usize, HeaderMap), SpamdError> {
    if data.is_empty() {
        return Ok((0, HeaderMap::default()));
    }

    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    match httparse::parse_headers(data, &mut storage) {
        Ok(httparse::Status::Complete((len, parsed))) => {
            let mut headers = HeaderMap::default();
            for header in parsed {
                headers.append(header.name, String::from_utf8_lossy(header.value));
            }
            Ok((len, headers))
        }
        Ok(httparse::Status::Partial) => Err(SpamdError::Protocol(
            String::from_utf8_lossy(data).trim_end().to_string(),
        )),
        Err(err) => Err(SpamdError::Protocol(err.to_string())),
    }
}

/// Populate the verdict fields from the `Spam:` reply header.
fn parse_spam_header(reply: &mut SpamdReply) -> Result<(), SpamdError> {
    let line = reply.headers.get("Spam").unwrap_or_default();
    let caps = SPAM_RE
        .captures(line)
        .ok_or_else(|| SpamdError::Protocol(line.to_string()))?;

    let verdict = &caps["isspam"];
    reply.is_spam =
        verdict.eq_ignore_ascii_case("true") || verdict.eq_ignore_ascii_case("yes");
    reply.score = caps["score"]
        .parse()
        .map_err(|e: std::num::ParseFloatError| SpamdError::Protocol(e.to_string()))?;
    reply.base_score = caps["basescore"]
        .parse()
        .map_err(|e: std::num::ParseFloatError| SpamdError::Protocol(e.to_string()))?;
    Ok(())
}

fn trim_line(line: &[u8]) -> Cow<'_, str> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line)
}

/// A continuation line starts with two or more spaces followed by a
/// non-space character.
fn is_continuation(line: &[u8]) -> bool {
    let trailing = line
        .iter()
        .position(|&b| b != b' ')
        .map(|i| (i, &line[i..]))
        .filter(|(i, _)| *i >= 2);
    matches!(trailing, Some((_, rest)) if !rest.is_empty() && !rest[0].is_ascii_whitespace())
}

fn rule_from(caps: &regex::Captures<'_>) -> Rule {
    Rule {
        score: caps["score"].to_string(),
        name: caps["name"].to_string(),
        description: caps["desc"].to_string(),
    }
}

/// HEADERS / PROCESS body: rewritten message headers plus message body.
/// Lines equal to `\r\n` are not copied into the body; everything after a
/// `----` delimiter line is additionally probed for scored rules.
fn parse_message(
    reply: &mut SpamdReply,
    body: &[u8],
    want_raw: bool,
) -> Result<(), SpamdError> {
    if want_raw {
        reply.raw = Bytes::copy_from_slice(body);
    }

    let (header_len, headers) = parse_header_block(body)?;
    let mut message = Message {
        headers,
        body: Vec::new(),
    };

    let mut in_rules = false;
    for line in body[header_len..].split_inclusive(|&b| b == b'\n') {
        if !in_rules && line.starts_with(b"----") {
            in_rules = true;
        }
        if in_rules {
            if let Some(caps) = RULE_RE.captures(&trim_line(line)) {
                reply.rules.push(rule_from(&caps));
            }
        }
        if line == b"\r\n" {
            continue;
        }
        message.body.extend_from_slice(line);
    }

    reply.message = Some(message);
    Ok(())
}

/// REPORT / REPORT_IFSPAM body: a rule table between `----` delimiter
/// lines. Wrapped descriptions are joined with their continuation line
/// before matching; a non-matching line inside the block is a protocol
/// error.
fn parse_report(reply: &mut SpamdReply, body: &[u8], want_raw: bool) -> Result<(), SpamdError> {
    let mut raw = Vec::new();
    let mut lines = body.split_inclusive(|&b| b == b'\n').peekable();
    let mut in_block = false;
    let mut closed = false;

    while let Some(line) = lines.next() {
        if want_raw {
            raw.extend_from_slice(line);
        }
        let mut text = trim_line(line).into_owned();
        if !text.trim().is_empty() {
            if let Some(next) = lines.peek() {
                if is_continuation(next) {
                    let next = lines.next().unwrap();
                    if want_raw {
                        raw.extend_from_slice(next);
                    }
                    text.push('\n');
                    text.push_str(&trim_line(next));
                }
            }
        }

        if !in_block {
            if text.starts_with("----") {
                in_block = true;
            }
            continue;
        }
        if closed || text.trim().is_empty() {
            continue;
        }
        if text.starts_with("----") {
            closed = true;
            continue;
        }

        let caps = RULE_RE
            .captures(&text)
            .ok_or_else(|| SpamdError::Protocol(text.clone()))?;
        reply.rules.push(rule_from(&caps));
    }

    if want_raw {
        reply.raw = raw.into();
    }
    Ok(())
}

/// SYMBOLS body: one line of comma-separated rule names.
fn parse_symbols(reply: &mut SpamdReply, body: &[u8], want_raw: bool) {
    let line = body
        .split_inclusive(|&b| b == b'\n')
        .next()
        .unwrap_or_default();
    if want_raw {
        reply.raw = Bytes::copy_from_slice(line);
    }

    let names = trim_line(line);
    if names.is_empty() {
        return;
    }
    for name in names.split(',') {
        reply.rules.push(Rule {
            score: String::new(),
            name: name.to_string(),
            description: String::new(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_map_lookup() {
        let mut headers = HeaderMap::default();
        headers.append("Spam", "True ; 7.3 / 5.0");
        headers.append("Content-Length", "42");
        headers.append("X-Multi", "one");
        headers.append("X-Multi", "two");

        assert_eq!(headers.get("spam"), Some("True ; 7.3 / 5.0"));
        assert_eq!(headers.get("content-length"), Some("42"));
        assert_eq!(headers.get_all("x-multi").collect::<Vec<_>>(), ["one", "two"]);
        assert_eq!(headers.get("missing"), None);
        // Case is preserved on iteration.
        assert_eq!(headers.iter().next(), Some(("Spam", "True ; 7.3 / 5.0")));
    }

    #[test]
    fn check_reply_with_verdict() {
        let data = b"SPAMD/1.5 0 EX_OK\r\nSpam: True ; 7.3 / 5.0\r\n\r\n";
        let reply = parse_reply(SpamdCommand::Check, data, false).unwrap();

        assert_eq!(reply.status_code, StatusCode::ExOk);
        assert_eq!(reply.status_line, "SPAMD/1.5 0 EX_OK");
        assert_eq!(reply.version, "1.5");
        assert!(reply.is_spam);
        assert_eq!(reply.score, 7.3);
        assert_eq!(reply.base_score, 5.0);
        assert!(reply.rules.is_empty());
        assert!(reply.raw.is_empty());
        assert!(reply.message.is_none());
    }

    #[test]
    fn ham_verdict_with_negative_score() {
        let data = b"SPAMD/1.5 0 EX_OK\r\nSpam: False ; -1.2 / 5.0\r\n\r\n";
        let reply = parse_reply(SpamdCommand::Check, data, false).unwrap();
        assert!(!reply.is_spam);
        assert_eq!(reply.score, -1.2);
    }

    #[test]
    fn ping_reply_answers_with_pong() {
        let reply = parse_reply(SpamdCommand::Ping, b"SPAMD/1.5 0 PONG\r\n", false).unwrap();
        assert_eq!(reply.status_code, StatusCode::ExOk);
        assert_eq!(reply.version, "1.5");
        assert!(reply.headers.is_empty());
    }

    #[test]
    fn empty_reply_is_tolerated_for_skip_only() {
        let reply = parse_reply(SpamdCommand::Skip, b"", false).unwrap();
        assert_eq!(reply.command, SpamdCommand::Skip);

        let err = parse_reply(SpamdCommand::Check, b"", false).unwrap_err();
        assert!(matches!(err, SpamdError::EmptyResponse));
        assert_eq!(err.to_string(), "Failed to read server response");
    }

    #[test]
    fn malformed_status_line() {
        let err = parse_reply(SpamdCommand::Check, b"SPAMD/oops\r\n", false).unwrap_err();
        assert_eq!(err.to_string(), "Invalid server response: SPAMD/oops");
    }

    #[test]
    fn non_ok_status_delivers_reply_inside_error() {
        let data = b"SPAMD/1.5 76 EX_PROTOCOL\r\n\r\n";
        let err = parse_reply(SpamdCommand::Check, data, false).unwrap_err();
        match err {
            SpamdError::Status { reply } => {
                assert_eq!(reply.status_code, StatusCode::ExProtocol);
                assert!(!reply.status_code.is_temporary());
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let data = b"SPAMD/1.5 75 EX_TEMPFAIL\r\n\r\n";
        let err = parse_reply(SpamdCommand::Check, data, false).unwrap_err();
        assert!(err.is_temporary());
    }

    #[test]
    fn tell_reply_stops_after_headers() {
        let data = b"SPAMD/1.5 0 EX_OK\r\nDidSet: local\r\n\r\n";
        let reply = parse_reply(SpamdCommand::Tell, data, false).unwrap();
        assert_eq!(reply.headers.get("DidSet"), Some("local"));
        assert!(reply.rules.is_empty());
        assert!(reply.message.is_none());
    }

    #[test]
    fn missing_spam_header_is_a_protocol_error() {
        let data = b"SPAMD/1.5 0 EX_OK\r\nContent-length: 0\r\n\r\n";
        let err = parse_reply(SpamdCommand::Check, data, false).unwrap_err();
        assert_eq!(err.to_string(), "Invalid server response: ");
    }

    #[test]
    fn symbols_reply() {
        let data = b"SPAMD/1.5 0 EX_OK\r\nSpam: True ; 7.3 / 5.0\r\n\r\nFOO,BAR,BAZ\n";
        let reply = parse_reply(SpamdCommand::Symbols, data, false).unwrap();

        let names: Vec<&str> = reply.rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["FOO", "BAR", "BAZ"]);
        for rule in &reply.rules {
            assert!(rule.score.is_empty());
            assert!(rule.description.is_empty());
        }
    }

    #[test]
    fn symbols_reply_with_empty_body() {
        let data = b"SPAMD/1.5 0 EX_OK\r\nSpam: False ; 0.0 / 5.0\r\n\r\n";
        let reply = parse_reply(SpamdCommand::Symbols, data, false).unwrap();
        assert!(reply.rules.is_empty());
    }

    #[test]
    fn symbols_raw_capture() {
        let data = b"SPAMD/1.5 0 EX_OK\r\nSpam: True ; 7.3 / 5.0\r\n\r\nFOO,BAR\n";
        let reply = parse_reply(SpamdCommand::Symbols, data, true).unwrap();
        assert_eq!(reply.raw.as_ref(), b"FOO,BAR\n");
    }

    const REPORT: &[u8] = b"SPAMD/1.5 0 EX_OK\r\n\
        Spam: True ; 1000.0 / 5.0\r\n\
        \r\n\
        Spam detection software, running on the system \"spamd.example.com\",\n\
        has identified this incoming email as possible spam.\n\
        \n\
        Content analysis details:   (1000.0 points, 5.0 required)\n\
        \n\
        pts rule name              description\n\
        ---- ---------------------- --------------------------------------------------\n\
        -0.0 NO_RELAYS              Informational: message was not relayed via SMTP\n\
        1000 GTUBE                  BODY: Generic Test for Unsolicited Bulk Email\n\
        -0.0 NO_RECEIVED            Informational: message has no Received headers\n\
        0.5 LONG_SUBJ              Subject is unusually long and keeps\n\
        \x20\x20going on the next line\n";

    #[test]
    fn report_reply_extracts_rules() {
        let reply = parse_reply(SpamdCommand::Report, REPORT, false).unwrap();

        let names: Vec<&str> = reply.rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["NO_RELAYS", "GTUBE", "NO_RECEIVED", "LONG_SUBJ"]);
        assert_eq!(reply.rules[0].score, "-0.0");
        assert_eq!(reply.rules[1].score, "1000");
        assert_eq!(
            reply.rules[3].description,
            "Subject is unusually long and keeps\n  going on the next line"
        );
        assert!(reply.raw.is_empty());
    }

    #[test]
    fn report_raw_capture_keeps_every_line() {
        let reply = parse_reply(SpamdCommand::Report, REPORT, true).unwrap();
        let body_at = REPORT
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .unwrap()
            + 4;
        assert_eq!(reply.raw.as_ref(), &REPORT[body_at..]);
    }

    #[test]
    fn report_with_bad_rule_line_carries_the_line() {
        let data = b"SPAMD/1.5 0 EX_OK\r\n\
            Spam: True ; 7.0 / 5.0\r\n\
            \r\n\
            preamble\n\
            ---- ----\n\
            not a rule line\n";
        let err = parse_reply(SpamdCommand::Report, data, false).unwrap_err();
        assert_eq!(err.to_string(), "Invalid server response: not a rule line");
    }

    #[test]
    fn report_second_delimiter_closes_the_block() {
        let data = b"SPAMD/1.5 0 EX_OK\r\n\
            Spam: True ; 7.0 / 5.0\r\n\
            \r\n\
            ---- ----\n\
            1.0 SOME_RULE some description\n\
            ---- ----\n\
            trailing text that is not a rule\n";
        let reply = parse_reply(SpamdCommand::Report, data, false).unwrap();
        assert_eq!(reply.rules.len(), 1);
        assert_eq!(reply.rules[0].name, "SOME_RULE");
    }

    #[test]
    fn report_without_delimiter_has_no_rules() {
        let data = b"SPAMD/1.5 0 EX_OK\r\n\
            Spam: False ; 0.0 / 5.0\r\n\
            \r\n\
            This message was not identified as spam.\n";
        let reply = parse_reply(SpamdCommand::ReportIfSpam, data, false).unwrap();
        assert!(reply.rules.is_empty());
    }

    const PROCESS: &[u8] = b"SPAMD/1.5 0 EX_OK\r\n\
        Spam: True ; 7.3 / 5.0\r\n\
        Content-length: 188\r\n\
        \r\n\
        Received: from localhost by spamd.example.com\r\n\
        Subject: [SPAM] hello\r\n\
        X-Spam-Flag: YES\r\n\
        \r\n\
        original body line one\r\n\
        ---- ----\n\
        1.2 SOME_RULE some description\n";

    #[test]
    fn process_reply_parses_message() {
        let reply = parse_reply(SpamdCommand::Process, PROCESS, false).unwrap();

        let message = reply.message.as_ref().unwrap();
        assert_eq!(message.headers.get("subject"), Some("[SPAM] hello"));
        assert_eq!(message.headers.get("X-Spam-Flag"), Some("YES"));
        // Lines equal to CRLF are elided from the body.
        assert_eq!(
            message.body,
            b"original body line one\r\n---- ----\n1.2 SOME_RULE some description\n"
        );
        assert_eq!(reply.rules.len(), 1);
        assert_eq!(reply.rules[0].name, "SOME_RULE");
        assert!(reply.raw.is_empty());
    }

    #[test]
    fn process_raw_capture_preserves_message_bytes() {
        let reply = parse_reply(SpamdCommand::Process, PROCESS, true).unwrap();
        let body_at = PROCESS
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .unwrap()
            + 4;
        assert_eq!(reply.raw.as_ref(), &PROCESS[body_at..]);
        // Parsing is unchanged under raw capture.
        assert!(reply.message.is_some());
        assert_eq!(reply.rules.len(), 1);
    }
}
