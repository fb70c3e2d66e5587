//! Commands that can be sent to the server

use std::fmt;

use serde::{Deserialize, Serialize};

/// Protocol version spoken on the request line.
pub const PROTOCOL_VERSION: &str = "1.5";

/// Commands that can be sent to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SpamdCommand {
    #[default]
    Check,
    Headers,
    Ping,
    Process,
    Report,
    ReportIfSpam,
    Skip,
    Symbols,
    Tell,
}

/// Protocol headers a request may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpamdHeader {
    Compress,
    User,
    ContentLength,
    MessageClass,
    Remove,
    Set,
}

/// Actions a TELL request can ask the server to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TellAction {
    Learn,
    Forget,
    Report,
    Revoke,
}

/// Classification a TELL request assigns to the message. `None` is the
/// unset state and is rejected before any bytes hit the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MessageClass {
    #[default]
    None,
    Ham,
    Spam,
}

impl SpamdCommand {
    pub fn wire_name(self) -> &'static str {
        match self {
            SpamdCommand::Check => "CHECK",
            SpamdCommand::Headers => "HEADERS",
            SpamdCommand::Ping => "PING",
            SpamdCommand::Process => "PROCESS",
            SpamdCommand::Report => "REPORT",
            SpamdCommand::ReportIfSpam => "REPORT_IFSPAM",
            SpamdCommand::Skip => "SKIP",
            SpamdCommand::Symbols => "SYMBOLS",
            SpamdCommand::Tell => "TELL",
        }
    }

    /// Whether this command carries the given protocol header.
    pub fn uses_header(self, header: SpamdHeader) -> bool {
        match self {
            SpamdCommand::Ping | SpamdCommand::Skip => false,
            SpamdCommand::Tell => true,
            _ => matches!(
                header,
                SpamdHeader::Compress | SpamdHeader::User | SpamdHeader::ContentLength
            ),
        }
    }

    /// The request line, terminator included.
    pub fn request_line(self) -> String {
        format!("{} SPAMC/{}\r\n", self.wire_name(), PROTOCOL_VERSION)
    }

    /// Whether the reply carries a `Spam:` verdict header. True for the
    /// scanning commands; PING, SKIP and TELL replies have none.
    pub fn expects_verdict(self) -> bool {
        !matches!(
            self,
            SpamdCommand::Ping | SpamdCommand::Skip | SpamdCommand::Tell
        )
    }
}

impl fmt::Display for SpamdCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl SpamdHeader {
    pub fn wire_name(self) -> &'static str {
        match self {
            SpamdHeader::Compress => "Compress",
            SpamdHeader::User => "User",
            SpamdHeader::ContentLength => "Content-length",
            SpamdHeader::MessageClass => "Message-class",
            SpamdHeader::Remove => "Remove",
            SpamdHeader::Set => "Set",
        }
    }
}

impl fmt::Display for SpamdHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl MessageClass {
    pub fn wire_name(self) -> &'static str {
        match self {
            MessageClass::None => "",
            MessageClass::Ham => "ham",
            MessageClass::Spam => "spam",
        }
    }

    pub fn is_set(self) -> bool {
        !matches!(self, MessageClass::None)
    }
}

/// Everything needed to frame the head of a request: the request line, the
/// header block, and the blank line separating it from the body.
#[derive(Debug, Clone)]
pub(crate) struct RequestFrame<'a> {
    pub command: SpamdCommand,
    /// Uncompressed body length; the emitted value adds the trailing CRLF.
    pub content_length: Option<u64>,
    pub user: Option<&'a str>,
    pub compress: bool,
    pub tell: Option<(TellAction, MessageClass)>,
}

impl RequestFrame<'_> {
    /// Whether the body will be run through the zlib encoder. Kept as the
    /// single source of truth for both the Compress header and the body
    /// framing.
    pub fn compresses(&self) -> bool {
        self.compress && self.command.uses_header(SpamdHeader::Compress)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.command.request_line().into_bytes();

        // Content-length needs to be sent first
        if let Some(len) = self.content_length {
            out.extend_from_slice(
                format!("{}: {}\r\n", SpamdHeader::ContentLength, len + 2).as_bytes(),
            );
        }
        if self.compresses() {
            out.extend_from_slice(format!("{}: zlib\r\n", SpamdHeader::Compress).as_bytes());
        }
        if let Some(user) = self.user.filter(|u| !u.is_empty()) {
            if self.command.uses_header(SpamdHeader::User) {
                out.extend_from_slice(format!("{}: {user}\r\n", SpamdHeader::User).as_bytes());
            }
        }
        if self.command == SpamdCommand::Tell {
            if let Some((action, class)) = self.tell {
                for (header, value) in tell_headers(action, class) {
                    out.extend_from_slice(format!("{header}: {value}\r\n").as_bytes());
                }
            }
        }

        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Headers a TELL action emits, in wire order.
fn tell_headers(action: TellAction, class: MessageClass) -> Vec<(SpamdHeader, &'static str)> {
    match action {
        TellAction::Learn => vec![
            (SpamdHeader::MessageClass, class.wire_name()),
            (SpamdHeader::Set, "local"),
        ],
        TellAction::Forget => vec![(SpamdHeader::Remove, "local")],
        TellAction::Report => vec![
            (SpamdHeader::MessageClass, MessageClass::Spam.wire_name()),
            (SpamdHeader::Set, "local, remote"),
        ],
        TellAction::Revoke => vec![
            (SpamdHeader::MessageClass, MessageClass::Ham.wire_name()),
            (SpamdHeader::Remove, "remote"),
            (SpamdHeader::Set, "local"),
        ],
    }
}
