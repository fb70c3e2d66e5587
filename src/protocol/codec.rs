//! Compiled wire patterns and the spamd status code table.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// `SPAMD/<version> <code> <mnemonic>` status line.
pub(crate) static STATUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^SPAMD/(?P<version>[0-9.]+)\s(?P<code>[0-9]+)\s(?P<message>[0-9A-Z_]+)$")
        .expect("status line pattern")
});

/// Value of the `Spam:` reply header: verdict, score, base score.
pub(crate) static SPAM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<isspam>True|False|Yes|No)\s;\s(?P<score>-?[0-9.]+)\s/\s(?P<basescore>[0-9.]+)")
        .expect("spam header pattern")
});

/// One scored rule line of a report, with an optional continuation line
/// indented by two or more spaces.
pub(crate) static RULE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?P<score>-?[0-9]+\.?[0-9]?)\s+(?P<name>[A-Z0-9_]+)\s+(?P<desc>\S.*(?:\n\s{2,}\S.*)?)$")
        .expect("rule line pattern")
});

/// Status codes spamd answers with, mirroring classical sysexits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StatusCode {
    #[default]
    ExOk = 0,
    ExUsage = 64,
    ExDataErr = 65,
    ExNoInput = 66,
    ExNoUser = 67,
    ExNoHost = 68,
    ExUnavailable = 69,
    ExSoftware = 70,
    ExOsErr = 71,
    ExOsFile = 72,
    ExCantCreat = 73,
    ExIoErr = 74,
    ExTempFail = 75,
    ExProtocol = 76,
    ExNoPerm = 77,
    ExConfig = 78,
    ExTimeout = 79,
}

impl StatusCode {
    /// Map a reply mnemonic to its code. Unknown mnemonics map to EX_OK;
    /// PING replies answer with PONG and rely on this.
    pub fn from_mnemonic(s: &str) -> StatusCode {
        match s {
            "EX_USAGE" => StatusCode::ExUsage,
            "EX_DATAERR" => StatusCode::ExDataErr,
            "EX_NOINPUT" => StatusCode::ExNoInput,
            "EX_NOUSER" => StatusCode::ExNoUser,
            "EX_NOHOST" => StatusCode::ExNoHost,
            "EX_UNAVAILABLE" => StatusCode::ExUnavailable,
            "EX_SOFTWARE" => StatusCode::ExSoftware,
            "EX_OSERR" => StatusCode::ExOsErr,
            "EX_OSFILE" => StatusCode::ExOsFile,
            "EX_CANTCREAT" => StatusCode::ExCantCreat,
            "EX_IOERR" => StatusCode::ExIoErr,
            "EX_TEMPFAIL" => StatusCode::ExTempFail,
            "EX_PROTOCOL" => StatusCode::ExProtocol,
            "EX_NOPERM" => StatusCode::ExNoPerm,
            "EX_CONFIG" => StatusCode::ExConfig,
            "EX_TIMEOUT" => StatusCode::ExTimeout,
            _ => StatusCode::ExOk,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            StatusCode::ExOk => "EX_OK",
            StatusCode::ExUsage => "EX_USAGE",
            StatusCode::ExDataErr => "EX_DATAERR",
            StatusCode::ExNoInput => "EX_NOINPUT",
            StatusCode::ExNoUser => "EX_NOUSER",
            StatusCode::ExNoHost => "EX_NOHOST",
            StatusCode::ExUnavailable => "EX_UNAVAILABLE",
            StatusCode::ExSoftware => "EX_SOFTWARE",
            StatusCode::ExOsErr => "EX_OSERR",
            StatusCode::ExOsFile => "EX_OSFILE",
            StatusCode::ExCantCreat => "EX_CANTCREAT",
            StatusCode::ExIoErr => "EX_IOERR",
            StatusCode::ExTempFail => "EX_TEMPFAIL",
            StatusCode::ExProtocol => "EX_PROTOCOL",
            StatusCode::ExNoPerm => "EX_NOPERM",
            StatusCode::ExConfig => "EX_CONFIG",
            StatusCode::ExTimeout => "EX_TIMEOUT",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            StatusCode::ExOk => "Success",
            StatusCode::ExUsage => "Command line usage error",
            StatusCode::ExDataErr => "Data format error",
            StatusCode::ExNoInput => "Cannot open input",
            StatusCode::ExNoUser => "Addressee unknown",
            StatusCode::ExNoHost => "Host name unknown",
            StatusCode::ExUnavailable => "Service unavailable",
            StatusCode::ExSoftware => "Internal software error",
            StatusCode::ExOsErr => "System error",
            StatusCode::ExOsFile => "Critical OS file missing",
            StatusCode::ExCantCreat => "Can't create (user) output file",
            StatusCode::ExIoErr => "Input/output error",
            StatusCode::ExTempFail => "Temp failure; user is invited to retry",
            StatusCode::ExProtocol => "Remote error in protocol",
            StatusCode::ExNoPerm => "Permission denied",
            StatusCode::ExConfig => "Configuration error",
            StatusCode::ExTimeout => "Read timeout",
        }
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    /// Whether the condition is transient and worth retrying.
    pub fn is_temporary(self) -> bool {
        matches!(self, StatusCode::ExTempFail | StatusCode::ExTimeout)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}
