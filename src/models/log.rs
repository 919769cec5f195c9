use serde::Deserialize;
use std::fmt;

/// Account id the device reports for entries that are not tied to a user.
pub const UNASSIGNED_ACCOUNT_ID: &str = "0";

const PHONE_LOCAL_LEN: usize = 9;
const PHONE_COUNTRY_PREFIX: &str = "79";
const UNKNOWN_NAME: &str = "Unknown";
const UNKNOWN_NAME_PLACEHOLDER: &str = "?";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "i64")]
pub enum EntryType {
    Undefined,
    Call,
    Admin,
}

impl TryFrom<i64> for EntryType {
    type Error = String;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(EntryType::Undefined),
            1 => Ok(EntryType::Call),
            100 => Ok(EntryType::Admin),
            other => Err(format!("unknown log entry type code: {other}")),
        }
    }
}

impl EntryType {
    pub fn code(self) -> i64 {
        match self {
            EntryType::Undefined => 0,
            EntryType::Call => 1,
            EntryType::Admin => 100,
        }
    }

    fn sign(self) -> Option<&'static str> {
        match self {
            EntryType::Undefined => None,
            EntryType::Call => Some("\u{1F4DE}"),
            EntryType::Admin => Some("\u{1F4F1}"),
        }
    }
}

/// One record of the device activity log.
///
/// Identity is the tuple (`account_id`, `operation`, `occurred_at`,
/// `entry_type`, `serial_number`). Names, image flag and reason code are
/// display data and do not take part in equality.
#[derive(Debug, Clone, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "userId")]
    pub account_id: String,
    pub operation: String,
    #[serde(rename = "time")]
    pub occurred_at: i64,
    #[serde(rename = "firstname", default)]
    pub first_name: String,
    #[serde(rename = "lastname", default)]
    pub last_name: String,
    #[serde(rename = "image", default)]
    pub has_image: bool,
    #[serde(rename = "reason", default)]
    pub reason_code: i64,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    #[serde(rename = "sn", default)]
    pub serial_number: String,
}

impl PartialEq for LogEntry {
    fn eq(&self, other: &Self) -> bool {
        self.account_id == other.account_id
            && self.operation == other.operation
            && self.occurred_at == other.occurred_at
            && self.entry_type == other.entry_type
            && self.serial_number == other.serial_number
    }
}

impl Eq for LogEntry {}

impl LogEntry {
    /// First and last name joined by a space, skipping empty parts.
    pub fn full_name(&self) -> String {
        [self.first_name.as_str(), self.last_name.as_str()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn display_name(&self) -> String {
        let name = self.full_name();
        if name.is_empty() || name == UNKNOWN_NAME {
            UNKNOWN_NAME_PLACEHOLDER.to_string()
        } else {
            name
        }
    }

    /// Canonical phone number for display and call links.
    ///
    /// The serial number is authoritative when present or when the entry has
    /// no assigned account; otherwise the account id is used. Values shorter
    /// than nine digits are zero-padded to nine, and nine-digit values get the
    /// `79` country prefix. Longer values pass through untouched.
    pub fn phone_number(&self) -> String {
        let raw = if !self.serial_number.is_empty() || self.account_id == UNASSIGNED_ACCOUNT_ID {
            self.serial_number.as_str()
        } else {
            self.account_id.as_str()
        };
        normalize_phone_number(raw)
    }

    pub fn has_exceptional_reason(&self) -> bool {
        self.reason_code != 0
    }
}

pub fn normalize_phone_number(raw: &str) -> String {
    let len = raw.chars().count();
    if len > PHONE_LOCAL_LEN {
        return raw.to_string();
    }
    format!(
        "{PHONE_COUNTRY_PREFIX}{}{raw}",
        "0".repeat(PHONE_LOCAL_LEN - len)
    )
}

/// Renders the entry as one HTML line for a chat message.
impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pn = self.phone_number();
        write!(
            f,
            "{} <a href=\"tel:+{pn}\">{pn}</a>",
            escape_html(&self.display_name())
        )?;
        if let Some(sign) = self.entry_type.sign() {
            write!(f, " {sign}")?;
        }
        if self.has_exceptional_reason() {
            write!(f, " \u{274C}")?;
        }
        Ok(())
    }
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Raw polling result as returned by the feed.
///
/// Only [`crate::services::validator::validate`] should construct one; it
/// guarantees `status == "ok"`, no error flag and a non-empty log.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchResponse {
    pub log: Vec<LogEntry>,
    #[serde(default)]
    pub err: Option<bool>,
    #[serde(rename = "msg")]
    pub message: String,
    pub status: String,
}

impl FetchResponse {
    /// Newest entry of the feed.
    pub fn newest(&self) -> Option<&LogEntry> {
        self.log.first()
    }
}

#[cfg(test)]
pub(crate) fn entry(account_id: &str, occurred_at: i64) -> LogEntry {
    LogEntry {
        account_id: account_id.to_string(),
        operation: "open".to_string(),
        occurred_at,
        first_name: String::new(),
        last_name: String::new(),
        has_image: false,
        reason_code: 0,
        entry_type: EntryType::Call,
        serial_number: String::new(),
    }
}
