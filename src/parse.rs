use std::collections::HashMap;
use std::fmt;

use mailparse::{MailAddr, MailHeaderMap, addrparse, parse_headers};

use crate::error::{HeaderError, VerifyError};

/// Headers searched for a DKIM signature, in order of preference.
pub const DKIM_HEADERS: [&str; 2] = ["Dkim-Signature", "X-Google-Dkim-Signature"];

/// Tag/value pairs of a DKIM signature header (`s`, `d`, `v`, ...).
pub type DkimParams = HashMap<String, String>;

/// A validated `local@domain` address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    local: String,
    domain: String,
}

impl Address {
    /// Validates a bare address, requiring exactly one `@`.
    pub fn parse(address: &str) -> Result<Self, VerifyError> {
        let domain = extract_domain(address)?;
        let local = &address[..address.len() - domain.len() - 1];
        Ok(Self {
            local: local.to_string(),
            domain: domain.to_string(),
        })
    }

    /// Accepts either a bare address or a display form such as
    /// `Alice <alice@example.com>`.
    pub fn from_mailbox(mailbox: &str) -> Result<Self, VerifyError> {
        let list = addrparse(mailbox).map_err(|_| VerifyError::MalformedAddress {
            address: mailbox.to_string(),
            reason: "not a valid mailbox",
        })?;
        match list.iter().next() {
            Some(MailAddr::Single(info)) if list.len() == 1 => Self::parse(&info.addr),
            _ => Err(VerifyError::MalformedAddress {
                address: mailbox.to_string(),
                reason: "expected a single mailbox",
            }),
        }
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

/// Returns the part of `address` after its single `@`, case preserved.
pub fn extract_domain(address: &str) -> Result<&str, VerifyError> {
    let mut parts = address.split('@');
    let _local = parts.next();
    match (parts.next(), parts.next()) {
        (None, _) => Err(VerifyError::MalformedAddress {
            address: address.to_string(),
            reason: "no @ character",
        }),
        (Some(_), Some(_)) => Err(VerifyError::MalformedAddress {
            address: address.to_string(),
            reason: "too many @ characters",
        }),
        (Some(domain), None) => Ok(domain),
    }
}

/// Result of looking for a DKIM signature in the message headers.
#[derive(Debug, PartialEq)]
pub enum DkimHeader {
    Found {
        header: &'static str,
        params: DkimParams,
    },
    Missing,
}

/// Parses only the header block of `raw` and picks the first DKIM
/// signature header present.
pub fn find_dkim_header(raw: &[u8]) -> Result<DkimHeader, HeaderError> {
    check_header_block(raw)?;
    let (headers, _) = parse_headers(raw).map_err(|e| HeaderError::Parse(e.to_string()))?;
    for name in DKIM_HEADERS {
        match headers.get_first_value(name) {
            Some(value) if !value.is_empty() => {
                return Ok(DkimHeader::Found {
                    header: name,
                    params: parse_dkim_params(&value),
                });
            }
            _ => continue,
        }
    }
    Ok(DkimHeader::Missing)
}

/// Rejects header blocks a strict RFC 5322 reader would refuse: an empty
/// message, a folded first line, or a field line without a `:`.
fn check_header_block(raw: &[u8]) -> Result<(), HeaderError> {
    if raw.is_empty() {
        return Err(HeaderError::Empty);
    }
    for (i, line) in raw.split(|b| *b == b'\n').enumerate() {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let malformed = match line.first().copied() {
            None => break,
            Some(b' ' | b'\t') => i == 0,
            Some(_) => !line.contains(&b':'),
        };
        if malformed {
            return Err(HeaderError::MalformedLine {
                line: i + 1,
                text: String::from_utf8_lossy(line).into_owned(),
            });
        }
    }
    Ok(())
}

/// Splits a signature header into its `tag=value` pairs.
///
/// Segments that do not contain exactly one `=` are dropped.
pub fn parse_dkim_params(value: &str) -> DkimParams {
    let mut params = DkimParams::new();
    for segment in value.split(';') {
        let mut kv = segment.trim().splitn(3, '=');
        if let (Some(key), Some(val), None) = (kv.next(), kv.next(), kv.next()) {
            if !key.is_empty() {
                params.insert(key.to_string(), val.to_string());
            }
        }
    }
    params
}
