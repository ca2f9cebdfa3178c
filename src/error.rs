use std::fmt;

use thiserror::Error;
use trust_dns_resolver::error::ResolveError;
use trust_dns_resolver::proto::op::ResponseCode;

/// Errors surfaced by the verification pipeline.
///
/// Only `ResolverConfigError` and `DKIMLookupFailure` are downgraded to
/// warnings by the pipeline; every other variant aborts the run.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("malformed address '{address}': {reason}")]
    MalformedAddress { address: String, reason: &'static str },

    #[error("failed to lookup MX for domain ({domain}): {cause}")]
    ResolutionFailure { domain: String, cause: String },

    #[error("failed to connect to any MX for domain '{domain}'{}", FormatAttempts(.attempts))]
    NoReachableMX {
        domain: String,
        attempts: Vec<HostAttempt>,
    },

    #[error("failed to load DNS config from {path}: {cause}")]
    ResolverConfigError { path: String, cause: String },

    #[error("DKIM lookup s={selector} d={domain}: {reason}")]
    DKIMLookupFailure {
        selector: String,
        domain: String,
        reason: DkimFailure,
    },

    #[error("failed to generate report: {0}")]
    ReportGenerationFailure(String),

    #[error("failed to transmit report: {0}")]
    TransmissionFailure(#[from] SmtpError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl VerifyError {
    pub(crate) fn resolution(domain: &str, err: ResolveError) -> Self {
        VerifyError::ResolutionFailure {
            domain: domain.to_string(),
            cause: err.to_string(),
        }
    }
}

/// Why a DKIM key lookup was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DkimFailure {
    /// The query itself could not be built or exchanged.
    Exchange(String),
    ResponseCode(ResponseCode),
    EmptyAnswer,
    UnexpectedRecordType(String),
}

impl fmt::Display for DkimFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DkimFailure::Exchange(msg) => write!(f, "failed TXT lookup: {}", msg),
            DkimFailure::ResponseCode(code) => {
                write!(f, "response code is not NoError: rcode={}", u16::from(*code))
            }
            DkimFailure::EmptyAnswer => f.write_str("response has empty answer section"),
            DkimFailure::UnexpectedRecordType(rtype) => {
                write!(f, "unexpected record type {} in answer", rtype)
            }
        }
    }
}

/// The header block of a message could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("message is empty")]
    Empty,

    #[error("malformed header line {line}: {text:?}")]
    MalformedLine { line: usize, text: String },

    #[error("{0}")]
    Parse(String),
}

/// One failed connection attempt against a single MX host.
#[derive(Debug, Clone)]
pub struct HostAttempt {
    pub host: String,
    pub error: String,
}

struct FormatAttempts<'a>(&'a [HostAttempt]);

impl fmt::Display for FormatAttempts<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for attempt in self.0 {
            write!(f, "; {}: {}", attempt.host, attempt.error)?;
        }
        Ok(())
    }
}

/// Low level SMTP client errors.
#[derive(Debug, Error)]
pub enum SmtpError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out during {0}")]
    Timeout(&'static str),

    #[error("unexpected reply to {command}: {code} {message}")]
    UnexpectedReply {
        command: &'static str,
        code: u16,
        message: String,
    },

    #[error("malformed reply line: {0}")]
    MalformedReply(String),

    #[error("connection closed by server")]
    Closed,

    #[error("tls error: {0}")]
    Tls(String),
}
