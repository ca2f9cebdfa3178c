pub mod config;
pub mod dkim;
pub mod dns;
pub mod error;
pub mod evidence;
pub mod logging;
pub mod parse;
pub mod pipeline;
pub mod report;
pub mod smtp;

pub use config::Config;
pub use dkim::{DkimLocator, DkimOutcome};
pub use dns::{DnsResolver, MxRecord, resolve_mx_hosts};
pub use error::{SmtpError, VerifyError};
pub use evidence::{ReportGenerator, VerificationEvidence};
pub use parse::{Address, extract_domain};
pub use pipeline::{Disposition, RunMode, Verifier};
pub use report::PlainReport;
pub use smtp::{SmtpDialer, probe_and_connect, tls_connector, transmit};
