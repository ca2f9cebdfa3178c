use crate::config::Config;
use crate::dns::MxRecord;
use crate::error::VerifyError;
use crate::parse::Address;
use crate::smtp::CertificateChain;

/// Everything gathered about a sender in one run.
///
/// Built once after probing and handed to the report generator by
/// reference; never modified afterwards.
#[derive(Debug)]
pub struct VerificationEvidence<'a> {
    /// The claimed sender the report goes back to.
    pub sender: &'a Address,

    /// Exchangers in the order they were tried.
    pub mx_list: &'a [MxRecord],

    /// The original message exactly as received.
    pub raw_message: &'a [u8],

    /// Peer chain from the STARTTLS handshake, leaf first. Empty means the
    /// session was never encrypted.
    pub certificates: CertificateChain,

    /// Text of the sender's DKIM key record, empty when none was found.
    pub dkim_key: String,
}

impl VerificationEvidence<'_> {
    pub fn tls_negotiated(&self) -> bool {
        !self.certificates.is_empty()
    }
}

/// Turns evidence into the finished response message.
pub trait ReportGenerator: Send + Sync {
    fn generate(
        &self,
        config: &Config,
        evidence: &VerificationEvidence<'_>,
    ) -> Result<Vec<u8>, VerifyError>;
}
