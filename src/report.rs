use std::fmt::{self, Write};

use lettre::message::{Mailbox, Message, header::ContentType};
use mailparse::{MailHeaderMap, parse_headers};
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::error::VerifyError;
use crate::evidence::{ReportGenerator, VerificationEvidence};

/// Unsigned plain-text report listing the gathered evidence.
#[derive(Debug, Default)]
pub struct PlainReport;

impl PlainReport {
    pub fn body(evidence: &VerificationEvidence<'_>) -> Result<String, fmt::Error> {
        let mut body = String::new();
        writeln!(body, "Sender verification report for {}", evidence.sender)?;
        writeln!(body)?;

        if let Ok((headers, _)) = parse_headers(evidence.raw_message) {
            for name in ["Subject", "Message-ID", "Date"] {
                if let Some(value) = headers.get_first_value(name) {
                    writeln!(body, "{}: {}", name, value)?;
                }
            }
            writeln!(body)?;
        }

        writeln!(body, "Mail exchangers:")?;
        for mx in evidence.mx_list {
            writeln!(body, "  {:>5} {}", mx.preference, mx.hostname())?;
        }
        writeln!(body)?;

        if evidence.tls_negotiated() {
            writeln!(body, "STARTTLS: negotiated")?;
            writeln!(body, "Peer certificates (leaf first):")?;
            for (i, cert) in evidence.certificates.iter().enumerate() {
                let der: &[u8] = cert.as_ref();
                let digest = Sha256::digest(der);
                writeln!(body, "  [{}] SHA256 {}", i, hex::encode_upper(digest))?;
            }
        } else {
            writeln!(body, "STARTTLS: not negotiated, session was plaintext")?;
        }
        writeln!(body)?;

        if evidence.dkim_key.is_empty() {
            writeln!(body, "DKIM: no DKIM key found")?;
        } else {
            writeln!(body, "DKIM key record:")?;
            writeln!(body, "  {}", evidence.dkim_key)?;
        }
        Ok(body)
    }
}

impl ReportGenerator for PlainReport {
    fn generate(
        &self,
        config: &Config,
        evidence: &VerificationEvidence<'_>,
    ) -> Result<Vec<u8>, VerifyError> {
        let failure = |e: String| VerifyError::ReportGenerationFailure(e);
        let from: Mailbox = config
            .verify_address
            .to_string()
            .parse()
            .map_err(|e: lettre::address::AddressError| failure(e.to_string()))?;
        let to: Mailbox = evidence
            .sender
            .to_string()
            .parse()
            .map_err(|e: lettre::address::AddressError| failure(e.to_string()))?;

        let email = Message::builder()
            .from(from)
            .to(to)
            .subject(format!("Sender verification report for {}", evidence.sender))
            .header(ContentType::TEXT_PLAIN)
            .body(Self::body(evidence).map_err(|e| failure(e.to_string()))?)
            .map_err(|e| failure(e.to_string()))?;
        Ok(email.formatted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::MxRecord;
    use crate::parse::Address;
    use tokio_rustls::rustls::pki_types::CertificateDer;

    #[test]
    fn test_body_lists_evidence() {
        let sender = Address::parse("alice@example.com").unwrap();
        let mxs = vec![MxRecord::new(10, "mx1.example.com.")];
        let evidence = VerificationEvidence {
            sender: &sender,
            mx_list: &mxs,
            raw_message: b"Subject: hello\r\nMessage-ID: <1@example.com>\r\n\r\nhi",
            certificates: vec![CertificateDer::from(vec![1u8, 2, 3])],
            dkim_key: "v=DKIM1; p=abc".to_string(),
        };
        let body = PlainReport::body(&evidence).unwrap();
        assert!(body.contains("Subject: hello"));
        assert!(body.contains("mx1.example.com"));
        assert!(body.contains("STARTTLS: negotiated"));
        let fingerprint = hex::encode_upper(Sha256::digest([1u8, 2, 3]));
        assert!(body.contains(&fingerprint));
        assert!(body.contains("v=DKIM1; p=abc"));
    }

    #[test]
    fn test_body_reports_missing_evidence() {
        let sender = Address::parse("bob@example.org").unwrap();
        let evidence = VerificationEvidence {
            sender: &sender,
            mx_list: &[],
            raw_message: b"",
            certificates: vec![],
            dkim_key: String::new(),
        };
        let body = PlainReport::body(&evidence).unwrap();
        assert!(body.contains("not negotiated"));
        assert!(body.contains("no DKIM key found"));
    }

    #[test]
    fn test_generate_addresses_report_to_sender() {
        let config = Config {
            verify_address: Address::parse("verify@nyms.io").unwrap(),
            log_path: std::path::PathBuf::from("/dev/null"),
            public_key: Vec::new(),
            private_key: Vec::new(),
            dkim: None,
            network: crate::config::NetworkConfig::default(),
        };
        let sender = Address::parse("alice@example.com").unwrap();
        let mxs = vec![MxRecord::new(10, "mx1.example.com.")];
        let evidence = VerificationEvidence {
            sender: &sender,
            mx_list: &mxs,
            raw_message: b"Subject: hello\r\n\r\nhi",
            certificates: vec![],
            dkim_key: String::new(),
        };

        let payload = PlainReport.generate(&config, &evidence).unwrap();
        let text = String::from_utf8(payload).unwrap();
        assert!(text.contains("From: verify@nyms.io"));
        assert!(text.contains("To: alice@example.com"));
        assert!(text.contains("Subject: Sender verification report for alice@example.com"));
        assert!(text.contains("mx1.example.com"));
    }
}
