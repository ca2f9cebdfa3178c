use std::io::Write;

use crate::config::Config;
use crate::dkim::{DkimLocator, DkimOutcome};
use crate::dns::{ResolverTrait, resolve_mx_hosts};
use crate::error::{SmtpError, VerifyError};
use crate::evidence::{ReportGenerator, VerificationEvidence};
use crate::parse::Address;
use crate::smtp::{Dialer, MailSession, probe_and_connect, transmit};

/// Whether the finished report is sent or only written out locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Deliver,
    /// Write the report to the debug output instead of sending it.
    Debug,
}

/// How a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Transmitted,
    Dumped,
}

/// Probes a sender's infrastructure and answers them with the findings.
pub struct Verifier<R, D, G> {
    resolver: R,
    dialer: D,
    dkim: DkimLocator,
    reports: G,
    mode: RunMode,
    debug_out: Box<dyn Write + Send>,
}

impl<R, D, G> Verifier<R, D, G>
where
    R: ResolverTrait + Sync + Send,
    D: Dialer,
    G: ReportGenerator,
{
    pub fn new(
        resolver: R,
        dialer: D,
        dkim: DkimLocator,
        reports: G,
        mode: RunMode,
        debug_out: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            resolver,
            dialer,
            dkim,
            reports,
            mode,
            debug_out,
        }
    }

    /// Runs the whole verification for one message.
    ///
    /// The SMTP session opened for probing is the one the report is sent
    /// over, and it is closed exactly once whichever way this returns.
    pub async fn process(
        &mut self,
        config: &Config,
        sender: &Address,
        raw_message: &[u8],
    ) -> Result<Disposition, VerifyError> {
        let mx_list = resolve_mx_hosts(&self.resolver, sender.domain()).await?;

        let mut session = probe_and_connect(&self.dialer, &mx_list)
            .await
            .map_err(|attempts| VerifyError::NoReachableMX {
                domain: sender.domain().to_string(),
                attempts,
            })?;

        let dkim_key = self.dkim_evidence(raw_message).await;

        let evidence = VerificationEvidence {
            sender,
            mx_list: &mx_list,
            raw_message,
            certificates: session.peer_certificates(),
            dkim_key,
        };
        let payload = match self.reports.generate(config, &evidence) {
            Ok(payload) => payload,
            Err(e) => {
                close(session).await;
                return Err(e);
            }
        };

        if self.mode == RunMode::Debug {
            close(session).await;
            self.debug_out
                .write_all(&payload)
                .and_then(|_| self.debug_out.flush())
                .map_err(|e| VerifyError::TransmissionFailure(SmtpError::Io(e)))?;
            return Ok(Disposition::Dumped);
        }

        let from = config.verify_address.to_string();
        let result = transmit(&mut session, &from, &sender.to_string(), &payload).await;
        close(session).await;
        result?;
        log::info!("verification report sent to {}", sender);
        Ok(Disposition::Transmitted)
    }

    /// DKIM problems never abort the run; they only cost the key evidence.
    async fn dkim_evidence(&self, raw_message: &[u8]) -> String {
        match self.dkim.locate(raw_message).await {
            Ok(DkimOutcome::Key(key)) => key.record,
            Ok(DkimOutcome::Unparseable(e)) => {
                log::warn!(
                    "DKIM: could not extract DKIM selector because mail could not be parsed: {}",
                    e
                );
                String::new()
            }
            Ok(DkimOutcome::NoSignature) => {
                log::debug!("DKIM: message carries no signature header");
                String::new()
            }
            Ok(DkimOutcome::MissingParams) => {
                log::debug!("DKIM: signature header lacks selector or domain");
                String::new()
            }
            Err(e) => {
                log::warn!("DKIM: {}", e);
                String::new()
            }
        }
    }
}

async fn close<S: MailSession>(session: S) {
    if let Err(e) = session.quit().await {
        log::debug!("QUIT failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::dkim::NameserverSource;
    use crate::dkim::tests::spawn_txt_server;
    use crate::dns::MxRecord;
    use crate::dns::tests::MockResolver;
    use crate::smtp::tests::FakeDialer;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio_rustls::rustls::pki_types::CertificateDer;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// What the report generator was shown.
    #[derive(Debug, Clone, PartialEq)]
    struct Seen {
        mx_hosts: Vec<String>,
        certificates: Vec<Vec<u8>>,
        dkim_key: String,
    }

    #[derive(Clone, Default)]
    struct RecordingReport {
        calls: Arc<Mutex<Vec<Seen>>>,
        fail: bool,
    }

    impl ReportGenerator for RecordingReport {
        fn generate(
            &self,
            _config: &Config,
            evidence: &VerificationEvidence<'_>,
        ) -> Result<Vec<u8>, VerifyError> {
            self.calls.lock().unwrap().push(Seen {
                mx_hosts: evidence.mx_list.iter().map(|m| m.hostname().to_string()).collect(),
                certificates: evidence.certificates.iter().map(|c| c.to_vec()).collect(),
                dkim_key: evidence.dkim_key.clone(),
            });
            if self.fail {
                return Err(VerifyError::ReportGenerationFailure("signing failed".into()));
            }
            Ok(b"Subject: report\r\n\r\nall good\r\n".to_vec())
        }
    }

    fn config() -> Config {
        Config {
            verify_address: Address::parse("verify@nyms.io").unwrap(),
            log_path: PathBuf::from("/dev/null"),
            public_key: Vec::new(),
            private_key: Vec::new(),
            dkim: None,
            network: NetworkConfig::default(),
        }
    }

    fn resolver() -> MockResolver {
        MockResolver {
            records: vec![MxRecord::new(10, "mx1.example.com.")],
        }
    }

    fn offline_locator() -> DkimLocator {
        DkimLocator::new(
            NameserverSource::ResolvConf(PathBuf::from("/nonexistent/resolv.conf")),
            Duration::from_millis(200),
        )
    }

    fn cert_c1() -> CertificateDer<'static> {
        CertificateDer::from(b"C1".to_vec())
    }

    const UNSIGNED: &[u8] = b"From: alice@example.com\r\nSubject: hi\r\n\r\nhello\r\n";

    #[tokio::test]
    async fn test_end_to_end_transmits_and_closes_once() {
        let dialer = FakeDialer::new(vec!["mx1.example.com"], vec![cert_c1()]);
        let session_log = dialer.log.clone();
        let report = RecordingReport::default();
        let calls = report.calls.clone();
        let out = SharedBuf::default();
        let mut verifier = Verifier::new(
            resolver(),
            dialer,
            offline_locator(),
            report,
            RunMode::Deliver,
            Box::new(out.clone()),
        );

        let sender = Address::parse("alice@example.com").unwrap();
        let disposition = verifier.process(&config(), &sender, UNSIGNED).await.unwrap();

        assert_eq!(disposition, Disposition::Transmitted);
        assert_eq!(
            *calls.lock().unwrap(),
            vec![Seen {
                mx_hosts: vec!["mx1.example.com".to_string()],
                certificates: vec![b"C1".to_vec()],
                dkim_key: String::new(),
            }]
        );
        let payload_len = b"Subject: report\r\n\r\nall good\r\n".len();
        assert_eq!(
            *session_log.lock().unwrap(),
            vec![
                format!("send verify@nyms.io -> alice@example.com ({} bytes)", payload_len),
                "quit".to_string(),
            ]
        );
        assert!(out.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_debug_mode_dumps_instead_of_sending() {
        let dialer = FakeDialer::new(vec!["mx1.example.com"], vec![cert_c1()]);
        let session_log = dialer.log.clone();
        let report = RecordingReport::default();
        let calls = report.calls.clone();
        let out = SharedBuf::default();
        let mut verifier = Verifier::new(
            resolver(),
            dialer,
            offline_locator(),
            report,
            RunMode::Debug,
            Box::new(out.clone()),
        );

        let sender = Address::parse("alice@example.com").unwrap();
        let disposition = verifier.process(&config(), &sender, UNSIGNED).await.unwrap();

        assert_eq!(disposition, Disposition::Dumped);
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(*session_log.lock().unwrap(), vec!["quit".to_string()]);
        assert_eq!(
            *out.0.lock().unwrap(),
            b"Subject: report\r\n\r\nall good\r\n".to_vec()
        );
    }

    #[tokio::test]
    async fn test_report_failure_still_closes_session() {
        let dialer = FakeDialer::new(vec!["mx1.example.com"], vec![]);
        let session_log = dialer.log.clone();
        let report = RecordingReport {
            fail: true,
            ..RecordingReport::default()
        };
        let mut verifier = Verifier::new(
            resolver(),
            dialer,
            offline_locator(),
            report,
            RunMode::Deliver,
            Box::new(std::io::sink()),
        );

        let sender = Address::parse("alice@example.com").unwrap();
        let err = verifier.process(&config(), &sender, UNSIGNED).await.unwrap_err();

        assert!(matches!(err, VerifyError::ReportGenerationFailure(_)));
        assert_eq!(*session_log.lock().unwrap(), vec!["quit".to_string()]);
    }

    #[tokio::test]
    async fn test_transmission_failure_still_closes_session() {
        let mut dialer = FakeDialer::new(vec!["mx1.example.com"], vec![]);
        dialer.fail_send = true;
        let session_log = dialer.log.clone();
        let mut verifier = Verifier::new(
            resolver(),
            dialer,
            offline_locator(),
            RecordingReport::default(),
            RunMode::Deliver,
            Box::new(std::io::sink()),
        );

        let sender = Address::parse("alice@example.com").unwrap();
        let err = verifier.process(&config(), &sender, UNSIGNED).await.unwrap_err();

        assert!(matches!(err, VerifyError::TransmissionFailure(_)));
        assert_eq!(*session_log.lock().unwrap(), vec!["quit".to_string()]);
    }

    #[tokio::test]
    async fn test_no_reachable_mx_reports_every_attempt() {
        let dialer = FakeDialer::new(vec![], vec![]);
        let report = RecordingReport::default();
        let calls = report.calls.clone();
        let resolver = MockResolver {
            records: vec![
                MxRecord::new(10, "mx1.example.com."),
                MxRecord::new(20, "mx2.example.com."),
            ],
        };
        let mut verifier = Verifier::new(
            resolver,
            dialer,
            offline_locator(),
            report,
            RunMode::Deliver,
            Box::new(std::io::sink()),
        );

        let sender = Address::parse("alice@example.com").unwrap();
        match verifier.process(&config(), &sender, UNSIGNED).await.unwrap_err() {
            VerifyError::NoReachableMX { domain, attempts } => {
                assert_eq!(domain, "example.com");
                assert_eq!(attempts.len(), 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unresolvable_domain_is_fatal() {
        let mut verifier = Verifier::new(
            resolver(),
            FakeDialer::new(vec!["mx1.example.com"], vec![]),
            offline_locator(),
            RecordingReport::default(),
            RunMode::Deliver,
            Box::new(std::io::sink()),
        );
        let sender = Address::parse("bob@unknown.test").unwrap();
        let err = verifier.process(&config(), &sender, UNSIGNED).await.unwrap_err();
        assert!(matches!(err, VerifyError::ResolutionFailure { .. }));
    }

    #[tokio::test]
    async fn test_dkim_failure_is_not_fatal() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let locator = DkimLocator::new(
            NameserverSource::Fixed(silent.local_addr().unwrap()),
            Duration::from_millis(200),
        );
        let dialer = FakeDialer::new(vec!["mx1.example.com"], vec![]);
        let report = RecordingReport::default();
        let calls = report.calls.clone();
        let mut verifier = Verifier::new(
            resolver(),
            dialer,
            locator,
            report,
            RunMode::Deliver,
            Box::new(std::io::sink()),
        );

        let signed = b"From: alice@example.com\r\nDKIM-Signature: v=1; s=sel1; d=example.com\r\n\r\nhi\r\n";
        let sender = Address::parse("alice@example.com").unwrap();
        let disposition = verifier.process(&config(), &sender, signed).await.unwrap();

        assert_eq!(disposition, Disposition::Transmitted);
        assert_eq!(calls.lock().unwrap()[0].dkim_key, "");
    }

    #[tokio::test]
    async fn test_unparseable_message_still_reports() {
        let report = RecordingReport::default();
        let calls = report.calls.clone();
        let mut verifier = Verifier::new(
            resolver(),
            FakeDialer::new(vec!["mx1.example.com"], vec![]),
            offline_locator(),
            report,
            RunMode::Deliver,
            Box::new(std::io::sink()),
        );

        let sender = Address::parse("alice@example.com").unwrap();
        let disposition = verifier
            .process(&config(), &sender, b"no colon here\r\n\r\nbody\r\n")
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Transmitted);
        assert_eq!(calls.lock().unwrap()[0].dkim_key, "");
    }

    #[tokio::test]
    async fn test_dkim_key_reaches_report() {
        let addr = spawn_txt_server(&["v=DKIM1; p=", "MIGfMA0"]).await;
        let locator = DkimLocator::new(NameserverSource::Fixed(addr), Duration::from_secs(5));
        let report = RecordingReport::default();
        let calls = report.calls.clone();
        let mut verifier = Verifier::new(
            resolver(),
            FakeDialer::new(vec!["mx1.example.com"], vec![cert_c1()]),
            locator,
            report,
            RunMode::Deliver,
            Box::new(std::io::sink()),
        );

        let signed = b"DKIM-Signature: v=1; s=sel1; d=example.com\r\nFrom: alice@example.com\r\n\r\nhi\r\n";
        let sender = Address::parse("alice@example.com").unwrap();
        verifier.process(&config(), &sender, signed).await.unwrap();

        assert_eq!(calls.lock().unwrap()[0].dkim_key, "v=DKIM1; p=MIGfMA0");
    }
}
