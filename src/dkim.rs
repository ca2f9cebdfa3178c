//! Locates the public key a message's DKIM signature points at.
//!
//! The TXT record is fetched with a hand-built query sent straight to one
//! nameserver instead of going through the resolver's TXT lookup. The
//! nameserver is either given explicitly or taken from the first entry of a
//! resolv.conf-format file. No retries across nameservers, no DNSSEC.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use tokio::net::UdpSocket;
use trust_dns_resolver::proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use trust_dns_resolver::proto::rr::{Name, RData, RecordType};
use trust_dns_resolver::system_conf::parse_resolv_conf;

use crate::error::{DkimFailure, VerifyError};
use crate::parse::{DkimHeader, find_dkim_header};

const MAX_UDP_RESPONSE: usize = 4096;

/// Where DKIM queries are sent.
#[derive(Debug, Clone)]
pub enum NameserverSource {
    /// First nameserver of a resolv.conf-format file.
    ResolvConf(PathBuf),
    Fixed(SocketAddr),
}

impl Default for NameserverSource {
    fn default() -> Self {
        NameserverSource::ResolvConf(PathBuf::from("/etc/resolv.conf"))
    }
}

/// Text of the first TXT answer, plus how many further answers were dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DkimKey {
    pub record: String,
    pub ignored_answers: usize,
}

/// What the locator found. Every variant other than `Key` means "no key
/// evidence", but callers can tell them apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DkimOutcome {
    Key(DkimKey),
    /// Neither `Dkim-Signature` nor `X-Google-Dkim-Signature` is present.
    NoSignature,
    /// A signature header exists but lacks `s=` or `d=`.
    MissingParams,
    /// The message headers could not be parsed at all.
    Unparseable(String),
}

impl DkimOutcome {
    /// The key record, or an empty string when there is none.
    pub fn key_record(&self) -> &str {
        match self {
            DkimOutcome::Key(key) => &key.record,
            _ => "",
        }
    }
}

pub struct DkimLocator {
    nameserver: NameserverSource,
    timeout: Duration,
}

impl DkimLocator {
    pub fn new(nameserver: NameserverSource, timeout: Duration) -> Self {
        Self {
            nameserver,
            timeout,
        }
    }

    /// Finds the signature header in `raw` and fetches the key it names.
    pub async fn locate(&self, raw: &[u8]) -> Result<DkimOutcome, VerifyError> {
        let params = match find_dkim_header(raw) {
            Ok(DkimHeader::Found { params, .. }) => params,
            Ok(DkimHeader::Missing) => return Ok(DkimOutcome::NoSignature),
            Err(e) => return Ok(DkimOutcome::Unparseable(e.to_string())),
        };
        let selector = params.get("s").map(String::as_str).unwrap_or("");
        let domain = params.get("d").map(String::as_str).unwrap_or("");
        if selector.is_empty() || domain.is_empty() {
            return Ok(DkimOutcome::MissingParams);
        }
        let key = self.lookup(selector, domain).await?;
        Ok(DkimOutcome::Key(key))
    }

    /// Queries `<selector>._domainkey.<domain>` for its TXT record.
    pub async fn lookup(&self, selector: &str, domain: &str) -> Result<DkimKey, VerifyError> {
        let server = nameserver_address(&self.nameserver)?;
        let failure = |reason| VerifyError::DKIMLookupFailure {
            selector: selector.to_string(),
            domain: domain.to_string(),
            reason,
        };
        let query = create_dkim_query(selector, domain, rand::random())
            .map_err(|e| failure(DkimFailure::Exchange(e)))?;
        let response = exchange(&query, server, self.timeout)
            .await
            .map_err(|e| failure(DkimFailure::Exchange(e)))?;
        process_dkim_response(selector, domain, &response)
    }
}

/// Builds a recursive TXT query for `<selector>._domainkey.<domain>`.
pub fn create_dkim_query(selector: &str, domain: &str, id: u16) -> Result<Message, String> {
    let qname = format!("{}._domainkey.{}", selector, domain);
    let fqdn = if qname.ends_with('.') {
        qname
    } else {
        format!("{}.", qname)
    };
    let name = Name::from_ascii(&fqdn).map_err(|e| format!("invalid name {}: {}", fqdn, e))?;

    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, RecordType::TXT));
    Ok(message)
}

/// Picks the nameserver DKIM queries go to.
pub fn nameserver_address(source: &NameserverSource) -> Result<SocketAddr, VerifyError> {
    let path = match source {
        NameserverSource::Fixed(addr) => return Ok(*addr),
        NameserverSource::ResolvConf(path) => path,
    };
    let config_err = |cause: String| VerifyError::ResolverConfigError {
        path: path.display().to_string(),
        cause,
    };
    let data = std::fs::read(path).map_err(|e| config_err(e.to_string()))?;
    let (config, _opts) = parse_resolv_conf(data).map_err(|e| config_err(e.to_string()))?;
    config
        .name_servers()
        .first()
        .map(|ns| ns.socket_addr)
        .ok_or_else(|| config_err("no nameserver configured".to_string()))
}

/// One UDP round trip; responses with a foreign id are skipped.
async fn exchange(query: &Message, server: SocketAddr, timeout: Duration) -> Result<Message, String> {
    let bind = if server.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };
    let socket = UdpSocket::bind(bind).await.map_err(|e| e.to_string())?;
    socket.connect(server).await.map_err(|e| e.to_string())?;
    let request = query.to_vec().map_err(|e| e.to_string())?;
    socket.send(&request).await.map_err(|e| e.to_string())?;

    let receive = async {
        let mut buf = vec![0u8; MAX_UDP_RESPONSE];
        loop {
            let len = match socket.recv(&mut buf).await {
                Ok(len) => len,
                Err(e) => return Err(e.to_string()),
            };
            match Message::from_vec(&buf[..len]) {
                Ok(response) if response.id() == query.id() => return Ok(response),
                Ok(response) => log::debug!("dropping DNS response with id {}", response.id()),
                Err(e) => log::debug!("dropping undecodable DNS response: {}", e),
            }
        }
    };
    tokio::time::timeout(timeout, receive)
        .await
        .map_err(|_| format!("no response from {} within {:?}", server, timeout))?
}

/// Checks the response shape and joins the TXT character-strings.
pub fn process_dkim_response(
    selector: &str,
    domain: &str,
    response: &Message,
) -> Result<DkimKey, VerifyError> {
    let failure = |reason| VerifyError::DKIMLookupFailure {
        selector: selector.to_string(),
        domain: domain.to_string(),
        reason,
    };
    if response.response_code() != ResponseCode::NoError {
        return Err(failure(DkimFailure::ResponseCode(response.response_code())));
    }
    let answers = response.answers();
    let first = answers.first().ok_or_else(|| failure(DkimFailure::EmptyAnswer))?;
    let ignored_answers = answers.len() - 1;
    if ignored_answers > 0 {
        log::warn!(
            "lookup s={} d={} returned {} answers, expecting 1. Ignoring extra responses",
            selector,
            domain,
            answers.len()
        );
    }
    let txt = match first.data() {
        Some(RData::TXT(txt)) => txt,
        _ => {
            return Err(failure(DkimFailure::UnexpectedRecordType(
                first.record_type().to_string(),
            )));
        }
    };
    let bytes: Vec<u8> = txt.txt_data().iter().flat_map(|s| s.iter().copied()).collect();
    Ok(DkimKey {
        record: String::from_utf8_lossy(&bytes).into_owned(),
        ignored_answers,
    })
}
