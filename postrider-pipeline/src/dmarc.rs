//! DMARC policy evaluation.
//!
//! After body-phase checks have contributed their SPF and DKIM results,
//! the outermost pipeline extracts the author domain from `From:`,
//! fetches `_dmarc.<domain>` TXT through an injected resolver, computes
//! alignment, and applies the published policy. Transient DNS failures
//! fail closed with a temporary rejection so senders retry.

use async_trait::async_trait;
use hickory_resolver::{
    TokioAsyncResolver,
    config::{ResolverConfig, ResolverOpts},
    error::ResolveErrorKind,
};
use postrider_common::{EnhancedCode, Header, SmtpError, address};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::authres::{AuthResult, ResultValue};

/// Outcome of a TXT lookup, split the way DMARC needs it.
#[derive(Debug, Clone, Error)]
pub enum TxtLookupError {
    /// The name exists but has no TXT records, or does not exist.
    #[error("no TXT record")]
    NotFound,

    /// Transient failure; the query may succeed if retried.
    #[error("temporary DNS failure: {0}")]
    Temporary(String),

    /// Persistent failure; retrying will not help.
    #[error("permanent DNS failure: {0}")]
    Permanent(String),
}

/// DNS TXT lookups, injectable so policy evaluation is testable
/// without the network.
#[async_trait]
pub trait TxtResolver: Send + Sync {
    /// Fetches all TXT records at `fqdn`, each record joined from its
    /// character strings.
    ///
    /// # Errors
    ///
    /// Returns [`TxtLookupError`] classifying the failure.
    async fn lookup_txt(
        &self,
        ctx: &CancellationToken,
        fqdn: &str,
    ) -> Result<Vec<String>, TxtLookupError>;
}

/// [`TxtResolver`] backed by the system DNS configuration.
#[derive(Debug)]
pub struct DnsTxtResolver {
    resolver: TokioAsyncResolver,
}

impl DnsTxtResolver {
    /// Creates a resolver with default upstream configuration.
    pub fn new() -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        }
    }
}

impl Default for DnsTxtResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TxtResolver for DnsTxtResolver {
    async fn lookup_txt(
        &self,
        _ctx: &CancellationToken,
        fqdn: &str,
    ) -> Result<Vec<String>, TxtLookupError> {
        match self.resolver.txt_lookup(fqdn).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|txt| {
                    txt.iter()
                        .map(|part| String::from_utf8_lossy(part).into_owned())
                        .collect::<String>()
                })
                .collect()),
            Err(err) => Err(match err.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => TxtLookupError::NotFound,
                ResolveErrorKind::Timeout | ResolveErrorKind::Proto(_) => {
                    TxtLookupError::Temporary(err.to_string())
                }
                _ => TxtLookupError::Permanent(err.to_string()),
            }),
        }
    }
}

/// Requested disposition for messages failing DMARC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Deliver normally, only record the result.
    None,
    /// Deliver into quarantine.
    Quarantine,
    /// Refuse the message.
    Reject,
}

/// Identifier alignment mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Alignment {
    /// Organizational match is enough.
    #[default]
    Relaxed,
    /// Domains must match exactly.
    Strict,
}

/// A parsed `v=DMARC1` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Disposition for the record's own domain.
    pub policy: Policy,
    /// Disposition for subdomains, when published.
    pub subdomain_policy: Option<Policy>,
    /// DKIM alignment mode.
    pub adkim: Alignment,
    /// SPF alignment mode.
    pub aspf: Alignment,
}

/// Error produced for unparseable DMARC records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed DMARC record: {0}")]
pub struct RecordParseError(String);

impl std::str::FromStr for Record {
    type Err = RecordParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tags = s.split(';').map(str::trim).filter(|t| !t.is_empty());
        match tags.next() {
            Some(tag) if tag.eq_ignore_ascii_case("v=DMARC1") => {}
            _ => return Err(RecordParseError("missing v=DMARC1 tag".to_owned())),
        }

        let parse_policy = |value: &str| match value.to_ascii_lowercase().as_str() {
            "none" => Ok(Policy::None),
            "quarantine" => Ok(Policy::Quarantine),
            "reject" => Ok(Policy::Reject),
            other => Err(RecordParseError(format!("unknown policy {other:?}"))),
        };
        let parse_alignment = |value: &str| match value.to_ascii_lowercase().as_str() {
            "r" => Ok(Alignment::Relaxed),
            "s" => Ok(Alignment::Strict),
            other => Err(RecordParseError(format!("unknown alignment {other:?}"))),
        };

        let mut policy = None;
        let mut subdomain_policy = None;
        let mut adkim = Alignment::default();
        let mut aspf = Alignment::default();
        for tag in tags {
            let Some((key, value)) = tag.split_once('=') else {
                return Err(RecordParseError(format!("malformed tag {tag:?}")));
            };
            match key.trim().to_ascii_lowercase().as_str() {
                "p" => policy = Some(parse_policy(value.trim())?),
                "sp" => subdomain_policy = Some(parse_policy(value.trim())?),
                "adkim" => adkim = parse_alignment(value.trim())?,
                "aspf" => aspf = parse_alignment(value.trim())?,
                // pct, rua, ruf, fo, rf, ri are reporting concerns.
                _ => {}
            }
        }

        Ok(Self {
            policy: policy.ok_or_else(|| RecordParseError("missing p tag".to_owned()))?,
            subdomain_policy,
            adkim,
            aspf,
        })
    }
}

/// Whether a TXT string looks like a DMARC record.
fn is_dmarc_record(txt: &str) -> bool {
    txt.trim_start()
        .get(..8)
        .is_some_and(|v| v.eq_ignore_ascii_case("v=DMARC1"))
}

/// The synthesized DMARC verdict and what to do about it.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// The verdict value recorded in `Authentication-Results`.
    pub value: ResultValue,
    /// Refuse the transaction with this reply, when set.
    pub reject: Option<SmtpError>,
    /// Quarantine the message, per `p=quarantine`.
    pub quarantine: bool,
    /// The `dmarc=` entry to lead the assembled results with.
    pub auth_result: AuthResult,
}

impl Evaluation {
    fn accept(value: ResultValue, auth_result: AuthResult) -> Self {
        Self {
            value,
            reject: None,
            quarantine: false,
            auth_result,
        }
    }
}

/// Evaluates DMARC for a message.
///
/// `results` are the authentication results contributed by body-phase
/// checks; SPF entries are expected to carry `smtp.mailfrom` or
/// `smtp.helo` properties and DKIM entries a `header.d` property, per
/// RFC 8601 conventions.
pub async fn evaluate(
    ctx: &CancellationToken,
    resolver: &dyn TxtResolver,
    header: &Header,
    results: &[AuthResult],
) -> Evaluation {
    let author_domain = match author_domain(header) {
        Ok(domain) => domain,
        Err(reason) => {
            return Evaluation {
                value: ResultValue::PermError,
                reject: Some(SmtpError::new(
                    550,
                    EnhancedCode(5, 7, 1),
                    format!("DMARC evaluation impossible: {reason}"),
                )),
                quarantine: false,
                auth_result: AuthResult::new("dmarc", ResultValue::PermError)
                    .with_reason(reason),
            };
        }
    };

    let record = match fetch_record(ctx, resolver, &author_domain).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            debug!(domain = %author_domain, "no DMARC record published");
            return Evaluation::accept(
                ResultValue::None,
                AuthResult::new("dmarc", ResultValue::None)
                    .with_prop("header", "from", &author_domain),
            );
        }
        Err(TxtLookupError::Temporary(reason)) => {
            return Evaluation {
                value: ResultValue::TempError,
                reject: Some(SmtpError::new(
                    451,
                    EnhancedCode(4, 7, 1),
                    "DMARC policy lookup failed, try again later",
                )),
                quarantine: false,
                auth_result: AuthResult::new("dmarc", ResultValue::TempError)
                    .with_reason(reason)
                    .with_prop("header", "from", &author_domain),
            };
        }
        Err(err) => {
            debug!(domain = %author_domain, error = %err, "permanent DMARC lookup failure");
            return Evaluation::accept(
                ResultValue::PermError,
                AuthResult::new("dmarc", ResultValue::PermError)
                    .with_reason(err.to_string())
                    .with_prop("header", "from", &author_domain),
            );
        }
    };

    if passes(&author_domain, &record, results) {
        return Evaluation::accept(
            ResultValue::Pass,
            AuthResult::new("dmarc", ResultValue::Pass)
                .with_prop("header", "from", &author_domain),
        );
    }

    let auth_result = AuthResult::new("dmarc", ResultValue::Fail)
        .with_prop("header", "from", &author_domain);
    match record.policy {
        Policy::None => Evaluation {
            value: ResultValue::Fail,
            reject: None,
            quarantine: false,
            auth_result,
        },
        Policy::Quarantine => Evaluation {
            value: ResultValue::Fail,
            reject: None,
            quarantine: true,
            auth_result: auth_result.with_reason("quarantined by DMARC policy"),
        },
        Policy::Reject => Evaluation {
            value: ResultValue::Fail,
            reject: Some(SmtpError::new(
                550,
                EnhancedCode(5, 7, 1),
                "rejected by DMARC policy of the sender domain",
            )),
            quarantine: false,
            auth_result,
        },
    }
}

/// Extracts the RFC 5322 author domain. Exactly one `From:` field with
/// exactly one address is required (RFC 7489 §6.6.1).
fn author_domain(header: &Header) -> Result<String, String> {
    if header.count("From") != 1 {
        return Err(format!(
            "message has {} From header fields, expected exactly one",
            header.count("From")
        ));
    }
    let from = header.get_first("From").unwrap_or_default();
    let addresses =
        mailparse::addrparse(from).map_err(|e| format!("unparseable From header: {e}"))?;

    let mut singles = addresses.iter().flat_map(|addr| match addr {
        mailparse::MailAddr::Single(single) => std::slice::from_ref(single).iter(),
        mailparse::MailAddr::Group(group) => group.addrs.iter(),
    });
    let (Some(author), None) = (singles.next(), singles.next()) else {
        return Err("From header does not contain exactly one address".to_owned());
    };

    let normalized = address::for_lookup(&author.addr)
        .map_err(|e| format!("malformed From address: {e}"))?;
    address::split(&normalized)
        .map(|(_, domain)| domain.to_owned())
        .map_err(|e| format!("malformed From address: {e}"))
}

async fn fetch_record(
    ctx: &CancellationToken,
    resolver: &dyn TxtResolver,
    author_domain: &str,
) -> Result<Option<Record>, TxtLookupError> {
    let fqdn = format!("_dmarc.{author_domain}");
    let records = match resolver.lookup_txt(ctx, &fqdn).await {
        Ok(records) => records,
        Err(TxtLookupError::NotFound) => return Ok(None),
        Err(err) => return Err(err),
    };

    let Some(txt) = records.iter().find(|txt| is_dmarc_record(txt)) else {
        return Ok(None);
    };
    match txt.parse::<Record>() {
        Ok(record) => Ok(Some(record)),
        // A published but unparseable record degrades to permerror.
        Err(err) => Err(TxtLookupError::Permanent(err.to_string())),
    }
}

/// Whether at least one aligned SPF or DKIM pass exists.
fn passes(author_domain: &str, record: &Record, results: &[AuthResult]) -> bool {
    let spf_aligned = results
        .iter()
        .filter(|r| r.method.eq_ignore_ascii_case("spf") && r.value == ResultValue::Pass)
        .filter_map(spf_domain)
        .any(|domain| aligned(author_domain, &domain, record.aspf));
    if spf_aligned {
        return true;
    }

    results
        .iter()
        .filter(|r| r.method.eq_ignore_ascii_case("dkim") && r.value == ResultValue::Pass)
        .filter_map(|r| r.prop("header", "d"))
        .any(|domain| aligned(author_domain, domain, record.adkim))
}

/// The domain an SPF result authenticated: MAIL FROM when present,
/// HELO otherwise.
fn spf_domain(result: &AuthResult) -> Option<String> {
    if let Some(mailfrom) = result.prop("smtp", "mailfrom") {
        let domain = mailfrom.rsplit_once('@').map_or(mailfrom, |(_, d)| d);
        return Some(domain.to_owned());
    }
    result.prop("smtp", "helo").map(str::to_owned)
}

/// Identifier alignment per RFC 7489 §3.1: exact match, or a
/// dot-boundary suffix relationship in relaxed mode.
fn aligned(author_domain: &str, authenticated: &str, mode: Alignment) -> bool {
    let author = author_domain.to_ascii_lowercase();
    let authenticated = authenticated.to_ascii_lowercase();
    if author == authenticated {
        return true;
    }
    if mode == Alignment::Strict {
        return false;
    }
    authenticated.ends_with(&format!(".{author}")) || author.ends_with(&format!(".{authenticated}"))
}
