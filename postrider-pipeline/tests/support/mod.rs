//! Shared mocks for pipeline integration tests: configurable checks,
//! modifiers, delivery targets, and a stub DMARC resolver, all with
//! counters so tests can assert on state lifecycles.

#![allow(dead_code)] // Test utility module - not every test uses every helper

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::Mutex;
use postrider_common::{Buffer, Field, Header, MemoryBuffer, MsgMetadata, SmtpError};
use postrider_pipeline::{
    AuthResult, Check, CheckResult, CheckState, Delivery, DeliveryTarget, Modifier, ModifierState,
    PartialDelivery, StatusCollector, TxtLookupError, TxtResolver,
};
use tokio_util::sync::CancellationToken;

pub fn meta(id: &str, from: &str) -> Arc<MsgMetadata> {
    Arc::new(MsgMetadata::new(id, from, None))
}

pub fn simple_header(from: &str, subject: &str) -> Header {
    let mut header = Header::new();
    header.append(Field::new("From", from));
    header.append(Field::new("Subject", subject));
    header
}

pub fn body_buffer(text: &str) -> Arc<dyn Buffer> {
    Arc::new(MemoryBuffer::from(text.as_bytes().to_vec()))
}

/// One observed transaction on a [`MockTarget`].
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    pub mail_from: String,
    pub rcpts: Vec<String>,
    pub header: Option<Header>,
    pub body: Option<Vec<u8>>,
    pub committed: bool,
    pub aborted: bool,
}

/// A delivery target that records everything it is told.
pub struct MockTarget {
    name: String,
    partial: bool,
    start_error: Option<SmtpError>,
    rcpt_errors: AHashMap<String, SmtpError>,
    partial_rcpt_errors: AHashMap<String, SmtpError>,
    transactions: Arc<Mutex<Vec<Transaction>>>,
}

impl MockTarget {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            partial: false,
            start_error: None,
            rcpt_errors: AHashMap::new(),
            partial_rcpt_errors: AHashMap::new(),
            transactions: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// A target whose deliveries report per-recipient status; `errors`
    /// maps recipient addresses to the failure reported for them.
    pub fn partial(name: &str, errors: &[(&str, SmtpError)]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            partial: true,
            start_error: None,
            rcpt_errors: AHashMap::new(),
            partial_rcpt_errors: errors
                .iter()
                .map(|(rcpt, err)| ((*rcpt).to_owned(), err.clone()))
                .collect(),
            transactions: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// A target that refuses the given recipients at `add_rcpt`.
    pub fn rejecting_rcpts(name: &str, errors: &[(&str, SmtpError)]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            partial: false,
            start_error: None,
            rcpt_errors: errors
                .iter()
                .map(|(rcpt, err)| ((*rcpt).to_owned(), err.clone()))
                .collect(),
            partial_rcpt_errors: AHashMap::new(),
            transactions: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.transactions.lock().clone()
    }
}

#[async_trait]
impl DeliveryTarget for MockTarget {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(
        &self,
        _ctx: &CancellationToken,
        _meta: &Arc<MsgMetadata>,
        mail_from: &str,
    ) -> Result<Box<dyn Delivery>, SmtpError> {
        if let Some(err) = &self.start_error {
            return Err(err.clone());
        }
        let idx = {
            let mut transactions = self.transactions.lock();
            transactions.push(Transaction {
                mail_from: mail_from.to_owned(),
                ..Transaction::default()
            });
            transactions.len() - 1
        };
        Ok(Box::new(MockDelivery {
            transactions: Arc::clone(&self.transactions),
            idx,
            partial: self.partial,
            rcpt_errors: self.rcpt_errors.clone(),
            partial_rcpt_errors: self.partial_rcpt_errors.clone(),
        }))
    }
}

struct MockDelivery {
    transactions: Arc<Mutex<Vec<Transaction>>>,
    idx: usize,
    partial: bool,
    rcpt_errors: AHashMap<String, SmtpError>,
    partial_rcpt_errors: AHashMap<String, SmtpError>,
}

#[async_trait]
impl Delivery for MockDelivery {
    async fn add_rcpt(&mut self, _ctx: &CancellationToken, to: &str) -> Result<(), SmtpError> {
        if let Some(err) = self.rcpt_errors.get(to) {
            return Err(err.clone());
        }
        self.transactions.lock()[self.idx].rcpts.push(to.to_owned());
        Ok(())
    }

    async fn body(
        &mut self,
        _ctx: &CancellationToken,
        header: &Header,
        body: Arc<dyn Buffer>,
    ) -> Result<(), SmtpError> {
        let mut transactions = self.transactions.lock();
        transactions[self.idx].header = Some(header.clone());
        transactions[self.idx].body = Some(postrider_common::buffer::read_to_vec(&*body).unwrap());
        Ok(())
    }

    async fn abort(&mut self, _ctx: &CancellationToken) -> Result<(), SmtpError> {
        self.transactions.lock()[self.idx].aborted = true;
        Ok(())
    }

    async fn commit(&mut self, _ctx: &CancellationToken) -> Result<(), SmtpError> {
        self.transactions.lock()[self.idx].committed = true;
        Ok(())
    }

    fn as_partial(&mut self) -> Option<&mut dyn PartialDelivery> {
        self.partial.then_some(self as &mut dyn PartialDelivery)
    }
}

#[async_trait]
impl PartialDelivery for MockDelivery {
    async fn body_non_atomic(
        &mut self,
        _ctx: &CancellationToken,
        sc: &dyn StatusCollector,
        header: &Header,
        body: Arc<dyn Buffer>,
    ) {
        let rcpts = {
            let mut transactions = self.transactions.lock();
            transactions[self.idx].header = Some(header.clone());
            transactions[self.idx].body =
                Some(postrider_common::buffer::read_to_vec(&*body).unwrap());
            transactions[self.idx].rcpts.clone()
        };
        for rcpt in rcpts {
            match self.partial_rcpt_errors.get(&rcpt) {
                Some(err) => sc.set_status(&rcpt, Err(err.clone())),
                None => sc.set_status(&rcpt, Ok(())),
            }
        }
    }
}

/// A check with configurable per-phase verdicts and lifecycle counters.
pub struct MockCheck {
    name: String,
    connection_result: Option<CheckResult>,
    sender_result: Option<CheckResult>,
    rcpt_result: Option<CheckResult>,
    body_result: Option<CheckResult>,
    open: Arc<AtomicUsize>,
    created: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockCheck {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            connection_result: None,
            sender_result: None,
            rcpt_result: None,
            body_result: None,
            open: Arc::new(AtomicUsize::new(0)),
            created: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicUsize::new(0)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn with_connection_result(mut self, result: CheckResult) -> Self {
        self.connection_result = Some(result);
        self
    }

    #[must_use]
    pub fn with_sender_result(mut self, result: CheckResult) -> Self {
        self.sender_result = Some(result);
        self
    }

    #[must_use]
    pub fn with_rcpt_result(mut self, result: CheckResult) -> Self {
        self.rcpt_result = Some(result);
        self
    }

    #[must_use]
    pub fn with_body_result(mut self, result: CheckResult) -> Self {
        self.body_result = Some(result);
        self
    }

    pub fn open_states(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn created_states(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed_states(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

struct MockCheckState {
    connection_result: Option<CheckResult>,
    sender_result: Option<CheckResult>,
    rcpt_result: Option<CheckResult>,
    body_result: Option<CheckResult>,
    open: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    calls: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Check for MockCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn state_for_msg(
        &self,
        _ctx: &CancellationToken,
        _meta: &Arc<MsgMetadata>,
    ) -> Result<Box<dyn CheckState>, SmtpError> {
        self.open.fetch_add(1, Ordering::SeqCst);
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockCheckState {
            connection_result: self.connection_result.clone(),
            sender_result: self.sender_result.clone(),
            rcpt_result: self.rcpt_result.clone(),
            body_result: self.body_result.clone(),
            open: Arc::clone(&self.open),
            closed: Arc::clone(&self.closed),
            calls: Arc::clone(&self.calls),
        }))
    }
}

#[async_trait]
impl CheckState for MockCheckState {
    async fn check_connection(&mut self, _ctx: &CancellationToken) -> CheckResult {
        self.calls.lock().push("connection".to_owned());
        self.connection_result.clone().unwrap_or_default()
    }

    async fn check_sender(&mut self, _ctx: &CancellationToken, from: &str) -> CheckResult {
        self.calls.lock().push(format!("sender {from}"));
        self.sender_result.clone().unwrap_or_default()
    }

    async fn check_rcpt(&mut self, _ctx: &CancellationToken, to: &str) -> CheckResult {
        self.calls.lock().push(format!("rcpt {to}"));
        self.rcpt_result.clone().unwrap_or_default()
    }

    async fn check_body(
        &mut self,
        _ctx: &CancellationToken,
        _header: &Header,
        _body: &Arc<dyn Buffer>,
    ) -> CheckResult {
        self.calls.lock().push("body".to_owned());
        self.body_result.clone().unwrap_or_default()
    }

    async fn close(&mut self) -> Result<(), SmtpError> {
        self.open.fetch_sub(1, Ordering::SeqCst);
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A modifier rewriting senders and expanding recipients from static
/// maps, with lifecycle counters.
pub struct MockModifier {
    name: String,
    sender_map: AHashMap<String, String>,
    rcpt_map: AHashMap<String, Vec<String>>,
    open: Arc<AtomicUsize>,
    created: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    sender_calls: Arc<AtomicUsize>,
}

impl MockModifier {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            sender_map: AHashMap::new(),
            rcpt_map: AHashMap::new(),
            open: Arc::new(AtomicUsize::new(0)),
            created: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicUsize::new(0)),
            sender_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn with_rcpt_rewrite(mut self, from: &str, to: &[&str]) -> Self {
        self.rcpt_map
            .insert(from.to_owned(), to.iter().map(|s| (*s).to_owned()).collect());
        self
    }

    #[must_use]
    pub fn with_sender_rewrite(mut self, from: &str, to: &str) -> Self {
        self.sender_map.insert(from.to_owned(), to.to_owned());
        self
    }

    pub fn open_states(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn created_states(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed_states(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn sender_calls(&self) -> usize {
        self.sender_calls.load(Ordering::SeqCst)
    }
}

struct MockModifierState {
    sender_map: AHashMap<String, String>,
    rcpt_map: AHashMap<String, Vec<String>>,
    open: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    sender_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Modifier for MockModifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn state_for_msg(
        &self,
        _ctx: &CancellationToken,
        _meta: &Arc<MsgMetadata>,
    ) -> Result<Box<dyn ModifierState>, SmtpError> {
        self.open.fetch_add(1, Ordering::SeqCst);
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockModifierState {
            sender_map: self.sender_map.clone(),
            rcpt_map: self.rcpt_map.clone(),
            open: Arc::clone(&self.open),
            closed: Arc::clone(&self.closed),
            sender_calls: Arc::clone(&self.sender_calls),
        }))
    }
}

#[async_trait]
impl ModifierState for MockModifierState {
    async fn rewrite_sender(
        &mut self,
        _ctx: &CancellationToken,
        from: &str,
    ) -> Result<String, SmtpError> {
        self.sender_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .sender_map
            .get(from)
            .cloned()
            .unwrap_or_else(|| from.to_owned()))
    }

    async fn rewrite_rcpt(
        &mut self,
        _ctx: &CancellationToken,
        to: &str,
    ) -> Result<Vec<String>, SmtpError> {
        Ok(self
            .rcpt_map
            .get(to)
            .cloned()
            .unwrap_or_else(|| vec![to.to_owned()]))
    }

    async fn close(&mut self) -> Result<(), SmtpError> {
        self.open.fetch_sub(1, Ordering::SeqCst);
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A DMARC resolver answering from a fixed map.
#[derive(Default)]
pub struct StubResolver {
    records: AHashMap<String, Result<Vec<String>, TxtLookupError>>,
}

impl StubResolver {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_record(mut self, fqdn: &str, txt: &str) -> Self {
        self.records.insert(fqdn.to_owned(), Ok(vec![txt.to_owned()]));
        self
    }

    #[must_use]
    pub fn with_error(mut self, fqdn: &str, err: TxtLookupError) -> Self {
        self.records.insert(fqdn.to_owned(), Err(err));
        self
    }
}

#[async_trait]
impl TxtResolver for StubResolver {
    async fn lookup_txt(
        &self,
        _ctx: &CancellationToken,
        fqdn: &str,
    ) -> Result<Vec<String>, TxtLookupError> {
        self.records
            .get(fqdn)
            .cloned()
            .unwrap_or(Err(TxtLookupError::NotFound))
    }
}

/// A [`StatusCollector`] that remembers everything published to it.
#[derive(Default)]
pub struct StatusLog {
    entries: Mutex<Vec<(String, Result<(), SmtpError>)>>,
}

impl StatusLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(String, Result<(), SmtpError>)> {
        self.entries.lock().clone()
    }

    /// The recorded outcome for one recipient.
    pub fn status_of(&self, rcpt: &str) -> Option<Result<(), SmtpError>> {
        self.entries
            .lock()
            .iter()
            .find(|(r, _)| r == rcpt)
            .map(|(_, result)| result.clone())
    }
}

impl StatusCollector for StatusLog {
    fn set_status(&self, rcpt: &str, result: Result<(), SmtpError>) {
        self.entries.lock().push((rcpt.to_owned(), result));
    }
}

/// Contributes fixed authentication results at the body phase, the way
/// SPF/DKIM checks do.
pub fn auth_check(name: &str, results: Vec<AuthResult>) -> MockCheck {
    MockCheck::new(name).with_body_result(CheckResult {
        auth_results: results,
        ..CheckResult::default()
    })
}
