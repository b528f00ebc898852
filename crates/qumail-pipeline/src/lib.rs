//! Authorization gate and the two-phase send/reveal protocol.
//!
//! Send runs Validating -> AcquiringKey -> Encrypting -> Persisting ->
//! Dispatching; reveal runs fetch -> re-slice -> decrypt. The two pipelines
//! share no in-flight state; the stored record is their only connection.
//! Every operation here starts at the [`AuthGate`]; there is no anonymous
//! path to the store.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use mailparse::addrparse;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use qumail_core::{
    MailError, MailStore, MailboxRole, MessageSummary, NewMessage, log_debug,
};
use qumail_crypto::{CryptoError, FieldLengths, decrypt_field, encrypt_field, slice_key};
use qumail_mail::{DeliveryTransport, render_outbound};
use qumail_qkd::{KeyMaterialSource, KeySourceError};

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no credential presented")]
    Unauthenticated,
    #[error("invalid or expired credential")]
    InvalidCredential,
    #[error("mailbox is neither sender nor recipient of this message")]
    Unauthorized,
    #[error("missing required field: {0}")]
    MissingFields(&'static str),
    #[error("invalid request: {0}")]
    ValidationError(String),
    #[error("key source unavailable: {0}")]
    KeySourceUnavailable(String),
    #[error("insufficient key material: need {required} bytes, have {available}")]
    InsufficientKeyMaterial { required: usize, available: usize },
    #[error("key slice too short to derive a field key")]
    KeyTooShort,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("message not found")]
    NotFound,
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<MailError> for PipelineError {
    fn from(err: MailError) -> Self {
        match err {
            MailError::NotFound => PipelineError::NotFound,
            MailError::Unauthorized => PipelineError::Unauthorized,
            other => PipelineError::Storage(other.to_string()),
        }
    }
}

impl From<CryptoError> for PipelineError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InsufficientKeyMaterial {
                required,
                available,
            } => PipelineError::InsufficientKeyMaterial {
                required,
                available,
            },
            CryptoError::KeyTooShort => PipelineError::KeyTooShort,
            CryptoError::EncryptionFailed => PipelineError::EncryptionFailed,
            CryptoError::DecryptionFailed => PipelineError::DecryptionFailed,
        }
    }
}

impl From<KeySourceError> for PipelineError {
    fn from(err: KeySourceError) -> Self {
        match err {
            KeySourceError::Unavailable(reason) => PipelineError::KeySourceUnavailable(reason),
        }
    }
}

/// Stateless bearer-token settings. One verification per request; no
/// server-side session store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub token_secret: String,
    pub token_ttl_minutes: i64,
}

impl AuthConfig {
    pub fn codec(&self) -> TokenCodec {
        TokenCodec::new(self.token_secret.as_bytes())
    }

    pub fn ttl(&self) -> Duration {
        Duration::minutes(self.token_ttl_minutes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
}

/// Signs and verifies bearer tokens: base64url JSON claims joined with a
/// hex HMAC-SHA256 signature over them. Issuance lives here so the (out of
/// scope) directory service and the tests can mint tokens the gate accepts.
#[derive(Clone)]
pub struct TokenCodec {
    secret: Vec<u8>,
}

impl TokenCodec {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
        }
    }

    pub fn issue(&self, mailbox: &str, ttl: Duration) -> String {
        let claims = Claims {
            sub: mailbox.to_string(),
            exp: (Utc::now() + ttl).timestamp(),
        };
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap_or_default());
        let signature = self.sign(payload.as_bytes());
        format!("{}.{}", payload, signature)
    }

    pub fn verify(&self, token: &str) -> Result<Claims, PipelineError> {
        let (payload, signature) = token
            .split_once('.')
            .ok_or(PipelineError::InvalidCredential)?;
        let expected = self.sign(payload.as_bytes());
        if !constant_time_eq(signature, &expected) {
            return Err(PipelineError::InvalidCredential);
        }
        let raw = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| PipelineError::InvalidCredential)?;
        let claims: Claims =
            serde_json::from_slice(&raw).map_err(|_| PipelineError::InvalidCredential)?;
        if claims.exp < Utc::now().timestamp() {
            return Err(PipelineError::InvalidCredential);
        }
        Ok(claims)
    }

    fn sign(&self, payload: &[u8]) -> String {
        // HMAC accepts keys of any length; new_from_slice cannot fail here.
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac key length");
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Verified caller identity: the mailbox address bound to the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxIdentity {
    pub address: String,
}

/// Mandatory per-request credential check. Missing credential and invalid
/// credential are distinct failures: the first carries no identity at all.
#[derive(Clone)]
pub struct AuthGate {
    codec: TokenCodec,
}

impl AuthGate {
    pub fn new(codec: TokenCodec) -> Self {
        Self { codec }
    }

    pub fn authenticate(
        &self,
        authorization: Option<&str>,
    ) -> Result<MailboxIdentity, PipelineError> {
        let header = authorization.ok_or(PipelineError::Unauthenticated)?;
        let token = header.strip_prefix("Bearer ").unwrap_or(header).trim();
        if token.is_empty() {
            return Err(PipelineError::Unauthenticated);
        }
        let claims = self.codec.verify(token)?;
        Ok(MailboxIdentity {
            address: claims.sub,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentUpload {
    pub filename: String,
    pub content: Vec<u8>,
}

/// Explicit send schema; anything outside this shape never reaches the
/// pipeline. The sender is deliberately absent: it is bound from the
/// authenticated identity, never client-supplied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attachment: Option<AttachmentUpload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Relayed,
    /// Degraded success: the record is persisted and readable in-app, only
    /// the outbound relay failed. Retry policy belongs to the relay.
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message_id: i64,
    pub channel_quality: f64,
    pub delivery: DeliveryStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevealedAttachment {
    pub filename: String,
    pub content_base64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevealedMessage {
    pub subject: String,
    pub body: String,
    pub attachment: Option<RevealedAttachment>,
}

fn validate(request: &SendRequest) -> Result<(), PipelineError> {
    if request.to.trim().is_empty() {
        return Err(PipelineError::MissingFields("to"));
    }
    if request.subject.trim().is_empty() {
        return Err(PipelineError::MissingFields("subject"));
    }
    if request.body.trim().is_empty() {
        return Err(PipelineError::MissingFields("body"));
    }
    let parsed = addrparse(request.to.trim()).map_err(|err| {
        PipelineError::ValidationError(format!("unparseable recipient address: {}", err))
    })?;
    let valid = parsed
        .iter()
        .any(|addr| matches!(addr, mailparse::MailAddr::Single(info) if info.addr.contains('@')));
    if !valid {
        return Err(PipelineError::ValidationError(format!(
            "not a mailbox address: {}",
            request.to.trim()
        )));
    }
    if let Some(attachment) = &request.attachment {
        if attachment.filename.trim().is_empty() {
            return Err(PipelineError::MissingFields("attachment filename"));
        }
        if attachment.content.is_empty() {
            return Err(PipelineError::ValidationError(
                "attachment content is empty".to_string(),
            ));
        }
    }
    Ok(())
}

/// Compose-to-dispatch orchestration. No record is written before the full
/// key batch is in hand, so a key-source failure aborts with nothing
/// persisted; a dispatch failure after persistence is reported, not rolled
/// back.
pub struct SendPipeline {
    gate: AuthGate,
    store: Arc<dyn MailStore>,
    key_source: Arc<dyn KeyMaterialSource>,
    delivery: Arc<dyn DeliveryTransport>,
}

impl SendPipeline {
    pub fn new(
        gate: AuthGate,
        store: Arc<dyn MailStore>,
        key_source: Arc<dyn KeyMaterialSource>,
        delivery: Arc<dyn DeliveryTransport>,
    ) -> Self {
        Self {
            gate,
            store,
            key_source,
            delivery,
        }
    }

    pub async fn send(
        &self,
        authorization: Option<&str>,
        request: SendRequest,
    ) -> Result<SendReceipt, PipelineError> {
        let identity = self.gate.authenticate(authorization)?;
        validate(&request)?;
        let recipient = request.to.trim().to_string();
        log_debug(&format!("send validating ok sender={}", identity.address));

        let lengths = FieldLengths::new(
            request.subject.len(),
            request.body.len(),
            request
                .attachment
                .as_ref()
                .map(|a| a.content.len())
                .unwrap_or(0),
        );
        let required = lengths.required_key_length();
        log_debug(&format!("send acquiring_key bytes={}", required));
        let batch = self.key_source.acquire(required, false).await?;

        let slices = slice_key(&batch.material, &lengths)?;
        let encrypted_subject = encrypt_field(request.subject.as_bytes(), slices.subject)?;
        let encrypted_body = encrypt_field(request.body.as_bytes(), slices.body)?;
        let encrypted_attachment = match &request.attachment {
            Some(upload) => Some(encrypt_field(&upload.content, slices.attachment)?),
            None => None,
        };
        log_debug("send encrypting done");

        let message_id = self
            .store
            .insert(NewMessage {
                sender_address: identity.address.clone(),
                recipient_address: recipient.clone(),
                encrypted_subject: encrypted_subject.clone(),
                encrypted_body: encrypted_body.clone(),
                subject_length: lengths.subject as i64,
                body_length: lengths.body as i64,
                attachment_length: lengths.attachment as i64,
                attachment_name: request.attachment.as_ref().map(|a| a.filename.clone()),
                attachment_ciphertext: encrypted_attachment,
                key_material: hex::encode(&batch.material),
                channel_quality: batch.quality,
            })
            .await?;
        log_debug(&format!("send persisted id={}", message_id));

        let rendered = render_outbound(
            &recipient,
            &encrypted_subject.ciphertext,
            &encrypted_body.ciphertext,
            request.attachment.as_ref().map(|a| a.filename.as_str()),
        );
        let delivery = match self.delivery.deliver(&rendered).await {
            Ok(()) => DeliveryStatus::Relayed,
            Err(err) => {
                log_debug(&format!(
                    "send dispatch failed id={} reason={}",
                    message_id, err
                ));
                DeliveryStatus::Failed {
                    reason: err.to_string(),
                }
            }
        };

        Ok(SendReceipt {
            message_id,
            channel_quality: batch.quality,
            delivery,
        })
    }
}

/// On-demand decryption. Re-derives the slice boundaries from the persisted
/// plaintext lengths, decrypts every populated field, and returns either
/// complete plaintext or an error; the stored ciphertext is never touched.
pub struct RevealPipeline {
    gate: AuthGate,
    store: Arc<dyn MailStore>,
}

impl RevealPipeline {
    pub fn new(gate: AuthGate, store: Arc<dyn MailStore>) -> Self {
        Self { gate, store }
    }

    pub async fn reveal(
        &self,
        authorization: Option<&str>,
        message_id: i64,
    ) -> Result<RevealedMessage, PipelineError> {
        let identity = self.gate.authenticate(authorization)?;
        let record = self.store.fetch_by_id(message_id, &identity.address).await?;

        let key_material =
            hex::decode(&record.key_material).map_err(|_| PipelineError::DecryptionFailed)?;
        let lengths = FieldLengths::new(
            record.subject_length as usize,
            record.body_length as usize,
            record.attachment_length as usize,
        );
        let slices = slice_key(&key_material, &lengths)?;

        let subject_bytes = decrypt_field(&record.encrypted_subject, slices.subject)?;
        let body_bytes = decrypt_field(&record.encrypted_body, slices.body)?;
        let attachment = match (&record.attachment_name, &record.attachment_ciphertext) {
            (Some(name), Some(field)) => {
                let content = decrypt_field(field, slices.attachment)?;
                Some(RevealedAttachment {
                    filename: name.clone(),
                    content_base64: STANDARD.encode(content),
                })
            }
            _ => None,
        };
        let subject =
            String::from_utf8(subject_bytes).map_err(|_| PipelineError::DecryptionFailed)?;
        let body = String::from_utf8(body_bytes).map_err(|_| PipelineError::DecryptionFailed)?;

        if identity.address == record.recipient_address {
            self.store.mark_read(message_id, &identity.address).await?;
        }
        log_debug(&format!(
            "reveal id={} mailbox={}",
            message_id, identity.address
        ));

        Ok(RevealedMessage {
            subject,
            body,
            attachment,
        })
    }
}

/// Auth-gated mailbox views and record housekeeping. Nothing on these paths
/// decrypts; listings stay metadata-only.
pub struct MailboxService {
    gate: AuthGate,
    store: Arc<dyn MailStore>,
}

impl MailboxService {
    pub fn new(gate: AuthGate, store: Arc<dyn MailStore>) -> Self {
        Self { gate, store }
    }

    pub async fn inbox(
        &self,
        authorization: Option<&str>,
    ) -> Result<Vec<MessageSummary>, PipelineError> {
        let identity = self.gate.authenticate(authorization)?;
        Ok(self
            .store
            .list_by_mailbox(&identity.address, MailboxRole::Inbox)
            .await?)
    }

    pub async fn sent(
        &self,
        authorization: Option<&str>,
    ) -> Result<Vec<MessageSummary>, PipelineError> {
        let identity = self.gate.authenticate(authorization)?;
        Ok(self
            .store
            .list_by_mailbox(&identity.address, MailboxRole::Sent)
            .await?)
    }

    pub async fn trash(
        &self,
        authorization: Option<&str>,
    ) -> Result<Vec<MessageSummary>, PipelineError> {
        let identity = self.gate.authenticate(authorization)?;
        Ok(self
            .store
            .list_by_mailbox(&identity.address, MailboxRole::Trash)
            .await?)
    }

    /// Inbox and sent are independent reads; fetch them concurrently.
    pub async fn overview(
        &self,
        authorization: Option<&str>,
    ) -> Result<(Vec<MessageSummary>, Vec<MessageSummary>), PipelineError> {
        let identity = self.gate.authenticate(authorization)?;
        let (inbox, sent) = tokio::join!(
            self.store
                .list_by_mailbox(&identity.address, MailboxRole::Inbox),
            self.store
                .list_by_mailbox(&identity.address, MailboxRole::Sent),
        );
        Ok((inbox?, sent?))
    }

    /// Single-message metadata fetch. A recipient opening the message flips
    /// the read flag; the ciphertext and key stay server-side.
    pub async fn message(
        &self,
        authorization: Option<&str>,
        message_id: i64,
    ) -> Result<MessageSummary, PipelineError> {
        let identity = self.gate.authenticate(authorization)?;
        let record = self.store.fetch_by_id(message_id, &identity.address).await?;
        let mut is_read = record.is_read;
        if identity.address == record.recipient_address && !record.is_read {
            self.store.mark_read(message_id, &identity.address).await?;
            is_read = true;
        }
        Ok(MessageSummary {
            id: record.id,
            sender_address: record.sender_address,
            recipient_address: record.recipient_address,
            attachment_name: record.attachment_name,
            channel_quality: record.channel_quality,
            is_read,
            created_at: record.created_at,
        })
    }

    pub async fn move_to_trash(
        &self,
        authorization: Option<&str>,
        message_id: i64,
    ) -> Result<(), PipelineError> {
        let identity = self.gate.authenticate(authorization)?;
        Ok(self
            .store
            .move_to_trash(message_id, &identity.address)
            .await?)
    }

    pub async fn restore(
        &self,
        authorization: Option<&str>,
        message_id: i64,
    ) -> Result<(), PipelineError> {
        let identity = self.gate.authenticate(authorization)?;
        Ok(self.store.restore(message_id, &identity.address).await?)
    }

    pub async fn purge(
        &self,
        authorization: Option<&str>,
        message_id: i64,
    ) -> Result<(), PipelineError> {
        let identity = self.gate.authenticate(authorization)?;
        Ok(self.store.purge(message_id, &identity.address).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{SystemTime, UNIX_EPOCH};

    use async_trait::async_trait;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use chrono::Duration;

    use qumail_core::{MailStore, SqliteMailStore};
    use qumail_mail::{DeliveryTransport, RenderedMessage};
    use qumail_qkd::{KeyBatch, KeyMaterialSource, KeySourceError};

    use super::{
        AttachmentUpload, AuthGate, DeliveryStatus, MailboxService, PipelineError, RevealPipeline,
        SendPipeline, SendRequest, TokenCodec,
    };

    const SECRET: &[u8] = b"unit-test-token-secret";

    static DB_SEQ: AtomicU64 = AtomicU64::new(0);

    fn temp_db_path() -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!(
            "qumail-pipeline-{}-{}-{}.db",
            std::process::id(),
            ts,
            DB_SEQ.fetch_add(1, Ordering::Relaxed)
        ))
    }

    struct PatternKeySource {
        last_requested: Mutex<usize>,
    }

    impl PatternKeySource {
        fn new() -> Self {
            Self {
                last_requested: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl KeyMaterialSource for PatternKeySource {
        async fn acquire(
            &self,
            length_bytes: usize,
            _simulate_interference: bool,
        ) -> Result<KeyBatch, KeySourceError> {
            *self.last_requested.lock().unwrap() = length_bytes;
            let material = (0..length_bytes).map(|i| (i % 251) as u8).collect();
            Ok(KeyBatch {
                material,
                quality: 0.0042,
            })
        }
    }

    struct FailingKeySource;

    #[async_trait]
    impl KeyMaterialSource for FailingKeySource {
        async fn acquire(
            &self,
            _length_bytes: usize,
            _simulate_interference: bool,
        ) -> Result<KeyBatch, KeySourceError> {
            Err(KeySourceError::Unavailable("link down".to_string()))
        }
    }

    struct RecordingDelivery {
        fail: bool,
        sent: Mutex<Vec<RenderedMessage>>,
    }

    impl RecordingDelivery {
        fn new(fail: bool) -> Self {
            Self {
                fail,
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DeliveryTransport for RecordingDelivery {
        async fn deliver(&self, message: &RenderedMessage) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("relay refused connection");
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    struct Harness {
        send: SendPipeline,
        reveal: RevealPipeline,
        mailbox: MailboxService,
        key_source: Arc<PatternKeySource>,
        delivery: Arc<RecordingDelivery>,
        db_path: PathBuf,
    }

    impl Harness {
        fn cleanup(&self) {
            let _ = std::fs::remove_file(&self.db_path);
        }
    }

    fn codec() -> TokenCodec {
        TokenCodec::new(SECRET)
    }

    fn bearer(mailbox: &str) -> String {
        format!("Bearer {}", codec().issue(mailbox, Duration::minutes(30)))
    }

    async fn harness() -> anyhow::Result<Harness> {
        harness_with(false).await
    }

    async fn harness_with(failing_delivery: bool) -> anyhow::Result<Harness> {
        let db_path = temp_db_path();
        let store = SqliteMailStore::connect(
            db_path
                .to_str()
                .ok_or_else(|| anyhow::anyhow!("invalid temp db path"))?,
        )
        .await?;
        store.init().await?;
        let store: Arc<dyn MailStore> = Arc::new(store);

        let key_source = Arc::new(PatternKeySource::new());
        let delivery = Arc::new(RecordingDelivery::new(failing_delivery));
        let gate = AuthGate::new(codec());

        Ok(Harness {
            send: SendPipeline::new(
                gate.clone(),
                store.clone(),
                key_source.clone(),
                delivery.clone(),
            ),
            reveal: RevealPipeline::new(gate.clone(), store.clone()),
            mailbox: MailboxService::new(gate, store),
            key_source,
            delivery,
            db_path,
        })
    }

    fn plain_request(to: &str, subject: &str, body: &str) -> SendRequest {
        SendRequest {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            attachment: None,
        }
    }

    #[tokio::test]
    async fn send_creates_a_record_visible_in_both_views() -> anyhow::Result<()> {
        let h = harness().await?;
        let receipt = h
            .send
            .send(
                Some(&bearer("alice@x")),
                plain_request("bob@x", "Hi", "Hello"),
            )
            .await?;
        assert_eq!(receipt.delivery, DeliveryStatus::Relayed);
        assert_eq!(receipt.channel_quality, 0.0042);

        let inbox = h.mailbox.inbox(Some(&bearer("bob@x"))).await?;
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].id, receipt.message_id);
        assert_eq!(inbox[0].sender_address, "alice@x");
        assert_eq!(inbox[0].recipient_address, "bob@x");
        assert!(!inbox[0].is_read);

        let sent = h.mailbox.sent(Some(&bearer("alice@x"))).await?;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, receipt.message_id);

        assert!(h.mailbox.inbox(Some(&bearer("carol@x"))).await?.is_empty());

        let relayed = h.delivery.sent.lock().unwrap();
        assert_eq!(relayed.len(), 1);
        // Only ciphertext leaves the system.
        assert_ne!(relayed[0].subject, "Hi");
        assert!(!relayed[0].body.contains("Hello"));

        h.cleanup();
        Ok(())
    }

    #[tokio::test]
    async fn reveal_returns_plaintext_and_marks_read() -> anyhow::Result<()> {
        let h = harness().await?;
        let receipt = h
            .send
            .send(
                Some(&bearer("alice@x")),
                plain_request("bob@x", "Hi", "Hello"),
            )
            .await?;

        let revealed = h
            .reveal
            .reveal(Some(&bearer("bob@x")), receipt.message_id)
            .await?;
        assert_eq!(revealed.subject, "Hi");
        assert_eq!(revealed.body, "Hello");
        assert!(revealed.attachment.is_none());

        let inbox = h.mailbox.inbox(Some(&bearer("bob@x"))).await?;
        assert!(inbox[0].is_read);

        h.cleanup();
        Ok(())
    }

    #[tokio::test]
    async fn reveal_is_idempotent() -> anyhow::Result<()> {
        let h = harness().await?;
        let receipt = h
            .send
            .send(
                Some(&bearer("alice@x")),
                plain_request("bob@x", "Hi", "Hello"),
            )
            .await?;

        let first = h
            .reveal
            .reveal(Some(&bearer("bob@x")), receipt.message_id)
            .await?;
        let second = h
            .reveal
            .reveal(Some(&bearer("bob@x")), receipt.message_id)
            .await?;
        assert_eq!(first.subject, second.subject);
        assert_eq!(first.body, second.body);

        h.cleanup();
        Ok(())
    }

    #[tokio::test]
    async fn sender_can_reveal_without_flipping_the_read_flag() -> anyhow::Result<()> {
        let h = harness().await?;
        let receipt = h
            .send
            .send(
                Some(&bearer("alice@x")),
                plain_request("bob@x", "Hi", "Hello"),
            )
            .await?;

        let revealed = h
            .reveal
            .reveal(Some(&bearer("alice@x")), receipt.message_id)
            .await?;
        assert_eq!(revealed.body, "Hello");

        let inbox = h.mailbox.inbox(Some(&bearer("bob@x"))).await?;
        assert!(!inbox[0].is_read);

        h.cleanup();
        Ok(())
    }

    #[tokio::test]
    async fn uninvolved_mailbox_gets_unauthorized() -> anyhow::Result<()> {
        let h = harness().await?;
        let receipt = h
            .send
            .send(
                Some(&bearer("alice@x")),
                plain_request("bob@x", "Hi", "Hello"),
            )
            .await?;

        assert!(matches!(
            h.reveal
                .reveal(Some(&bearer("carol@x")), receipt.message_id)
                .await,
            Err(PipelineError::Unauthorized)
        ));
        assert!(matches!(
            h.mailbox
                .message(Some(&bearer("carol@x")), receipt.message_id)
                .await,
            Err(PipelineError::Unauthorized)
        ));

        h.cleanup();
        Ok(())
    }

    #[tokio::test]
    async fn attachment_round_trips_and_sizes_the_key_request() -> anyhow::Result<()> {
        let h = harness().await?;
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
        let receipt = h
            .send
            .send(
                Some(&bearer("alice@x")),
                SendRequest {
                    to: "bob@x".to_string(),
                    subject: "abc".to_string(),
                    body: "hello".to_string(),
                    attachment: Some(AttachmentUpload {
                        filename: "data.bin".to_string(),
                        content: content.clone(),
                    }),
                },
            )
            .await?;

        // max(128, 8 x 5) + 10 000
        assert_eq!(*h.key_source.last_requested.lock().unwrap(), 10_128);

        let revealed = h
            .reveal
            .reveal(Some(&bearer("bob@x")), receipt.message_id)
            .await?;
        let attachment = revealed
            .attachment
            .ok_or_else(|| anyhow::anyhow!("missing attachment"))?;
        assert_eq!(attachment.filename, "data.bin");
        assert_eq!(STANDARD.decode(attachment.content_base64)?, content);

        h.cleanup();
        Ok(())
    }

    #[tokio::test]
    async fn key_source_failure_leaves_no_record() -> anyhow::Result<()> {
        let db_path = temp_db_path();
        let store = SqliteMailStore::connect(
            db_path
                .to_str()
                .ok_or_else(|| anyhow::anyhow!("invalid temp db path"))?,
        )
        .await?;
        store.init().await?;
        let store: Arc<dyn MailStore> = Arc::new(store);
        let delivery = Arc::new(RecordingDelivery::new(false));
        let gate = AuthGate::new(codec());
        let send = SendPipeline::new(
            gate.clone(),
            store.clone(),
            Arc::new(FailingKeySource),
            delivery.clone(),
        );
        let mailbox = MailboxService::new(gate, store);

        let err = send
            .send(
                Some(&bearer("alice@x")),
                plain_request("bob@x", "Hi", "Hello"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::KeySourceUnavailable(_)));

        assert!(mailbox.inbox(Some(&bearer("bob@x"))).await?.is_empty());
        assert!(mailbox.sent(Some(&bearer("alice@x"))).await?.is_empty());
        assert!(delivery.sent.lock().unwrap().is_empty());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn delivery_failure_is_a_degraded_success() -> anyhow::Result<()> {
        let h = harness_with(true).await?;
        let receipt = h
            .send
            .send(
                Some(&bearer("alice@x")),
                plain_request("bob@x", "Hi", "Hello"),
            )
            .await?;
        match &receipt.delivery {
            DeliveryStatus::Failed { reason } => assert!(reason.contains("relay")),
            other => panic!("expected failed delivery, got {:?}", other),
        }

        // The record survives the relay failure on both sides.
        assert_eq!(h.mailbox.inbox(Some(&bearer("bob@x"))).await?.len(), 1);
        assert_eq!(h.mailbox.sent(Some(&bearer("alice@x"))).await?.len(), 1);
        let revealed = h
            .reveal
            .reveal(Some(&bearer("bob@x")), receipt.message_id)
            .await?;
        assert_eq!(revealed.body, "Hello");

        h.cleanup();
        Ok(())
    }

    #[tokio::test]
    async fn send_validation_rejects_incomplete_requests() -> anyhow::Result<()> {
        let h = harness().await?;
        let token = bearer("alice@x");

        assert!(matches!(
            h.send
                .send(Some(&token), plain_request("  ", "Hi", "Hello"))
                .await,
            Err(PipelineError::MissingFields("to"))
        ));
        assert!(matches!(
            h.send
                .send(Some(&token), plain_request("bob@x", "", "Hello"))
                .await,
            Err(PipelineError::MissingFields("subject"))
        ));
        assert!(matches!(
            h.send
                .send(Some(&token), plain_request("bob@x", "Hi", "  "))
                .await,
            Err(PipelineError::MissingFields("body"))
        ));
        assert!(matches!(
            h.send
                .send(Some(&token), plain_request("bob", "Hi", "Hello"))
                .await,
            Err(PipelineError::ValidationError(_))
        ));

        h.cleanup();
        Ok(())
    }

    #[tokio::test]
    async fn auth_gate_separates_missing_from_invalid_credentials() -> anyhow::Result<()> {
        let h = harness().await?;

        assert!(matches!(
            h.mailbox.inbox(None).await,
            Err(PipelineError::Unauthenticated)
        ));
        assert!(matches!(
            h.mailbox.inbox(Some("Bearer ")).await,
            Err(PipelineError::Unauthenticated)
        ));
        assert!(matches!(
            h.mailbox.inbox(Some("Bearer not-a-token")).await,
            Err(PipelineError::InvalidCredential)
        ));

        let expired = codec().issue("alice@x", Duration::minutes(-5));
        assert!(matches!(
            h.mailbox.inbox(Some(&format!("Bearer {}", expired))).await,
            Err(PipelineError::InvalidCredential)
        ));

        let valid = codec().issue("alice@x", Duration::minutes(5));
        let (payload, signature) = valid
            .split_once('.')
            .ok_or_else(|| anyhow::anyhow!("malformed token"))?;
        let forged = format!("{}x.{}", payload, signature);
        assert!(matches!(
            h.mailbox.inbox(Some(&format!("Bearer {}", forged))).await,
            Err(PipelineError::InvalidCredential)
        ));

        h.cleanup();
        Ok(())
    }

    #[tokio::test]
    async fn listings_never_expose_key_material_or_ciphertext() -> anyhow::Result<()> {
        let h = harness().await?;
        h.send
            .send(
                Some(&bearer("alice@x")),
                plain_request("bob@x", "Hi", "Hello"),
            )
            .await?;

        let inbox = h.mailbox.inbox(Some(&bearer("bob@x"))).await?;
        let json = serde_json::to_value(&inbox)?;
        let keys: Vec<String> = json[0]
            .as_object()
            .ok_or_else(|| anyhow::anyhow!("expected object"))?
            .keys()
            .cloned()
            .collect();
        for forbidden in ["key_material", "encrypted_subject", "encrypted_body", "ciphertext"] {
            assert!(!keys.iter().any(|k| k == forbidden), "leaked {}", forbidden);
        }

        h.cleanup();
        Ok(())
    }

    #[tokio::test]
    async fn trash_restore_and_purge_through_the_service() -> anyhow::Result<()> {
        let h = harness().await?;
        let receipt = h
            .send
            .send(
                Some(&bearer("alice@x")),
                plain_request("bob@x", "Hi", "Hello"),
            )
            .await?;
        let id = receipt.message_id;

        h.mailbox.move_to_trash(Some(&bearer("bob@x")), id).await?;
        assert!(h.mailbox.inbox(Some(&bearer("bob@x"))).await?.is_empty());
        assert_eq!(h.mailbox.trash(Some(&bearer("bob@x"))).await?.len(), 1);

        h.mailbox.restore(Some(&bearer("bob@x")), id).await?;
        assert_eq!(h.mailbox.inbox(Some(&bearer("bob@x"))).await?.len(), 1);

        assert!(matches!(
            h.mailbox.purge(Some(&bearer("alice@x")), id).await,
            Err(PipelineError::Unauthorized)
        ));
        h.mailbox.purge(Some(&bearer("bob@x")), id).await?;
        assert!(matches!(
            h.reveal.reveal(Some(&bearer("bob@x")), id).await,
            Err(PipelineError::NotFound)
        ));

        h.cleanup();
        Ok(())
    }

    #[tokio::test]
    async fn overview_returns_both_views() -> anyhow::Result<()> {
        let h = harness().await?;
        h.send
            .send(
                Some(&bearer("alice@x")),
                plain_request("bob@x", "Hi", "Hello"),
            )
            .await?;
        h.send
            .send(
                Some(&bearer("bob@x")),
                plain_request("alice@x", "Re: Hi", "Hey"),
            )
            .await?;

        let (inbox, sent) = h.mailbox.overview(Some(&bearer("bob@x"))).await?;
        assert_eq!(inbox.len(), 1);
        assert_eq!(sent.len(), 1);
        assert_eq!(inbox[0].sender_address, "alice@x");
        assert_eq!(sent[0].recipient_address, "alice@x");

        h.cleanup();
        Ok(())
    }

    #[tokio::test]
    async fn opening_a_message_marks_it_read_for_the_recipient_only() -> anyhow::Result<()> {
        let h = harness().await?;
        let receipt = h
            .send
            .send(
                Some(&bearer("alice@x")),
                plain_request("bob@x", "Hi", "Hello"),
            )
            .await?;

        // The sender opening their own sent mail does not flip the flag.
        let seen_by_sender = h
            .mailbox
            .message(Some(&bearer("alice@x")), receipt.message_id)
            .await?;
        assert!(!seen_by_sender.is_read);

        let seen_by_recipient = h
            .mailbox
            .message(Some(&bearer("bob@x")), receipt.message_id)
            .await?;
        assert!(seen_by_recipient.is_read);

        h.cleanup();
        Ok(())
    }
}
