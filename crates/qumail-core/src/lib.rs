//! Data model and persistence for ciphertext-only message records.
//!
//! One table holds every message; inbox, sent and trash are filtered views
//! over it, not separate stores. Records are written once by the send
//! pipeline and never mutated afterwards except for the read and trash
//! flags. Plaintext never reaches this crate.

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{SqlitePool, sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions};
use thiserror::Error;

use qumail_crypto::EncryptedField;

static LOG_FILE: OnceLock<Mutex<Option<std::fs::File>>> = OnceLock::new();

pub fn log_debug(msg: &str) {
    if std::env::var("QUMAIL_LOG").is_err() {
        return;
    }
    let base = std::env::var_os("XDG_STATE_HOME")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local").join("state"))
        })
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    let path = base.join("qumail").join("qumail.log");
    let lock = LOG_FILE.get_or_init(|| {
        let _ = std::fs::create_dir_all(
            path.parent()
                .unwrap_or_else(|| std::path::Path::new("/tmp")),
        );
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .ok();
        Mutex::new(file)
    });
    if let Ok(mut guard) = lock.lock() {
        if let Some(file) = guard.as_mut() {
            let ts = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let _ = writeln!(file, "[{}] {}", ts, msg);
        }
    }
}

#[derive(Error, Debug)]
pub enum MailError {
    #[error("message not found")]
    NotFound,
    #[error("mailbox is neither sender nor recipient of this message")]
    Unauthorized,
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Mailbox views over the single record set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxRole {
    Inbox,
    Sent,
    Trash,
}

/// A full at-rest record, including the key material the reveal pipeline
/// needs. Only `fetch_by_id` ever returns this shape; listings use
/// [`MessageSummary`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub sender_address: String,
    pub recipient_address: String,
    pub encrypted_subject: EncryptedField,
    pub encrypted_body: EncryptedField,
    pub subject_length: i64,
    pub body_length: i64,
    pub attachment_length: i64,
    pub attachment_name: Option<String>,
    pub attachment_ciphertext: Option<EncryptedField>,
    pub key_material: String,
    pub channel_quality: f64,
    pub is_read: bool,
    pub trashed: bool,
    pub created_at: String,
}

/// Insert payload. The store assigns id and creation timestamps; read and
/// trash flags start cleared.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_address: String,
    pub recipient_address: String,
    pub encrypted_subject: EncryptedField,
    pub encrypted_body: EncryptedField,
    pub subject_length: i64,
    pub body_length: i64,
    pub attachment_length: i64,
    pub attachment_name: Option<String>,
    pub attachment_ciphertext: Option<EncryptedField>,
    pub key_material: String,
    pub channel_quality: f64,
}

/// Metadata-only projection used by every listing. Carries no key material
/// and no ciphertext, so nothing in a list response can feed a decryption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSummary {
    pub id: i64,
    pub sender_address: String,
    pub recipient_address: String,
    pub attachment_name: Option<String>,
    pub channel_quality: f64,
    pub is_read: bool,
    pub created_at: String,
}

#[async_trait]
pub trait MailStore: Send + Sync {
    /// Persist a new record atomically and return its id.
    async fn insert(&self, message: NewMessage) -> Result<i64, MailError>;
    /// Full record fetch, gated to the record's sender or recipient.
    async fn fetch_by_id(&self, id: i64, requester: &str) -> Result<MessageRecord, MailError>;
    /// Metadata-only listing of one mailbox view, newest first.
    async fn list_by_mailbox(
        &self,
        mailbox: &str,
        role: MailboxRole,
    ) -> Result<Vec<MessageSummary>, MailError>;
    /// Recipient-only; idempotent once set.
    async fn mark_read(&self, id: i64, requester: &str) -> Result<(), MailError>;
    /// Recipient-only trash-flag mutations. Trash is a filter, not a delete.
    async fn move_to_trash(&self, id: i64, requester: &str) -> Result<(), MailError>;
    async fn restore(&self, id: i64, requester: &str) -> Result<(), MailError>;
    /// Recipient-only, irreversible removal.
    async fn purge(&self, id: i64, requester: &str) -> Result<(), MailError>;
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    sender_addr: String,
    recipient_addr: String,
    subject_iv: String,
    subject_ct: String,
    body_iv: String,
    body_ct: String,
    subject_len: i64,
    body_len: i64,
    attachment_len: i64,
    attachment_name: Option<String>,
    attachment_iv: Option<String>,
    attachment_ct: Option<String>,
    key_material: String,
    channel_quality: f64,
    is_read: bool,
    trashed: bool,
    created_at: String,
}

impl From<MessageRow> for MessageRecord {
    fn from(row: MessageRow) -> Self {
        let attachment_ciphertext = match (row.attachment_iv, row.attachment_ct) {
            (Some(iv), Some(ciphertext)) => Some(EncryptedField { iv, ciphertext }),
            _ => None,
        };
        MessageRecord {
            id: row.id,
            sender_address: row.sender_addr,
            recipient_address: row.recipient_addr,
            encrypted_subject: EncryptedField {
                iv: row.subject_iv,
                ciphertext: row.subject_ct,
            },
            encrypted_body: EncryptedField {
                iv: row.body_iv,
                ciphertext: row.body_ct,
            },
            subject_length: row.subject_len,
            body_length: row.body_len,
            attachment_length: row.attachment_len,
            attachment_name: row.attachment_name,
            attachment_ciphertext,
            key_material: row.key_material,
            channel_quality: row.channel_quality,
            is_read: row.is_read,
            trashed: row.trashed,
            created_at: row.created_at,
        }
    }
}

const RECORD_COLUMNS: &str = "id, sender_addr, recipient_addr, subject_iv, subject_ct, \
     body_iv, body_ct, subject_len, body_len, attachment_len, attachment_name, \
     attachment_iv, attachment_ct, key_material, channel_quality, is_read, trashed, created_at";

#[derive(Clone)]
pub struct SqliteMailStore {
    pool: SqlitePool,
}

impl SqliteMailStore {
    pub async fn connect(path: &str) -> Result<Self, MailError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{}", path)
        };
        let options = SqliteConnectOptions::new()
            .filename(url.trim_start_matches("sqlite:"))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn init(&self) -> Result<(), MailError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn fetch_row(&self, id: i64) -> Result<MessageRow, MailError> {
        let query = format!("SELECT {} FROM messages WHERE id = ?", RECORD_COLUMNS);
        sqlx::query_as::<_, MessageRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(MailError::NotFound)
    }

    /// Trash, restore, purge and mark-read all belong to the recipient; the
    /// sender's view of the record is not theirs to mutate.
    async fn recipient_guard(&self, id: i64, requester: &str) -> Result<(), MailError> {
        let row = sqlx::query_as::<_, (String,)>("SELECT recipient_addr FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(MailError::NotFound)?;
        if row.0 != requester {
            return Err(MailError::Unauthorized);
        }
        Ok(())
    }
}

#[async_trait]
impl MailStore for SqliteMailStore {
    async fn insert(&self, message: NewMessage) -> Result<i64, MailError> {
        let now = Utc::now();
        let (attachment_iv, attachment_ct) = match &message.attachment_ciphertext {
            Some(field) => (Some(field.iv.clone()), Some(field.ciphertext.clone())),
            None => (None, None),
        };
        let result = sqlx::query(
            "INSERT INTO messages (sender_addr, recipient_addr, subject_iv, subject_ct, \
             body_iv, body_ct, subject_len, body_len, attachment_len, attachment_name, \
             attachment_iv, attachment_ct, key_material, channel_quality, is_read, trashed, \
             created_at, created_ts)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, ?, ?)",
        )
        .bind(&message.sender_address)
        .bind(&message.recipient_address)
        .bind(&message.encrypted_subject.iv)
        .bind(&message.encrypted_subject.ciphertext)
        .bind(&message.encrypted_body.iv)
        .bind(&message.encrypted_body.ciphertext)
        .bind(message.subject_length)
        .bind(message.body_length)
        .bind(message.attachment_length)
        .bind(&message.attachment_name)
        .bind(attachment_iv)
        .bind(attachment_ct)
        .bind(&message.key_material)
        .bind(message.channel_quality)
        .bind(now.to_rfc3339())
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn fetch_by_id(&self, id: i64, requester: &str) -> Result<MessageRecord, MailError> {
        let row = self.fetch_row(id).await?;
        if row.sender_addr != requester && row.recipient_addr != requester {
            return Err(MailError::Unauthorized);
        }
        Ok(row.into())
    }

    async fn list_by_mailbox(
        &self,
        mailbox: &str,
        role: MailboxRole,
    ) -> Result<Vec<MessageSummary>, MailError> {
        let filter = match role {
            MailboxRole::Inbox => "recipient_addr = ? AND trashed = 0",
            MailboxRole::Trash => "recipient_addr = ? AND trashed = 1",
            MailboxRole::Sent => "sender_addr = ?",
        };
        let query = format!(
            "SELECT id, sender_addr, recipient_addr, attachment_name, channel_quality, \
             is_read, created_at
             FROM messages WHERE {}
             ORDER BY created_ts DESC, id DESC",
            filter
        );
        let rows = sqlx::query_as::<_, (i64, String, String, Option<String>, f64, bool, String)>(
            &query,
        )
        .bind(mailbox)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| MessageSummary {
                id: row.0,
                sender_address: row.1,
                recipient_address: row.2,
                attachment_name: row.3,
                channel_quality: row.4,
                is_read: row.5,
                created_at: row.6,
            })
            .collect())
    }

    async fn mark_read(&self, id: i64, requester: &str) -> Result<(), MailError> {
        self.recipient_guard(id, requester).await?;
        sqlx::query("UPDATE messages SET is_read = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn move_to_trash(&self, id: i64, requester: &str) -> Result<(), MailError> {
        self.recipient_guard(id, requester).await?;
        sqlx::query("UPDATE messages SET trashed = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn restore(&self, id: i64, requester: &str) -> Result<(), MailError> {
        self.recipient_guard(id, requester).await?;
        sqlx::query("UPDATE messages SET trashed = 0 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge(&self, id: i64, requester: &str) -> Result<(), MailError> {
        self.recipient_guard(id, requester).await?;
        sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
