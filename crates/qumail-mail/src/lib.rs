//! Outbound delivery collaborator (SMTP via lettre).
//!
//! The relay only ever sees ciphertext: the rendered subject and body are
//! the stored hex ciphertexts, and an attachment is reduced to a reference
//! line. Delivery is fire-and-forget relative to persistence; a failed
//! relay never rolls the stored record back.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
    message::{Mailbox, Message},
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
    },
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    pub skip_tls_verify: bool,
}

/// A message as handed to the relay. Plaintext never reaches this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

/// Render the outbound representation of a stored ciphertext message: hex
/// subject, hex body, and a reference line when an encrypted attachment
/// rides along.
pub fn render_outbound(
    recipient: &str,
    subject_ciphertext: &str,
    body_ciphertext: &str,
    attachment_name: Option<&str>,
) -> RenderedMessage {
    let mut body = body_ciphertext.to_string();
    if let Some(name) = attachment_name {
        body.push_str(&format!(
            "\n\nAttachment (encrypted): {} (reveal in QuMail to download)",
            name
        ));
    }
    RenderedMessage {
        recipient: recipient.to_string(),
        subject: subject_ciphertext.to_string(),
        body,
    }
}

#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn deliver(&self, message: &RenderedMessage) -> Result<()>;
}

pub struct SmtpDelivery {
    config: SmtpConfig,
}

impl SmtpDelivery {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DeliveryTransport for SmtpDelivery {
    async fn deliver(&self, message: &RenderedMessage) -> Result<()> {
        let from = parse_mailbox(&self.config.from)?;
        let to = parse_mailbox(&message.recipient)?;
        let email = Message::builder()
            .from(from)
            .to(to)
            .subject(message.subject.clone())
            .body(message.body.clone())?;

        let creds = Credentials::new(self.config.username.clone(), self.config.password.clone());
        let mut tls_builder = TlsParameters::builder(self.config.host.clone());
        if self.config.skip_tls_verify {
            tls_builder = tls_builder
                .dangerous_accept_invalid_certs(true)
                .dangerous_accept_invalid_hostnames(true);
        }
        let tls_parameters = tls_builder.build()?;
        let builder = if self.config.port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.config.host)
                .port(self.config.port)
                .tls(Tls::Wrapper(tls_parameters))
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.config.host)
                .port(self.config.port)
                .tls(Tls::Required(tls_parameters))
        };
        let mailer = builder.credentials(creds).build();

        mailer
            .send(email)
            .await
            .map_err(|e| anyhow!(e.to_string()))?;
        Ok(())
    }
}

fn parse_mailbox(input: &str) -> Result<Mailbox> {
    let trimmed = input.trim();
    if let (Some(start), Some(end)) = (trimmed.find('<'), trimmed.find('>')) {
        let name = trimmed[..start].trim().trim_matches('"');
        let addr = trimmed[start + 1..end].trim();
        return Ok(Mailbox::new(Some(name.to_string()), addr.parse()?));
    }
    Ok(Mailbox::new(None, trimmed.parse()?))
}
