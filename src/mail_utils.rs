// mail_utils.rs
use crate::sql_utils::{quote_str, SqlConnection, SqlSession};
use async_trait::async_trait;

/// Pipeline outcomes a human gets told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyEvent {
    UploadSucceeded,
    UploadFailed,
    SchemaCreated,
    SchemaDropped,
}

impl NotifyEvent {
    /// Subject line for the event, `target` names the table or schema
    /// concerned.
    pub fn subject(&self, target: &str) -> String {
        match self {
            NotifyEvent::UploadSucceeded => format!("New data added to {}", target),
            NotifyEvent::UploadFailed => "Crawler Error".to_string(),
            NotifyEvent::SchemaCreated => format!("New schema created: {}", target),
            NotifyEvent::SchemaDropped => format!("Schema rolled back: {}", target),
        }
    }
}

/// A mail-sending capability. Implementations deliver an HTML body to a
/// recipient list; how they do it is their business.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, recipients: &[String], subject: &str, html_body: &str)
        -> anyhow::Result<()>;
}

/// Sends mail through the database itself via `msdb.dbo.sp_send_dbmail`,
/// opening a short-lived session per message so a broken mail path never
/// holds pipeline connections.
pub struct DbMail {
    pub username: String,
    pub password: String,
    pub server: String,
    pub database: String,
    pub profile: String,
}

impl DbMail {
    pub fn new(username: &str, password: &str, server: &str, database: &str) -> Self {
        DbMail {
            username: username.to_string(),
            password: password.to_string(),
            server: server.to_string(),
            database: database.to_string(),
            profile: "TechnologySupport".to_string(),
        }
    }
}

#[async_trait]
impl MailTransport for DbMail {
    async fn send(
        &self,
        recipients: &[String],
        subject: &str,
        html_body: &str,
    ) -> anyhow::Result<()> {
        let mut conn =
            SqlConnection::connect(&self.username, &self.password, &self.server, &self.database)
                .await?;
        let stmt = format!(
            "BEGIN EXEC msdb.dbo.sp_send_dbmail @profile_name = {}, @recipients = {}, @body = {}, @body_format = 'HTML', @subject = {}; END",
            quote_str(&self.profile),
            quote_str(&recipients.join(";")),
            quote_str(html_body),
            quote_str(subject)
        );
        conn.execute(&stmt).await?;
        Ok(())
    }
}

/// A transport that delivers nothing, for pipelines that run without mail.
pub struct NullMail;

#[async_trait]
impl MailTransport for NullMail {
    async fn send(&self, _: &[String], _: &str, _: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Dispatches pipeline notifications. The pipeline calls it unconditionally;
/// when disabled (or the recipient list is empty) it no-ops internally so
/// control flow never changes. A transport failure is logged and swallowed,
/// never propagated, so a notification problem cannot mask the pipeline
/// outcome it reports on.
pub struct Notifier {
    enabled: bool,
    recipients: Vec<String>,
    transport: Box<dyn MailTransport>,
}

impl Notifier {
    pub fn new(transport: Box<dyn MailTransport>, recipients: Vec<String>) -> Self {
        Notifier {
            enabled: true,
            recipients,
            transport,
        }
    }

    /// A notifier that never sends anything.
    pub fn disabled() -> Self {
        Notifier {
            enabled: false,
            recipients: Vec::new(),
            transport: Box::new(NullMail),
        }
    }

    /// Builds a notifier from the crawler environment contract: `SEND_EMAIL`
    /// set to "False" disables sending, `EMAILS` holds a JSON array of
    /// recipient addresses.
    pub fn from_env(transport: Box<dyn MailTransport>) -> Self {
        let enabled = std::env::var("SEND_EMAIL").map(|v| v != "False").unwrap_or(true);
        let recipients = std::env::var("EMAILS")
            .ok()
            .and_then(|raw| serde_json::from_str::<Vec<String>>(&raw).ok())
            .unwrap_or_default();
        Notifier {
            enabled,
            recipients,
            transport,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) -> &mut Self {
        self.enabled = enabled;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Formats and dispatches one notification. Never raises.
    pub async fn notify(&self, event: NotifyEvent, target: &str, html_body: &str) {
        if !self.enabled || self.recipients.is_empty() {
            return;
        }
        let subject = event.subject(target);
        match self
            .transport
            .send(&self.recipients, &subject, html_body)
            .await
        {
            Ok(()) => {
                tracing::info!(subject = %subject, recipients = self.recipients.len(), "mail sent");
            }
            Err(e) => {
                tracing::warn!(subject = %subject, error = %e, "notification delivery failed");
            }
        }
    }
}
