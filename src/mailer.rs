use crate::db;
use anyhow::Context;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use rusqlite::Connection;
use uuid::Uuid;

const DEFAULT_FROM: &str = "noreply@studentrecords.com";

/// SMTP settings, read once at startup. With no relay configured the mailer
/// only records outbox rows; nothing ever fails because of mail.
#[derive(Debug, Clone)]
pub struct MailerConfig {
    pub relay: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
}

impl MailerConfig {
    pub fn from_env() -> Self {
        let nonempty = |k: &str| std::env::var(k).ok().filter(|v| !v.trim().is_empty());
        Self {
            relay: nonempty("SKILLBOOKD_SMTP_RELAY"),
            port: nonempty("SKILLBOOKD_SMTP_PORT").and_then(|v| v.trim().parse().ok()),
            username: nonempty("SKILLBOOKD_SMTP_USERNAME"),
            password: nonempty("SKILLBOOKD_SMTP_PASSWORD"),
            from: nonempty("SKILLBOOKD_MAIL_FROM").unwrap_or_else(|| DEFAULT_FROM.to_string()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.relay.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FlushSummary {
    pub attempted: usize,
    pub sent: usize,
}

/// Record an outgoing email and make one delivery attempt. Delivery is
/// fire-and-continue: failures are logged and the row stays pending for a
/// later `mailer.flush`; only the outbox write itself can error.
pub fn enqueue_and_send(
    conn: &Connection,
    cfg: &MailerConfig,
    recipient: &str,
    subject: &str,
    body: &str,
) -> anyhow::Result<()> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO email_outbox(id, recipient, subject, body, created_at, sent_at)
         VALUES(?, ?, ?, ?, ?, NULL)",
        (&id, recipient, subject, body, &db::now_utc()),
    )?;

    if !cfg.enabled() {
        return Ok(());
    }

    match send_now(cfg, recipient, subject, body) {
        Ok(()) => {
            conn.execute(
                "UPDATE email_outbox SET sent_at = ? WHERE id = ?",
                (&db::now_utc(), &id),
            )?;
        }
        Err(e) => {
            log::warn!("mail delivery to {} failed: {:#}", recipient, e);
        }
    }
    Ok(())
}

/// Re-attempt every pending outbox row.
pub fn flush_pending(conn: &Connection, cfg: &MailerConfig) -> anyhow::Result<FlushSummary> {
    let mut stmt = conn.prepare(
        "SELECT id, recipient, subject, body FROM email_outbox
         WHERE sent_at IS NULL
         ORDER BY created_at",
    )?;
    let pending: Vec<(String, String, String, String)> = stmt
        .query_map([], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut summary = FlushSummary {
        attempted: pending.len(),
        sent: 0,
    };
    if !cfg.enabled() {
        return Ok(summary);
    }

    for (id, recipient, subject, body) in pending {
        match send_now(cfg, &recipient, &subject, &body) {
            Ok(()) => {
                conn.execute(
                    "UPDATE email_outbox SET sent_at = ? WHERE id = ?",
                    (&db::now_utc(), &id),
                )?;
                summary.sent += 1;
            }
            Err(e) => {
                log::warn!("mail delivery to {} failed: {:#}", recipient, e);
            }
        }
    }
    Ok(summary)
}

fn send_now(cfg: &MailerConfig, recipient: &str, subject: &str, body: &str) -> anyhow::Result<()> {
    let relay = cfg
        .relay
        .as_deref()
        .context("no SMTP relay configured")?;

    let from: Mailbox = cfg
        .from
        .parse()
        .with_context(|| format!("invalid sender address {}", cfg.from))?;
    let to: Mailbox = recipient
        .parse()
        .with_context(|| format!("invalid recipient address {}", recipient))?;

    let message = Message::builder()
        .from(from)
        .to(to)
        .subject(subject)
        .body(body.to_string())
        .context("failed to build email message")?;

    let mut builder = SmtpTransport::relay(relay).context("invalid SMTP relay")?;
    if let Some(port) = cfg.port {
        builder = builder.port(port);
    }
    if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
        builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
    }
    let transport = builder.build();

    transport.send(&message).context("SMTP send failed")?;
    Ok(())
}
