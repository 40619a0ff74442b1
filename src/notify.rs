use crate::db;
use crate::mailer::{self, MailerConfig};
use rusqlite::Connection;
use uuid::Uuid;

/// The closed set of notification tags. Downstream rendering matches on
/// this exhaustively; there is no free-form variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    StudentCreated,
    StudentUpdated,
    NoteAdded,
    WeeklyReport,
    Welcome,
    SystemAnnouncement,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::StudentCreated => "student_created",
            NotificationKind::StudentUpdated => "student_updated",
            NotificationKind::NoteAdded => "note_added",
            NotificationKind::WeeklyReport => "weekly_report",
            NotificationKind::Welcome => "welcome",
            NotificationKind::SystemAnnouncement => "system_announcement",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "student_created" => Some(NotificationKind::StudentCreated),
            "student_updated" => Some(NotificationKind::StudentUpdated),
            "note_added" => Some(NotificationKind::NoteAdded),
            "weekly_report" => Some(NotificationKind::WeeklyReport),
            "welcome" => Some(NotificationKind::Welcome),
            "system_announcement" => Some(NotificationKind::SystemAnnouncement),
            _ => None,
        }
    }
}

/// A fan-out target: the user a notification row belongs to and the address
/// its email copy goes to.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub user_id: String,
    pub email: String,
}

fn insert_notification(
    conn: &Connection,
    user_id: &str,
    kind: NotificationKind,
    title: &str,
    message: &str,
) -> anyhow::Result<()> {
    let now = db::now_utc();
    conn.execute(
        "INSERT INTO notifications(id, user_id, title, message, notification_type, read, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, 0, ?, ?)",
        (
            &Uuid::new_v4().to_string(),
            user_id,
            title,
            message,
            kind.as_str(),
            &now,
            &now,
        ),
    )?;
    Ok(())
}

fn fan_out(
    conn: &Connection,
    cfg: &MailerConfig,
    recipient: &Recipient,
    kind: NotificationKind,
    title: &str,
    message: &str,
    subject: &str,
) -> anyhow::Result<()> {
    if recipient.email.trim().is_empty() {
        return Ok(());
    }
    insert_notification(conn, &recipient.user_id, kind, title, message)?;
    mailer::enqueue_and_send(conn, cfg, &recipient.email, subject, message)
}

pub fn student_created(
    conn: &Connection,
    cfg: &MailerConfig,
    recipient: &Recipient,
    student_name: &str,
    total_score: i64,
) -> anyhow::Result<()> {
    fan_out(
        conn,
        cfg,
        recipient,
        NotificationKind::StudentCreated,
        "New Student Added",
        &format!(
            "{} has been added to your class with a score of {}/40.",
            student_name, total_score
        ),
        &format!("New Student Added: {}", student_name),
    )
}

pub fn student_updated(
    conn: &Connection,
    cfg: &MailerConfig,
    recipient: &Recipient,
    student_name: &str,
    total_score: i64,
) -> anyhow::Result<()> {
    fan_out(
        conn,
        cfg,
        recipient,
        NotificationKind::StudentUpdated,
        "Student Updated",
        &format!(
            "{}'s information has been updated. New score: {}/40.",
            student_name, total_score
        ),
        &format!("Student Updated: {}", student_name),
    )
}

pub fn note_added(
    conn: &Connection,
    cfg: &MailerConfig,
    recipient: &Recipient,
    student_name: &str,
    note_content: &str,
) -> anyhow::Result<()> {
    fan_out(
        conn,
        cfg,
        recipient,
        NotificationKind::NoteAdded,
        "New Note Added",
        &format!(
            "A new note has been added for {}: {}",
            student_name,
            truncate_message(note_content)
        ),
        &format!("New Note Added for {}", student_name),
    )
}

pub fn welcome(conn: &Connection, cfg: &MailerConfig, recipient: &Recipient) -> anyhow::Result<()> {
    fan_out(
        conn,
        cfg,
        recipient,
        NotificationKind::Welcome,
        "Welcome!",
        "Welcome to the Student Records Management System! \
         Your account has been created successfully.",
        "Welcome to the Student Records Management System",
    )
}

/// Previous-calendar-week digest for every teacher and admin. Triggered on
/// demand; the daemon does no background scheduling.
pub fn weekly_reports(conn: &Connection, cfg: &MailerConfig) -> anyhow::Result<usize> {
    use chrono::{Datelike, Duration, Utc};

    let today = Utc::now().date_naive();
    let this_monday = today - Duration::days(today.weekday().num_days_from_monday() as i64);
    let week_start = (this_monday - Duration::days(7)).format("%Y-%m-%dT00:00:00Z");
    let week_end = this_monday.format("%Y-%m-%dT00:00:00Z");
    let (week_start, week_end) = (week_start.to_string(), week_end.to_string());

    let mut stmt = conn.prepare("SELECT id, email FROM users WHERE role IN (1, 2)")?;
    let recipients: Vec<Recipient> = stmt
        .query_map([], |r| {
            Ok(Recipient {
                user_id: r.get(0)?,
                email: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut notified = 0usize;
    for recipient in recipients {
        if recipient.email.trim().is_empty() {
            continue;
        }

        let (total_students, average_score): (i64, f64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(AVG(total_score), 0)
             FROM students WHERE user_id = ?",
            [&recipient.user_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        let new_notes: i64 = conn.query_row(
            "SELECT COUNT(*) FROM notes
             WHERE user_id = ? AND created_at >= ? AND created_at < ?",
            (&recipient.user_id, &week_start, &week_end),
            |r| r.get(0),
        )?;
        let top_performers: i64 = conn.query_row(
            "SELECT COUNT(*) FROM students WHERE user_id = ? AND total_score >= 35",
            [&recipient.user_id],
            |r| r.get(0),
        )?;

        let message = format!(
            "Your weekly student progress report is ready. {} students, {} new notes.",
            total_students, new_notes
        );
        insert_notification(
            conn,
            &recipient.user_id,
            NotificationKind::WeeklyReport,
            "Weekly Report Available",
            &message,
        )?;

        let body = format!(
            "{}\nAverage score: {:.2}/40. Top performers (35+): {}.",
            message,
            average_score,
            top_performers
        );
        mailer::enqueue_and_send(
            conn,
            cfg,
            &recipient.email,
            &format!(
                "Weekly Student Progress Report - {}",
                today.format("%B %d, %Y")
            ),
            &body,
        )?;
        notified += 1;
    }
    Ok(notified)
}

/// Broadcast an announcement to every user, or to an explicit target list.
pub fn system_announcement(
    conn: &Connection,
    cfg: &MailerConfig,
    title: &str,
    message: &str,
    target_user_ids: Option<&[String]>,
) -> anyhow::Result<usize> {
    let recipients: Vec<Recipient> = match target_user_ids {
        Some(ids) => {
            let mut out = Vec::new();
            let mut stmt = conn.prepare("SELECT id, email FROM users WHERE id = ?")?;
            for id in ids {
                let found = stmt
                    .query_map([id], |r| {
                        Ok(Recipient {
                            user_id: r.get(0)?,
                            email: r.get(1)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                out.extend(found);
            }
            out
        }
        None => {
            let mut stmt = conn.prepare("SELECT id, email FROM users")?;
            let all = stmt
                .query_map([], |r| {
                    Ok(Recipient {
                        user_id: r.get(0)?,
                        email: r.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            all
        }
    };

    let mut notified = 0usize;
    for recipient in recipients {
        if recipient.email.trim().is_empty() {
            continue;
        }
        insert_notification(
            conn,
            &recipient.user_id,
            NotificationKind::SystemAnnouncement,
            title,
            message,
        )?;
        mailer::enqueue_and_send(
            conn,
            cfg,
            &recipient.email,
            &format!("System Announcement: {}", title),
            message,
        )?;
        notified += 1;
    }
    Ok(notified)
}

/// Returns false when the notification doesn't exist or belongs to someone
/// else; ownership is enforced here, not in the handler.
pub fn mark_as_read(conn: &Connection, user_id: &str, notification_id: &str) -> anyhow::Result<bool> {
    let changed = conn.execute(
        "UPDATE notifications SET read = 1, updated_at = ? WHERE id = ? AND user_id = ?",
        (&db::now_utc(), notification_id, user_id),
    )?;
    Ok(changed > 0)
}

pub fn mark_all_as_read(conn: &Connection, user_id: &str) -> anyhow::Result<usize> {
    let changed = conn.execute(
        "UPDATE notifications SET read = 1, updated_at = ? WHERE user_id = ? AND read = 0",
        (&db::now_utc(), user_id),
    )?;
    Ok(changed)
}

pub fn unread_count(conn: &Connection, user_id: &str) -> anyhow::Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM notifications WHERE user_id = ? AND read = 0",
        [user_id],
        |r| r.get(0),
    )?;
    Ok(count)
}

/// Truncate an embedded note excerpt for a notification message.
pub fn truncate_message(content: &str) -> String {
    const LIMIT: usize = 50;
    if content.chars().count() <= LIMIT {
        return content.to_string();
    }
    let head: String = content.chars().take(LIMIT).collect();
    format!("{}...", head)
}
