use crate::calc;
use crate::db;
use anyhow::Context;
use rusqlite::Connection;
use std::path::Path;
use uuid::Uuid;

pub const STUDENTS_EXPORT_HEADER: &str =
    "ID,Name,Reading,Writing,Listening,Speaking,Total Score,Percentage,\
     Created At,Updated At,Teacher,Notes Count";
pub const NOTES_EXPORT_HEADER: &str = "ID,Student,Content,Author,Created At,Updated At";
pub const STUDENTS_IMPORT_HEADER: &str = "Name,Reading,Writing,Listening,Speaking,Teacher Email";

#[derive(Debug, Clone, Copy)]
pub struct ExportSummary {
    pub rows: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ImportSummary {
    pub imported: usize,
    pub errors: Vec<String>,
}

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '"' {
            if in_quotes && i + 1 < chars.len() && chars[i + 1] == '"' {
                buf.push('"');
                i += 2;
                continue;
            }
            in_quotes = !in_quotes;
            i += 1;
            continue;
        }
        if ch == ',' && !in_quotes {
            out.push(buf);
            buf = String::new();
            i += 1;
            continue;
        }
        buf.push(ch);
        i += 1;
    }
    out.push(buf);
    out
}

/// Stored ISO timestamps are exported in the original's spreadsheet-friendly
/// "YYYY-MM-DD HH:MM:SS" shape.
fn csv_timestamp(ts: &str) -> String {
    ts.trim_end_matches('Z').replace('T', " ")
}

pub fn export_students_csv(conn: &Connection, out_path: &Path) -> anyhow::Result<ExportSummary> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.name, s.reading, s.writing, s.listening, s.speaking,
                s.total_score, s.percentage, s.created_at, s.updated_at,
                (SELECT u.first_name || ' ' || u.last_name FROM users u WHERE u.id = s.user_id),
                (SELECT COUNT(*) FROM notes n WHERE n.student_id = s.id)
         FROM students s
         ORDER BY s.percentage DESC",
    )?;

    let mut csv = String::from(STUDENTS_EXPORT_HEADER);
    csv.push('\n');
    let mut rows = 0usize;

    let records = stmt.query_map([], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, i64>(2)?,
            r.get::<_, i64>(3)?,
            r.get::<_, i64>(4)?,
            r.get::<_, i64>(5)?,
            r.get::<_, i64>(6)?,
            r.get::<_, f64>(7)?,
            r.get::<_, String>(8)?,
            r.get::<_, String>(9)?,
            r.get::<_, Option<String>>(10)?,
            r.get::<_, i64>(11)?,
        ))
    })?;
    for record in records {
        let (id, name, reading, writing, listening, speaking, total, pct, created, updated, teacher, notes_count) =
            record?;
        csv.push_str(&format!(
            "{},{},{},{},{},{},{},{:.2},{},{},{},{}\n",
            csv_quote(&id),
            csv_quote(&name),
            reading,
            writing,
            listening,
            speaking,
            total,
            calc::round2(pct),
            csv_quote(&csv_timestamp(&created)),
            csv_quote(&csv_timestamp(&updated)),
            csv_quote(teacher.as_deref().unwrap_or("N/A")),
            notes_count
        ));
        rows += 1;
    }

    std::fs::write(out_path, csv)
        .with_context(|| format!("failed to write {}", out_path.to_string_lossy()))?;
    Ok(ExportSummary { rows })
}

pub fn export_notes_csv(conn: &Connection, out_path: &Path) -> anyhow::Result<ExportSummary> {
    let mut stmt = conn.prepare(
        "SELECT n.id, s.name, n.content,
                u.first_name || ' ' || u.last_name,
                n.created_at, n.updated_at
         FROM notes n
         JOIN students s ON s.id = n.student_id
         JOIN users u ON u.id = n.user_id
         ORDER BY n.created_at DESC",
    )?;

    let mut csv = String::from(NOTES_EXPORT_HEADER);
    csv.push('\n');
    let mut rows = 0usize;

    let records = stmt.query_map([], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, String>(2)?,
            r.get::<_, String>(3)?,
            r.get::<_, String>(4)?,
            r.get::<_, String>(5)?,
        ))
    })?;
    for record in records {
        let (id, student, content, author, created, updated) = record?;
        csv.push_str(&format!(
            "{},{},{},{},{},{}\n",
            csv_quote(&id),
            csv_quote(&student),
            csv_quote(&content),
            csv_quote(&author),
            csv_quote(&csv_timestamp(&created)),
            csv_quote(&csv_timestamp(&updated))
        ));
        rows += 1;
    }

    std::fs::write(out_path, csv)
        .with_context(|| format!("failed to write {}", out_path.to_string_lossy()))?;
    Ok(ExportSummary { rows })
}

/// The downloadable import template: documented header plus sample rows.
pub fn write_students_template_csv(out_path: &Path) -> anyhow::Result<()> {
    let mut csv = String::from(STUDENTS_IMPORT_HEADER);
    csv.push('\n');
    csv.push_str("John Doe,8,7,9,6,teacher@example.com\n");
    csv.push_str("Jane Smith,9,8,7,8,teacher@example.com\n");
    csv.push_str("Bob Johnson,7,9,8,7,teacher@example.com\n");
    std::fs::write(out_path, csv)
        .with_context(|| format!("failed to write {}", out_path.to_string_lossy()))?;
    Ok(())
}

fn header_index(header: &[String], name: &str) -> Option<usize> {
    header
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case(name))
}

fn parse_skill(fields: &[String], idx: usize) -> Option<i64> {
    fields
        .get(idx)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse::<i64>().ok())
}

/// Import students from a header-addressed CSV file. A bad row is reported
/// and skipped; the import itself never aborts on row data. `Teacher Email`
/// resolves to a teacher-role user; rows without one fall back to
/// `fallback_owner`.
pub fn import_students_csv(
    conn: &Connection,
    in_path: &Path,
    fallback_owner: Option<&str>,
) -> anyhow::Result<ImportSummary> {
    let text = std::fs::read_to_string(in_path)
        .with_context(|| format!("failed to read {}", in_path.to_string_lossy()))?;
    let mut lines = text.lines();

    let header = match lines.next() {
        Some(line) => parse_csv_record(line),
        None => anyhow::bail!("import file is empty"),
    };
    let name_idx = header_index(&header, "Name").context("missing required column: Name")?;
    let reading_idx =
        header_index(&header, "Reading").context("missing required column: Reading")?;
    let writing_idx =
        header_index(&header, "Writing").context("missing required column: Writing")?;
    let listening_idx =
        header_index(&header, "Listening").context("missing required column: Listening")?;
    let speaking_idx =
        header_index(&header, "Speaking").context("missing required column: Speaking")?;
    let teacher_idx = header_index(&header, "Teacher Email");

    let mut summary = ImportSummary::default();

    for (line_no, raw_line) in lines.enumerate() {
        let row_no = line_no + 2;
        if raw_line.trim().is_empty() {
            continue;
        }
        let fields = parse_csv_record(raw_line);

        let name = fields
            .get(name_idx)
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        let skills = [
            ("Reading", parse_skill(&fields, reading_idx)),
            ("Writing", parse_skill(&fields, writing_idx)),
            ("Listening", parse_skill(&fields, listening_idx)),
            ("Speaking", parse_skill(&fields, speaking_idx)),
        ];

        let field_errors = calc::validate_student(&name, &skills);
        if !field_errors.is_empty() {
            summary
                .errors
                .push(format!("Row {}: {}", row_no, field_errors.join(", ")));
            continue;
        }

        let teacher_email = teacher_idx
            .and_then(|i| fields.get(i))
            .map(|s| s.trim())
            .filter(|s| !s.is_empty());
        let owner_id: Option<String> = match teacher_email {
            Some(email) => {
                let mut stmt =
                    conn.prepare("SELECT id FROM users WHERE email = ? AND role = 1")?;
                let found: Option<String> = stmt
                    .query_map([email], |r| r.get(0))?
                    .next()
                    .transpose()?;
                match found {
                    Some(id) => Some(id),
                    None => fallback_owner.map(|s| s.to_string()),
                }
            }
            None => fallback_owner.map(|s| s.to_string()),
        };

        let scores = calc::SkillScores {
            reading: skills[0].1.unwrap_or(0),
            writing: skills[1].1.unwrap_or(0),
            listening: skills[2].1.unwrap_or(0),
            speaking: skills[3].1.unwrap_or(0),
        };
        let derived = calc::derive_scores(scores);
        let now = db::now_utc();

        conn.execute(
            "INSERT INTO students(
               id, user_id, name, reading, writing, listening, speaking,
               total_score, percentage, created_at, updated_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &Uuid::new_v4().to_string(),
                owner_id.as_deref(),
                &name,
                scores.reading,
                scores.writing,
                scores.listening,
                scores.speaking,
                derived.total_score,
                derived.percentage,
                &now,
                &now,
            ),
        )?;
        summary.imported += 1;
    }

    log::info!(
        "imported {} students from {} ({} bad rows)",
        summary.imported,
        in_path.to_string_lossy(),
        summary.errors.len()
    );
    Ok(summary)
}
