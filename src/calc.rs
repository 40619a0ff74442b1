use rusqlite::Connection;
use serde::Serialize;

pub const SKILL_MAX: i64 = 10;
pub const TOTAL_MAX: i64 = 40;

/// The four skill inputs a student is scored on, each in [0, 10].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkillScores {
    pub reading: i64,
    pub writing: i64,
    pub listening: i64,
    pub speaking: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivedScores {
    pub total_score: i64,
    pub percentage: f64,
}

/// Derive the stored score fields from the four skills.
///
/// Callers must have validated the inputs first (see `validate_skills`);
/// this runs immediately before every insert/update so the stored values
/// are never stale and never caller-supplied.
pub fn derive_scores(skills: SkillScores) -> DerivedScores {
    let total_score = skills.reading + skills.writing + skills.listening + skills.speaking;
    let percentage = (total_score as f64 / TOTAL_MAX as f64) * 100.0;
    DerivedScores {
        total_score,
        percentage,
    }
}

/// Field-level validation messages for a student payload. Empty means valid.
pub fn validate_student(name: &str, skills: &[(&str, Option<i64>)]) -> Vec<String> {
    let mut errors = Vec::new();
    if name.trim().is_empty() {
        errors.push("Name can't be blank".to_string());
    }
    for (label, value) in skills {
        match value {
            None => errors.push(format!("{} is required", label)),
            Some(v) if *v < 0 || *v > SKILL_MAX => {
                errors.push(format!("{} must be between 0 and {}", label, SKILL_MAX))
            }
            Some(_) => {}
        }
    }
    errors
}

/// 2-decimal rounding applied only at presentation/export boundaries.
/// Stored percentages stay unrounded.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

fn query_err(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillAverages {
    pub reading: f64,
    pub writing: f64,
    pub listening: f64,
    pub speaking: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentDigest {
    pub id: String,
    pub name: String,
    pub total_score: i64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteDigest {
    pub id: String,
    pub student_name: String,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewModel {
    pub total_students: i64,
    pub total_users: i64,
    pub total_notes: i64,
    pub average_score: f64,
    pub average_percentage: f64,
    pub skills_average: SkillAverages,
    pub top_performers: Vec<StudentDigest>,
    pub needs_improvement: Vec<StudentDigest>,
    pub recent_students: Vec<StudentDigest>,
    pub recent_notes: Vec<NoteDigest>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BandedCounts {
    pub labels: Vec<String>,
    pub values: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceModel {
    pub labels: Vec<String>,
    pub average_scores: Vec<f64>,
    pub top_scores: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatsModel {
    pub total_students: i64,
    pub average_score: f64,
    pub average_percentage: f64,
    pub top_performer: Option<String>,
    pub skills_average: SkillAverages,
    pub score_distribution: ScoreDistribution,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreDistribution {
    pub excellent: i64,
    pub good: i64,
    pub average: i64,
    pub below_average: i64,
    pub needs_improvement: i64,
}

fn count_where(conn: &Connection, sql: &str) -> Result<i64, CalcError> {
    conn.query_row(sql, [], |r| r.get(0)).map_err(query_err)
}

fn skills_average_where(
    conn: &Connection,
    where_clause: &str,
    binds: &[&str],
) -> Result<SkillAverages, CalcError> {
    let sql = format!(
        "SELECT COALESCE(AVG(reading), 0),
                COALESCE(AVG(writing), 0),
                COALESCE(AVG(listening), 0),
                COALESCE(AVG(speaking), 0)
         FROM students {}",
        where_clause
    );
    conn.query_row(
        &sql,
        rusqlite::params_from_iter(binds.iter()),
        |r| {
            Ok(SkillAverages {
                reading: round2(r.get(0)?),
                writing: round2(r.get(1)?),
                listening: round2(r.get(2)?),
                speaking: round2(r.get(3)?),
            })
        },
    )
    .map_err(query_err)
}

fn student_digests(conn: &Connection, sql: &str) -> Result<Vec<StudentDigest>, CalcError> {
    let mut stmt = conn.prepare(sql).map_err(query_err)?;
    stmt.query_map([], |r| {
        Ok(StudentDigest {
            id: r.get(0)?,
            name: r.get(1)?,
            total_score: r.get(2)?,
            percentage: r.get::<_, f64>(3)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(query_err)
    .map(|mut v| {
        for d in &mut v {
            d.percentage = round2(d.percentage);
        }
        v
    })
}

pub fn compute_overview(conn: &Connection) -> Result<OverviewModel, CalcError> {
    let total_students = count_where(conn, "SELECT COUNT(*) FROM students")?;
    let total_users = count_where(conn, "SELECT COUNT(*) FROM users")?;
    let total_notes = count_where(conn, "SELECT COUNT(*) FROM notes")?;

    let (average_score, average_percentage): (f64, f64) = conn
        .query_row(
            "SELECT COALESCE(AVG(total_score), 0), COALESCE(AVG(percentage), 0) FROM students",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(query_err)?;

    let skills_average = skills_average_where(conn, "", &[])?;

    let top_performers = student_digests(
        conn,
        "SELECT id, name, total_score, percentage FROM students
         ORDER BY total_score DESC LIMIT 5",
    )?;
    let needs_improvement = student_digests(
        conn,
        "SELECT id, name, total_score, percentage FROM students
         ORDER BY total_score ASC LIMIT 5",
    )?;
    let recent_students = student_digests(
        conn,
        "SELECT id, name, total_score, percentage FROM students
         ORDER BY created_at DESC, rowid DESC LIMIT 5",
    )?;

    let mut stmt = conn
        .prepare(
            "SELECT n.id, s.name, n.content, n.created_at
             FROM notes n
             JOIN students s ON s.id = n.student_id
             ORDER BY n.created_at DESC, n.rowid DESC
             LIMIT 5",
        )
        .map_err(query_err)?;
    let recent_notes = stmt
        .query_map([], |r| {
            Ok(NoteDigest {
                id: r.get(0)?,
                student_name: r.get(1)?,
                content: r.get(2)?,
                created_at: r.get(3)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    Ok(OverviewModel {
        total_students,
        total_users,
        total_notes,
        average_score: round2(average_score),
        average_percentage: round2(average_percentage),
        skills_average,
        top_performers,
        needs_improvement,
        recent_students,
        recent_notes,
    })
}

pub fn compute_skills(conn: &Connection) -> Result<SkillAverages, CalcError> {
    skills_average_where(conn, "", &[])
}

pub fn compute_distribution(conn: &Connection) -> Result<BandedCounts, CalcError> {
    let d = distribution_where(conn, "", &[])?;
    Ok(BandedCounts {
        labels: vec![
            "Excellent (90%+)".to_string(),
            "Good (80-89%)".to_string(),
            "Average (70-79%)".to_string(),
            "Below Average (60-69%)".to_string(),
            "Needs Improvement (<60%)".to_string(),
        ],
        values: vec![
            d.excellent,
            d.good,
            d.average,
            d.below_average,
            d.needs_improvement,
        ],
    })
}

fn distribution_where(
    conn: &Connection,
    where_clause: &str,
    binds: &[&str],
) -> Result<ScoreDistribution, CalcError> {
    let sql = format!(
        "SELECT
            COUNT(CASE WHEN percentage >= 90 THEN 1 END),
            COUNT(CASE WHEN percentage >= 80 AND percentage < 90 THEN 1 END),
            COUNT(CASE WHEN percentage >= 70 AND percentage < 80 THEN 1 END),
            COUNT(CASE WHEN percentage >= 60 AND percentage < 70 THEN 1 END),
            COUNT(CASE WHEN percentage < 60 THEN 1 END)
         FROM students {}",
        where_clause
    );
    conn.query_row(&sql, rusqlite::params_from_iter(binds.iter()), |r| {
        Ok(ScoreDistribution {
            excellent: r.get(0)?,
            good: r.get(1)?,
            average: r.get(2)?,
            below_average: r.get(3)?,
            needs_improvement: r.get(4)?,
        })
    })
    .map_err(query_err)
}

pub fn compute_score_ranges(conn: &Connection) -> Result<BandedCounts, CalcError> {
    let values: Vec<i64> = conn
        .query_row(
            "SELECT
                COUNT(CASE WHEN total_score BETWEEN 0 AND 10 THEN 1 END),
                COUNT(CASE WHEN total_score BETWEEN 11 AND 20 THEN 1 END),
                COUNT(CASE WHEN total_score BETWEEN 21 AND 30 THEN 1 END),
                COUNT(CASE WHEN total_score BETWEEN 31 AND 35 THEN 1 END),
                COUNT(CASE WHEN total_score BETWEEN 36 AND 40 THEN 1 END)
             FROM students",
            [],
            |r| {
                Ok(vec![
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                ])
            },
        )
        .map_err(query_err)?;

    Ok(BandedCounts {
        labels: vec![
            "0-10".to_string(),
            "11-20".to_string(),
            "21-30".to_string(),
            "31-35".to_string(),
            "36-40".to_string(),
        ],
        values,
    })
}

/// Average and maximum total score per month for the last six months,
/// keyed off each student's creation date. Months with no students report 0.
pub fn compute_performance(conn: &Connection) -> Result<PerformanceModel, CalcError> {
    use chrono::Datelike;

    let today = chrono::Utc::now().date_naive();
    let mut year = today.year();
    let mut month = today.month() as i32;

    // Oldest-first (year, month) pairs covering the last 6 months.
    let mut months: Vec<(i32, i32)> = Vec::with_capacity(6);
    for _ in 0..6 {
        months.push((year, month));
        month -= 1;
        if month == 0 {
            month = 12;
            year -= 1;
        }
    }
    months.reverse();

    let mut labels = Vec::with_capacity(6);
    let mut average_scores = Vec::with_capacity(6);
    let mut top_scores = Vec::with_capacity(6);

    let mut stmt = conn
        .prepare(
            "SELECT COALESCE(AVG(total_score), 0), COALESCE(MAX(total_score), 0)
             FROM students
             WHERE strftime('%Y-%m', created_at) = ?",
        )
        .map_err(query_err)?;

    for (y, m) in months {
        let label = chrono::NaiveDate::from_ymd_opt(y, m as u32, 1)
            .map(|d| d.format("%b %Y").to_string())
            .unwrap_or_else(|| format!("{:04}-{:02}", y, m));
        let key = format!("{:04}-{:02}", y, m);
        let (avg, max): (f64, f64) = stmt
            .query_row([&key], |r| Ok((r.get(0)?, r.get(1)?)))
            .map_err(query_err)?;
        labels.push(label);
        average_scores.push(round2(avg));
        top_scores.push(round2(max));
    }

    Ok(PerformanceModel {
        labels,
        average_scores,
        top_scores,
    })
}

/// Stats over a single user's students (the token API's per-user view).
pub fn compute_user_stats(conn: &Connection, user_id: &str) -> Result<UserStatsModel, CalcError> {
    let total_students: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM students WHERE user_id = ?",
            [user_id],
            |r| r.get(0),
        )
        .map_err(query_err)?;

    let (average_score, average_percentage): (f64, f64) = conn
        .query_row(
            "SELECT COALESCE(AVG(total_score), 0), COALESCE(AVG(percentage), 0)
             FROM students WHERE user_id = ?",
            [user_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(query_err)?;

    let top_performer: Option<String> = {
        let mut stmt = conn
            .prepare(
                "SELECT name FROM students WHERE user_id = ?
                 ORDER BY total_score DESC LIMIT 1",
            )
            .map_err(query_err)?;
        let mut rows = stmt.query([user_id]).map_err(query_err)?;
        match rows.next().map_err(query_err)? {
            Some(row) => Some(row.get(0).map_err(query_err)?),
            None => None,
        }
    };

    let skills_average = skills_average_where(conn, "WHERE user_id = ?", &[user_id])?;
    let score_distribution = distribution_where(conn, "WHERE user_id = ?", &[user_id])?;

    Ok(UserStatsModel {
        total_students,
        average_score: round2(average_score),
        average_percentage: round2(average_percentage),
        top_performer,
        skills_average,
        score_distribution,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skills(r: i64, w: i64, l: i64, s: i64) -> SkillScores {
        SkillScores {
            reading: r,
            writing: w,
            listening: l,
            speaking: s,
        }
    }

    #[test]
    fn derive_sums_and_scales() {
        let d = derive_scores(skills(8, 7, 9, 8));
        assert_eq!(d.total_score, 32);
        assert_eq!(d.percentage, 80.0);

        let d = derive_scores(skills(9, 8, 10, 7));
        assert_eq!(d.total_score, 34);
        assert_eq!(d.percentage, 85.0);

        let d = derive_scores(skills(10, 9, 10, 10));
        assert_eq!(d.total_score, 39);
        assert_eq!(d.percentage, 97.5);
    }

    #[test]
    fn derive_boundaries() {
        let lo = derive_scores(skills(0, 0, 0, 0));
        assert_eq!(lo.total_score, 0);
        assert_eq!(lo.percentage, 0.0);

        let hi = derive_scores(skills(10, 10, 10, 10));
        assert_eq!(hi.total_score, 40);
        assert_eq!(hi.percentage, 100.0);
    }

    #[test]
    fn derive_matches_definition_exhaustively() {
        for r in 0..=10 {
            for w in 0..=10 {
                let d = derive_scores(skills(r, w, 10 - r, 10 - w));
                assert_eq!(d.total_score, 20);
                assert_eq!(d.percentage, 50.0);
                assert_eq!(d.percentage, d.total_score as f64 / 40.0 * 100.0);
            }
        }
    }

    #[test]
    fn validation_rejects_out_of_range_and_missing() {
        let errors = validate_student(
            "Ann",
            &[
                ("Reading", Some(11)),
                ("Writing", Some(-1)),
                ("Listening", None),
                ("Speaking", Some(5)),
            ],
        );
        assert_eq!(errors.len(), 3);
        assert!(errors[0].contains("Reading"));
        assert!(errors[1].contains("Writing"));
        assert!(errors[2].contains("Listening"));

        let errors = validate_student("  ", &[("Reading", Some(0))]);
        assert_eq!(errors, vec!["Name can't be blank".to_string()]);

        assert!(validate_student("Bo", &[("Reading", Some(0)), ("Writing", Some(10))]).is_empty());
    }

    #[test]
    fn round2_is_presentation_only() {
        assert_eq!(round2(97.5), 97.5);
        assert_eq!(round2(33.333333), 33.33);
        assert_eq!(round2(66.666666), 66.67);
        assert_eq!(round2(0.0), 0.0);
    }
}
