use crate::calc::CalcError;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};

pub const PER_PAGE_DEFAULT: i64 = 10;
pub const PER_PAGE_MAX: i64 = 100;

const SUGGESTION_SOURCE_LIMIT: usize = 5;
const SUGGESTION_LIMIT: usize = 8;
const SUGGESTION_TRUNCATE: usize = 50;

/// Optional inclusive bounds over the student collection. An absent field
/// imposes no constraint; bounds are AND-combined.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilters {
    pub min_score: Option<i64>,
    pub max_score: Option<i64>,
    pub min_percentage: Option<f64>,
    pub max_percentage: Option<f64>,
    pub min_reading: Option<i64>,
    pub min_writing: Option<i64>,
    pub min_listening: Option<i64>,
    pub min_speaking: Option<i64>,
    pub created_after: Option<String>,
    pub created_before: Option<String>,
    pub user_id: Option<String>,
}

fn opt_i64(v: Option<&serde_json::Value>) -> Option<i64> {
    let v = v?;
    v.as_i64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse::<i64>().ok()))
}

fn opt_f64(v: Option<&serde_json::Value>) -> Option<f64> {
    let v = v?;
    v.as_f64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
}

fn opt_str(v: Option<&serde_json::Value>) -> Option<String> {
    let s = v?.as_str()?.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

impl SearchFilters {
    /// Lenient by contract: malformed or unrecognized filter values are
    /// treated as absent, never surfaced as an error.
    pub fn from_params(raw: Option<&serde_json::Value>) -> Self {
        let Some(obj) = raw.and_then(|v| v.as_object()) else {
            return Self::default();
        };
        Self {
            min_score: opt_i64(obj.get("minScore")),
            max_score: opt_i64(obj.get("maxScore")),
            min_percentage: opt_f64(obj.get("minPercentage")),
            max_percentage: opt_f64(obj.get("maxPercentage")),
            min_reading: opt_i64(obj.get("minReading")),
            min_writing: opt_i64(obj.get("minWriting")),
            min_listening: opt_i64(obj.get("minListening")),
            min_speaking: opt_i64(obj.get("minSpeaking")),
            created_after: opt_str(obj.get("createdAfter")),
            created_before: opt_str(obj.get("createdBefore")),
            user_id: opt_str(obj.get("userId")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    NameAsc,
    NameDesc,
    ScoreAsc,
    ScoreDesc,
    PercentageAsc,
    PercentageDesc,
    CreatedAsc,
    CreatedDesc,
}

impl SortKey {
    /// Unrecognized or absent keys fall back to percentage descending
    /// (highest performers first). Documented policy, not an error.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.unwrap_or("") {
            "name_asc" => SortKey::NameAsc,
            "name_desc" => SortKey::NameDesc,
            "score_asc" => SortKey::ScoreAsc,
            "score_desc" => SortKey::ScoreDesc,
            "percentage_asc" => SortKey::PercentageAsc,
            "percentage_desc" => SortKey::PercentageDesc,
            "created_asc" => SortKey::CreatedAsc,
            "created_desc" => SortKey::CreatedDesc,
            _ => SortKey::PercentageDesc,
        }
    }

    fn order_clause(self) -> &'static str {
        match self {
            SortKey::NameAsc => "name ASC",
            SortKey::NameDesc => "name DESC",
            SortKey::ScoreAsc => "total_score ASC",
            SortKey::ScoreDesc => "total_score DESC",
            SortKey::PercentageAsc => "percentage ASC",
            SortKey::PercentageDesc => "percentage DESC",
            SortKey::CreatedAsc => "created_at ASC",
            SortKey::CreatedDesc => "created_at DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageParams {
    pub page: i64,
    pub per_page: i64,
}

impl PageParams {
    pub fn from_params(params: &serde_json::Value) -> Self {
        let page = opt_i64(params.get("page")).unwrap_or(1).max(1);
        let per_page = opt_i64(params.get("perPage"))
            .unwrap_or(PER_PAGE_DEFAULT)
            .clamp(1, PER_PAGE_MAX);
        Self { page, per_page }
    }
}

#[derive(Debug, Clone)]
pub struct Pagination {
    pub current_page: i64,
    pub total_pages: i64,
    pub total_count: i64,
    pub per_page: i64,
}

#[derive(Debug, Clone)]
pub struct StudentHit {
    pub id: String,
    pub user_id: Option<String>,
    pub name: String,
    pub reading: i64,
    pub writing: i64,
    pub listening: i64,
    pub speaking: i64,
    pub total_score: i64,
    pub percentage: f64,
    pub notes_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// Escape LIKE metacharacters so the query text always matches literally.
fn escape_like(q: &str) -> String {
    q.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn build_where(query: &str, filters: &SearchFilters) -> (String, Vec<Value>) {
    let mut parts: Vec<String> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();

    let q = query.trim();
    if !q.is_empty() {
        // Boolean filter, not a ranked search: match on the student's own
        // name, or transitively through the content of any of its notes.
        let pattern = format!("%{}%", escape_like(q));
        parts.push(
            "(name LIKE ? ESCAPE '\\' OR id IN (
                SELECT student_id FROM notes WHERE content LIKE ? ESCAPE '\\'
             ))"
            .to_string(),
        );
        binds.push(Value::Text(pattern.clone()));
        binds.push(Value::Text(pattern));
    }

    if let Some(v) = filters.min_score {
        parts.push("total_score >= ?".to_string());
        binds.push(Value::Integer(v));
    }
    if let Some(v) = filters.max_score {
        parts.push("total_score <= ?".to_string());
        binds.push(Value::Integer(v));
    }
    if let Some(v) = filters.min_percentage {
        parts.push("percentage >= ?".to_string());
        binds.push(Value::Real(v));
    }
    if let Some(v) = filters.max_percentage {
        parts.push("percentage <= ?".to_string());
        binds.push(Value::Real(v));
    }
    if let Some(v) = filters.min_reading {
        parts.push("reading >= ?".to_string());
        binds.push(Value::Integer(v));
    }
    if let Some(v) = filters.min_writing {
        parts.push("writing >= ?".to_string());
        binds.push(Value::Integer(v));
    }
    if let Some(v) = filters.min_listening {
        parts.push("listening >= ?".to_string());
        binds.push(Value::Integer(v));
    }
    if let Some(v) = filters.min_speaking {
        parts.push("speaking >= ?".to_string());
        binds.push(Value::Integer(v));
    }
    if let Some(v) = &filters.created_after {
        parts.push("created_at >= ?".to_string());
        binds.push(Value::Text(v.clone()));
    }
    if let Some(v) = &filters.created_before {
        parts.push("created_at <= ?".to_string());
        binds.push(Value::Text(v.clone()));
    }
    if let Some(v) = &filters.user_id {
        parts.push("user_id = ?".to_string());
        binds.push(Value::Text(v.clone()));
    }

    let clause = if parts.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", parts.join(" AND "))
    };
    (clause, binds)
}

/// Filter, sort, and paginate the student collection. Read-only; pagination
/// is a plain offset/limit slice applied after filtering and sorting.
pub fn search_students(
    conn: &Connection,
    query: &str,
    filters: &SearchFilters,
    sort: SortKey,
    page: PageParams,
) -> Result<(Vec<StudentHit>, Pagination), CalcError> {
    let (where_clause, binds) = build_where(query, filters);

    let count_sql = format!("SELECT COUNT(*) FROM students {}", where_clause);
    let total_count: i64 = conn
        .query_row(&count_sql, params_from_iter(binds.iter()), |r| r.get(0))
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let total_pages = if total_count == 0 {
        0
    } else {
        (total_count + page.per_page - 1) / page.per_page
    };

    let sql = format!(
        "SELECT id, user_id, name, reading, writing, listening, speaking,
                total_score, percentage, created_at, updated_at,
                (SELECT COUNT(*) FROM notes n WHERE n.student_id = students.id)
         FROM students
         {}
         ORDER BY {}
         LIMIT ? OFFSET ?",
        where_clause,
        sort.order_clause()
    );

    let mut all_binds = binds;
    all_binds.push(Value::Integer(page.per_page));
    all_binds.push(Value::Integer((page.page - 1) * page.per_page));

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let hits = stmt
        .query_map(params_from_iter(all_binds), |r| {
            Ok(StudentHit {
                id: r.get(0)?,
                user_id: r.get(1)?,
                name: r.get(2)?,
                reading: r.get(3)?,
                writing: r.get(4)?,
                listening: r.get(5)?,
                speaking: r.get(6)?,
                total_score: r.get(7)?,
                percentage: r.get(8)?,
                notes_count: r.get(11)?,
                created_at: r.get(9)?,
                updated_at: r.get(10)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    Ok((
        hits,
        Pagination {
            current_page: page.page,
            total_pages,
            total_count,
            per_page: page.per_page,
        },
    ))
}

/// Ranked autocomplete candidates: up to 5 matching student names, then up
/// to 5 matching note contents (truncated), deduplicated, capped at 8.
pub fn suggestions(conn: &Connection, query: &str) -> Result<Vec<String>, CalcError> {
    let q = query.trim();
    // Guard against overly broad matches on very short prefixes.
    if q.chars().count() < 2 {
        return Ok(Vec::new());
    }
    let pattern = format!("%{}%", escape_like(q));

    let mut stmt = conn
        .prepare("SELECT name FROM students WHERE name LIKE ? ESCAPE '\\' LIMIT ?")
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let names: Vec<String> = stmt
        .query_map((&pattern, SUGGESTION_SOURCE_LIMIT as i64), |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let mut stmt = conn
        .prepare("SELECT content FROM notes WHERE content LIKE ? ESCAPE '\\' LIMIT ?")
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let contents: Vec<String> = stmt
        .query_map((&pattern, SUGGESTION_SOURCE_LIMIT as i64), |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for s in names
        .into_iter()
        .chain(contents.into_iter().map(|c| truncate_suggestion(&c)))
    {
        if out.len() >= SUGGESTION_LIMIT {
            break;
        }
        if seen.insert(s.clone()) {
            out.push(s);
        }
    }
    Ok(out)
}

/// Cap a suggestion at 50 characters, ellipsis included.
fn truncate_suggestion(s: &str) -> String {
    if s.chars().count() <= SUGGESTION_TRUNCATE {
        return s.to_string();
    }
    let head: String = s.chars().take(SUGGESTION_TRUNCATE - 3).collect();
    format!("{}...", head)
}
