use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_skillbookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn skillbookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

struct Harness {
    _child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    token: String,
    next_id: u32,
}

impl Harness {
    fn call(&mut self, method: &str, mut params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        params["apiToken"] = json!(self.token);
        request_ok(
            &mut self.stdin,
            &mut self.reader,
            &self.next_id.to_string(),
            method,
            params,
        )
    }
}

/// Workspace with the three reference students: Alice 34/85.0, Bob 30/75.0,
/// Charlie 39/97.5, plus a note "great progress" on Bob.
fn seeded_harness(prefix: &str) -> Harness {
    let workspace = temp_dir(prefix);
    let (child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "setup-1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "setup-2",
        "users.create",
        json!({ "email": "admin@example.com", "firstName": "Ada", "lastName": "Admin" }),
    );
    let token = created["user"]["apiToken"]
        .as_str()
        .expect("apiToken")
        .to_string();

    let mut h = Harness {
        _child: child,
        stdin,
        reader,
        token,
        next_id: 100,
    };

    let alice = json!({ "name": "Alice", "reading": 9, "writing": 8, "listening": 10, "speaking": 7 });
    let bob = json!({ "name": "Bob", "reading": 7, "writing": 6, "listening": 8, "speaking": 9 });
    let charlie = json!({ "name": "Charlie", "reading": 10, "writing": 9, "listening": 10, "speaking": 10 });
    h.call("students.create", alice);
    let bob_created = h.call("students.create", bob);
    h.call("students.create", charlie);

    let bob_id = bob_created["student"]["id"].as_str().expect("id").to_string();
    h.call(
        "notes.create",
        json!({ "studentId": bob_id, "content": "great progress" }),
    );
    h
}

fn names(result: &serde_json::Value) -> Vec<String> {
    result["students"]
        .as_array()
        .expect("students array")
        .iter()
        .map(|s| s["name"].as_str().expect("name").to_string())
        .collect()
}

#[test]
fn default_sort_is_percentage_desc() {
    let mut h = seeded_harness("skillbook-sort-default");

    // No sort key at all.
    let listed = h.call("students.list", json!({}));
    assert_eq!(names(&listed), vec!["Charlie", "Alice", "Bob"]);

    // Explicit key.
    let listed = h.call("students.list", json!({ "sort": "percentage_desc" }));
    assert_eq!(names(&listed), vec!["Charlie", "Alice", "Bob"]);

    // An unrecognized key falls back to the same order instead of erroring.
    let listed = h.call("students.list", json!({ "sort": "by_vibes" }));
    assert_eq!(names(&listed), vec!["Charlie", "Alice", "Bob"]);
}

#[test]
fn sort_keys_order_results() {
    let mut h = seeded_harness("skillbook-sort-keys");

    let listed = h.call("students.list", json!({ "sort": "name_asc" }));
    assert_eq!(names(&listed), vec!["Alice", "Bob", "Charlie"]);

    let listed = h.call("students.list", json!({ "sort": "name_desc" }));
    assert_eq!(names(&listed), vec!["Charlie", "Bob", "Alice"]);

    let listed = h.call("students.list", json!({ "sort": "score_asc" }));
    assert_eq!(names(&listed), vec!["Bob", "Alice", "Charlie"]);

    // score_desc yields pairwise non-increasing total scores.
    let listed = h.call("students.list", json!({ "sort": "score_desc" }));
    let scores: Vec<i64> = listed["students"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["totalScore"].as_i64().unwrap())
        .collect();
    for pair in scores.windows(2) {
        assert!(pair[0] >= pair[1]);
    }
}

#[test]
fn min_score_filter_matches_only_charlie() {
    let mut h = seeded_harness("skillbook-filter-min-score");

    let listed = h.call(
        "students.list",
        json!({ "filters": { "minScore": 35 } }),
    );
    assert_eq!(names(&listed), vec!["Charlie"]);
    assert_eq!(listed["pagination"]["totalCount"], json!(1));
}

#[test]
fn filters_are_and_combined_and_monotonic() {
    let mut h = seeded_harness("skillbook-filter-monotonic");

    let unfiltered = h.call("students.list", json!({}));
    let all_names = names(&unfiltered);
    assert_eq!(all_names.len(), 3);

    // Adding a filter never adds results.
    let filters = [
        json!({ "minScore": 31 }),
        json!({ "minScore": 31, "minPercentage": 90.0 }),
        json!({ "minScore": 31, "minPercentage": 90.0, "minSpeaking": 10 }),
    ];
    let mut prev = all_names.clone();
    for (i, f) in filters.iter().enumerate() {
        let listed = h.call("students.list", json!({ "filters": f }));
        let got = names(&listed);
        assert!(
            got.iter().all(|n| prev.contains(n)),
            "filter step {} added results: {:?} vs {:?}",
            i,
            got,
            prev
        );
        prev = got;
    }
    assert_eq!(prev, vec!["Charlie"]);

    // Skill minimums are inclusive.
    let listed = h.call(
        "students.list",
        json!({ "filters": { "minReading": 9, "minListening": 10 }, "sort": "name_asc" }),
    );
    assert_eq!(names(&listed), vec!["Alice", "Charlie"]);

    // Malformed values are treated as absent, not as errors.
    let listed = h.call(
        "students.list",
        json!({ "filters": { "minScore": "junk", "maxPercentage": [1, 2] } }),
    );
    assert_eq!(names(&listed).len(), 3);
}

#[test]
fn query_matches_name_or_note_content() {
    let mut h = seeded_harness("skillbook-query-paths");

    // Name substring, case-insensitive.
    let listed = h.call("students.list", json!({ "q": "ali" }));
    assert_eq!(names(&listed), vec!["Alice"]);

    // No student is named "prog"; Bob matches through his note content.
    let listed = h.call("students.list", json!({ "q": "prog" }));
    assert_eq!(names(&listed), vec!["Bob"]);

    // Empty query imposes no constraint.
    let listed = h.call("students.list", json!({ "q": "" }));
    assert_eq!(names(&listed).len(), 3);

    // Query and filter compose with AND.
    let listed = h.call(
        "students.list",
        json!({ "q": "prog", "filters": { "minScore": 35 } }),
    );
    assert_eq!(names(&listed).len(), 0);
}

#[test]
fn pagination_slices_after_sort_and_caps_per_page() {
    let mut h = seeded_harness("skillbook-pagination");

    let page1 = h.call(
        "students.list",
        json!({ "sort": "percentage_desc", "page": 1, "perPage": 2 }),
    );
    assert_eq!(names(&page1), vec!["Charlie", "Alice"]);
    assert_eq!(page1["pagination"]["currentPage"], json!(1));
    assert_eq!(page1["pagination"]["totalPages"], json!(2));
    assert_eq!(page1["pagination"]["totalCount"], json!(3));
    assert_eq!(page1["pagination"]["perPage"], json!(2));

    let page2 = h.call(
        "students.list",
        json!({ "sort": "percentage_desc", "page": 2, "perPage": 2 }),
    );
    assert_eq!(names(&page2), vec!["Bob"]);

    // perPage is capped at 100.
    let capped = h.call("students.list", json!({ "perPage": 5000 }));
    assert_eq!(capped["pagination"]["perPage"], json!(100));
}
