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
    fn new(prefix: &str) -> Self {
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
        Harness {
            _child: child,
            stdin,
            reader,
            token,
            next_id: 100,
        }
    }

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

    fn add_student(&mut self, name: &str) -> String {
        let created = self.call(
            "students.create",
            json!({ "name": name, "reading": 5, "writing": 5, "listening": 5, "speaking": 5 }),
        );
        created["student"]["id"].as_str().expect("id").to_string()
    }

    fn suggestions(&mut self, q: &str) -> Vec<String> {
        let result = self.call("students.suggestions", json!({ "q": q }));
        result["suggestions"]
            .as_array()
            .expect("suggestions array")
            .iter()
            .map(|v| v.as_str().expect("string").to_string())
            .collect()
    }
}

#[test]
fn short_queries_yield_nothing() {
    let mut h = Harness::new("skillbook-suggest-short");
    h.add_student("Alice");

    assert!(h.suggestions("").is_empty());
    assert!(h.suggestions("A").is_empty());
    assert_eq!(h.suggestions("Al"), vec!["Alice"]);
}

#[test]
fn single_name_match_returns_that_name() {
    let mut h = Harness::new("skillbook-suggest-single");
    h.add_student("Alice");
    h.add_student("Bob");

    assert_eq!(h.suggestions("lice"), vec!["Alice"]);
}

#[test]
fn note_content_is_truncated_with_ellipsis() {
    let mut h = Harness::new("skillbook-suggest-truncate");
    let id = h.add_student("Quiet Kid");
    let long_note = format!("remarkable improvement {}", "x".repeat(60));
    h.call(
        "notes.create",
        json!({ "studentId": id, "content": long_note }),
    );

    let got = h.suggestions("remarkable");
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].chars().count(), 50);
    assert!(got[0].ends_with("..."));
}

#[test]
fn names_come_before_notes_and_duplicates_collapse() {
    let mut h = Harness::new("skillbook-suggest-order");
    let id = h.add_student("Progress Pete");
    h.call(
        "notes.create",
        json!({ "studentId": id, "content": "steady progress in class" }),
    );
    // An exact-duplicate suggestion can only appear once.
    h.call(
        "notes.create",
        json!({ "studentId": id, "content": "Progress Pete" }),
    );

    let got = h.suggestions("progress");
    assert_eq!(got[0], "Progress Pete");
    assert!(got.contains(&"steady progress in class".to_string()));
    assert_eq!(
        got.iter().filter(|s| s.as_str() == "Progress Pete").count(),
        1
    );
}

#[test]
fn results_are_capped_at_eight() {
    let mut h = Harness::new("skillbook-suggest-cap");
    for i in 0..7 {
        let id = h.add_student(&format!("Common Name {}", i));
        h.call(
            "notes.create",
            json!({ "studentId": id, "content": format!("common remark {}", i) }),
        );
    }

    // 7 matching names and 7 matching notes collapse to 5 + 5, capped at 8.
    let got = h.suggestions("common");
    assert_eq!(got.len(), 8);
    let name_count = got.iter().filter(|s| s.starts_with("Common Name")).count();
    assert_eq!(name_count, 5);
}
