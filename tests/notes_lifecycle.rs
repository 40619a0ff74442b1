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
    admin_token: String,
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
        let admin_token = created["user"]["apiToken"]
            .as_str()
            .expect("apiToken")
            .to_string();
        Harness {
            _child: child,
            stdin,
            reader,
            admin_token,
            next_id: 100,
        }
    }

    fn call_raw(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        request(
            &mut self.stdin,
            &mut self.reader,
            &self.next_id.to_string(),
            method,
            params,
        )
    }

    fn call(
        &mut self,
        token: &str,
        method: &str,
        mut params: serde_json::Value,
    ) -> serde_json::Value {
        self.next_id += 1;
        params["apiToken"] = json!(token);
        request_ok(
            &mut self.stdin,
            &mut self.reader,
            &self.next_id.to_string(),
            method,
            params,
        )
    }

    fn add_user(&mut self, email: &str, first: &str, role: &str) -> String {
        let admin = self.admin_token.clone();
        let created = self.call(
            &admin,
            "users.create",
            json!({ "email": email, "firstName": first, "lastName": "Teach", "role": role }),
        );
        created["user"]["apiToken"]
            .as_str()
            .expect("apiToken")
            .to_string()
    }

    fn add_student(&mut self, token: &str, name: &str) -> String {
        let created = self.call(
            token,
            "students.create",
            json!({ "name": name, "reading": 6, "writing": 6, "listening": 6, "speaking": 6 }),
        );
        created["student"]["id"].as_str().expect("id").to_string()
    }
}

#[test]
fn note_crud_with_author_attribution() {
    let mut h = Harness::new("skillbook-notes-crud");
    let admin = h.admin_token.clone();
    let student_id = h.add_student(&admin, "Noted One");

    let created = h.call(
        &admin,
        "notes.create",
        json!({ "studentId": student_id, "content": "shows strong listening skills" }),
    );
    let note_id = created["note"]["id"].as_str().expect("id").to_string();
    assert_eq!(created["note"]["createdBy"]["name"], json!("Ada Admin"));

    let fetched = h.call(&admin, "notes.get", json!({ "noteId": note_id }));
    assert_eq!(
        fetched["note"]["content"],
        json!("shows strong listening skills")
    );

    let updated = h.call(
        &admin,
        "notes.update",
        json!({ "noteId": note_id, "content": "outstanding improvement" }),
    );
    assert_eq!(updated["note"]["content"], json!("outstanding improvement"));

    let listed = h.call(&admin, "notes.list", json!({ "studentId": student_id }));
    assert_eq!(listed["pagination"]["totalCount"], json!(1));

    let _ = h.call(&admin, "notes.delete", json!({ "noteId": note_id }));
    let listed = h.call(&admin, "notes.list", json!({ "studentId": student_id }));
    assert_eq!(listed["pagination"]["totalCount"], json!(0));
}

#[test]
fn content_length_is_validated() {
    let mut h = Harness::new("skillbook-notes-validation");
    let admin = h.admin_token.clone();
    let student_id = h.add_student(&admin, "Strict");

    let blank = h.call_raw(
        "notes.create",
        json!({ "apiToken": admin, "studentId": student_id, "content": "" }),
    );
    assert_eq!(blank["error"]["code"], json!("validation_failed"));

    let too_long = h.call_raw(
        "notes.create",
        json!({
            "apiToken": admin,
            "studentId": student_id,
            "content": "x".repeat(1001)
        }),
    );
    assert_eq!(too_long["error"]["code"], json!("validation_failed"));

    // Exactly 1000 characters is still valid.
    let max = h.call(
        &admin,
        "notes.create",
        json!({ "studentId": student_id, "content": "y".repeat(1000) }),
    );
    assert!(max["note"]["id"].is_string());
}

#[test]
fn note_search_and_mine_filter() {
    let mut h = Harness::new("skillbook-notes-filters");
    let admin = h.admin_token.clone();
    let teacher = h.add_user("t1@example.com", "Tina", "teacher");
    let student_id = h.add_student(&admin, "Observed");

    h.call(
        &admin,
        "notes.create",
        json!({ "studentId": student_id, "content": "struggles with writing" }),
    );
    h.call(
        &teacher,
        "notes.create",
        json!({ "studentId": student_id, "content": "improving steadily" }),
    );

    let searched = h.call(
        &admin,
        "notes.list",
        json!({ "studentId": student_id, "search": "writing" }),
    );
    assert_eq!(searched["pagination"]["totalCount"], json!(1));

    let mine = h.call(
        &teacher,
        "notes.list",
        json!({ "studentId": student_id, "myNotes": true }),
    );
    assert_eq!(mine["pagination"]["totalCount"], json!(1));
    assert_eq!(
        mine["notes"][0]["content"],
        json!("improving steadily")
    );
}

#[test]
fn only_author_or_admin_may_mutate_a_note() {
    let mut h = Harness::new("skillbook-notes-authorship");
    let admin = h.admin_token.clone();
    let author = h.add_user("author@example.com", "Avery", "teacher");
    let other = h.add_user("other@example.com", "Omar", "teacher");
    let student_id = h.add_student(&admin, "Contested");

    let created = h.call(
        &author,
        "notes.create",
        json!({ "studentId": student_id, "content": "my observation" }),
    );
    let note_id = created["note"]["id"].as_str().expect("id").to_string();

    let denied = h.call_raw(
        "notes.update",
        json!({ "apiToken": other, "noteId": note_id, "content": "hijacked" }),
    );
    assert_eq!(denied["error"]["code"], json!("forbidden"));

    let denied = h.call_raw(
        "notes.delete",
        json!({ "apiToken": other, "noteId": note_id }),
    );
    assert_eq!(denied["error"]["code"], json!("forbidden"));

    // The author edits their own note; an admin may remove any note.
    let _ = h.call(
        &author,
        "notes.update",
        json!({ "noteId": note_id, "content": "revised observation" }),
    );
    let _ = h.call(&admin, "notes.delete", json!({ "noteId": note_id }));
}

#[test]
fn deleting_a_student_cascades_to_its_notes() {
    let mut h = Harness::new("skillbook-notes-cascade");
    let admin = h.admin_token.clone();
    let student_id = h.add_student(&admin, "Ephemeral");

    let created = h.call(
        &admin,
        "notes.create",
        json!({ "studentId": student_id, "content": "soon to vanish" }),
    );
    let note_id = created["note"]["id"].as_str().expect("id").to_string();

    let _ = h.call(&admin, "students.delete", json!({ "studentId": student_id }));

    let gone = h.call_raw("notes.get", json!({ "apiToken": admin, "noteId": note_id }));
    assert_eq!(gone["error"]["code"], json!("not_found"));

    let student_gone = h.call_raw(
        "students.get",
        json!({ "apiToken": admin, "studentId": student_id }),
    );
    assert_eq!(student_gone["error"]["code"], json!("not_found"));
}
