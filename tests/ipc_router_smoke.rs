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
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("skillbook-router-smoke");
    let csv_out = workspace.join("smoke-students.csv");
    let template_out = workspace.join("smoke-template.csv");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health["ok"], json!(true));
    assert!(health["result"]["version"].is_string());

    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // First account bootstraps as admin and carries the api token.
    let created = request(
        &mut stdin,
        &mut reader,
        "3",
        "users.create",
        json!({ "email": "admin@example.com", "firstName": "Ada", "lastName": "Admin" }),
    );
    let token = created["result"]["user"]["apiToken"]
        .as_str()
        .expect("apiToken")
        .to_string();

    let student = request(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({
            "apiToken": token,
            "name": "Smoke Student",
            "reading": 8, "writing": 7, "listening": 9, "speaking": 6
        }),
    );
    let student_id = student["result"]["student"]["id"]
        .as_str()
        .expect("studentId")
        .to_string();

    let _ = request(
        &mut stdin,
        &mut reader,
        "5",
        "students.list",
        json!({ "apiToken": token }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "6",
        "students.suggestions",
        json!({ "apiToken": token, "q": "Smo" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "7",
        "students.get",
        json!({ "apiToken": token, "studentId": student_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "8",
        "students.stats",
        json!({ "apiToken": token }),
    );

    let note = request(
        &mut stdin,
        &mut reader,
        "9",
        "notes.create",
        json!({ "apiToken": token, "studentId": student_id, "content": "smoke note" }),
    );
    let note_id = note["result"]["note"]["id"].as_str().expect("noteId");
    let _ = request(
        &mut stdin,
        &mut reader,
        "10",
        "notes.list",
        json!({ "apiToken": token, "studentId": student_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "11",
        "notes.get",
        json!({ "apiToken": token, "noteId": note_id }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "12",
        "notifications.list",
        json!({ "apiToken": token }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "13",
        "notifications.unreadCount",
        json!({ "apiToken": token }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "14",
        "analytics.overview",
        json!({ "apiToken": token }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "15",
        "analytics.performance",
        json!({ "apiToken": token }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "16",
        "exchange.exportStudentsCsv",
        json!({ "apiToken": token, "outPath": csv_out.to_string_lossy() }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "17",
        "exchange.studentsTemplateCsv",
        json!({ "apiToken": token, "outPath": template_out.to_string_lossy() }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "18",
        "users.list",
        json!({ "apiToken": token }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "19",
        "mailer.flush",
        json!({ "apiToken": token }),
    );

    // Unknown methods fall through every family to not_implemented.
    writeln!(
        stdin,
        "{}",
        json!({ "id": "20", "method": "bogus.method", "params": {} })
    )
    .expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let unknown: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response");
    assert_eq!(unknown["ok"], json!(false));
    assert_eq!(unknown["error"]["code"], json!("not_implemented"));

    let _ = child.kill();
}
