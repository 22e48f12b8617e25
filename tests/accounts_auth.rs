
use serde_json::json;
use test_support::Sidecar;

#[test]
fn register_login_and_duplicate_email() {
    let (mut s, workspace) = Sidecar::with_workspace("examdesk-accounts");

    let student_id = s.register("Okafor, Chidi", "Chidi@Example.Test", "student");

    // Email is stored lowercased; login is case-insensitive on the address.
    let login = s.ok(
        "accounts.login",
        json!({ "email": "chidi@example.test", "password": "s3cret-pass" }),
    );
    assert_eq!(
        login.get("accountId").and_then(|v| v.as_str()),
        Some(student_id.as_str())
    );
    assert_eq!(login.get("role").and_then(|v| v.as_str()), Some("student"));

    let code = s.err_code(
        "accounts.register",
        json!({
            "fullName": "Another, Person",
            "email": "CHIDI@example.test",
            "password": "whatever-1",
            "role": "student"
        }),
    );
    assert_eq!(code, "conflict");

    let wrong_pw = s.err_code(
        "accounts.login",
        json!({ "email": "chidi@example.test", "password": "wrong" }),
    );
    assert_eq!(wrong_pw, "invalid_credentials");
    let unknown = s.err_code(
        "accounts.login",
        json!({ "email": "nobody@example.test", "password": "wrong" }),
    );
    assert_eq!(unknown, "invalid_credentials");

    let bad_role = s.err_code(
        "accounts.register",
        json!({
            "fullName": "X",
            "email": "x@example.test",
            "password": "pw-123456",
            "role": "principal"
        }),
    );
    assert_eq!(bad_role, "bad_params");

    drop(s.stdin);
    let _ = s.child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn list_filters_by_role_and_hides_hashes() {
    let (mut s, workspace) = Sidecar::with_workspace("examdesk-accounts-list");

    let _ = s.register("Adler, Kim", "kim@example.test", "teacher");
    let _ = s.register("Boame, Esi", "esi@example.test", "student");
    let _ = s.register("Cho, Daniel", "dan@example.test", "student");

    let all = s.ok("accounts.list", json!({}));
    let accounts = all
        .get("accounts")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(accounts.len(), 3);
    assert!(accounts.iter().all(|a| a.get("passwordHash").is_none()));

    let students = s.ok("accounts.list", json!({ "role": "student" }));
    let students = students
        .get("accounts")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(students.len(), 2);
    assert!(students
        .iter()
        .all(|a| a.get("role").and_then(|v| v.as_str()) == Some("student")));
    // Ordered by name.
    assert_eq!(
        students[0].get("fullName").and_then(|v| v.as_str()),
        Some("Boame, Esi")
    );

    drop(s.stdin);
    let _ = s.child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn update_rehashes_password_and_delete_guards_references() {
    let (mut s, workspace) = Sidecar::with_workspace("examdesk-accounts-update");

    let teacher_id = s.register("Adler, Kim", "kim@example.test", "teacher");
    let student_id = s.register("Boame, Esi", "esi@example.test", "student");

    let _ = s.ok(
        "accounts.update",
        json!({ "accountId": student_id, "patch": { "password": "new-pass-99" } }),
    );
    let old_pw = s.err_code(
        "accounts.login",
        json!({ "email": "esi@example.test", "password": "s3cret-pass" }),
    );
    assert_eq!(old_pw, "invalid_credentials");
    let new_pw = s.ok(
        "accounts.login",
        json!({ "email": "esi@example.test", "password": "new-pass-99" }),
    );
    assert_eq!(
        new_pw.get("accountId").and_then(|v| v.as_str()),
        Some(student_id.as_str())
    );

    // A teacher who owns a class cannot be deleted.
    let subject_id = s.create_subject("Physics");
    let class_id = s.create_class("10B Physics", &subject_id, &teacher_id);
    let code = s.err_code("accounts.delete", json!({ "accountId": teacher_id }));
    assert_eq!(code, "conflict");

    // An unreferenced account can.
    let _ = s.ok("accounts.delete", json!({ "accountId": student_id }));
    let gone = s.err_code("accounts.delete", json!({ "accountId": student_id }));
    assert_eq!(gone, "not_found");

    let _ = s.ok("classes.delete", json!({ "classId": class_id }));
    let _ = s.ok("accounts.delete", json!({ "accountId": teacher_id }));

    drop(s.stdin);
    let _ = s.child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
