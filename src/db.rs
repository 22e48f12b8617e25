use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "examdesk.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS accounts(
            id TEXT PRIMARY KEY,
            full_name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            role TEXT NOT NULL CHECK(role IN ('student','teacher','admin')),
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_accounts_role ON accounts(role)",
        [],
    )?;

    // Existing workspaces may predate account edit tracking.
    ensure_accounts_updated_at(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            code TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(teacher_id) REFERENCES accounts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_subject ON classes(subject_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_teacher ON classes(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_members(
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            joined_at TEXT NOT NULL,
            PRIMARY KEY(class_id, student_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES accounts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_members_student ON class_members(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS question_banks(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(owner_id) REFERENCES accounts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_question_banks_subject ON question_banks(subject_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_question_banks_owner ON question_banks(owner_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS questions(
            id TEXT PRIMARY KEY,
            bank_id TEXT NOT NULL,
            prompt TEXT NOT NULL,
            choice_a TEXT NOT NULL,
            choice_b TEXT NOT NULL,
            choice_c TEXT NOT NULL,
            choice_d TEXT NOT NULL,
            correct_choice TEXT NOT NULL CHECK(correct_choice IN ('A','B','C','D')),
            marks REAL NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(bank_id) REFERENCES question_banks(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_questions_bank ON questions(bank_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_questions_bank_sort ON questions(bank_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exams(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            starts_at TEXT,
            ends_at TEXT,
            duration_minutes INTEGER,
            pass_percent REAL NOT NULL DEFAULT 50,
            published INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(teacher_id) REFERENCES accounts(id)
        )",
        [],
    )?;
    ensure_exams_pass_percent(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exams_class ON exams(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exams_teacher ON exams(teacher_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exams_subject ON exams(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_questions(
            exam_id TEXT NOT NULL,
            question_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            PRIMARY KEY(exam_id, question_id),
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            FOREIGN KEY(question_id) REFERENCES questions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_questions_question ON exam_questions(question_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_answers(
            id TEXT PRIMARY KEY,
            exam_id TEXT NOT NULL,
            question_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            chosen TEXT CHECK(chosen IS NULL OR chosen IN ('A','B','C','D')),
            is_correct INTEGER NOT NULL,
            awarded REAL NOT NULL,
            UNIQUE(exam_id, question_id, student_id),
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            FOREIGN KEY(question_id) REFERENCES questions(id),
            FOREIGN KEY(student_id) REFERENCES accounts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_answers_exam ON student_answers(exam_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_answers_student ON student_answers(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_answers_exam_student
         ON student_answers(exam_id, student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            exam_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            score REAL NOT NULL,
            total_marks REAL NOT NULL,
            percent REAL,
            passed INTEGER,
            graded_at TEXT NOT NULL,
            UNIQUE(exam_id, student_id),
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            FOREIGN KEY(student_id) REFERENCES accounts(id)
        )",
        [],
    )?;
    ensure_grades_percent_columns(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_exam ON grades(exam_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student ON grades(student_id)",
        [],
    )?;

    // Backfill percent/passed for rows written before those columns existed.
    migrate_grade_percentages(&conn)?;

    Ok(conn)
}

fn ensure_accounts_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "accounts", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE accounts ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

fn ensure_exams_pass_percent(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "exams", "pass_percent")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE exams ADD COLUMN pass_percent REAL NOT NULL DEFAULT 50",
        [],
    )?;
    Ok(())
}

fn ensure_grades_percent_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "grades", "percent")? {
        conn.execute("ALTER TABLE grades ADD COLUMN percent REAL", [])?;
    }
    if !table_has_column(conn, "grades", "passed")? {
        conn.execute("ALTER TABLE grades ADD COLUMN passed INTEGER", [])?;
    }
    Ok(())
}

fn migrate_grade_percentages(conn: &Connection) -> anyhow::Result<()> {
    // Early workspaces stored only score/total_marks; percent and passed were
    // derived in the UI. Recompute them here once so every reader sees the
    // same numbers. total_marks = 0 grades as percent 0, failed.
    let mut stmt = conn.prepare(
        "SELECT g.id, g.score, g.total_marks, e.pass_percent
         FROM grades g
         JOIN exams e ON e.id = g.exam_id
         WHERE g.percent IS NULL OR g.passed IS NULL",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, f64>(1)?,
                r.get::<_, f64>(2)?,
                r.get::<_, f64>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (id, score, total, pass_percent) in rows {
        let percent = crate::scoring::grade_percent(score, total);
        let passed = percent >= pass_percent;
        conn.execute(
            "UPDATE grades SET percent = ?, passed = ? WHERE id = ?",
            (percent, passed as i64, &id),
        )?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
