use rusqlite::Connection;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Half-up rounding to 2 decimals. Every percentage leaving the daemon goes
/// through this so stored grades, dashboards and exports agree digit-for-digit.
pub fn round2(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

/// Percent for a graded sheet. A zero-mark exam grades as 0, not NaN.
pub fn grade_percent(score: f64, total_marks: f64) -> f64 {
    if total_marks > 0.0 {
        round2(100.0 * score / total_marks)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl StatsError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassFailRollup {
    pub taken: usize,
    pub passed: usize,
    pub failed: usize,
    pub pass_rate: Option<f64>,
    pub average_percent: Option<f64>,
    pub highest_percent: Option<f64>,
    pub lowest_percent: Option<f64>,
}

/// The one pass/fail aggregation. Dashboards, exam stats and the leaderboard
/// all feed (percent, passed) pairs through here.
pub fn pass_fail_rollup<I>(grades: I) -> PassFailRollup
where
    I: IntoIterator<Item = (f64, bool)>,
{
    let mut taken: usize = 0;
    let mut passed: usize = 0;
    let mut sum: f64 = 0.0;
    let mut highest: Option<f64> = None;
    let mut lowest: Option<f64> = None;

    for (percent, did_pass) in grades {
        taken += 1;
        if did_pass {
            passed += 1;
        }
        sum += percent;
        highest = Some(highest.map_or(percent, |h: f64| h.max(percent)));
        lowest = Some(lowest.map_or(percent, |l: f64| l.min(percent)));
    }

    let failed = taken - passed;
    let pass_rate = if taken > 0 {
        Some(round2(100.0 * passed as f64 / taken as f64))
    } else {
        None
    };
    let average_percent = if taken > 0 {
        Some(round2(sum / taken as f64))
    } else {
        None
    };

    PassFailRollup {
        taken,
        passed,
        failed,
        pass_rate,
        average_percent,
        highest_percent: highest,
        lowest_percent: lowest,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamOutcome {
    pub student_id: String,
    pub display_name: String,
    pub email: String,
    pub score: f64,
    pub total_marks: f64,
    pub percent: f64,
    pub passed: bool,
    pub graded_at: String,
}

/// Graded outcomes for one exam, best first, names breaking ties.
pub fn exam_outcomes(conn: &Connection, exam_id: &str) -> Result<Vec<ExamOutcome>, StatsError> {
    let mut stmt = conn
        .prepare(
            "SELECT g.student_id, a.full_name, a.email, g.score, g.total_marks,
                    g.percent, g.passed, g.graded_at
             FROM grades g
             JOIN accounts a ON a.id = g.student_id
             WHERE g.exam_id = ?",
        )
        .map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;
    let mut rows = stmt
        .query_map([exam_id], |r| {
            Ok(ExamOutcome {
                student_id: r.get(0)?,
                display_name: r.get(1)?,
                email: r.get(2)?,
                score: r.get(3)?,
                total_marks: r.get(4)?,
                percent: r.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
                passed: r.get::<_, Option<i64>>(6)?.unwrap_or(0) != 0,
                graded_at: r.get(7)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;

    rows.sort_by(|a, b| {
        b.percent
            .partial_cmp(&a.percent)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.display_name.cmp(&b.display_name))
            .then_with(|| a.student_id.cmp(&b.student_id))
    });
    Ok(rows)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentOutcome {
    pub exam_id: String,
    pub exam_title: String,
    pub subject_name: String,
    pub score: f64,
    pub total_marks: f64,
    pub percent: f64,
    pub passed: bool,
    pub graded_at: String,
}

/// Graded outcomes for one student, most recent first.
pub fn student_outcomes(
    conn: &Connection,
    student_id: &str,
) -> Result<Vec<StudentOutcome>, StatsError> {
    let mut stmt = conn
        .prepare(
            "SELECT g.exam_id, e.title, s.name, g.score, g.total_marks,
                    g.percent, g.passed, g.graded_at
             FROM grades g
             JOIN exams e ON e.id = g.exam_id
             JOIN subjects s ON s.id = e.subject_id
             WHERE g.student_id = ?
             ORDER BY g.graded_at DESC, e.title",
        )
        .map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;
    stmt.query_map([student_id], |r| {
        Ok(StudentOutcome {
            exam_id: r.get(0)?,
            exam_title: r.get(1)?,
            subject_name: r.get(2)?,
            score: r.get(3)?,
            total_marks: r.get(4)?,
            percent: r.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
            passed: r.get::<_, Option<i64>>(6)?.unwrap_or(0) != 0,
            graded_at: r.get(7)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| StatsError::new("db_query_failed", e.to_string()))
}

const BIN_EDGES: [(&str, f64, f64); 6] = [
    ("0-49", 0.0, 50.0),
    ("50-59", 50.0, 60.0),
    ("60-69", 60.0, 70.0),
    ("70-79", 70.0, 80.0),
    ("80-89", 80.0, 90.0),
    ("90-100", 90.0, 100.0),
];

/// Fixed score-distribution bins; [min, max) except the last, which keeps 100.
pub fn distribution_bins(percents: &[f64]) -> Vec<serde_json::Value> {
    let last = BIN_EDGES.len() - 1;
    BIN_EDGES
        .iter()
        .enumerate()
        .map(|(i, (label, min, max))| {
            let count = percents
                .iter()
                .filter(|v| {
                    if i == last {
                        **v >= *min && **v <= *max
                    } else {
                        **v >= *min && **v < *max
                    }
                })
                .count();
            serde_json::json!({
                "label": label,
                "min": min,
                "max": max,
                "count": count
            })
        })
        .collect::<Vec<_>>()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardRow {
    pub rank: usize,
    pub student_id: String,
    pub display_name: String,
    pub exams_taken: usize,
    pub average_percent: f64,
    pub pass_rate: f64,
    pub best_percent: f64,
}

#[derive(Debug, Clone, Default)]
pub struct LeaderboardQuery {
    pub subject_id: Option<String>,
    pub class_id: Option<String>,
    pub min_exams: usize,
    pub limit: usize,
}

/// Leaderboard of students by average percent across their graded exams.
/// Competition ranking: equal averages share a rank, the next distinct
/// average resumes at its 1-based position.
pub fn top_students(
    conn: &Connection,
    query: &LeaderboardQuery,
) -> Result<Vec<LeaderboardRow>, StatsError> {
    let mut sql = String::from(
        "SELECT g.student_id, a.full_name, g.percent, g.passed
         FROM grades g
         JOIN accounts a ON a.id = g.student_id
         JOIN exams e ON e.id = g.exam_id",
    );
    let mut clauses: Vec<&str> = Vec::new();
    let mut params: Vec<String> = Vec::new();
    if let Some(subject_id) = query.subject_id.as_ref() {
        clauses.push("e.subject_id = ?");
        params.push(subject_id.clone());
    }
    if let Some(class_id) = query.class_id.as_ref() {
        clauses.push("e.class_id = ?");
        params.push(class_id.clone());
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                r.get::<_, Option<i64>>(3)?.unwrap_or(0) != 0,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;

    Ok(rank_students(rows, query.min_exams, query.limit))
}

/// Pure half of the leaderboard: aggregate per student, order, rank, cut.
pub fn rank_students(
    grade_rows: Vec<(String, String, f64, bool)>,
    min_exams: usize,
    limit: usize,
) -> Vec<LeaderboardRow> {
    struct Acc {
        display_name: String,
        taken: usize,
        passed: usize,
        sum: f64,
        best: f64,
    }

    let mut by_student: HashMap<String, Acc> = HashMap::new();
    for (student_id, display_name, percent, passed) in grade_rows {
        let acc = by_student.entry(student_id).or_insert(Acc {
            display_name,
            taken: 0,
            passed: 0,
            sum: 0.0,
            best: 0.0,
        });
        acc.taken += 1;
        if passed {
            acc.passed += 1;
        }
        acc.sum += percent;
        acc.best = acc.best.max(percent);
    }

    let min_exams = min_exams.max(1);
    let mut rows = by_student
        .into_iter()
        .filter(|(_, acc)| acc.taken >= min_exams)
        .map(|(student_id, acc)| LeaderboardRow {
            rank: 0,
            student_id,
            display_name: acc.display_name.clone(),
            exams_taken: acc.taken,
            average_percent: round2(acc.sum / acc.taken as f64),
            pass_rate: round2(100.0 * acc.passed as f64 / acc.taken as f64),
            best_percent: acc.best,
        })
        .collect::<Vec<_>>();

    rows.sort_by(|a, b| {
        b.average_percent
            .partial_cmp(&a.average_percent)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.exams_taken.cmp(&a.exams_taken))
            .then_with(|| a.display_name.cmp(&b.display_name))
            .then_with(|| a.student_id.cmp(&b.student_id))
    });

    let mut prev_avg: Option<f64> = None;
    let mut prev_rank: usize = 0;
    for (i, row) in rows.iter_mut().enumerate() {
        if prev_avg == Some(row.average_percent) {
            row.rank = prev_rank;
        } else {
            row.rank = i + 1;
            prev_rank = row.rank;
            prev_avg = Some(row.average_percent);
        }
    }

    if limit > 0 {
        rows.truncate(limit);
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round2_is_half_up() {
        assert_eq!(round2(0.0), 0.0);
        assert_eq!(round2(66.664), 66.66);
        assert_eq!(round2(66.665), 66.67);
        assert_eq!(round2(100.0), 100.0);
    }

    #[test]
    fn grade_percent_handles_zero_total() {
        assert_eq!(grade_percent(0.0, 0.0), 0.0);
        assert_eq!(grade_percent(7.0, 0.0), 0.0);
        assert_eq!(grade_percent(2.0, 3.0), 66.67);
    }

    #[test]
    fn rollup_of_nothing_is_empty() {
        let r = pass_fail_rollup(std::iter::empty());
        assert_eq!(r.taken, 0);
        assert_eq!(r.passed, 0);
        assert_eq!(r.failed, 0);
        assert_eq!(r.pass_rate, None);
        assert_eq!(r.average_percent, None);
        assert_eq!(r.highest_percent, None);
        assert_eq!(r.lowest_percent, None);
    }

    #[test]
    fn rollup_counts_and_averages() {
        let r = pass_fail_rollup(vec![(80.0, true), (40.0, false), (60.0, true)]);
        assert_eq!(r.taken, 3);
        assert_eq!(r.passed, 2);
        assert_eq!(r.failed, 1);
        assert_eq!(r.pass_rate, Some(66.67));
        assert_eq!(r.average_percent, Some(60.0));
        assert_eq!(r.highest_percent, Some(80.0));
        assert_eq!(r.lowest_percent, Some(40.0));
    }

    #[test]
    fn distribution_bins_have_no_gaps() {
        let bins = distribution_bins(&[0.0, 49.95, 50.0, 59.99, 90.0, 100.0]);
        let counts = bins
            .iter()
            .map(|b| b.get("count").and_then(|v| v.as_u64()).unwrap_or(0))
            .collect::<Vec<_>>();
        assert_eq!(counts, vec![2, 2, 0, 0, 0, 2]);
        let total: u64 = counts.iter().sum();
        assert_eq!(total, 6);
    }

    #[test]
    fn ranking_shares_rank_on_equal_average() {
        let rows = rank_students(
            vec![
                ("s1".into(), "Abara, Ngozi".into(), 90.0, true),
                ("s2".into(), "Brandt, Mia".into(), 90.0, true),
                ("s3".into(), "Cho, Daniel".into(), 70.0, true),
            ],
            1,
            0,
        );
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].rank, 1);
        assert_eq!(rows[1].rank, 1);
        assert_eq!(rows[2].rank, 3);
        // Equal averages order by name.
        assert_eq!(rows[0].student_id, "s1");
        assert_eq!(rows[1].student_id, "s2");
    }

    #[test]
    fn ranking_prefers_more_exams_then_name_on_ties() {
        let rows = rank_students(
            vec![
                ("s1".into(), "Zhou, Lin".into(), 80.0, true),
                ("s2".into(), "Adler, Kim".into(), 80.0, true),
                ("s2".into(), "Adler, Kim".into(), 80.0, true),
            ],
            1,
            0,
        );
        // Same 80.0 average; s2 took two exams and comes first.
        assert_eq!(rows[0].student_id, "s2");
        assert_eq!(rows[0].exams_taken, 2);
        assert_eq!(rows[0].rank, 1);
        assert_eq!(rows[1].rank, 1);
    }

    #[test]
    fn ranking_applies_min_exams_and_limit() {
        let rows = rank_students(
            vec![
                ("s1".into(), "A".into(), 95.0, true),
                ("s2".into(), "B".into(), 90.0, true),
                ("s2".into(), "B".into(), 70.0, true),
                ("s3".into(), "C".into(), 85.0, true),
            ],
            2,
            5,
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].student_id, "s2");
        assert_eq!(rows[0].average_percent, 80.0);

        let limited = rank_students(
            vec![
                ("s1".into(), "A".into(), 95.0, true),
                ("s2".into(), "B".into(), 90.0, true),
                ("s3".into(), "C".into(), 85.0, true),
            ],
            1,
            2,
        );
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].student_id, "s1");
    }
}
