//! Class trajectory: how a class performed from fundamental school, through
//! the high-school gradebook, next to external assessments.

use std::collections::{BTreeMap, HashSet};

use chrono::Datelike;
use serde::Serialize;

use crate::academic::{self, PASSING_GRADE, QUARTERS};
use crate::model::{ExternalAssessment, Grade, HistoricalGrade, SchoolLevel, Student, StudentStatus};
use crate::text;

const FUNDAMENTAL_YEARS: [u8; 4] = [6, 7, 8, 9];
const EXCELLENCE_GRADE: f64 = 9.0;
/// Subject value that selects external scores recorded without a subject.
const GENERAL_SUBJECT: &str = "geral";

pub struct TrajectoryInput<'a> {
    pub students: &'a [Student],
    pub grades: &'a [Grade],
    pub historical: &'a [HistoricalGrade],
    pub external: &'a [ExternalAssessment],
    pub subject: Option<&'a str>,
    pub assessment_name: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StudentTrajectory {
    pub student_id: String,
    pub name: String,
    pub fund_avg: Option<f64>,
    pub high_school_avg: Option<f64>,
    pub external_avg: Option<f64>,
}

impl StudentTrajectory {
    /// Mean of the gradebook-style averages; external scores stay out.
    fn academic_avg(&self) -> Option<f64> {
        let points: Vec<f64> = [self.fund_avg, self.high_school_avg].into_iter().flatten().collect();
        academic::mean(&points)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct TrajectoryAverages {
    pub fund: Option<f64>,
    pub hs: Option<f64>,
    pub ext: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct TrajectoryCounts {
    pub critical: usize,
    pub excellence: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum Stage {
    Fundamental,
    #[serde(rename = "Médio")]
    Medio,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimelinePoint {
    pub label: String,
    #[serde(rename = "type")]
    pub stage: Stage,
    /// Gradebook or historical average for the period.
    pub internal: Option<f64>,
    pub external: Option<f64>,
    pub unified: f64,
    pub sort_key: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClassTrajectory {
    pub averages: TrajectoryAverages,
    pub counts: TrajectoryCounts,
    pub student_stats: Vec<StudentTrajectory>,
    pub timeline: Vec<TimelinePoint>,
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn subject_key(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Score on a 0..10 scale.
fn normalized_score(e: &ExternalAssessment) -> f64 {
    if e.max_score > 0.0 {
        e.score / e.max_score * 10.0
    } else {
        0.0
    }
}

/// Quarter an external score is charted in: its own, else the one its date falls in.
fn external_quarter(e: &ExternalAssessment) -> Option<usize> {
    if let Some(q) = e.quarter.as_deref() {
        return q
            .chars()
            .find(|c| c.is_ascii_digit())
            .and_then(|c| c.to_digit(10))
            .filter(|n| (1..=4).contains(n))
            .map(|n| n as usize - 1);
    }
    let month = academic::parse_date(&e.applied_date)?.month();
    Some(match month {
        1..=4 => 0,
        5..=7 => 1,
        8..=10 => 2,
        _ => 3,
    })
}

#[derive(Default)]
struct Acc {
    total: f64,
    count: usize,
}

impl Acc {
    fn push(&mut self, v: f64) {
        self.total += v;
        self.count += 1;
    }

    fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.total / self.count as f64)
    }
}

fn unified_point(label: String, stage: Stage, internal: Option<f64>, external: Option<f64>, sort_key: u32) -> Option<TimelinePoint> {
    let values: Vec<f64> = [internal, external].into_iter().flatten().collect();
    let unified = academic::mean(&values)?;
    Some(TimelinePoint {
        label,
        stage,
        internal: internal.map(round1),
        external: external.map(round1),
        unified: round1(unified),
        sort_key,
    })
}

struct Filters<'a> {
    subject: Option<String>,
    assessment_name: Option<&'a str>,
}

impl Filters<'_> {
    fn subject_matches(&self, subject: &str) -> bool {
        self.subject.as_deref().map_or(true, |t| subject_key(subject) == t)
    }

    fn external_matches(&self, e: &ExternalAssessment) -> bool {
        if let Some(name) = self.assessment_name {
            if e.assessment_name != name {
                return false;
            }
        }
        let subject = e.subject.as_deref().map(subject_key);
        match (self.subject.as_deref(), subject.as_deref()) {
            (None, _) => true,
            (Some(t), None) => t == GENERAL_SUBJECT,
            (Some(t), Some(s)) => s == t,
        }
    }
}

/// Trajectory of the active students of `class_id`; `None` when the class has none.
pub fn class_trajectory(input: &TrajectoryInput<'_>, class_id: &str) -> Option<ClassTrajectory> {
    let students: Vec<&Student> = input
        .students
        .iter()
        .filter(|s| s.class_id == class_id && s.status == StudentStatus::Active)
        .collect();
    if students.is_empty() {
        return None;
    }
    let ids: HashSet<&str> = students.iter().map(|s| s.id.as_str()).collect();
    let filters = Filters {
        subject: input
            .subject
            .filter(|s| !s.trim().is_empty() && *s != "all")
            .map(subject_key),
        assessment_name: input.assessment_name.filter(|n| !n.is_empty() && *n != "all"),
    };

    let historical: Vec<&HistoricalGrade> = input
        .historical
        .iter()
        .filter(|h| ids.contains(h.student_id.as_str()) && filters.subject_matches(&h.subject))
        .collect();
    let grades: Vec<&Grade> = input
        .grades
        .iter()
        .filter(|g| g.class_id == class_id && filters.subject_matches(&g.subject))
        .collect();
    let external: Vec<&ExternalAssessment> = input
        .external
        .iter()
        .filter(|e| ids.contains(e.student_id.as_str()) && filters.external_matches(e))
        .collect();

    let student_stats: Vec<StudentTrajectory> = students
        .iter()
        .map(|s| {
            let fund: Vec<f64> = historical.iter().filter(|h| h.student_id == s.id).map(|h| h.grade).collect();
            let hs: Vec<f64> = grades.iter().filter(|g| g.student_id == s.id).map(|g| g.grade).collect();
            let ext: Vec<f64> = external
                .iter()
                .filter(|e| e.student_id == s.id)
                .map(|e| normalized_score(e))
                .collect();
            StudentTrajectory {
                student_id: s.id.clone(),
                name: s.name.clone(),
                fund_avg: academic::mean(&fund).map(round1),
                high_school_avg: academic::mean(&hs).map(round1),
                external_avg: academic::mean(&ext).map(round1),
            }
        })
        .collect();

    let column = |f: fn(&StudentTrajectory) -> Option<f64>| {
        let values: Vec<f64> = student_stats.iter().filter_map(f).collect();
        academic::mean(&values)
    };
    let averages = TrajectoryAverages {
        fund: column(|s| s.fund_avg),
        hs: column(|s| s.high_school_avg),
        ext: column(|s| s.external_avg),
    };
    let counts = TrajectoryCounts {
        critical: student_stats
            .iter()
            .filter(|s| s.academic_avg().is_some_and(|a| a < PASSING_GRADE))
            .count(),
        excellence: student_stats
            .iter()
            .filter(|s| s.academic_avg().is_some_and(|a| a >= EXCELLENCE_GRADE))
            .count(),
        total: student_stats.len(),
    };

    let mut timeline = Vec::new();
    for year in FUNDAMENTAL_YEARS {
        let mut internal = Acc::default();
        for h in historical.iter().filter(|h| h.school_level == SchoolLevel::Fundamental && h.grade_year == year) {
            internal.push(h.grade);
        }
        let mut ext = Acc::default();
        for e in external.iter().filter(|e| e.school_level == SchoolLevel::Fundamental && e.grade_year == year) {
            ext.push(normalized_score(e));
        }
        timeline.extend(unified_point(
            format!("{}º Ano", year),
            Stage::Fundamental,
            internal.avg(),
            ext.avg(),
            u32::from(year),
        ));
    }

    // Keyed by (course year, quarter index).
    let mut periods: BTreeMap<(u8, usize), (Acc, Acc)> = BTreeMap::new();
    for g in &grades {
        if let Some(q) = academic::quarter_index(&g.quarter) {
            periods.entry((g.school_year, q)).or_default().0.push(g.grade);
        }
    }
    for e in external.iter().filter(|e| e.school_level == SchoolLevel::Medio) {
        if let Some(q) = external_quarter(e) {
            periods.entry((e.grade_year, q)).or_default().1.push(normalized_score(e));
        }
    }
    for ((year, q), (internal, ext)) in &periods {
        timeline.extend(unified_point(
            format!("{}º ano - {}", year, QUARTERS[*q]),
            Stage::Medio,
            internal.avg(),
            ext.avg(),
            u32::from(*year) * 10 + *q as u32 + 1,
        ));
    }
    timeline.sort_by_key(|p| p.sort_key);

    Some(ClassTrajectory { averages, counts, student_stats, timeline })
}

/// Assessment names seen among the students of the given classes, any status.
pub fn distinct_assessments(students: &[Student], external: &[ExternalAssessment], class_ids: &[String]) -> Vec<String> {
    let ids: HashSet<&str> = students
        .iter()
        .filter(|s| class_ids.contains(&s.class_id))
        .map(|s| s.id.as_str())
        .collect();
    text::dedupe_sorted(
        external
            .iter()
            .filter(|e| ids.contains(e.student_id.as_str()))
            .map(|e| e.assessment_name.clone()),
    )
}
