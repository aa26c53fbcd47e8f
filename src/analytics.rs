use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{Datelike, Months, NaiveDate};
use serde::Serialize;

use crate::academic::{self, Classification, ClassificationResult, Trend, PASSING_GRADE, QUARTERS};
use crate::filters::{AnalyticsFilters, Scope, ALL};
use crate::incidents::{Incident, IncidentStatus, Severity};
use crate::model::{AttendanceRecord, AttendanceStatus, Grade, SchoolClass, Student, StudentStatus};

const NO_CLASS: &str = "Sem turma";
const MONTH_NAMES: [&str; 12] = [
    "Jan", "Fev", "Mar", "Abr", "Mai", "Jun", "Jul", "Ago", "Set", "Out", "Nov", "Dez",
];

pub struct AnalyticsInput<'a> {
    pub students: &'a [Student],
    pub classes: &'a [SchoolClass],
    pub grades: &'a [Grade],
    pub attendance: &'a [AttendanceRecord],
    pub incidents: &'a [Incident],
    pub filters: &'a AnalyticsFilters,
    pub today: NaiveDate,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ClassificationCounts {
    pub critico: usize,
    pub atencao: usize,
    pub aprovado: usize,
    pub excelencia: usize,
}

impl ClassificationCounts {
    fn add(&mut self, c: Classification) {
        match c {
            Classification::Critico => self.critico += 1,
            Classification::Atencao => self.atencao += 1,
            Classification::Aprovado => self.aprovado += 1,
            Classification::Excelencia => self.excelencia += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct SeverityTally {
    pub leve: usize,
    pub intermediaria: usize,
    pub grave: usize,
    pub gravissima: usize,
}

impl SeverityTally {
    fn add(&mut self, s: Severity) {
        match s {
            Severity::Leve => self.leve += 1,
            Severity::Intermediaria => self.intermediaria += 1,
            Severity::Grave => self.grave += 1,
            Severity::Gravissima => self.gravissima += 1,
        }
    }

    fn get(&self, s: Severity) -> usize {
        match s {
            Severity::Leve => self.leve,
            Severity::Intermediaria => self.intermediaria,
            Severity::Grave => self.grave,
            Severity::Gravissima => self.gravissima,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAnalytics {
    pub student: Student,
    pub classification: ClassificationResult,
    pub class_name: String,
    pub incident_count: usize,
    pub trend: Trend,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassAnalytics {
    pub class_data: SchoolClass,
    pub calendar_year: Option<i32>,
    pub student_count: usize,
    pub average: f64,
    pub frequency: f64,
    pub growth: Option<f64>,
    pub classifications: ClassificationCounts,
    pub incident_count: usize,
    pub trend: Trend,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CohortAnalytics {
    pub calendar_year: i32,
    pub class_count: usize,
    pub student_count: usize,
    pub average: f64,
    pub frequency: f64,
    pub incident_count: usize,
    pub growth_average: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAnalytics {
    pub subject: String,
    pub area: String,
    pub average: f64,
    pub students_below6: usize,
    pub students_below6_percent: f64,
    pub total_students: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AreaAnalytics {
    pub area: String,
    pub average: f64,
    pub subjects: Vec<SubjectAnalytics>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchoolOverview {
    pub total_students: usize,
    pub total_classes: usize,
    pub overall_average: f64,
    pub overall_frequency: f64,
    pub total_incidents: usize,
    pub classifications: ClassificationCounts,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IncidentBySeverity {
    pub severity: Severity,
    pub count: usize,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassIncidentRanking {
    pub class_data: SchoolClass,
    pub incident_count: usize,
    pub student_count: usize,
    pub incidents_per_student: f64,
    pub open_incidents: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentIncidentRanking {
    pub student: Student,
    pub class_name: String,
    pub incident_count: usize,
    pub last_incident_date: Option<String>,
    pub severities: SeverityTally,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyIncidentTrend {
    pub month: &'static str,
    pub year: i32,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BehavioralAnalytics {
    pub incidents_by_severity: Vec<IncidentBySeverity>,
    pub class_incident_ranking: Vec<ClassIncidentRanking>,
    pub top_students_by_incidents: Vec<StudentIncidentRanking>,
    pub monthly_trend: Vec<MonthlyIncidentTrend>,
    pub open_incidents_count: usize,
    pub resolved_incidents_count: usize,
    pub average_incidents_per_student: f64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InsightType {
    Warning,
    Alert,
    Success,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InsightCategory {
    Academic,
    Behavioral,
    Risk,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Insight {
    pub id: &'static str,
    #[serde(rename = "type")]
    pub insight_type: InsightType,
    pub category: InsightCategory,
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_label: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CategorizedInsights {
    pub academic: Vec<Insight>,
    pub behavioral: Vec<Insight>,
    pub risk: Vec<Insight>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchoolAnalytics {
    pub overview: SchoolOverview,
    pub class_ranking: Vec<ClassAnalytics>,
    pub top_students: Vec<StudentAnalytics>,
    pub critical_students: Vec<StudentAnalytics>,
    pub subject_analytics: Vec<SubjectAnalytics>,
    pub area_analytics: Vec<AreaAnalytics>,
    pub best_subjects: Vec<SubjectAnalytics>,
    pub worst_subjects: Vec<SubjectAnalytics>,
    pub behavioral_analytics: BehavioralAnalytics,
    pub insights: Vec<Insight>,
    pub categorized_insights: CategorizedInsights,
    pub comparison_data: Vec<ClassAnalytics>,
    pub cohort_analytics: Vec<CohortAnalytics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    fn contains(range: Option<&DateRange>, value: &str) -> bool {
        let Some(range) = range else {
            return true;
        };
        match academic::parse_date(value) {
            Some(d) => d >= range.start && d < range.end,
            None => false,
        }
    }
}

fn add_months(date: NaiveDate, months: u32) -> Option<NaiveDate> {
    date.checked_add_months(Months::new(months))
}

fn resolve_start_date(cls: &SchoolClass) -> Option<NaiveDate> {
    cls.start_year_date
        .as_deref()
        .and_then(academic::parse_date)
        .or_else(|| cls.start_calendar_year.and_then(|y| NaiveDate::from_ymd_opt(y, 2, 1)))
}

/// The window of `quarter` (two months) or of the whole school year (eight months)
/// for the class's `school_year`.
fn class_period(cls: &SchoolClass, school_year: i32, quarter: &str) -> Option<DateRange> {
    let start = resolve_start_date(cls)?;
    let offset = u32::try_from(school_year - 1).ok()?;
    let year_start = add_months(start, offset * 12)?;
    if quarter == ALL {
        return Some(DateRange {
            start: year_start,
            end: add_months(year_start, 8)?,
        });
    }
    let index = u32::try_from(academic::quarter_index(quarter)?).ok()?;
    Some(DateRange {
        start: add_months(year_start, index * 2)?,
        end: add_months(year_start, index * 2 + 2)?,
    })
}

fn ratio_percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

fn presence_percent<'r>(records: impl IntoIterator<Item = &'r AttendanceRecord>) -> (usize, usize) {
    let mut present = 0;
    let mut total = 0;
    for r in records {
        total += 1;
        if r.status == AttendanceStatus::Presente {
            present += 1;
        }
    }
    (present, total)
}

fn in_quarter_selection(grade: &Grade, filters: &AnalyticsFilters) -> bool {
    match (&filters.quarter_range_start, &filters.quarter_range_end) {
        (Some(s), Some(e)) if filters.use_quarter_range => {
            match (
                academic::quarter_index(s),
                academic::quarter_index(e),
                academic::quarter_index(&grade.quarter),
            ) {
                (Some(a), Some(b), Some(q)) => q >= a.min(b) && q <= a.max(b),
                (Some(_), Some(_), None) => false,
                _ => true,
            }
        }
        _ => filters.quarter == ALL || grade.quarter == filters.quarter,
    }
}

/// School-wide dashboard data for the given filters.
pub fn compute_school_analytics(input: &AnalyticsInput<'_>) -> SchoolAnalytics {
    let filters = input.filters;
    let target_school_year = filters.school_year.value();

    let active_classes: Vec<&SchoolClass> = input
        .classes
        .iter()
        .filter(|c| filters.include_archived || !c.archived)
        .collect();

    let calendar_year_of: HashMap<&str, Option<i32>> = active_classes
        .iter()
        .map(|c| {
            let year = target_school_year
                .and_then(|sy| academic::recorded_start_calendar_year(c).map(|s| s + (sy - 1)));
            (c.id.as_str(), year)
        })
        .collect();

    let mut classes: Vec<&SchoolClass> = active_classes.clone();
    if !filters.series.is_empty() {
        classes.retain(|c| filters.series.iter().any(|s| c.series.contains(s.as_str())));
    }
    if !filters.class_ids.is_empty() {
        classes.retain(|c| filters.class_ids.contains(&c.id));
    }
    if let (Some(_), Scope::Only(target)) = (target_school_year, filters.calendar_year) {
        classes.retain(|c| calendar_year_of.get(c.id.as_str()).copied().flatten() == Some(target));
    }
    let class_ids: BTreeSet<&str> = classes.iter().map(|c| c.id.as_str()).collect();
    let class_name = |id: &str| -> String {
        classes
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| NO_CLASS.to_string())
    };

    let students: Vec<&Student> = input
        .students
        .iter()
        .filter(|s| class_ids.contains(s.class_id.as_str()) && s.status == StudentStatus::Active)
        .collect();

    let all_grades = input.grades.iter().filter(|g| class_ids.contains(g.class_id.as_str()));
    let year_grades: Vec<&Grade> = match target_school_year {
        Some(sy) => all_grades.filter(|g| i32::from(g.school_year) == sy).collect(),
        None => all_grades.collect(),
    };
    let grades: Vec<&Grade> = year_grades
        .iter()
        .copied()
        .filter(|g| in_quarter_selection(g, filters))
        .collect();

    let ranges: HashMap<&str, DateRange> = match target_school_year {
        Some(sy) => classes
            .iter()
            .filter_map(|c| class_period(c, sy, &filters.quarter).map(|r| (c.id.as_str(), r)))
            .collect(),
        None => HashMap::new(),
    };
    let attendance: Vec<&AttendanceRecord> = input
        .attendance
        .iter()
        .filter(|a| class_ids.contains(a.class_id.as_str()))
        .filter(|a| DateRange::contains(ranges.get(a.class_id.as_str()), &a.date))
        .collect();
    let incidents: Vec<&Incident> = input
        .incidents
        .iter()
        .filter(|i| class_ids.contains(i.class_id.as_str()))
        .filter(|i| DateRange::contains(ranges.get(i.class_id.as_str()), &i.date))
        .collect();

    let student_list: Vec<StudentAnalytics> = students
        .iter()
        .map(|student| {
            let own_grades: Vec<&Grade> = grades.iter().copied().filter(|g| g.student_id == student.id).collect();
            let own_attendance: Vec<&AttendanceRecord> = attendance
                .iter()
                .copied()
                .filter(|a| a.student_id == student.id)
                .collect();
            let incident_count = incidents
                .iter()
                .filter(|i| i.student_ids.iter().any(|s| *s == student.id))
                .count();
            let trend_averages =
                academic::quarter_averages(year_grades.iter().copied().filter(|g| g.student_id == student.id));
            StudentAnalytics {
                student: (*student).clone(),
                classification: academic::classify_student(&own_grades, &own_attendance),
                class_name: class_name(&student.class_id),
                incident_count,
                trend: academic::trend(&trend_averages, 0.3),
            }
        })
        .collect();

    let class_list: Vec<ClassAnalytics> = classes
        .iter()
        .map(|cls| {
            let class_students: Vec<&StudentAnalytics> =
                student_list.iter().filter(|s| s.student.class_id == cls.id).collect();
            let student_averages: Vec<f64> = class_students
                .iter()
                .filter_map(|s| {
                    let values: Vec<f64> = grades
                        .iter()
                        .filter(|g| g.class_id == cls.id && g.student_id == s.student.id)
                        .map(|g| g.grade)
                        .collect();
                    academic::mean(&values)
                })
                .collect();
            let (present, total) = presence_percent(attendance.iter().copied().filter(|a| a.class_id == cls.id));
            let mut classifications = ClassificationCounts::default();
            for s in &class_students {
                classifications.add(s.classification.classification);
            }
            let quarter_avgs = academic::quarter_averages(year_grades.iter().copied().filter(|g| g.class_id == cls.id));
            ClassAnalytics {
                class_data: (*cls).clone(),
                calendar_year: calendar_year_of.get(cls.id.as_str()).copied().flatten(),
                student_count: class_students.len(),
                average: academic::mean(&student_averages).unwrap_or(0.0),
                frequency: if total > 0 { present as f64 / total as f64 * 100.0 } else { 100.0 },
                growth: academic::growth(&quarter_avgs),
                classifications,
                incident_count: incidents.iter().filter(|i| i.class_id == cls.id).count(),
                trend: academic::trend(&quarter_avgs, 0.2),
            }
        })
        .collect();

    let mut class_ranking = class_list.clone();
    class_ranking.sort_by(|a, b| b.average.total_cmp(&a.average));

    let cohort_analytics = match target_school_year {
        Some(_) => cohorts(&classes, &calendar_year_of, &students, &grades, &attendance, &incidents, &class_list),
        None => Vec::new(),
    };

    let subject_analytics = subjects(&grades);
    let mut best_subjects = subject_analytics.clone();
    best_subjects.sort_by(|a, b| b.average.total_cmp(&a.average));
    best_subjects.truncate(5);
    let mut worst_subjects = subject_analytics.clone();
    worst_subjects.sort_by(|a, b| a.average.total_cmp(&b.average));
    worst_subjects.truncate(5);
    let area_analytics = areas(&subject_analytics);

    let mut top_students = student_list.clone();
    top_students.sort_by(|a, b| b.classification.average.total_cmp(&a.classification.average));
    top_students.truncate(10);

    let mut critical_students: Vec<StudentAnalytics> = student_list
        .iter()
        .filter(|s| {
            matches!(
                s.classification.classification,
                Classification::Critico | Classification::Atencao
            )
        })
        .cloned()
        .collect();
    critical_students.sort_by(|a, b| {
        a.classification
            .classification
            .cmp(&b.classification.classification)
            .then(a.classification.average.total_cmp(&b.classification.average))
    });
    critical_students.truncate(15);

    let mut totals = ClassificationCounts::default();
    for s in &student_list {
        totals.add(s.classification.classification);
    }
    let overall: Vec<f64> = grades.iter().map(|g| g.grade).collect();
    let (present, total) = presence_percent(attendance.iter().copied());
    let overview = SchoolOverview {
        total_students: students.len(),
        total_classes: classes.len(),
        overall_average: academic::mean(&overall).unwrap_or(0.0),
        overall_frequency: if total > 0 { present as f64 / total as f64 * 100.0 } else { 100.0 },
        total_incidents: incidents.len(),
        classifications: totals,
    };

    let (behavioral_analytics, severity_counts) =
        behavioral(&classes, &students, &incidents, input.today, &class_name);

    let insights = build_insights(
        &overview,
        students.len(),
        &class_ranking,
        &worst_subjects,
        &behavioral_analytics,
        &severity_counts,
    );
    let categorized_insights = CategorizedInsights {
        academic: insights
            .iter()
            .filter(|i| i.category == InsightCategory::Academic)
            .cloned()
            .collect(),
        behavioral: insights
            .iter()
            .filter(|i| i.category == InsightCategory::Behavioral)
            .cloned()
            .collect(),
        risk: insights
            .iter()
            .filter(|i| i.category == InsightCategory::Risk)
            .cloned()
            .collect(),
    };

    let comparison_data = class_list
        .iter()
        .filter(|c| filters.comparison_class_ids.contains(&c.class_data.id))
        .cloned()
        .collect();

    SchoolAnalytics {
        overview,
        class_ranking,
        top_students,
        critical_students,
        subject_analytics,
        area_analytics,
        best_subjects,
        worst_subjects,
        behavioral_analytics,
        insights,
        categorized_insights,
        comparison_data,
        cohort_analytics,
    }
}

#[derive(Default)]
struct CohortAcc {
    class_ids: BTreeSet<String>,
    student_ids: BTreeSet<String>,
    grade_sum: f64,
    grade_count: usize,
    present: usize,
    attendance_total: usize,
    incident_count: usize,
    growth_values: Vec<f64>,
}

fn cohorts(
    classes: &[&SchoolClass],
    calendar_year_of: &HashMap<&str, Option<i32>>,
    students: &[&Student],
    grades: &[&Grade],
    attendance: &[&AttendanceRecord],
    incidents: &[&Incident],
    class_list: &[ClassAnalytics],
) -> Vec<CohortAnalytics> {
    let mut by_year: BTreeMap<i32, CohortAcc> = BTreeMap::new();
    for cls in classes {
        let Some(year) = calendar_year_of.get(cls.id.as_str()).copied().flatten() else {
            continue;
        };
        let acc = by_year.entry(year).or_default();
        acc.class_ids.insert(cls.id.clone());
        acc.student_ids.extend(
            students
                .iter()
                .filter(|s| s.class_id == cls.id)
                .map(|s| s.id.clone()),
        );
        for g in grades.iter().filter(|g| g.class_id == cls.id) {
            acc.grade_sum += g.grade;
            acc.grade_count += 1;
        }
        let (present, total) = presence_percent(attendance.iter().copied().filter(|a| a.class_id == cls.id));
        acc.present += present;
        acc.attendance_total += total;
        acc.incident_count += incidents.iter().filter(|i| i.class_id == cls.id).count();
        if let Some(g) = class_list
            .iter()
            .find(|c| c.class_data.id == cls.id)
            .and_then(|c| c.growth)
        {
            acc.growth_values.push(g);
        }
    }

    by_year
        .into_iter()
        .map(|(calendar_year, acc)| CohortAnalytics {
            calendar_year,
            class_count: acc.class_ids.len(),
            student_count: acc.student_ids.len(),
            average: if acc.grade_count > 0 {
                acc.grade_sum / acc.grade_count as f64
            } else {
                0.0
            },
            frequency: if acc.attendance_total > 0 {
                acc.present as f64 / acc.attendance_total as f64 * 100.0
            } else {
                100.0
            },
            incident_count: acc.incident_count,
            growth_average: academic::mean(&acc.growth_values),
        })
        .collect()
}

/// Per-subject averages as the mean of each student's own average.
fn subjects(grades: &[&Grade]) -> Vec<SubjectAnalytics> {
    let mut order: Vec<&str> = Vec::new();
    let mut by_subject: HashMap<&str, BTreeMap<&str, Vec<f64>>> = HashMap::new();
    for g in grades {
        if !by_subject.contains_key(g.subject.as_str()) {
            order.push(g.subject.as_str());
        }
        by_subject
            .entry(g.subject.as_str())
            .or_default()
            .entry(g.student_id.as_str())
            .or_default()
            .push(g.grade);
    }

    order
        .into_iter()
        .map(|subject| {
            let finals: Vec<f64> = by_subject
                .get(subject)
                .map(|m| m.values().filter_map(|v| academic::mean(v)).collect())
                .unwrap_or_default();
            let below = finals.iter().filter(|v| **v < PASSING_GRADE).count();
            SubjectAnalytics {
                subject: subject.to_string(),
                area: academic::subject_area(subject).to_string(),
                average: academic::mean(&finals).unwrap_or(0.0),
                students_below6: below,
                students_below6_percent: ratio_percent(below, finals.len()),
                total_students: finals.len(),
            }
        })
        .collect()
}

fn areas(subjects: &[SubjectAnalytics]) -> Vec<AreaAnalytics> {
    let mut out: Vec<AreaAnalytics> = Vec::new();
    for s in subjects {
        match out.iter_mut().find(|a| a.area == s.area) {
            Some(area) => area.subjects.push(s.clone()),
            None => out.push(AreaAnalytics {
                area: s.area.clone(),
                average: 0.0,
                subjects: vec![s.clone()],
            }),
        }
    }
    for area in &mut out {
        let values: Vec<f64> = area.subjects.iter().map(|s| s.average).collect();
        area.average = academic::mean(&values).unwrap_or(0.0);
    }
    out
}

fn behavioral(
    classes: &[&SchoolClass],
    students: &[&Student],
    incidents: &[&Incident],
    today: NaiveDate,
    class_name: &dyn Fn(&str) -> String,
) -> (BehavioralAnalytics, SeverityTally) {
    let mut severity_counts = SeverityTally::default();
    for i in incidents {
        severity_counts.add(i.final_severity);
    }
    let incidents_by_severity = Severity::ALL
        .iter()
        .map(|s| IncidentBySeverity {
            severity: *s,
            count: severity_counts.get(*s),
            percent: ratio_percent(severity_counts.get(*s), incidents.len()),
        })
        .collect();

    let mut class_incident_ranking: Vec<ClassIncidentRanking> = classes
        .iter()
        .map(|cls| {
            let own: Vec<&&Incident> = incidents.iter().filter(|i| i.class_id == cls.id).collect();
            let student_count = students.iter().filter(|s| s.class_id == cls.id).count();
            ClassIncidentRanking {
                class_data: (*cls).clone(),
                incident_count: own.len(),
                student_count,
                incidents_per_student: if student_count > 0 {
                    own.len() as f64 / student_count as f64
                } else {
                    0.0
                },
                open_incidents: own.iter().filter(|i| i.status != IncidentStatus::Resolvida).count(),
            }
        })
        .collect();
    class_incident_ranking.sort_by(|a, b| b.incident_count.cmp(&a.incident_count));

    let mut per_student: Vec<(&str, usize, Option<&str>, SeverityTally)> = Vec::new();
    for incident in incidents {
        for student_id in &incident.student_ids {
            let idx = match per_student.iter().position(|(id, ..)| *id == student_id.as_str()) {
                Some(i) => i,
                None => {
                    per_student.push((student_id.as_str(), 0, None, SeverityTally::default()));
                    per_student.len() - 1
                }
            };
            let entry = &mut per_student[idx];
            entry.1 += 1;
            entry.3.add(incident.final_severity);
            if entry.2.map(|d| incident.date.as_str() > d).unwrap_or(true) {
                entry.2 = Some(incident.date.as_str());
            }
        }
    }
    let mut top_students_by_incidents: Vec<StudentIncidentRanking> = per_student
        .into_iter()
        .filter_map(|(id, count, last, severities)| {
            let student = students.iter().find(|s| s.id == id)?;
            Some(StudentIncidentRanking {
                student: (*student).clone(),
                class_name: class_name(&student.class_id),
                incident_count: count,
                last_incident_date: last.map(str::to_string),
                severities,
            })
        })
        .collect();
    top_students_by_incidents.sort_by(|a, b| b.incident_count.cmp(&a.incident_count));
    top_students_by_incidents.truncate(10);

    let monthly_trend = (0..6)
        .rev()
        .filter_map(|back| {
            let first = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)?;
            let month = first.checked_sub_months(Months::new(back))?;
            let count = incidents
                .iter()
                .filter_map(|i| academic::parse_date(&i.date))
                .filter(|d| d.year() == month.year() && d.month() == month.month())
                .count();
            Some(MonthlyIncidentTrend {
                month: MONTH_NAMES[month.month0() as usize],
                year: month.year(),
                count,
            })
        })
        .collect();

    let resolved = incidents
        .iter()
        .filter(|i| i.status == IncidentStatus::Resolvida)
        .count();
    let analytics = BehavioralAnalytics {
        incidents_by_severity,
        class_incident_ranking,
        top_students_by_incidents,
        monthly_trend,
        open_incidents_count: incidents.len() - resolved,
        resolved_incidents_count: resolved,
        average_incidents_per_student: if students.is_empty() {
            0.0
        } else {
            incidents.len() as f64 / students.len() as f64
        },
    };
    (analytics, severity_counts)
}

fn insight(
    id: &'static str,
    insight_type: InsightType,
    category: InsightCategory,
    title: String,
    description: String,
) -> Insight {
    Insight {
        id,
        insight_type,
        category,
        title,
        description,
        action_label: None,
        action_data: None,
    }
}

fn build_insights(
    overview: &SchoolOverview,
    student_count: usize,
    class_ranking: &[ClassAnalytics],
    worst_subjects: &[SubjectAnalytics],
    behavior: &BehavioralAnalytics,
    severity: &SeverityTally,
) -> Vec<Insight> {
    use InsightCategory::{Academic, Behavioral, Risk};
    use InsightType::{Alert, Success, Warning};

    let mut out = Vec::new();
    let totals = overview.classifications;

    if totals.critico > 0 {
        let mut item = insight(
            "critical-students",
            Alert,
            Risk,
            format!("{} alunos em situação crítica", totals.critico),
            format!(
                "{:.0}% dos alunos estão reprovados em 3 ou mais disciplinas e precisam de intervenção imediata.",
                ratio_percent(totals.critico, student_count)
            ),
        );
        item.action_label = Some("Ver alunos");
        item.action_data = Some(serde_json::json!({ "filter": "critico" }));
        out.push(item);
    }

    if let Some(cls) = class_ranking
        .iter()
        .find(|c| c.student_count > 0 && c.classifications.critico as f64 / c.student_count as f64 > 0.3)
    {
        let mut item = insight(
            "class-critical",
            Warning,
            Risk,
            format!("{} precisa de atenção", cls.class_data.name),
            format!(
                "{:.0}% dos alunos desta turma estão em situação crítica.",
                ratio_percent(cls.classifications.critico, cls.student_count)
            ),
        );
        item.action_label = Some("Ver turma");
        item.action_data = Some(serde_json::json!({ "classId": cls.class_data.id }));
        out.push(item);
    }

    if let Some(worst) = worst_subjects.first().filter(|s| s.students_below6_percent > 30.0) {
        out.push(insight(
            "worst-subject",
            Warning,
            Academic,
            format!("{} é a disciplina mais crítica", worst.subject),
            format!(
                "{:.0}% das notas estão abaixo de 6.0 (média: {:.1}).",
                worst.students_below6_percent, worst.average
            ),
        ));
    }

    if totals.excelencia > 0 {
        let mut item = insight(
            "excellence-students",
            Success,
            Academic,
            format!("{} alunos de excelência", totals.excelencia),
            format!(
                "{:.0}% dos alunos têm média geral acima de 8.0 em todas as disciplinas.",
                ratio_percent(totals.excelencia, student_count)
            ),
        );
        item.action_label = Some("Ver alunos");
        item.action_data = Some(serde_json::json!({ "filter": "excelencia" }));
        out.push(item);
    }

    if overview.overall_frequency < 80.0 {
        out.push(insight(
            "low-frequency",
            Alert,
            Academic,
            "Frequência abaixo do esperado".to_string(),
            format!(
                "A frequência média é de {:.0}%, abaixo dos 80% recomendados.",
                overview.overall_frequency
            ),
        ));
    }

    if let Some(best) = class_ranking.first().filter(|c| c.average >= 7.0) {
        out.push(insight(
            "best-class",
            Success,
            Academic,
            format!("{} lidera o ranking", best.class_data.name),
            format!(
                "Média de {:.1} e {} alunos de excelência.",
                best.average, best.classifications.excelencia
            ),
        ));
    }

    let with_growth: Vec<(&ClassAnalytics, f64)> = class_ranking
        .iter()
        .filter_map(|c| c.growth.map(|g| (c, g)))
        .collect();
    if let Some(first) = with_growth.first() {
        let best = with_growth
            .iter()
            .fold(*first, |best, cur| if cur.1 > best.1 { *cur } else { best });
        if best.1 >= 0.5 {
            out.push(insight(
                "best-growth",
                Success,
                Academic,
                format!("{} teve maior crescimento", best.0.class_data.name),
                format!(
                    "Evolução de {:.1} pontos entre o primeiro e o último bimestre disponível.",
                    best.1
                ),
            ));
        }
        let worst = with_growth
            .iter()
            .fold(*first, |worst, cur| if cur.1 < worst.1 { *cur } else { worst });
        if worst.1 <= -0.5 {
            out.push(insight(
                "worst-growth",
                Warning,
                Academic,
                format!("{} apresentou queda de desempenho", worst.0.class_data.name),
                format!(
                    "Queda de {:.1} ponto(s) entre o primeiro e o último bimestre disponível.",
                    worst.1.abs()
                ),
            ));
        }
    }

    if behavior.average_incidents_per_student > 0.5 {
        out.push(insight(
            "high-incidents",
            Warning,
            Behavioral,
            "Alto índice de ocorrências".to_string(),
            format!(
                "Média de {:.1} ocorrências por aluno. Considere ações preventivas.",
                behavior.average_incidents_per_student
            ),
        ));
    }

    let severe = severity.grave + severity.gravissima;
    if severe > 0 {
        out.push(insight(
            "severe-incidents",
            Alert,
            Behavioral,
            format!("{} ocorrências graves", severe),
            format!(
                "Há {} ocorrências graves e {} gravíssimas que requerem atenção especial.",
                severity.grave, severity.gravissima
            ),
        ));
    }

    if behavior.open_incidents_count > 5 {
        out.push(insight(
            "pending-incidents",
            Warning,
            Behavioral,
            format!("{} ocorrências pendentes", behavior.open_incidents_count),
            "Existem ocorrências aguardando resolução. Considere revisar e dar encaminhamento.".to_string(),
        ));
    }

    if let Some(cls) = behavior
        .class_incident_ranking
        .first()
        .filter(|c| c.incident_count >= 5)
    {
        out.push(insight(
            "class-most-incidents",
            Warning,
            Behavioral,
            format!("{} lidera em ocorrências", cls.class_data.name),
            format!(
                "{} ocorrências registradas ({:.1} por aluno).",
                cls.incident_count, cls.incidents_per_student
            ),
        ));
    }

    if let [.., prev, last] = behavior.monthly_trend.as_slice() {
        if prev.count > 0 && (last.count as f64) < prev.count as f64 * 0.7 {
            out.push(insight(
                "behavior-improvement",
                Success,
                Behavioral,
                "Melhoria no comportamento".to_string(),
                format!(
                    "Ocorrências reduziram {:.0}% em relação ao mês anterior.",
                    ratio_percent(prev.count - last.count, prev.count)
                ),
            ));
        }
    }

    out
}
