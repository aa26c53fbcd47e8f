use crate::analytics::{self, AnalyticsInput};
use crate::db;
use crate::filters::{AnalyticsFilters, AutoIndicators, FilterContext, FilterEngine, FiltersPatch};
use crate::ipc::helpers::{
    get_optional_str, get_string_list, parse_params, to_json, today, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{Grade, ProfessionalSubject, SchoolClass, SubjectTemplate};
use crate::trajectory::{self, TrajectoryInput};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

/// Everything the filter normalizer reads.
struct FilterData {
    classes: Vec<SchoolClass>,
    grades: Vec<Grade>,
    templates: Vec<SubjectTemplate>,
    professional_subjects: Vec<ProfessionalSubject>,
}

impl FilterData {
    fn load(conn: &Connection) -> Result<Self, HandlerErr> {
        Ok(Self {
            classes: db::load_classes(conn).map_err(HandlerErr::query)?,
            grades: db::load_grades(conn, None).map_err(HandlerErr::query)?,
            templates: db::load_templates(conn).map_err(HandlerErr::query)?,
            professional_subjects: db::load_professional_subjects(conn, None).map_err(HandlerErr::query)?,
        })
    }

    fn engine(&self, today: NaiveDate) -> FilterEngine<'_> {
        FilterEngine::new(FilterContext {
            classes: &self.classes,
            grades: &self.grades,
            templates: &self.templates,
            professional_subjects: &self.professional_subjects,
            today,
        })
    }
}

/// Missing or null keys fall back to the type's default.
fn param_or_default<T: DeserializeOwned + Default>(params: &Value, key: &str) -> Result<T, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(v) => parse_params(v),
    }
}

fn analytics_normalize_filters(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let current: AnalyticsFilters = param_or_default(params, "current")?;
    let patch: FiltersPatch = param_or_default(params, "patch")?;
    let previous: AutoIndicators = param_or_default(params, "previous")?;
    let today = today(params)?;

    let data = FilterData::load(conn)?;
    let engine = data.engine(today);
    let (filters, indicators, changed) = engine.apply(&current, &patch, &previous);
    tracing::debug!(changed, "analytics filters normalized");

    Ok(json!({
        "filters": to_json(&filters)?,
        "autoIndicators": to_json(&indicators)?,
        "changed": changed,
        "availableSubjects": engine.available_subjects(&filters),
        "classIdsForFetch": engine.class_ids_for_fetch(&filters),
    }))
}

fn analytics_available_subjects(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let filters: AnalyticsFilters = param_or_default(params, "filters")?;
    let today = today(params)?;
    let data = FilterData::load(conn)?;
    Ok(json!({ "subjects": data.engine(today).available_subjects(&filters) }))
}

fn analytics_school(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let filters: AnalyticsFilters = param_or_default(params, "filters")?;
    let today = today(params)?;

    let classes = db::load_classes(conn).map_err(HandlerErr::query)?;
    let students = db::load_students(conn, None).map_err(HandlerErr::query)?;
    let grades = db::load_grades(conn, None).map_err(HandlerErr::query)?;
    let attendance = db::load_attendance(conn, None).map_err(HandlerErr::query)?;
    let incidents = db::load_incidents(conn, None).map_err(HandlerErr::query)?;

    let result = analytics::compute_school_analytics(&AnalyticsInput {
        students: &students,
        classes: &classes,
        grades: &grades,
        attendance: &attendance,
        incidents: &incidents,
        filters: &filters,
        today,
    });
    tracing::debug!(
        classes = result.class_ranking.len(),
        insights = result.insights.len(),
        "school analytics computed"
    );
    to_json(&result)
}

/// Trajectory of each requested class, `stats` null for classes without active students.
fn analytics_trajectory(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_ids = get_string_list(params, "classIds")?;
    let subject = get_optional_str(params, "subject");
    let assessment_name = get_optional_str(params, "assessmentName");

    let students = db::load_students(conn, None).map_err(HandlerErr::query)?;
    let grades = db::load_grades(conn, None).map_err(HandlerErr::query)?;
    let historical = db::load_historical_grades(conn, None).map_err(HandlerErr::query)?;
    let external = db::load_external_assessments(conn, None).map_err(HandlerErr::query)?;
    let input = TrajectoryInput {
        students: &students,
        grades: &grades,
        historical: &historical,
        external: &external,
        subject: subject.as_deref(),
        assessment_name: assessment_name.as_deref(),
    };

    let classes = class_ids
        .iter()
        .map(|class_id| {
            let stats = trajectory::class_trajectory(&input, class_id);
            Ok(json!({ "classId": class_id, "stats": to_json(&stats)? }))
        })
        .collect::<Result<Vec<_>, HandlerErr>>()?;
    Ok(json!({
        "classes": classes,
        "distinctAssessments": trajectory::distinct_assessments(&students, &external, &class_ids),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "analytics.normalizeFilters" => Some(with_conn(state, req, analytics_normalize_filters)),
        "analytics.availableSubjects" => Some(with_conn(state, req, analytics_available_subjects)),
        "analytics.school" => Some(with_conn(state, req, analytics_school)),
        "analytics.trajectory" => Some(with_conn(state, req, analytics_trajectory)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::Scope;

    #[test]
    fn absent_filter_params_use_defaults() {
        let params = json!({ "current": null, "patch": { "schoolYear": 2 } });
        let current: AnalyticsFilters = param_or_default(&params, "current").unwrap();
        assert_eq!(current, AnalyticsFilters::default());
        let patch: FiltersPatch = param_or_default(&params, "patch").unwrap();
        assert_eq!(patch.school_year, Some(Scope::Only(2)));
        let previous: AutoIndicators = param_or_default(&params, "previous").unwrap();
        assert_eq!(previous, AutoIndicators::default());
    }
}
