use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDate;
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::academic;
use crate::model::{Grade, ProfessionalSubject, SchoolClass, SubjectTemplate};
use crate::text;

pub const ALL: &str = "all";

/// A year filter: either every year or a single one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Scope {
    #[default]
    All,
    Only(i32),
}

impl Scope {
    pub fn value(self) -> Option<i32> {
        match self {
            Self::All => None,
            Self::Only(v) => Some(v),
        }
    }

    pub fn is_all(self) -> bool {
        matches!(self, Self::All)
    }
}

impl Serialize for Scope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::All => serializer.serialize_str(ALL),
            Self::Only(v) => serializer.serialize_i32(*v),
        }
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        match &raw {
            serde_json::Value::String(s) if s == ALL => Ok(Self::All),
            serde_json::Value::String(s) => s
                .trim()
                .parse::<i32>()
                .map(Self::Only)
                .map_err(|_| de::Error::custom(format!("invalid year filter: {}", s))),
            serde_json::Value::Number(n) => n
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(Self::Only)
                .ok_or_else(|| de::Error::custom("year filter must be an integer")),
            serde_json::Value::Null => Ok(Self::All),
            _ => Err(de::Error::custom("year filter must be \"all\" or a number")),
        }
    }
}

fn all_quarters() -> String {
    ALL.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalyticsFilters {
    pub series: Vec<String>,
    pub class_ids: Vec<String>,
    pub subjects: Vec<String>,
    pub quarter: String,
    pub use_quarter_range: bool,
    pub quarter_range_start: Option<String>,
    pub quarter_range_end: Option<String>,
    /// Course year (1..=3).
    pub school_year: Scope,
    pub calendar_year: Scope,
    pub include_archived: bool,
    pub comparison_class_ids: Vec<String>,
    pub comparison_mode: Option<String>,
    pub comparison_course_year: Option<u8>,
}

impl Default for AnalyticsFilters {
    fn default() -> Self {
        Self {
            series: Vec::new(),
            class_ids: Vec::new(),
            subjects: Vec::new(),
            quarter: all_quarters(),
            use_quarter_range: false,
            quarter_range_start: None,
            quarter_range_end: None,
            school_year: Scope::All,
            calendar_year: Scope::All,
            include_archived: false,
            comparison_class_ids: Vec::new(),
            comparison_mode: None,
            comparison_course_year: None,
        }
    }
}

/// Partial update of [`AnalyticsFilters`]; a present field is a user choice.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FiltersPatch {
    pub series: Option<Vec<String>>,
    pub class_ids: Option<Vec<String>>,
    pub subjects: Option<Vec<String>>,
    pub quarter: Option<String>,
    pub use_quarter_range: Option<bool>,
    pub quarter_range_start: Option<String>,
    pub quarter_range_end: Option<String>,
    pub school_year: Option<Scope>,
    pub calendar_year: Option<Scope>,
    pub include_archived: Option<bool>,
    pub comparison_class_ids: Option<Vec<String>>,
    pub comparison_mode: Option<String>,
    pub comparison_course_year: Option<u8>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Fields the normalizer changed on its own, as opposed to by the patch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoIndicators {
    #[serde(skip_serializing_if = "is_false")]
    pub class_ids: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub subjects: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub school_year: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub calendar_year: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub quarter: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub use_quarter_range: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub comparison_class_ids: bool,
}

pub struct FilterContext<'a> {
    pub classes: &'a [SchoolClass],
    pub grades: &'a [Grade],
    pub templates: &'a [SubjectTemplate],
    pub professional_subjects: &'a [ProfessionalSubject],
    pub today: NaiveDate,
}

#[derive(Debug, Clone, Default)]
struct SubjectSet {
    all: BTreeSet<String>,
    by_year: BTreeMap<u8, BTreeSet<String>>,
    labels: HashMap<String, String>,
}

impl SubjectSet {
    fn add(&mut self, year: Option<u8>, subject: &str) {
        let key = text::normalize_key(subject);
        self.all.insert(key.clone());
        if let Some(y) = year {
            self.by_year.entry(y).or_default().insert(key.clone());
        }
        self.labels.entry(key).or_insert_with(|| subject.to_string());
    }

    fn for_school_year(&self, school_year: Scope) -> Option<&BTreeSet<String>> {
        match school_year {
            Scope::All => Some(&self.all),
            Scope::Only(y) => u8::try_from(y).ok().and_then(|y| self.by_year.get(&y)),
        }
    }

    fn label<'s>(&'s self, key: &'s str) -> &'s str {
        self.labels.get(key).map(String::as_str).unwrap_or(key)
    }
}

/// Matches subject names the way the analytics filter does: exact normalized
/// name, or every significant token of the selection present in the candidate.
struct SubjectMatcher {
    keys: BTreeSet<String>,
    matchers: Vec<(String, Vec<String>)>,
}

impl SubjectMatcher {
    fn new(selected: &[String]) -> Self {
        Self {
            keys: selected.iter().map(|s| text::normalize_key(s)).collect(),
            matchers: selected
                .iter()
                .map(|s| (text::normalize_key(s), text::normalize_tokens(s)))
                .collect(),
        }
    }

    fn matches(&self, subject: &str) -> bool {
        let normalized = text::normalize_key(subject);
        let mut tokens: Option<Vec<String>> = None;
        for (key, wanted) in &self.matchers {
            if normalized == *key {
                return true;
            }
            if wanted.is_empty() {
                continue;
            }
            let have = tokens.get_or_insert_with(|| text::normalize_tokens(subject));
            if wanted.iter().all(|t| have.contains(t)) {
                return true;
            }
        }
        false
    }

    fn matches_set(&self, set: Option<&BTreeSet<String>>, entry: &SubjectSet) -> bool {
        let Some(set) = set else {
            return false;
        };
        set.iter()
            .any(|key| self.keys.contains(key) || self.matches(entry.label(key)))
    }
}

fn parse_series_year(series: &str) -> Option<i32> {
    let digits: String = series
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

pub struct FilterEngine<'a> {
    ctx: FilterContext<'a>,
    template_by_class: HashMap<&'a str, SubjectSet>,
    professional_by_class: HashMap<&'a str, SubjectSet>,
    class_by_id: HashMap<&'a str, &'a SchoolClass>,
}

impl<'a> FilterEngine<'a> {
    pub fn new(ctx: FilterContext<'a>) -> Self {
        let template_by_class = Self::build_template_map(&ctx);
        let mut professional_by_class: HashMap<&'a str, SubjectSet> = HashMap::new();
        for item in ctx.professional_subjects {
            professional_by_class
                .entry(item.class_id.as_str())
                .or_default()
                .add(None, &item.subject);
        }
        let class_by_id = ctx.classes.iter().map(|c| (c.id.as_str(), c)).collect();
        Self {
            ctx,
            template_by_class,
            professional_by_class,
            class_by_id,
        }
    }

    fn build_template_map(ctx: &FilterContext<'a>) -> HashMap<&'a str, SubjectSet> {
        let mut by_course: Vec<(String, SubjectSet)> = Vec::new();
        for template in ctx.templates {
            let key = template.course.as_deref().map(text::normalize_key).unwrap_or_default();
            if key.is_empty() {
                continue;
            }
            let idx = match by_course.iter().position(|(k, _)| *k == key) {
                Some(i) => i,
                None => {
                    by_course.push((key, SubjectSet::default()));
                    by_course.len() - 1
                }
            };
            for year in &template.subjects_by_year {
                for subject in &year.subjects {
                    by_course[idx].1.add(Some(year.year), subject);
                }
            }
        }
        let mut course_keys: Vec<&str> = by_course.iter().map(|(k, _)| k.as_str()).collect();
        course_keys.sort_by_key(|k| std::cmp::Reverse(k.len()));

        let find_course = |course: &str| -> Option<&SubjectSet> {
            let normalized = text::normalize_key(course);
            if normalized.is_empty() {
                return None;
            }
            if let Some((_, set)) = by_course.iter().find(|(k, _)| *k == normalized) {
                return Some(set);
            }
            let key = course_keys
                .iter()
                .find(|k| k.contains(normalized.as_str()) || normalized.contains(**k))?;
            by_course.iter().find(|(k, _)| k == key).map(|(_, s)| s)
        };

        let mut out = HashMap::new();
        for cls in ctx.classes {
            let template = cls
                .template_id
                .as_deref()
                .and_then(|id| ctx.templates.iter().find(|t| t.id == id));
            if let Some(template) = template {
                let mut set = SubjectSet::default();
                for year in &template.subjects_by_year {
                    set.by_year.entry(year.year).or_default();
                    for subject in &year.subjects {
                        set.add(Some(year.year), subject);
                    }
                }
                out.insert(cls.id.as_str(), set);
            } else if let Some(set) = cls.course.as_deref().and_then(find_course) {
                out.insert(cls.id.as_str(), set.clone());
            }
        }
        out
    }

    fn start_year(&self, cls: &SchoolClass) -> Option<i32> {
        academic::start_calendar_year(cls, self.ctx.today)
    }

    fn base_classes(&self, include_archived: bool) -> Vec<&'a SchoolClass> {
        self.ctx
            .classes
            .iter()
            .filter(|c| include_archived || !c.archived)
            .collect()
    }

    /// Series filter; with a target year, series like "2º" match the course
    /// year the class is in during that year rather than its label.
    pub fn filter_classes_by_series(
        &self,
        list: Vec<&'a SchoolClass>,
        series: &[String],
        calendar_year: Scope,
        school_year: Scope,
    ) -> Vec<&'a SchoolClass> {
        if series.is_empty() {
            return list;
        }
        let series_years: Vec<i32> = series
            .iter()
            .filter_map(|s| parse_series_year(s))
            .filter(|y| *y != 0)
            .collect();
        let derived = !series_years.is_empty() && (!calendar_year.is_all() || !school_year.is_all());

        list.into_iter()
            .filter(|cls| {
                if derived {
                    let target = match (calendar_year, school_year) {
                        (Scope::Only(y), _) => Some(y),
                        (Scope::All, Scope::Only(sy)) => self.start_year(cls).map(|s| s + (sy - 1)),
                        (Scope::All, Scope::All) => None,
                    };
                    if let Some(target) = target.filter(|t| *t != 0) {
                        if let Some(cy) = academic::course_year_for_calendar_year(cls, target, self.ctx.today) {
                            return series_years.contains(&i32::from(cy));
                        }
                    }
                }
                series.iter().any(|s| cls.series.contains(s.as_str()))
            })
            .collect()
    }

    fn scoped_classes(&self, filters: &AnalyticsFilters) -> Vec<&'a SchoolClass> {
        self.filter_classes_by_series(
            self.base_classes(filters.include_archived),
            &filters.series,
            filters.calendar_year,
            filters.school_year,
        )
    }

    /// Classes whose grades must be loaded for the current filters.
    pub fn class_ids_for_fetch(&self, filters: &AnalyticsFilters) -> Vec<String> {
        let mut base = self.base_classes(filters.include_archived);
        if !filters.series.is_empty() {
            base.retain(|c| filters.series.iter().any(|s| c.series.contains(s.as_str())));
        }
        let base = self.filter_classes_by_series(base, &filters.series, filters.calendar_year, filters.school_year);
        let selected: Vec<String> = if filters.class_ids.is_empty() {
            base.iter().map(|c| c.id.clone()).collect()
        } else {
            filters.class_ids.clone()
        };
        let mut seen = BTreeSet::new();
        selected
            .into_iter()
            .chain(filters.comparison_class_ids.iter().cloned())
            .filter(|id| seen.insert(id.clone()))
            .collect()
    }

    pub fn subject_class_ids(&self, filters: &AnalyticsFilters) -> BTreeSet<String> {
        if !filters.class_ids.is_empty() {
            return filters.class_ids.iter().cloned().collect();
        }
        self.scoped_classes(filters).iter().map(|c| c.id.clone()).collect()
    }

    /// School year, quarter (or quarter range) and calendar year restrictions on a grade.
    fn grade_in_period(
        &self,
        grade: &Grade,
        filters: &AnalyticsFilters,
        classes: &HashMap<&str, &SchoolClass>,
    ) -> bool {
        if let Scope::Only(sy) = filters.school_year {
            if i32::from(grade.school_year) != sy {
                return false;
            }
        }

        match (&filters.quarter_range_start, &filters.quarter_range_end) {
            (Some(s), Some(e)) if filters.use_quarter_range => {
                if let (Some(a), Some(b)) = (academic::quarter_index(s), academic::quarter_index(e)) {
                    let (lo, hi) = (a.min(b), a.max(b));
                    match academic::quarter_index(&grade.quarter) {
                        Some(q) if q >= lo && q <= hi => {}
                        _ => return false,
                    }
                }
            }
            _ => {
                if filters.quarter != ALL && grade.quarter != filters.quarter {
                    return false;
                }
            }
        }

        if let Scope::Only(target) = filters.calendar_year {
            let Some(cls) = classes.get(grade.class_id.as_str()) else {
                return false;
            };
            let Some(start) = self.start_year(cls) else {
                return false;
            };
            let year = match filters.school_year {
                Scope::Only(sy) => start + (sy - 1),
                Scope::All => start + (i32::from(grade.school_year) - 1),
            };
            if year != target {
                return false;
            }
        }
        true
    }

    /// Subject labels offered by the subject picker, deduplicated by normalized name.
    pub fn available_subjects(&self, filters: &AnalyticsFilters) -> Vec<String> {
        let class_ids = self.subject_class_ids(filters);
        let mut labels: Vec<(String, String)> = Vec::new();
        let mut push = |key: String, label: &str| {
            if !labels.iter().any(|(k, _)| *k == key) {
                labels.push((key, label.to_string()));
            }
        };

        for grade in self.ctx.grades {
            if !class_ids.contains(&grade.class_id) || grade.subject.is_empty() {
                continue;
            }
            if self.grade_in_period(grade, filters, &self.class_by_id) {
                push(text::normalize_key(&grade.subject), &grade.subject);
            }
        }
        for item in self.ctx.professional_subjects {
            if class_ids.contains(&item.class_id) {
                push(text::normalize_key(&item.subject), &item.subject);
            }
        }
        for class_id in &class_ids {
            let Some(entry) = self.template_by_class.get(class_id.as_str()) else {
                continue;
            };
            if let Some(keys) = entry.for_school_year(filters.school_year) {
                for key in keys {
                    push(key.clone(), entry.label(key));
                }
            }
        }
        for subject in academic::all_subjects() {
            push(text::normalize_key(subject), subject);
        }

        let mut out: Vec<String> = labels.into_iter().map(|(_, l)| l).collect();
        text::sort_pt(&mut out);
        out
    }

    /// Classes that teach any selected subject; `None` when no subject is selected.
    pub fn eligible_class_ids_for_subjects(&self, filters: &AnalyticsFilters) -> Option<BTreeSet<String>> {
        if filters.subjects.is_empty() {
            return None;
        }
        let matcher = SubjectMatcher::new(&filters.subjects);
        let scoped = self.scoped_classes(filters);
        let scoped_by_id: HashMap<&str, &SchoolClass> = scoped.iter().map(|c| (c.id.as_str(), *c)).collect();

        let mut from_mapping = BTreeSet::new();
        for cls in &scoped {
            let mapped = self
                .professional_by_class
                .get(cls.id.as_str())
                .map(|e| matcher.matches_set(Some(&e.all), e))
                .unwrap_or(false);
            let templated = self
                .template_by_class
                .get(cls.id.as_str())
                .map(|e| matcher.matches_set(e.for_school_year(filters.school_year), e))
                .unwrap_or(false);
            if mapped || templated {
                from_mapping.insert(cls.id.clone());
            }
        }

        if academic::all_subjects().iter().any(|s| matcher.matches(s)) {
            for cls in &scoped {
                from_mapping.insert(cls.id.clone());
            }
        }

        let mut eligible: BTreeSet<String> = self
            .ctx
            .grades
            .iter()
            .filter(|g| scoped_by_id.contains_key(g.class_id.as_str()))
            .filter(|g| matcher.matches(&g.subject))
            .filter(|g| self.grade_in_period(g, filters, &scoped_by_id))
            .map(|g| g.class_id.clone())
            .collect();
        eligible.extend(from_mapping);
        Some(eligible)
    }

    fn calendar_years_for_school_year(&self, list: &[&SchoolClass], school_year: i32) -> Vec<i32> {
        let years: BTreeSet<i32> = list
            .iter()
            .filter_map(|c| self.start_year(c))
            .map(|s| s + (school_year - 1))
            .collect();
        years.into_iter().collect()
    }

    /// Applies `patch` to `current` and resolves every inconsistency the
    /// combination could produce. Class selection wins over year context and
    /// over subject selection.
    pub fn normalize(&self, current: &AnalyticsFilters, patch: &FiltersPatch) -> AnalyticsFilters {
        let pick = |p: &Option<Vec<String>>, c: &Vec<String>| text::dedupe_sorted(p.clone().unwrap_or_else(|| c.clone()));
        let mut next = AnalyticsFilters {
            series: pick(&patch.series, &current.series),
            class_ids: pick(&patch.class_ids, &current.class_ids),
            subjects: pick(&patch.subjects, &current.subjects),
            quarter: patch.quarter.clone().unwrap_or_else(|| current.quarter.clone()),
            use_quarter_range: patch.use_quarter_range.unwrap_or(current.use_quarter_range),
            quarter_range_start: patch
                .quarter_range_start
                .clone()
                .or_else(|| current.quarter_range_start.clone()),
            quarter_range_end: patch
                .quarter_range_end
                .clone()
                .or_else(|| current.quarter_range_end.clone()),
            school_year: patch.school_year.unwrap_or(current.school_year),
            calendar_year: patch.calendar_year.unwrap_or(current.calendar_year),
            include_archived: patch.include_archived.unwrap_or(current.include_archived),
            comparison_class_ids: pick(&patch.comparison_class_ids, &current.comparison_class_ids),
            comparison_mode: patch.comparison_mode.clone().or_else(|| current.comparison_mode.clone()),
            comparison_course_year: patch.comparison_course_year.or(current.comparison_course_year),
        };

        // A single selected class pulls the year context towards itself.
        if let [only] = next.class_ids.as_slice() {
            if let Some(cls) = self.class_by_id.get(only.as_str()) {
                let start = self.start_year(cls);
                if let Some(class_year) = cls.current_year.filter(|y| (1..=3).contains(y)) {
                    let class_year = i32::from(class_year);
                    let year_incompatible = matches!(next.school_year, Scope::Only(y) if y != class_year);
                    let calendar_incompatible = match (start, next.calendar_year) {
                        (Some(s), Scope::Only(cal)) => cal < s || cal > s + 2,
                        _ => false,
                    };
                    if year_incompatible || calendar_incompatible {
                        next.school_year = Scope::Only(class_year);
                        if let Some(s) = start {
                            if !next.calendar_year.is_all() {
                                next.calendar_year = Scope::Only(s + (class_year - 1));
                            }
                        }
                    }
                }
            }
        }

        let scoped = self.scoped_classes(&next);
        let valid: BTreeSet<&str> = scoped.iter().map(|c| c.id.as_str()).collect();
        next.class_ids.retain(|id| valid.contains(id.as_str()));
        next.comparison_class_ids.retain(|id| valid.contains(id.as_str()));

        let class_ids_patched = patch.class_ids.is_some();
        let mut eligible = self.eligible_class_ids_for_subjects(&next);

        if class_ids_patched && !next.class_ids.is_empty() {
            if let Some(set) = eligible.as_ref().filter(|s| !s.is_empty()) {
                if next.class_ids.iter().any(|id| !set.contains(id)) {
                    next.subjects.clear();
                    eligible = self.eligible_class_ids_for_subjects(&next);
                }
            }
        }

        match eligible.filter(|s| !s.is_empty()) {
            Some(set) => {
                if !next.class_ids.is_empty() {
                    next.class_ids.retain(|id| set.contains(id));
                } else if !next.subjects.is_empty() {
                    next.class_ids = set.iter().cloned().collect();
                }
                next.comparison_class_ids.retain(|id| set.contains(id));
            }
            None => {
                if !next.subjects.is_empty() && !class_ids_patched {
                    next.class_ids.clear();
                    next.comparison_class_ids.clear();
                }
            }
        }

        if patch.use_quarter_range.is_some() && next.use_quarter_range {
            next.quarter = all_quarters();
        }
        if matches!(&patch.quarter, Some(q) if q != ALL) {
            next.use_quarter_range = false;
        }

        if let (Scope::Only(sy), Scope::Only(cal)) = (next.school_year, next.calendar_year) {
            let scope: Vec<&SchoolClass> = if next.class_ids.is_empty() {
                scoped.clone()
            } else {
                scoped
                    .iter()
                    .copied()
                    .filter(|c| next.class_ids.contains(&c.id))
                    .collect()
            };
            let allowed = self.calendar_years_for_school_year(&scope, sy);
            if let Some(first) = allowed.first() {
                if !allowed.contains(&cal) {
                    next.calendar_year = Scope::Only(*first);
                }
            }
        }

        next
    }

    /// Normalizes and reports which fields changed without the user asking.
    /// Indicators for fields present in the patch are cleared.
    pub fn apply(
        &self,
        current: &AnalyticsFilters,
        patch: &FiltersPatch,
        previous: &AutoIndicators,
    ) -> (AnalyticsFilters, AutoIndicators, bool) {
        let next = self.normalize(current, patch);
        if filters_equal(current, &next) {
            return (next, previous.clone(), false);
        }
        let mut ind = previous.clone();
        if patch.class_ids.is_some() {
            ind.class_ids = false;
        }
        if patch.subjects.is_some() {
            ind.subjects = false;
        }
        if patch.school_year.is_some() {
            ind.school_year = false;
        }
        if patch.calendar_year.is_some() {
            ind.calendar_year = false;
        }
        if patch.quarter.is_some() {
            ind.quarter = false;
        }
        if patch.use_quarter_range.is_some() {
            ind.use_quarter_range = false;
        }
        if patch.comparison_class_ids.is_some() {
            ind.comparison_class_ids = false;
        }

        if patch.class_ids.is_none() && current.class_ids != next.class_ids {
            ind.class_ids = true;
        }
        if patch.comparison_class_ids.is_none() && current.comparison_class_ids != next.comparison_class_ids {
            ind.comparison_class_ids = true;
        }
        if patch.subjects.is_none() && current.subjects != next.subjects {
            ind.subjects = true;
        }
        if patch.school_year.is_none() && current.school_year != next.school_year {
            ind.school_year = true;
        }
        if patch.calendar_year.is_none() && current.calendar_year != next.calendar_year {
            ind.calendar_year = true;
        }
        if patch.quarter.is_none() && current.quarter != next.quarter {
            ind.quarter = true;
        }
        if patch.use_quarter_range.is_none() && current.use_quarter_range != next.use_quarter_range {
            ind.use_quarter_range = true;
        }
        (next, ind, true)
    }
}

pub fn filters_equal(a: &AnalyticsFilters, b: &AnalyticsFilters) -> bool {
    a == b
}
