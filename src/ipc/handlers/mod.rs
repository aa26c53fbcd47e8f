pub mod academic;
pub mod analytics;
pub mod assessments;
pub mod attendance;
pub mod certificates;
pub mod classes;
pub mod config;
pub mod core;
pub mod follow_ups;
pub mod grades;
pub mod incidents;
pub mod students;
pub mod templates;
