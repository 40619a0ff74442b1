pub mod analytics;
pub mod core;
pub mod exchange;
pub mod notes;
pub mod notifications;
pub mod students;
pub mod users;
