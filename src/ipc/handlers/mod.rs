pub mod accounts;
pub mod answers;
pub mod banks;
pub mod classes;
pub mod core;
pub mod dashboard;
pub mod exams;
pub mod grades;
pub mod reports;
pub mod subjects;
