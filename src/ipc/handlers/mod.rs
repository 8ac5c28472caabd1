pub mod classes;
pub mod core;
pub mod grid;
pub mod rubric;
pub mod scores;
pub mod setup;
