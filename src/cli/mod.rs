pub mod commands;
pub mod setup;
pub mod ui;
