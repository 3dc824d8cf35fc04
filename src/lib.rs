//! Telegram assistant for a diabetes diary: glucose readings, carbohydrate
//! intake, insulin doses, reminders and weekly reports.

pub mod api;
pub mod bot;
pub mod config;
pub mod db;
pub mod dialogue;
pub mod dose;
pub mod gpt;
pub mod nutrition;
pub mod reminders;
pub mod report;
pub mod staging;
