pub mod cache;
pub mod composed;
pub mod load_rules;
pub mod notice;
