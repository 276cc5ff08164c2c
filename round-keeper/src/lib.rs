pub mod config;
pub mod control;
pub mod keeper;
pub mod startup;
pub mod uptime;
