pub mod alerts;
pub mod api;
pub mod backup_job;
pub mod cloud_init_job;
pub mod configurator;
pub mod health_job;
pub mod logger;
pub mod migrations;
pub mod pool_monitor;
pub mod registry;
pub mod shell;
