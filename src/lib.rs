pub mod config;

pub mod db;
pub mod repository;

pub mod agent;
pub mod queue;
pub mod scheduler;
pub mod fanout;
pub mod events;

pub mod services;
pub mod jobs;
pub mod orchestrator;
