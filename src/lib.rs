pub mod api;
pub mod auth;
pub mod catalog;
pub mod config;
pub mod dataset;
pub mod db;
pub mod discovery;
pub mod error;
pub mod model;
pub mod probe;
pub mod queue;
pub mod stac;
pub mod tracker;
pub mod validator;
pub mod workflow;
