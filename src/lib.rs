// Wire types keep fields the sources send even where nothing reads them yet.
#![allow(dead_code)]

pub mod accounts;
pub mod config;
pub mod db;
pub mod error;
pub mod migrations;
pub mod psa;
pub mod reconcile;
pub mod remote;
pub mod rmm;
pub mod scheduler;
pub mod schema;
pub mod services;
pub mod sync;
pub mod tracker;
