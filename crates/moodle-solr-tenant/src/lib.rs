//! Tenant lifecycle management for a multi-tenant Moodle Solr deployment.
//!
//! Each Moodle site gets its own Solr core and a Solr user that may only
//! access that core. [`controller::Controller`] provisions, deletes, backs up
//! and lists tenants; all changes to Solr's `security.json` go through
//! [`moodle_solr_security`].

pub mod cli;
pub mod commands;
pub mod controller;
pub mod external;
pub mod health;
pub mod identifier;
pub mod prompt;
pub mod secret;
pub mod service;
pub mod solr;
