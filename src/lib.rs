//! Capstone orchestrator.
//!
//! A learner's push reaches the webhook dispatcher in [`server`], which
//! records a pending changelog entry and queues a job. The [`queue`] worker
//! runs it through [`lifecycle`]: deploy via [`deploy`], run the [`checker`],
//! then fold the results into task status with [`reconciler`].

pub mod checker;
pub mod config;
pub mod deploy;
pub mod errors;
pub mod git;
pub mod lifecycle;
pub mod logging;
pub mod queue;
pub mod reconciler;
pub mod repo_provider;
pub mod server;
pub mod store;
