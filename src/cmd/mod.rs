//! CLI command implementations.
//!
//! | Module       | Commands handled                          |
//! |--------------|-------------------------------------------|
//! | `serve`      | `Serve`                                   |
//! | `worker`     | `Worker`                                  |
//! | `admin`      | `InitDb`, `Site`, `User`, `Project`, `UserProject` |
//! | `run_checks` | `RunChecks`                               |
//! | `config`     | `Config`                                  |

pub mod admin;
pub mod config;
pub mod run_checks;
pub mod serve;
pub mod worker;

pub use admin::{cmd_init_db, cmd_project, cmd_site, cmd_user, cmd_user_project};
pub use config::cmd_config;
pub use run_checks::cmd_run_checks;
pub use serve::cmd_serve;
pub use worker::cmd_worker;
