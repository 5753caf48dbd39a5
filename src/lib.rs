//! Test-support library for Tortuga integration testing.
//!
//! Provides the keyword surface consumed by the RobotFramework suites:
//! cloud VM provisioning (currently AWS EC2), an SSH readiness poll, and a
//! grab-bag of helpers for exercising Tortuga auth and CLI behavior.

pub mod cloud_provider;
pub mod models;
pub mod services;
pub mod tortuga;
pub mod util;

pub use cloud_provider::{wait_for_port, CloudProvider, CloudProviderLauncher};
pub use models::cloud_instance::{CloudProviderKind, LaunchVm, VmConnection};
pub use services::openid_service::OpenidLogin;
pub use tortuga::Tortuga;
