pub mod allocation;
pub mod configuration;
pub mod container_management;
pub mod controller;
pub mod error_handling;
pub mod provisioning;
pub mod secrets;
pub mod storage;
