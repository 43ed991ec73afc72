#[macro_use]
extern crate serde_derive;

pub mod config;
pub mod k8s;
pub mod runtime;
