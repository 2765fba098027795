//! imgsync CLI - push and pull OCI images between a local CAS and registries.

pub mod commands;
