//! Concrete [`ModelClient`](crate::model::ModelClient) implementations.

pub mod ollama;
