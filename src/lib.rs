pub mod animation;
pub mod cache;
pub mod chat;
pub mod config;
pub mod diagram;
pub mod export;
pub mod gateway;
pub mod graph;
pub mod layout;
pub mod parser;
pub mod pipeline;
pub mod prompt;
pub mod render;
pub mod session;
pub mod web_server;

pub use config::Settings;
pub use diagram::{DiagramSpec, Edge, EdgeStyle, Node, NodeKind};
pub use pipeline::{Pipeline, PipelineError, PipelineOutput, Stage};
pub use prompt::{Fingerprint, Prompt};
