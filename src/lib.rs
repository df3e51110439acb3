//! Reconciles declarative content assets against an object store.
//!
//! A trigger hands an asset to [`controller::Controller`], which keeps the
//! finalizer in place and writes whatever status [`reconciler::AssetReconciler`]
//! computes. Publishing runs the [`pipeline::ContentPipeline`]: the source is
//! pulled by [`loader::ArchiveLoader`], passed through the webhook stages in
//! [`hooks`] (each driven by [`engine::ProcessingEngine`]) and uploaded.

pub mod cli;
pub mod config;
pub mod contract;
pub mod controller;
pub mod engine;
pub mod error;
pub mod events;
pub mod filter;
pub mod hooks;
pub mod load_config;
pub mod loader;
pub mod model;
pub mod pipeline;
pub mod reconciler;
pub mod resource;
pub mod store;
pub mod webhook;

pub use error::{AssetError, Result};
