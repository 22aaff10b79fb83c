//! `playout-core` drives an uninterrupted on-screen broadcast by sequencing
//! media through a small set of external renderers and by letting
//! rule-driven overlays be injected at precise points during or between
//! items.
//!
//! The crate owns the playback tree, the renderer pool, the render
//! hierarchy and the engine that ties them together. It never decodes
//! media, routes audio/video or renders pixels itself; it commands a
//! [`core::renderer::Renderer`] capability that does.

pub mod core;

#[cfg(feature = "testing")]
pub mod testing;
