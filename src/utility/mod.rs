//! Utility tasks served by the background session.

mod title;

pub use title::{fallback_title, TitleGenerator};
