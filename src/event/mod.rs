//! Anchor event model.

mod types;

pub use types::{event_types, AnchorEvent, AnchorEventBuilder};
