//! Service layer: validated operations over storage and the index.

mod graph;

pub use graph::{EntityDetails, GraphService};
