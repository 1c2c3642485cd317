//! Record reassembly and cell rewriting.

mod reassembler;
mod rewriter;
mod stage;

pub use reassembler::{Reassembler, Records, RECORD_TERMINATOR};
pub use rewriter::{CellRewriter, Record, DEFAULT_MARKER, FIELD_SEPARATOR};
pub use stage::{Phase, TransformStage};
