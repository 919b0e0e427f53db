//! Media-layer types shared by the ingest, fan-out, and recording paths.

pub mod nal;

pub use nal::{AnnexBSplitter, NalUnit, NaluType};
