//! Shared utility functions.

pub mod json_extraction;

pub use json_extraction::{
    analyze_json_structure, extract_from_code_block, extract_json_object, find_matching_brace,
    JsonExtractionError, JsonStructureAnalysis,
};
