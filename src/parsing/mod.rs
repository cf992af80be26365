//! # Parsing Utilities
//!
//! Text-level helpers for the document model:
//!
//! - `numeric`: locale-independent integer and float parsing with strict
//!   overflow rejection, shortest-round-trip float formatting, and the
//!   debug-checked narrowing casts used by the commit path
//! - `json`: a small recursive-descent JSON codec for [`crate::Value`],
//!   used to build and inspect documents as text
//!
//! Neither module touches the storage layer; both are pure functions over
//! strings and values.

pub mod json;
pub mod numeric;

pub use json::{parse_json, to_json};
pub use numeric::{format_float, parse_float, parse_signed, parse_unsigned};
