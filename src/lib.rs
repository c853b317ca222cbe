//! Incremental translation compiler.
//!
//! Extracts strings from a JSON source file, works out which
//! `(key, language)` pairs changed since the last run, sends only those to an
//! LLM provider, validates the results and merges them into the target files
//! without overwriting hand-edited translations.

pub mod compiler;
pub mod config;
pub mod error;
pub mod extract;
pub mod hashing;
pub mod ledger;
pub mod manual_override;
pub mod model;
pub mod planner;
pub mod provider;
pub mod retry;
pub mod validation;
pub mod writer;
