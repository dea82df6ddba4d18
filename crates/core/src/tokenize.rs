//! Message tokenization and sliding-window record emission
//!
//! A token is any maximal run of non-whitespace code points; no case
//! folding or other normalization is applied. A prefix is `state_size`
//! consecutive tokens rendered as a canonical space-joined key.

use crate::types::TrainingRecord;

/// Split a message into tokens.
///
/// # Example
///
/// ```
/// use markgen_core::tokenize;
///
/// let tokens = tokenize("  the quick\tbrown   fox ");
/// assert_eq!(tokens, vec!["the", "quick", "brown", "fox"]);
/// ```
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace().map(String::from).collect()
}

/// Render a token run as the canonical map key.
pub fn prefix_key(tokens: &[String]) -> String {
    tokens.join(" ")
}

/// Emit one weight-1 record per sliding window of `state_size + 1` tokens.
///
/// Messages shorter than `state_size + 1` tokens produce nothing.
///
/// # Example
///
/// ```
/// use markgen_core::records_from_message;
///
/// let records = records_from_message("a b c d", 2);
/// assert_eq!(records.len(), 2);
/// assert_eq!(records[0].prefix, "a b");
/// assert_eq!(records[0].suffix, "c");
/// assert_eq!(records[1].prefix, "b c");
/// assert_eq!(records[1].suffix, "d");
/// ```
pub fn records_from_message(text: &str, state_size: usize) -> Vec<TrainingRecord> {
    let tokens = tokenize(text);
    sliding_records(&tokens, state_size)
}

/// Sliding-window record emission over an already tokenized message.
pub fn sliding_records(tokens: &[String], state_size: usize) -> Vec<TrainingRecord> {
    if state_size == 0 || tokens.len() < state_size + 1 {
        return Vec::new();
    }
    tokens
        .windows(state_size + 1)
        .map(|w| TrainingRecord::new(prefix_key(&w[..state_size]), w[state_size].clone(), 1))
        .collect()
}
