//! Strict splitting of concatenated PEM blocks.
//!
//! The `pem` crate happily skips garbage around blocks. Package files and key
//! files must not carry any, so callers split one block at a time and decide
//! what to do with the rest.

const BEGIN: &[u8] = b"-----BEGIN ";
const END: &[u8] = b"-----END ";
const DASHES: &[u8] = b"-----";

/// Split the first PEM block off `input`.
///
/// Leading ASCII whitespace is skipped. Returns the bytes of the block (from
/// `-----BEGIN` through the closing dashes of the `-----END` line) and the
/// remaining input, or `None` if `input` does not start with a complete block.
pub fn split_pem_block(input: &[u8]) -> Option<(&[u8], &[u8])> {
    let input = input.trim_ascii_start();
    if !input.starts_with(BEGIN) {
        return None;
    }
    let end = find(input, END)?;
    let after_end = end + END.len();
    let close = after_end + find(&input[after_end..], DASHES)? + DASHES.len();
    Some(input.split_at(close))
}

/// Returns `true` if `rest` contains nothing but ASCII whitespace.
pub fn is_blank(rest: &[u8]) -> bool {
    rest.iter().all(u8::is_ascii_whitespace)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
