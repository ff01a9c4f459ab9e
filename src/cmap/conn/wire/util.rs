use std::{
    io::BufRead,
    sync::atomic::{AtomicI32, Ordering},
};

use crate::error::{ErrorKind, Result};

static REQUEST_ID: AtomicI32 = AtomicI32::new(0);

/// Returns a new, unique request ID.
pub(crate) fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// Serializes `string` to bytes and writes them to `writer` with a null terminator appended.
pub(super) fn write_cstring(writer: &mut Vec<u8>, string: &str) {
    writer.extend_from_slice(string.as_bytes());
    writer.push(0);
}

/// Reads a null-terminated UTF-8 string from `reader`.
pub(super) fn read_cstring<R: BufRead>(reader: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    reader.read_until(0, &mut bytes)?;
    if bytes.pop() != Some(0) {
        return Err(ErrorKind::InvalidResponse {
            message: "missing null terminator in wire message string".to_string(),
        }
        .into());
    }

    String::from_utf8(bytes).map_err(|_| {
        ErrorKind::InvalidResponse {
            message: "invalid UTF-8 in wire message string".to_string(),
        }
        .into()
    })
}
