// SPDX-License-Identifier: Apache-2.0

use std::{
    fmt,
    io,
    path::{Component, Path, PathBuf},
};

pub const ZEROS: [u8; 16384] = [0u8; 16384];

/// Check if a byte slice is all zeros.
pub fn is_zero(mut buf: &[u8]) -> bool {
    while !buf.is_empty() {
        let n = buf.len().min(ZEROS.len());
        if buf[..n] != ZEROS[..n] {
            return false;
        }

        buf = &buf[n..];
    }

    true
}

/// A wrapper that eagerly captures a value's [`fmt::Debug`] output so that it
/// can be stored in error types without borrowing the value.
#[derive(Clone, PartialEq, Eq)]
pub struct DebugString(String);

impl DebugString {
    pub fn new(value: impl fmt::Debug) -> Self {
        Self(format!("{value:?}"))
    }
}

impl fmt::Debug for DebugString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for DebugString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Join a parent directory with a path that must consist of a single normal
/// component. This guards against path traversal when the file name comes
/// from untrusted input, like a partition name.
pub fn path_join_single(parent: &Path, name: impl AsRef<Path>) -> io::Result<PathBuf> {
    let name = name.as_ref();
    let mut components = name.components();

    match (components.next(), components.next()) {
        (Some(Component::Normal(c)), None) => Ok(parent.join(c)),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Not a single path component: {name:?}"),
        )),
    }
}
