//! Hex rendering for diagnostic log lines

use std::fmt::{self, Write};

/// Displays bytes as space separated upper-case hex pairs
pub struct Hex<'a>(pub &'a [u8]);

impl fmt::Display for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i != 0 {
                f.write_char(' ')?;
            }
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

/// Render bytes as a classic 16-per-row dump with offsets
pub fn dump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in bytes.chunks(16).enumerate() {
        if row != 0 {
            out.push('\n');
        }
        let _ = write!(out, "{:04X}  {}", row * 16, Hex(chunk));
    }
    out
}
