//! `/proc/<pid>/mountinfo` parsing.
//!
//! One line per mount:
//!
//! ```text
//! 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
//! (1)(2)(3)   (4)   (5)      (6)      (7)   (8) (9)   (10)         (11)
//! ```
//!
//! Field 7 is a variable-length list of optional fields ended by `-`. Paths
//! escape space, tab, newline and backslash as three-digit octal (`\040`).

use std::path::PathBuf;

use crate::error::{HotplugError, HotplugResult};

/// The parts of a mount entry the tracker needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_id: u32,
    pub mount_point: PathBuf,
    pub fs_type: String,
    /// Mount source; a block device path for disk-backed mounts.
    pub source: String,
}

impl MountEntry {
    pub fn is_block_device(&self) -> bool {
        self.source.starts_with("/dev/")
    }
}

/// Parse a whole mountinfo file. Blank lines are skipped; a malformed line
/// fails the parse.
pub fn parse_mountinfo(text: &str) -> HotplugResult<Vec<MountEntry>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| parse_line(line).map_err(|reason| HotplugError::mountinfo(n + 1, reason)))
        .collect()
}

fn parse_line(line: &str) -> Result<MountEntry, String> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return Err(format!("expected at least 10 fields, found {}", fields.len()));
    }
    let mount_id = fields[0]
        .parse()
        .map_err(|_| format!("bad mount id `{}`", fields[0]))?;
    let separator = fields[6..]
        .iter()
        .position(|f| *f == "-")
        .map(|i| i + 6)
        .ok_or("missing `-` separator")?;
    let (Some(fs_type), Some(source)) = (fields.get(separator + 1), fields.get(separator + 2)) else {
        return Err("missing filesystem type or source".into());
    };
    Ok(MountEntry {
        mount_id,
        mount_point: PathBuf::from(unescape(fields[4])),
        fs_type: fs_type.to_string(),
        source: unescape(source),
    })
}

/// Undo the kernel's octal escaping.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let code = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            out.push(code as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
