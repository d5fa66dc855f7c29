//! WAL naming (§3): a WAL is referenced by its base name; WALs sharing a
//! *prefix* (log group) form a single lexicographically-ordered sequence.

use std::fmt;

use camino::Utf8PathBuf;

/// The base name of a WAL file, e.g. `"w.101"`. Ordered lexicographically,
/// which the design relies on matching the on-disk rotation order within
/// a single prefix.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WalName(String);

impl WalName {
    pub fn new(name: impl Into<String>) -> Self {
        WalName(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The log group this WAL belongs to: everything before the last
    /// `.`-delimited component, or the whole name if there is none.
    /// WALs `w.100` and `w.101` share prefix `w`; `w` and `v.1` do not.
    pub fn prefix(&self) -> Prefix {
        match self.0.rsplit_once('.') {
            Some((head, _)) => Prefix(head.to_string()),
            None => Prefix(self.0.clone()),
        }
    }
}

impl fmt::Display for WalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WalName {
    fn from(s: &str) -> Self {
        WalName::new(s.to_string())
    }
}

impl From<String> for WalName {
    fn from(s: String) -> Self {
        WalName::new(s)
    }
}

/// A WAL log group: all WAL names sharing a prefix form one ordered
/// sequence, independent of every other prefix's sequence.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Prefix(String);

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A rolled WAL as handed to `preLogRoll`/`postLogRoll`: the base name
/// plus the full path on this node's `logDir`, from which the name is
/// derived.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalLog {
    pub path: Utf8PathBuf,
}

impl WalLog {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        WalLog { path: path.into() }
    }

    pub fn name(&self) -> WalName {
        WalName::new(
            self.path
                .file_name()
                .expect("WAL log path must have a file name")
                .to_string(),
        )
    }
}
