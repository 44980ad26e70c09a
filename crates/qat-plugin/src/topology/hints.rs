use std::collections::HashMap;
use std::fmt;

/// Affinity detected for a device at one sysfs directory.
///
/// Every list is a comma separated string as found in sysfs, an empty string
/// means the value is unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hint {
    /// sysfs directory the hint was read from
    pub provider: String,
    pub cpus: String,
    pub numas: String,
    pub sockets: String,
}

impl Hint {
    pub(crate) fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            ..Default::default()
        }
    }

    /// Whether no affinity at all was detected.
    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty() && self.numas.is_empty() && self.sockets.is_empty()
    }
}

impl fmt::Display for Hint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = [
            ("CPUs", &self.cpus),
            ("NUMAs", &self.numas),
            ("sockets", &self.sockets),
        ];

        write!(f, "<hints ")?;
        let mut sep = "";
        for (name, value) in fields.iter().filter(|(_, value)| !value.is_empty()) {
            write!(f, "{sep}{name}:{value}")?;
            sep = ", ";
        }
        write!(f, " (from {})>", self.provider)
    }
}

/// Hints keyed by their provider path.
pub type Hints = HashMap<String, Hint>;

/// Adds `hints` to `org`. A provider already present in `org` is never
/// overwritten.
pub fn merge_topology_hints(mut org: Hints, hints: Hints) -> Hints {
    for (provider, hint) in hints {
        org.entry(provider).or_insert(hint);
    }
    org
}
