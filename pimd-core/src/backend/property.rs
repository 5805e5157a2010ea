//! Named backend properties.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendProperty {
    Opened,
    Opening,
    Revision,
    Online,
    Readonly,
    CacheDir,
    Capabilities,
    Kind,
}

impl BackendProperty {
    pub const ALL: [BackendProperty; 8] = [
        BackendProperty::Opened,
        BackendProperty::Opening,
        BackendProperty::Revision,
        BackendProperty::Online,
        BackendProperty::Readonly,
        BackendProperty::CacheDir,
        BackendProperty::Capabilities,
        BackendProperty::Kind,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BackendProperty::Opened => "opened",
            BackendProperty::Opening => "opening",
            BackendProperty::Revision => "revision",
            BackendProperty::Online => "online",
            BackendProperty::Readonly => "readonly",
            BackendProperty::CacheDir => "cache-dir",
            BackendProperty::Capabilities => "capabilities",
            BackendProperty::Kind => "kind",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }
}

impl fmt::Display for BackendProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
