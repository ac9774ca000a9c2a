use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of the device a trace was recorded on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    name: String,
}

impl Device {
    pub fn new(name: impl Into<String>) -> Self {
        Device { name: name.into() }
    }

    /// Host CPU, the device the built-in kernel timer measures.
    pub fn host() -> Self {
        Device::new("host")
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
