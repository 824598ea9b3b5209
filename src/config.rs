use crate::{marshal::ClassifierFlags, types::CharSet};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_PACKING_SIZE: u32 = 32;
pub const MAX_TYPE_SIZE: u32 = 0x1000_0000;

/// Process-wide marshaling policy.
///
/// Every knob can be overridden through `DOTNET_MARSHAL_*` environment
/// variables, see [`MarshalConfig::from_env`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarshalConfig {
    pub default_packing: u32,
    pub max_type_size: u32,
    /// What `CharSet.Auto` (and unannotated strings) resolve to.
    pub default_char_set: CharSet,
    /// Enables the COM/OLE-automation strategies.
    pub platform_extensions: bool,
    pub throw_on_unmappable_char: bool,
}

impl Default for MarshalConfig {
    fn default() -> Self {
        Self {
            default_packing: DEFAULT_PACKING_SIZE,
            max_type_size: MAX_TYPE_SIZE,
            default_char_set: if cfg!(windows) {
                CharSet::Unicode
            } else {
                CharSet::Ansi
            },
            platform_extensions: cfg!(windows),
            throw_on_unmappable_char: false,
        }
    }
}

fn parse_bool(name: &str, value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!("ignoring {}={:?}: expected a boolean", name, value);
            None
        }
    }
}

fn parse_u32(name: &str, value: &str) -> Option<u32> {
    let value = value.trim();
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    match parsed {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring {}={:?}: expected an integer", name, value);
            None
        }
    }
}

impl MarshalConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Applies overrides from `lookup` on top of the defaults. Malformed
    /// values are logged and ignored.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(v) = lookup("DOTNET_MARSHAL_PACKING") {
            if let Some(p) = parse_u32("DOTNET_MARSHAL_PACKING", &v) {
                config.default_packing = p;
            }
        }
        if let Some(v) = lookup("DOTNET_MARSHAL_MAX_TYPE_SIZE") {
            if let Some(s) = parse_u32("DOTNET_MARSHAL_MAX_TYPE_SIZE", &v) {
                config.max_type_size = s;
            }
        }
        if let Some(v) = lookup("DOTNET_MARSHAL_CHARSET") {
            match v.trim().to_ascii_lowercase().as_str() {
                "ansi" => config.default_char_set = CharSet::Ansi,
                "unicode" => config.default_char_set = CharSet::Unicode,
                _ => warn!("ignoring DOTNET_MARSHAL_CHARSET={:?}", v),
            }
        }
        if let Some(v) = lookup("DOTNET_MARSHAL_PLATFORM_EXTENSIONS") {
            if let Some(b) = parse_bool("DOTNET_MARSHAL_PLATFORM_EXTENSIONS", &v) {
                config.platform_extensions = b;
            }
        }
        if let Some(v) = lookup("DOTNET_MARSHAL_THROW_ON_UNMAPPABLE") {
            if let Some(b) = parse_bool("DOTNET_MARSHAL_THROW_ON_UNMAPPABLE", &v) {
                config.throw_on_unmappable_char = b;
            }
        }

        config
    }

    pub fn with_platform_extensions(mut self, enabled: bool) -> Self {
        self.platform_extensions = enabled;
        self
    }

    pub fn with_default_char_set(mut self, char_set: CharSet) -> Self {
        self.default_char_set = char_set;
        self
    }

    pub fn with_default_packing(mut self, packing: u32) -> Self {
        self.default_packing = packing;
        self
    }

    /// Resolves `CharSet::Auto` against the configured default.
    pub fn resolve_char_set(&self, char_set: CharSet) -> CharSet {
        match char_set {
            CharSet::Auto => match self.default_char_set {
                CharSet::Auto => CharSet::Unicode,
                other => other,
            },
            other => other,
        }
    }

    pub fn classifier_flags(&self, char_set: CharSet) -> ClassifierFlags {
        ClassifierFlags {
            ansi: self.resolve_char_set(char_set) == CharSet::Ansi,
            platform_extensions: self.platform_extensions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let config = MarshalConfig::from_vars(|_| None);
        assert_eq!(config, MarshalConfig::default());
        assert_eq!(config.default_packing, 32);
        assert_eq!(config.max_type_size, 0x1000_0000);
    }

    #[test]
    fn overrides_apply() {
        let config = MarshalConfig::from_vars(vars(&[
            ("DOTNET_MARSHAL_PACKING", "8"),
            ("DOTNET_MARSHAL_MAX_TYPE_SIZE", "0x100"),
            ("DOTNET_MARSHAL_CHARSET", "Unicode"),
            ("DOTNET_MARSHAL_PLATFORM_EXTENSIONS", "on"),
            ("DOTNET_MARSHAL_THROW_ON_UNMAPPABLE", "1"),
        ]));
        assert_eq!(config.default_packing, 8);
        assert_eq!(config.max_type_size, 0x100);
        assert_eq!(config.default_char_set, CharSet::Unicode);
        assert!(config.platform_extensions);
        assert!(config.throw_on_unmappable_char);
    }

    #[test]
    fn malformed_values_ignored() {
        let config = MarshalConfig::from_vars(vars(&[
            ("DOTNET_MARSHAL_PACKING", "eight"),
            ("DOTNET_MARSHAL_PLATFORM_EXTENSIONS", "maybe"),
        ]));
        assert_eq!(config.default_packing, DEFAULT_PACKING_SIZE);
        assert_eq!(config.platform_extensions, cfg!(windows));
    }

    #[test]
    fn auto_char_set_resolution() {
        let config = MarshalConfig::default().with_default_char_set(CharSet::Ansi);
        assert_eq!(config.resolve_char_set(CharSet::Auto), CharSet::Ansi);
        assert_eq!(config.resolve_char_set(CharSet::Unicode), CharSet::Unicode);
        assert!(config.classifier_flags(CharSet::Auto).ansi);
    }
}
