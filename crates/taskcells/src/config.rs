//! User settings persistence.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/taskcells/settings.json
//! - Linux: ~/.config/taskcells/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\taskcells\settings.json

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Deserializer, Serialize};

use crate::cell::{Markers, AUTO_EXEC_MARKER, AUTO_HIDE_MARKER};

fn default_auto_exec_marker() -> String {
    AUTO_EXEC_MARKER.to_string()
}

fn default_auto_hide_marker() -> String {
    AUTO_HIDE_MARKER.to_string()
}

fn default_kernel_ready_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Source marker for widget cells re-executed on load
    #[serde(default = "default_auto_exec_marker")]
    pub auto_exec_marker: String,

    /// Source marker for cells hidden on load
    #[serde(default = "default_auto_hide_marker")]
    pub auto_hide_marker: String,

    /// How long to wait for the kernel to become connected and idle
    #[serde(default = "default_kernel_ready_timeout_secs")]
    pub kernel_ready_timeout_secs: u64,

    /// Modules imported kernel-side when the task manager is created,
    /// e.g. `"numpy as np, pandas"`
    #[serde(default, deserialize_with = "deserialize_module_list")]
    pub extra_imports: Vec<String>,

    /// Directory of task library files for offline compilation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library_dir: Option<PathBuf>,
}

/// Deserialize a module list that accepts both:
/// - `"numpy as np, pandas"` (comma-separated string)
/// - `["numpy as np", "pandas"]` (JSON array)
fn deserialize_module_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    struct ModuleListVisitor;

    impl<'de> de::Visitor<'de> for ModuleListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Vec<String>, E> {
            Ok(v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect())
        }

        fn visit_seq<A: de::SeqAccess<'de>>(
            self,
            mut seq: A,
        ) -> std::result::Result<Vec<String>, A::Error> {
            let mut items = Vec::new();
            while let Some(item) = seq.next_element::<String>()? {
                let trimmed = item.trim().to_string();
                if !trimmed.is_empty() {
                    items.push(trimmed);
                }
            }
            Ok(items)
        }
    }

    deserializer.deserialize_any(ModuleListVisitor)
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_exec_marker: default_auto_exec_marker(),
            auto_hide_marker: default_auto_hide_marker(),
            kernel_ready_timeout_secs: default_kernel_ready_timeout_secs(),
            extra_imports: vec![],
            library_dir: None,
        }
    }
}

impl Settings {
    pub fn markers(&self) -> Markers {
        Markers {
            auto_exec: self.auto_exec_marker.clone(),
            auto_hide: self.auto_hide_marker.clone(),
        }
    }

    pub fn kernel_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.kernel_ready_timeout_secs)
    }

    /// `import` statements for [`Settings::extra_imports`].
    pub fn import_statements(&self) -> Vec<String> {
        self.extra_imports
            .iter()
            .map(|module| format!("import {}", module))
            .collect()
    }
}

/// Get the path to the settings file
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("taskcells")
        .join("settings.json")
}

/// Load settings from `path`, returning defaults if it is missing or unreadable
pub fn load_settings_from(path: &Path) -> Settings {
    if path.exists() {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    } else {
        Settings::default()
    }
}

pub fn load_settings() -> Settings {
    load_settings_from(&settings_path())
}

pub fn save_settings_to(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}

/// Save settings to disk
pub fn save_settings(settings: &Settings) -> Result<()> {
    save_settings_to(&settings_path(), settings)
}
