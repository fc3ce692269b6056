use std::{
    collections::BTreeMap,
    fs,
    path::Path,
};

use anyhow::Context;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::messages::LogicalKeyCode;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModifierMask {
    #[serde(default)]
    pub ctrl: bool,
    #[serde(default)]
    pub alt: bool,
    #[serde(default)]
    pub shift: bool,
    #[serde(default, rename = "super")]
    pub super_key: bool,
}

impl ModifierMask {
    /// Prefix in the `mod+mod+key` form understood by xdotool.
    pub fn prefix(&self) -> String {
        let mut prefix = String::new();
        for (held, name) in [
            (self.ctrl, "ctrl+"),
            (self.alt, "alt+"),
            (self.shift, "shift+"),
            (self.super_key, "super+"),
        ] {
            if held {
                prefix.push_str(name);
            }
        }
        prefix
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Binding {
    #[serde(default)]
    pub modifiers: ModifierMask,
    /// `None` until someone assigns a key.
    #[serde(default)]
    pub symbol: Option<String>,
    /// Send a single `key` tap on press instead of holding until release.
    #[serde(default)]
    pub tap: bool,
}

impl Binding {
    pub fn new(modifiers: ModifierMask, symbol: &str) -> Self {
        Binding {
            modifiers,
            symbol: Some(symbol.to_owned()),
            tap: false,
        }
    }

    pub fn tapped(self) -> Self {
        Binding { tap: true, ..self }
    }

    pub fn is_defined(&self) -> bool {
        self.symbol.is_some()
    }

    pub fn composite(&self) -> Option<String> {
        self.symbol
            .as_ref()
            .map(|symbol| format!("{}{}", self.modifiers.prefix(), symbol))
    }
}

/// Flat form of one table entry, as stored on disk.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BindingRecord {
    pub code: LogicalKeyCode,
    #[serde(flatten)]
    pub binding: Binding,
}

#[derive(Debug, Clone, Default)]
pub struct BindingTable {
    entries: BTreeMap<LogicalKeyCode, Binding>,
}

impl BindingTable {
    pub fn new() -> Self {
        BindingTable::default()
    }

    pub fn from_records(records: Vec<BindingRecord>) -> Self {
        BindingTable {
            entries: records.into_iter().map(|r| (r.code, r.binding)).collect(),
        }
    }

    pub fn records(&self) -> Vec<BindingRecord> {
        self.entries
            .iter()
            .map(|(code, binding)| BindingRecord {
                code: *code,
                binding: binding.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LogicalKeyCode, &Binding)> {
        self.entries.iter()
    }

    pub fn get(&self, code: &LogicalKeyCode) -> Option<&Binding> {
        self.entries.get(code)
    }

    /// Composite `modifiers+symbol` for a code, or `None` when unbound.
    pub fn resolve(&self, code: &LogicalKeyCode) -> Option<String> {
        self.entries.get(code).and_then(Binding::composite)
    }

    /// Adds an undefined placeholder for a code not seen before.
    /// Returns `false` if the code was already present.
    pub fn register(&mut self, code: LogicalKeyCode) -> bool {
        if self.entries.contains_key(&code) {
            return false;
        }
        self.entries.insert(code, Binding::default());
        true
    }

    pub fn assign(&mut self, code: LogicalKeyCode, binding: Binding) {
        self.entries.insert(code, binding);
    }

    pub fn clear(&mut self, code: &LogicalKeyCode) {
        if let Some(binding) = self.entries.get_mut(code) {
            binding.modifiers = ModifierMask::default();
            binding.symbol = None;
        }
    }

    pub fn is_tap(&self, code: &LogicalKeyCode) -> bool {
        self.entries.get(code).is_some_and(|b| b.tap)
    }

    /// Switches a code between hold and tap; registers it if needed.
    pub fn set_tap(&mut self, code: LogicalKeyCode, tap: bool) {
        self.entries.entry(code).or_default().tap = tap;
    }
}

/// Loads the binding file; a missing file yields an empty table.
pub fn load_bindings(path: &Path) -> anyhow::Result<BindingTable> {
    if !path.exists() {
        warn!("No binding file at {}; starting empty", path.display());
        return Ok(BindingTable::new());
    }
    let json_str = fs::read_to_string(path)
        .with_context(|| format!("failed to read bindings from {}", path.display()))?;
    let records = serde_json::from_str::<Vec<BindingRecord>>(&json_str)
        .with_context(|| format!("failed to parse bindings in {}", path.display()))?;
    info!("...Loaded {} bindings OK", records.len());
    Ok(BindingTable::from_records(records))
}

/// Like [`load_bindings`], but an unreadable file is moved aside to
/// `<path>.broken` and an empty table is returned instead. The flag tells
/// whether that happened, so the caller can start learning.
pub fn load_bindings_or_empty(path: &Path) -> (BindingTable, bool) {
    match load_bindings(path) {
        Ok(table) => (table, false),
        Err(e) => {
            warn!("{:#}; starting with an empty table", e);
            let mut backup = path.as_os_str().to_owned();
            backup.push(".broken");
            if let Err(e) = fs::rename(path, &backup) {
                warn!("could not move {} aside: {}", path.display(), e);
            }
            (BindingTable::new(), true)
        }
    }
}

pub fn save_bindings(path: &Path, table: &BindingTable) -> anyhow::Result<()> {
    let json_str = serde_json::to_string_pretty(&table.records())?;
    fs::write(path, json_str)
        .with_context(|| format!("failed to write bindings to {}", path.display()))?;
    info!("Saved {} bindings to {}", table.len(), path.display());
    Ok(())
}
