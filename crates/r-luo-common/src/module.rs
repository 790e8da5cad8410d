//! ---
//! luo_section: "01-core-functionality"
//! luo_subsection: "module"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Shared primitives and utilities for the live update runtime."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};

/// Class of a hot-swappable unit. Each class is scanned on its own interval.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    Code,
    #[default]
    Config,
    Rule,
    Cache,
}

impl ModuleKind {
    pub const ALL: [ModuleKind; 4] = [
        ModuleKind::Code,
        ModuleKind::Config,
        ModuleKind::Rule,
        ModuleKind::Cache,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleKind::Code => "code",
            ModuleKind::Config => "config",
            ModuleKind::Rule => "rule",
            ModuleKind::Cache => "cache",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ModuleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "code" => Ok(ModuleKind::Code),
            "config" => Ok(ModuleKind::Config),
            "rule" | "rules" => Ok(ModuleKind::Rule),
            "cache" => Ok(ModuleKind::Cache),
            other => Err(format!("unknown module kind: {}", other)),
        }
    }
}

/// On-disk encoding of a file-backed data module.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModuleFormat {
    #[default]
    Json,
    Toml,
    Text,
}
