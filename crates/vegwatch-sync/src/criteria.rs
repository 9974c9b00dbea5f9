use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::warn;
use vegwatch_core::{Criterion, CriterionConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriteriaFormat {
    Json,
    Yaml,
}

impl CriteriaFormat {
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
            Some("yaml" | "yml") => CriteriaFormat::Yaml,
            _ => CriteriaFormat::Json,
        }
    }
}

/// Parses an ordered criteria list and validates each record.
pub fn parse_criteria(raw: &str, format: CriteriaFormat) -> Result<Vec<Criterion>> {
    let configs: Vec<CriterionConfig> = match format {
        CriteriaFormat::Json => serde_json::from_str(raw).context("parsing criteria JSON")?,
        CriteriaFormat::Yaml => serde_yaml::from_str(raw).context("parsing criteria YAML")?,
    };
    configs
        .into_iter()
        .map(|config| Criterion::try_from(config).map_err(anyhow::Error::from))
        .collect()
}

/// Loads criteria from disk. A missing file yields no criteria.
pub fn load_criteria(path: &Path) -> Result<Vec<Criterion>> {
    if !path.exists() {
        warn!(path = %path.display(), "criteria file not found; alerts disabled");
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_criteria(&raw, CriteriaFormat::for_path(path)).with_context(|| format!("loading {}", path.display()))
}

/// Narrows to the criterion named `pinned`, or keeps them all.
pub fn select_criteria(criteria: Vec<Criterion>, pinned: Option<&str>) -> Result<Vec<Criterion>> {
    let Some(name) = pinned else {
        return Ok(criteria);
    };
    let selected = criteria.into_iter().filter(|c| c.name == name).collect::<Vec<_>>();
    if selected.is_empty() {
        bail!("alert criterion `{name}` is not configured");
    }
    Ok(selected)
}
