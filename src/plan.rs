use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use globset::{Glob, GlobSetBuilder};
use serde::Deserialize;

use crate::changeset::{ColumnFilter, FilterKind, RowRule};
use crate::store::PkValue;

/// A non-interactive operation plan: everything one search-and-replace run
/// needs, loaded from YAML or JSON by file extension.
#[derive(Debug, Deserialize)]
pub struct OperationPlan {
    pub search: String,
    pub replacement: String,
    /// Table name patterns (globs). Empty selects every table the source
    /// offers.
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub filter: Option<FilterPlan>,
    #[serde(default)]
    pub rows: BTreeMap<String, RowRulePlan>,
}

#[derive(Debug, Deserialize)]
pub struct FilterPlan {
    pub column: String,
    #[serde(default = "default_filter_kind")]
    pub kind: FilterKind,
    pub text: String,
}

fn default_filter_kind() -> FilterKind {
    FilterKind::Contains
}

/// Row selection for one table as written in a plan. At most one of the
/// three may be used; combinations are rejected rather than ranked.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RowRulePlan {
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub exclude: Option<Vec<PkValue>>,
    #[serde(default)]
    pub include_only: Option<Vec<PkValue>>,
}

pub fn load_plan(path: &Path) -> Result<OperationPlan> {
    let data = fs::read(path).with_context(|| format!("reading plan {}", path.display()))?;
    let plan: OperationPlan = if path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
    {
        serde_json::from_slice(&data)
            .with_context(|| format!("parsing plan {}", path.display()))?
    } else {
        serde_yaml::from_slice(&data)
            .with_context(|| format!("parsing plan {}", path.display()))?
    };
    plan.validate()?;
    Ok(plan)
}

impl OperationPlan {
    pub fn validate(&self) -> Result<()> {
        if self.search.trim().is_empty() {
            bail!("plan is missing a search term");
        }
        for (table, spec) in &self.rows {
            if spec.exclude.is_some() && spec.include_only.is_some() {
                bail!(
                    "row rules for '{table}' set both 'exclude' and 'include_only'; pick one"
                );
            }
            if spec.skip && (spec.exclude.is_some() || spec.include_only.is_some()) {
                bail!("row rules for '{table}' combine 'skip' with a selection list");
            }
        }
        Ok(())
    }

    pub fn column_filter(&self) -> Option<ColumnFilter> {
        self.filter.as_ref().map(|spec| ColumnFilter {
            column: spec.column.clone(),
            kind: spec.kind,
            text: spec.text.clone(),
        })
    }

    pub fn row_rules(&self) -> BTreeMap<String, RowRule> {
        self.rows
            .iter()
            .map(|(table, spec)| {
                let rule = if spec.skip {
                    RowRule::SkipTable
                } else if let Some(ids) = &spec.exclude {
                    RowRule::Exclude(ids.clone())
                } else if let Some(ids) = &spec.include_only {
                    RowRule::IncludeOnly(ids.clone())
                } else {
                    RowRule::IncludeAll
                };
                (table.clone(), rule)
            })
            .collect()
    }

    /// Match the plan's table patterns against what the source offers.
    pub fn resolve_tables(&self, available: &[String]) -> Result<Vec<String>> {
        if self.tables.is_empty() {
            return Ok(available.to_vec());
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.tables {
            let glob = Glob::new(pattern)
                .map_err(|err| anyhow!("invalid table pattern '{pattern}': {err}"))?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|err| anyhow!("unable to build table patterns: {err}"))?;
        let selected: Vec<String> = available
            .iter()
            .filter(|table| set.is_match(table.as_str()))
            .cloned()
            .collect();
        if selected.is_empty() {
            bail!("no tables matched the plan's table patterns");
        }
        Ok(selected)
    }
}
