//! Configuration section: tenant settings grouped by category.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{check_cancelled, RestoreMode};
use crate::archive::{layout, ArchiveReader, ArchiveWriter};
use crate::executor::manifest::ConfigurationManifest;
use crate::sources::{SettingEntry, TenantSettings};
use crate::utils::SectionError;

/// Content of `config/settings.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SettingsExport {
    pub exported_at: DateTime<Utc>,
    pub tenant_id: Uuid,
    /// category -> key -> value
    pub settings: BTreeMap<String, BTreeMap<String, Value>>,
}

impl SettingsExport {
    fn settings_count(&self) -> usize {
        self.settings.values().map(BTreeMap::len).sum()
    }

    fn into_entries(self) -> Vec<SettingEntry> {
        self.settings
            .into_iter()
            .flat_map(|(category, values)| {
                values.into_iter().map(move |(key, value)| SettingEntry {
                    category: category.clone(),
                    key,
                    value,
                })
            })
            .collect()
    }
}

pub async fn build(
    settings: &dyn TenantSettings,
    tenant_id: Uuid,
    archive: &mut ArchiveWriter,
    cancel: &CancellationToken,
) -> Result<ConfigurationManifest, SectionError> {
    let entries = settings.export_settings(tenant_id).await?;
    check_cancelled(cancel)?;

    let mut grouped: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
    for entry in entries {
        // Later duplicates win, matching an upsert on import
        grouped.entry(entry.category).or_default().insert(entry.key, entry.value);
    }

    let export = SettingsExport {
        exported_at: Utc::now(),
        tenant_id,
        settings: grouped,
    };
    let manifest = ConfigurationManifest {
        settings_count: export.settings_count(),
        categories: export.settings.keys().cloned().collect(),
    };
    archive
        .blocking(move |a| a.write_json_entry(layout::CONFIG_SETTINGS, &export))
        .await??;

    Ok(manifest)
}

/// Check the exported settings against `manifest` and, in applied mode,
/// import them. Returns the number of settings.
pub async fn restore(
    reader: &mut ArchiveReader,
    manifest: &ConfigurationManifest,
    mode: RestoreMode,
    settings: &dyn TenantSettings,
    tenant_id: Uuid,
    cancel: &CancellationToken,
) -> Result<u64, SectionError> {
    check_cancelled(cancel)?;
    let export = reader
        .blocking(|r| r.read_json::<SettingsExport>(layout::CONFIG_SETTINGS))
        .await??;

    if export.tenant_id != tenant_id {
        return Err(SectionError::Mismatch(format!(
            "settings were exported for tenant {}",
            export.tenant_id
        )));
    }
    let count = export.settings_count();
    if count != manifest.settings_count {
        return Err(SectionError::Mismatch(format!(
            "settings file holds {} settings, manifest has {}",
            count, manifest.settings_count
        )));
    }
    let categories: Vec<&String> = export.settings.keys().collect();
    if categories.len() != manifest.categories.len() || categories.iter().zip(&manifest.categories).any(|(a, b)| *a != b) {
        return Err(SectionError::Mismatch(
            "settings categories differ from the manifest".to_string(),
        ));
    }

    if mode == RestoreMode::DryRun {
        return Ok(count as u64);
    }

    let imported = settings.import_settings(tenant_id, export.into_entries()).await?;
    if imported != count {
        return Err(SectionError::Mismatch(format!("imported {} of {} settings", imported, count)));
    }
    Ok(imported as u64)
}
