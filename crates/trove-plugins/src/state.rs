use crate::types::{PluginSpecs, PluginType};
use std::collections::BTreeSet;

/// The two plugin lists the catalog owns. Status is always derived from them.
#[derive(Debug, Clone, Default)]
pub struct PluginLists {
    pub available: Vec<PluginSpecs>,
    pub installed: Vec<PluginSpecs>,
}

impl PluginLists {
    pub fn available(&self, id: &str) -> Option<&PluginSpecs> {
        self.available.iter().find(|p| p.id == id)
    }

    pub fn installed(&self, id: &str) -> Option<&PluginSpecs> {
        self.installed.iter().find(|p| p.id == id)
    }

    pub fn plugin_type(&self, id: &str) -> PluginType {
        plugin_type(&self.available, &self.installed, id)
    }

    /// Every installed plugin plus every available one not installed, by label.
    pub fn combined(&self) -> Vec<PluginSpecs> {
        let mut out = self.installed.clone();
        out.extend(
            self.available
                .iter()
                .filter(|p| self.installed(&p.id).is_none())
                .cloned(),
        );
        out.sort_by(|a, b| a.label.cmp(&b.label).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Distinct non-empty group names, sorted.
    pub fn groups<'a>(plugins: impl IntoIterator<Item = &'a PluginSpecs>) -> Vec<String> {
        plugins
            .into_iter()
            .filter(|p| !p.group.is_empty())
            .map(|p| p.group.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Install state of `id` given both lists.
///
/// An installed plugin whose version is newer than the available one counts as
/// installed; only a strictly newer available version is an update.
pub fn plugin_type(available: &[PluginSpecs], installed: &[PluginSpecs], id: &str) -> PluginType {
    let avail = available.iter().find(|p| p.id == id);
    let inst = installed.iter().find(|p| p.id == id);
    match (avail, inst) {
        (None, None) => PluginType::None,
        (Some(_), None) => PluginType::Available,
        (None, Some(_)) => PluginType::Installed,
        (Some(a), Some(i)) if a.version > i.version => PluginType::Update,
        (Some(_), Some(_)) => PluginType::Installed,
    }
}
