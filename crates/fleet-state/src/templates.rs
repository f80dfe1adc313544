//! Versioned launch templates.
//!
//! Templates are immutable once published. The catalog tracks which
//! version the scaling controller launches from: the explicitly selected
//! one, or the latest published version when none was selected.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::error::TemplateError;
use crate::store::FleetStore;
use crate::tables::META_ACTIVE_TEMPLATE;
use crate::types::{LaunchTemplate, epoch_secs};

struct CatalogState {
    templates: BTreeMap<u32, LaunchTemplate>,
    active: Option<u32>,
}

#[derive(Clone)]
pub struct TemplateCatalog {
    store: FleetStore,
    state: Arc<RwLock<CatalogState>>,
}

impl TemplateCatalog {
    /// Load the catalog persisted in `store`.
    pub fn open(store: FleetStore) -> Result<Self, TemplateError> {
        let templates = store
            .list_templates()?
            .into_iter()
            .map(|t| (t.version, t))
            .collect();
        let active = store
            .get_meta(META_ACTIVE_TEMPLATE)?
            .and_then(|v| u32::try_from(v).ok());
        Ok(Self {
            store,
            state: Arc::new(RwLock::new(CatalogState { templates, active })),
        })
    }

    /// Validate and publish a new template version.
    pub fn publish(&self, mut template: LaunchTemplate) -> Result<LaunchTemplate, TemplateError> {
        if template.version == 0 {
            return Err(TemplateError::Invalid("version must be greater than 0".into()));
        }
        if template.app_port == 0 {
            return Err(TemplateError::Invalid("app_port must be greater than 0".into()));
        }
        if template.artifact.trim().is_empty() {
            return Err(TemplateError::Invalid("artifact must not be empty".into()));
        }

        let mut state = self.state.write().expect("template catalog lock");
        if state.templates.contains_key(&template.version) {
            return Err(TemplateError::AlreadyPublished(template.version));
        }
        if template.created_at == 0 {
            template.created_at = epoch_secs();
        }
        self.store.put_template(&template)?;
        info!(
            version = template.version,
            app_port = template.app_port,
            artifact = %template.artifact,
            "launch template published"
        );
        state.templates.insert(template.version, template.clone());
        Ok(template)
    }

    pub fn get(&self, version: u32) -> Option<LaunchTemplate> {
        let state = self.state.read().expect("template catalog lock");
        state.templates.get(&version).cloned()
    }

    /// All published templates, ordered by version.
    pub fn list(&self) -> Vec<LaunchTemplate> {
        let state = self.state.read().expect("template catalog lock");
        state.templates.values().cloned().collect()
    }

    /// The template new instances launch from.
    pub fn active(&self) -> Result<LaunchTemplate, TemplateError> {
        let state = self.state.read().expect("template catalog lock");
        match state.active {
            Some(version) => state
                .templates
                .get(&version)
                .cloned()
                .ok_or(TemplateError::NotFound(version)),
            None => state
                .templates
                .values()
                .next_back()
                .cloned()
                .ok_or(TemplateError::Empty),
        }
    }

    /// Select the version new launches use. Running instances are unaffected.
    pub fn set_active(&self, version: u32) -> Result<(), TemplateError> {
        let mut state = self.state.write().expect("template catalog lock");
        if !state.templates.contains_key(&version) {
            return Err(TemplateError::NotFound(version));
        }
        self.store.put_meta(META_ACTIVE_TEMPLATE, u64::from(version))?;
        state.active = Some(version);
        info!(version, "active launch template selected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(version: u32) -> LaunchTemplate {
        LaunchTemplate {
            version,
            app_port: 3000,
            artifact: format!("web:{version}"),
            created_at: 0,
        }
    }

    fn catalog() -> TemplateCatalog {
        TemplateCatalog::open(FleetStore::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn empty_catalog_has_no_active_template() {
        assert!(matches!(catalog().active(), Err(TemplateError::Empty)));
    }

    #[test]
    fn latest_version_is_active_by_default() {
        let cat = catalog();
        cat.publish(template(1)).unwrap();
        cat.publish(template(2)).unwrap();
        assert_eq!(cat.active().unwrap().version, 2);
    }

    #[test]
    fn explicit_selection_wins() {
        let cat = catalog();
        cat.publish(template(1)).unwrap();
        cat.publish(template(2)).unwrap();
        cat.set_active(1).unwrap();
        assert_eq!(cat.active().unwrap().version, 1);

        assert!(matches!(cat.set_active(9), Err(TemplateError::NotFound(9))));
    }

    #[test]
    fn publish_stamps_creation_time() {
        let cat = catalog();
        let published = cat.publish(template(1)).unwrap();
        assert!(published.created_at > 0);
    }

    #[test]
    fn versions_are_never_republished() {
        let cat = catalog();
        cat.publish(template(1)).unwrap();
        let mut again = template(1);
        again.artifact = "web:other".into();
        assert!(matches!(
            cat.publish(again),
            Err(TemplateError::AlreadyPublished(1))
        ));
        assert_eq!(cat.get(1).unwrap().artifact, "web:1");
    }

    #[test]
    fn publish_validates_fields() {
        let cat = catalog();
        assert!(matches!(cat.publish(template(0)), Err(TemplateError::Invalid(_))));

        let mut no_port = template(1);
        no_port.app_port = 0;
        assert!(matches!(cat.publish(no_port), Err(TemplateError::Invalid(_))));

        let mut no_artifact = template(1);
        no_artifact.artifact = "  ".into();
        assert!(matches!(cat.publish(no_artifact), Err(TemplateError::Invalid(_))));
        assert!(cat.list().is_empty());
    }

    #[test]
    fn selection_survives_reopen() {
        let store = FleetStore::open_in_memory().unwrap();
        {
            let cat = TemplateCatalog::open(store.clone()).unwrap();
            cat.publish(template(1)).unwrap();
            cat.publish(template(2)).unwrap();
            cat.set_active(1).unwrap();
        }
        let cat = TemplateCatalog::open(store).unwrap();
        assert_eq!(cat.list().len(), 2);
        assert_eq!(cat.active().unwrap().version, 1);
    }
}
