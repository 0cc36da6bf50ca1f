//! Plugin protocol and registry
//!
//! Provider backends register a factory with the [`PluginRegistry`]; the
//! manager instantiates every registered plugin and drives the set through
//! one deployment pass. Registration is an explicit object constructed at
//! startup - there is no ambient global registry.

use crate::deploy::types::Action;
use crate::error::{Error, Result};
use crate::tree::Element;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Opaque provider observation, round-tripped through a canonical JSON
/// string between `observe` and `analyze`.
pub type Observation = serde_json::Value;

/// Options handed to each plugin's `start`
#[derive(Debug, Clone)]
pub struct PluginStartOptions {
    /// Private data directory for this plugin, created before `start`
    pub data_dir: PathBuf,
    /// Identity of the deployment being operated on
    pub deploy_id: String,
}

/// Contract every provider plugin satisfies
///
/// The manager calls these in strict order: `start`, `observe`, `analyze`
/// (possibly repeatedly on dry runs), `finish`. Plugin methods are user
/// code; any error aborts the phase.
pub trait Plugin: Send {
    /// Prepare for a deployment pass
    fn start(&mut self, options: &PluginStartOptions) -> anyhow::Result<()>;

    /// Inspect the provider and return observations for `analyze`
    fn observe(
        &mut self,
        prev_tree: Option<&Arc<Element>>,
        new_tree: Option<&Arc<Element>>,
    ) -> anyhow::Result<Observation>;

    /// Propose the actions that converge the provider onto the new tree
    fn analyze(
        &mut self,
        prev_tree: Option<&Arc<Element>>,
        new_tree: Option<&Arc<Element>>,
        observation: Observation,
    ) -> anyhow::Result<Vec<Action>>;

    /// Release any resources held for the pass
    fn finish(&mut self) -> anyhow::Result<()>;
}

/// Factory producing a fresh plugin instance per manager
pub type PluginFactory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// Registration info for one plugin module
#[derive(Clone)]
pub struct PluginRegistration {
    /// Plugin name, unique within its package
    pub name: String,
    /// Package the plugin ships in
    pub package: String,
    /// Package version
    pub version: String,
    /// Instance factory
    pub create: PluginFactory,
}

impl PluginRegistration {
    /// Registry key: `"<name> [<package>@<version>]"`
    pub fn key(&self) -> PluginKey {
        format!("{} [{}@{}]", self.name, self.package, self.version)
    }

    /// Private data directory under the given root
    pub fn data_dir(&self, root: &Path) -> PathBuf {
        root.join(format!("{}@{}", self.package, self.version))
            .join(&self.name)
    }
}

impl std::fmt::Debug for PluginRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistration")
            .field("name", &self.name)
            .field("package", &self.package)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Key identifying one registered plugin
pub type PluginKey = String;

/// Explicit plugin registry, constructed once at startup and passed by
/// reference into the manager.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    modules: BTreeMap<PluginKey, PluginRegistration>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin module
    ///
    /// Registering the identical module twice is ignored; a different
    /// module under an existing key is rejected.
    pub fn register(&mut self, registration: PluginRegistration) -> Result<()> {
        let key = registration.key();
        if let Some(existing) = self.modules.get(&key) {
            if Arc::ptr_eq(&existing.create, &registration.create) {
                return Ok(());
            }
            return Err(Error::DuplicatePlugin(key));
        }
        self.modules.insert(key, registration);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Registered modules in key order
    pub fn modules(&self) -> impl Iterator<Item = &PluginRegistration> {
        self.modules.values()
    }

    /// Instantiate every registered plugin
    pub(crate) fn instantiate(&self) -> Result<Vec<(PluginRegistration, Box<dyn Plugin>)>> {
        if self.modules.is_empty() {
            return Err(Error::NoPlugins);
        }
        Ok(self
            .modules
            .values()
            .map(|reg| (reg.clone(), (reg.create)()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct NullPlugin;

    impl Plugin for NullPlugin {
        fn start(&mut self, _options: &PluginStartOptions) -> anyhow::Result<()> {
            Ok(())
        }

        fn observe(
            &mut self,
            _prev_tree: Option<&Arc<Element>>,
            _new_tree: Option<&Arc<Element>>,
        ) -> anyhow::Result<Observation> {
            Ok(Observation::Null)
        }

        fn analyze(
            &mut self,
            _prev_tree: Option<&Arc<Element>>,
            _new_tree: Option<&Arc<Element>>,
            _observation: Observation,
        ) -> anyhow::Result<Vec<Action>> {
            Ok(Vec::new())
        }

        fn finish(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn null_factory() -> PluginFactory {
        Arc::new(|| Box::new(NullPlugin) as Box<dyn Plugin>)
    }

    fn registration(create: PluginFactory) -> PluginRegistration {
        PluginRegistration {
            name: "containers".into(),
            package: "provider-local".into(),
            version: "0.3.1".into(),
            create,
        }
    }

    #[test]
    fn test_key_and_data_dir_layout() {
        let reg = registration(null_factory());
        assert_eq!(reg.key(), "containers [provider-local@0.3.1]");
        assert_eq!(
            reg.data_dir(Path::new("/data")),
            Path::new("/data/provider-local@0.3.1/containers")
        );
    }

    #[test]
    fn test_identical_reregistration_is_ignored() {
        let mut registry = PluginRegistry::new();
        let factory = null_factory();
        registry.register(registration(Arc::clone(&factory))).unwrap();
        registry.register(registration(factory)).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_conflicting_registration_is_rejected() {
        let mut registry = PluginRegistry::new();
        registry.register(registration(null_factory())).unwrap();
        let err = registry
            .register(registration(null_factory()))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicatePlugin(_)));
    }

    #[test]
    fn test_empty_registry_cannot_instantiate() {
        let registry = PluginRegistry::new();
        assert!(matches!(registry.instantiate(), Err(Error::NoPlugins)));
    }
}
