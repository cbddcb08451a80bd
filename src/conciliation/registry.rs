//! Version-scoped catalog of desired-state generators and decorators.
//!
//! Each registry serves one context type. Generators are registered against a
//! named slot and a `VersionRange`; building the registry for the running
//! version picks exactly one generator per slot or fails. Decorators are not
//! slotted: every decorator active for the version runs on every generated
//! object, in registration order.

use std::collections::BTreeSet;
use std::sync::Arc;

use kube::api::DynamicObject;
use tracing::debug;

use crate::error::{Error, Result};
use crate::store::ObjectKey;
use crate::version::{OperatorVersion, VersionRange};

/// Produces the desired objects of one slot from an assembled context.
/// Implementations must not perform I/O.
pub trait ResourceGenerator<C>: Send + Sync {
    fn generate(&self, context: &C) -> Result<Vec<DynamicObject>>;
}

/// Enriches objects produced by generators. Decorators never change an
/// object's identity and skip objects they do not apply to.
pub trait ResourceDecorator<C>: Send + Sync {
    fn decorate(&self, context: &C, object: &mut DynamicObject) -> Result<()>;
}

struct GeneratorEntry<C> {
    slot: &'static str,
    range: VersionRange,
    generator: Arc<dyn ResourceGenerator<C>>,
}

struct DecoratorEntry<C> {
    name: &'static str,
    range: VersionRange,
    decorator: Arc<dyn ResourceDecorator<C>>,
}

/// Collects registrations before the running version is known.
pub struct RegistryBuilder<C> {
    generators: Vec<GeneratorEntry<C>>,
    decorators: Vec<DecoratorEntry<C>>,
}

impl<C> Default for RegistryBuilder<C> {
    fn default() -> Self {
        Self {
            generators: Vec::new(),
            decorators: Vec::new(),
        }
    }
}

impl<C> RegistryBuilder<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generator(
        mut self,
        slot: &'static str,
        range: VersionRange,
        generator: impl ResourceGenerator<C> + 'static,
    ) -> Self {
        self.generators.push(GeneratorEntry {
            slot,
            range,
            generator: Arc::new(generator),
        });
        self
    }

    pub fn decorator(
        mut self,
        name: &'static str,
        range: VersionRange,
        decorator: impl ResourceDecorator<C> + 'static,
    ) -> Self {
        self.decorators.push(DecoratorEntry {
            name,
            range,
            decorator: Arc::new(decorator),
        });
        self
    }

    /// Resolve the active generator of every slot for `version`.
    ///
    /// Fails with `ConfigurationAmbiguity` when any slot has no generator or
    /// more than one generator covering `version`.
    pub fn build(self, version: OperatorVersion) -> Result<ResourceRegistry<C>> {
        let mut slots: Vec<&'static str> = Vec::new();
        for entry in &self.generators {
            if !slots.contains(&entry.slot) {
                slots.push(entry.slot);
            }
        }

        let mut active = Vec::with_capacity(slots.len());
        for slot in slots {
            let matching: Vec<&GeneratorEntry<C>> = self
                .generators
                .iter()
                .filter(|e| e.slot == slot && e.range.contains(version))
                .collect();
            match matching.as_slice() {
                [entry] => {
                    debug!(slot, range = %entry.range, %version, "generator selected");
                    active.push((slot, entry.generator.clone()));
                }
                [] => {
                    return Err(Error::ambiguity(format!(
                        "no generator for slot {slot:?} covers operator version {version}"
                    )))
                }
                many => {
                    let ranges: Vec<String> = many.iter().map(|e| e.range.to_string()).collect();
                    return Err(Error::ambiguity(format!(
                        "{} generators for slot {slot:?} cover operator version {version}: {}",
                        many.len(),
                        ranges.join(", ")
                    )));
                }
            }
        }

        let decorators = self
            .decorators
            .into_iter()
            .filter(|d| d.range.contains(version))
            .map(|d| (d.name, d.decorator))
            .collect();

        Ok(ResourceRegistry {
            version,
            generators: active,
            decorators,
        })
    }
}

/// Generators and decorators active for one operator version.
pub struct ResourceRegistry<C> {
    version: OperatorVersion,
    generators: Vec<(&'static str, Arc<dyn ResourceGenerator<C>>)>,
    decorators: Vec<(&'static str, Arc<dyn ResourceDecorator<C>>)>,
}

impl<C> ResourceRegistry<C> {
    pub fn version(&self) -> OperatorVersion {
        self.version
    }

    /// Slots in registration order.
    pub fn slots(&self) -> Vec<&'static str> {
        self.generators.iter().map(|(slot, _)| *slot).collect()
    }

    /// Names of the active decorators in the order they run.
    pub fn decorators(&self) -> Vec<&'static str> {
        self.decorators.iter().map(|(name, _)| *name).collect()
    }

    /// Run every active generator then every decorator over `context`.
    /// The output is in slot order and unique by identity.
    pub fn generate(&self, context: &C) -> Result<Vec<DynamicObject>> {
        let mut objects = Vec::new();
        for (_, generator) in &self.generators {
            objects.extend(generator.generate(context)?);
        }

        let mut seen = BTreeSet::new();
        for object in &mut objects {
            let key = ObjectKey::of(object);
            for (_, decorator) in &self.decorators {
                decorator.decorate(context, object)?;
            }
            if ObjectKey::of(object) != key {
                return Err(Error::reconcile(format!(
                    "decorator changed the identity of {key}"
                )));
            }
            if !seen.insert(key.clone()) {
                return Err(Error::reconcile(format!("{key} generated more than once")));
            }
        }
        Ok(objects)
    }
}
