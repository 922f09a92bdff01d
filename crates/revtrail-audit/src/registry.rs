//! Audited entity registry.
//!
//! Tracks which entity types are audited, how subtypes map onto their
//! registered base type, and which attributes each type records.

use revtrail_core::{ActionKind, AuditConfig, EntityConfig, RevtrailConfig};
use std::collections::{BTreeSet, HashMap};

use crate::codec::Changes;
use crate::error::AuditError;

/// Audit options for one registered entity type.
#[derive(Debug, Clone)]
pub struct EntityOptions {
    only: BTreeSet<String>,
    except: BTreeSet<String>,
    on: Vec<ActionKind>,
    redacted: BTreeSet<String>,
    comment_required: bool,
}

impl Default for EntityOptions {
    fn default() -> Self {
        Self {
            only: BTreeSet::new(),
            except: BTreeSet::new(),
            on: ActionKind::ALL.to_vec(),
            redacted: BTreeSet::new(),
            comment_required: false,
        }
    }
}

fn to_set<I, S>(items: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

impl EntityOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record only these attributes.
    pub fn only<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only = to_set(attributes);
        self
    }

    /// Never record these attributes.
    pub fn except<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.except = to_set(attributes);
        self
    }

    /// Record only these actions.
    pub fn on(mut self, actions: impl IntoIterator<Item = ActionKind>) -> Self {
        self.on = actions.into_iter().collect();
        self
    }

    /// Record these attributes with masked values.
    pub fn redacted<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.redacted = to_set(attributes);
        self
    }

    pub fn comment_required(mut self, required: bool) -> Self {
        self.comment_required = required;
        self
    }

    pub fn requires_comment(&self) -> bool {
        self.comment_required
    }

    pub fn audits_action(&self, action: ActionKind) -> bool {
        self.on.contains(&action)
    }

    fn records_attribute(&self, attribute: &str) -> bool {
        if !self.only.is_empty() {
            return self.only.contains(attribute);
        }
        !self.except.contains(attribute)
    }
}

impl From<&EntityConfig> for EntityOptions {
    fn from(config: &EntityConfig) -> Self {
        Self::new()
            .only(config.only.iter().cloned())
            .except(config.except.iter().cloned())
            .on(config.on.iter().copied())
            .redacted(config.redacted.iter().cloned())
            .comment_required(config.comment_required)
    }
}

/// Registry of audited entity types.
#[derive(Debug, Clone)]
pub struct AuditedRegistry {
    entities: HashMap<String, EntityOptions>,
    parents: HashMap<String, String>,
    ignored: BTreeSet<String>,
    redaction_marker: String,
}

impl Default for AuditedRegistry {
    fn default() -> Self {
        Self::with_audit_config(&AuditConfig::default())
    }
}

impl AuditedRegistry {
    /// Create an empty registry with default ignored attributes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry using the global settings of `config`.
    pub fn with_audit_config(config: &AuditConfig) -> Self {
        Self {
            entities: HashMap::new(),
            parents: HashMap::new(),
            ignored: to_set(config.ignored_attributes.iter().cloned()),
            redaction_marker: config.redaction_marker.clone(),
        }
    }

    /// Build a registry from a validated configuration.
    pub fn from_config(config: &RevtrailConfig) -> Result<Self, AuditError> {
        config.validate()?;

        let mut registry = Self::with_audit_config(&config.audit);
        for (name, entity) in &config.entities {
            registry.register(name.clone(), EntityOptions::from(entity));
            for subtype in &entity.subtypes {
                registry.register_subtype(subtype.clone(), name.clone());
            }
        }
        Ok(registry)
    }

    /// Register an audited entity type.
    pub fn register(
        &mut self,
        entity_type: impl Into<String>,
        options: EntityOptions,
    ) -> &mut Self {
        self.entities.insert(entity_type.into(), options);
        self
    }

    /// Declare `subtype` as a subtype of `parent`.
    ///
    /// `parent` may itself be a subtype; resolution follows the chain.
    pub fn register_subtype(
        &mut self,
        subtype: impl Into<String>,
        parent: impl Into<String>,
    ) -> &mut Self {
        self.parents.insert(subtype.into(), parent.into());
        self
    }

    /// The registered type `entity_type` is audited as, if any.
    pub fn resolve<'a>(&'a self, entity_type: &'a str) -> Option<&'a str> {
        let mut current = entity_type;
        // Bounded walk: a cyclic subtype declaration resolves to nothing.
        for _ in 0..=self.parents.len() {
            if let Some((name, _)) = self.entities.get_key_value(current) {
                return Some(name.as_str());
            }
            current = self.parents.get(current)?.as_str();
        }
        None
    }

    /// Whether `entity_type` or one of its ancestors is registered.
    pub fn is_audited(&self, entity_type: &str) -> bool {
        self.resolve(entity_type).is_some()
    }

    /// Options of the registered type `entity_type` resolves to.
    pub fn options(&self, entity_type: &str) -> Option<&EntityOptions> {
        self.resolve(entity_type)
            .and_then(|registered| self.entities.get(registered))
    }

    pub fn redaction_marker(&self) -> &str {
        &self.redaction_marker
    }

    /// Drop attributes the entity does not record and mask redacted ones.
    ///
    /// Unregistered types record nothing.
    pub fn filter_changes(&self, entity_type: &str, changes: Changes) -> Changes {
        let Some(options) = self.options(entity_type) else {
            return Changes::new();
        };

        changes
            .into_iter()
            .filter(|(attribute, _)| !self.ignored.contains(attribute))
            .filter(|(attribute, _)| options.records_attribute(attribute))
            .map(|(attribute, change)| {
                if options.redacted.contains(&attribute) {
                    let masked = change.redacted(&self.redaction_marker);
                    (attribute, masked)
                } else {
                    (attribute, change)
                }
            })
            .collect()
    }
}
