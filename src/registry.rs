//! Which models are webhook-enabled, and the after-change hooks that run for
//! them.
//!
//! The mutation pipeline of the host application keeps one [`HookChain`] per
//! model and runs it after every committed mutation. Registering a model with
//! the [`ModelRegistry`] appends the scheduling trigger to that chain exactly
//! once, no matter how often registration is evaluated.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::{SelectorError, WebhookError};
use crate::selector::{normalize_fields_string, ChangeFilter, FieldSelector};
use crate::types::{ItemId, ModelName, Operation};

/// Field names of a model, used to validate subscription selectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSchema {
    pub name: ModelName,

    /// `None` accepts any field.
    pub fields: Option<BTreeSet<String>>,
}

impl ModelSchema {
    pub fn new<I, S>(name: impl Into<ModelName>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            fields: Some(fields.into_iter().map(Into::into).collect()),
        }
    }

    fn check_field(&self, field: &str) -> Result<(), SelectorError> {
        match &self.fields {
            Some(fields) if !fields.contains(field) => Err(SelectorError::UnknownField {
                model: self.name.clone(),
                field: field.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

impl From<&str> for ModelSchema {
    fn from(name: &str) -> Self {
        Self { name: ModelName::from(name), fields: None }
    }
}

impl From<ModelName> for ModelSchema {
    fn from(name: ModelName) -> Self {
        Self { name, fields: None }
    }
}

/// Derived per-item data attached to one operation, e.g. decrypted fields
/// that are not part of the stored item.
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    pub request_id: Option<String>,
    side_table: HashMap<ItemId, Map<String, Value>>,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn attach(&mut self, item_id: impl Into<ItemId>, field: impl Into<String>, value: Value) {
        self.side_table
            .entry(item_id.into())
            .or_default()
            .insert(field.into(), value);
    }

    pub fn derived(&self, item_id: &ItemId) -> Option<&Map<String, Value>> {
        self.side_table.get(item_id)
    }
}

/// Arguments of an after-change hook: one committed mutation.
#[derive(Debug, Clone)]
pub struct AfterChange {
    pub model: ModelName,
    pub operation: Operation,
    pub updated_item: Option<Value>,
    pub existing_item: Option<Value>,
    pub original_input: Option<Value>,
    pub context: OperationContext,

    /// Commit time of the mutation.
    pub at: DateTime<Utc>,
}

impl AfterChange {
    pub fn new(model: impl Into<ModelName>, operation: Operation) -> Self {
        Self {
            model: model.into(),
            operation,
            updated_item: None,
            existing_item: None,
            original_input: None,
            context: OperationContext::default(),
            at: Utc::now(),
        }
    }

    pub fn with_updated_item(mut self, item: Value) -> Self {
        self.updated_item = Some(item);
        self
    }

    pub fn with_existing_item(mut self, item: Value) -> Self {
        self.existing_item = Some(item);
        self
    }

    pub fn with_original_input(mut self, input: Value) -> Self {
        self.original_input = Some(input);
        self
    }

    pub fn with_context(mut self, context: OperationContext) -> Self {
        self.context = context;
        self
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }

    /// Snapshot describing the item after the change. Deletes fall back to
    /// the item as it existed.
    pub fn snapshot(&self) -> Option<&Value> {
        match self.operation {
            Operation::Delete => self.existing_item.as_ref().or(self.updated_item.as_ref()),
            _ => self.updated_item.as_ref().or(self.existing_item.as_ref()),
        }
    }

    pub fn item_id(&self) -> Option<ItemId> {
        let id = self.snapshot()?.get("id")?;
        match id {
            Value::String(s) => Some(ItemId(s.clone())),
            Value::Number(n) => Some(ItemId(n.to_string())),
            _ => None,
        }
    }
}

/// One step of the after-change phase. Hooks must not fail the mutation.
#[async_trait]
pub trait AfterChangeHook: Send + Sync {
    fn name(&self) -> &str;
    async fn after_change(&self, change: &AfterChange);
}

/// Ordered after-change hooks of one model.
#[derive(Clone, Default)]
pub struct HookChain {
    hooks: Vec<Arc<dyn AfterChangeHook>>,
}

impl HookChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, hook: Arc<dyn AfterChangeHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn hook_names(&self) -> Vec<&str> {
        self.hooks.iter().map(|hook| hook.name()).collect()
    }

    /// Run every hook in order.
    pub async fn run(&self, change: &AfterChange) {
        for hook in &self.hooks {
            hook.after_change(change).await;
        }
    }
}

impl std::fmt::Debug for HookChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.hook_names()).finish()
    }
}

/// Process-wide set of webhook-enabled models.
///
/// Built at startup and shared by `Arc`. Writes only happen while the schema
/// is loaded; afterwards the lock is uncontended.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: RwLock<BTreeMap<ModelName, ModelSchema>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable webhooks for a model and append `hook` to its chain.
    ///
    /// Registering a model twice is a no-op that hands back `chain`
    /// unchanged, so the trigger can never run twice per mutation.
    pub fn register_model(
        &self,
        schema: impl Into<ModelSchema>,
        chain: HookChain,
        hook: Arc<dyn AfterChangeHook>,
    ) -> HookChain {
        let schema = schema.into();
        let mut models = self.models.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if models.contains_key(&schema.name) {
            tracing::debug!(model = %schema.name, "model already webhook-enabled");
            return chain;
        }
        tracing::info!(model = %schema.name, "webhook-enabled model registered");
        models.insert(schema.name.clone(), schema);
        chain.then(hook)
    }

    pub fn is_registered(&self, model: &ModelName) -> bool {
        self.read().contains_key(model)
    }

    pub fn models(&self) -> Vec<ModelName> {
        self.read().keys().cloned().collect()
    }

    /// Check a field selection against the model schema.
    pub fn validate_fields(&self, model: &ModelName, fields: &str) -> Result<FieldSelector, WebhookError> {
        let models = self.read();
        let schema = models
            .get(model)
            .ok_or_else(|| WebhookError::UnregisteredModel { model: model.clone() })?;
        let selector = FieldSelector::parse(fields)?;
        for field in selector.field_names() {
            schema.check_field(field)?;
        }
        Ok(selector)
    }

    /// Check a where-input filter against the model schema.
    pub fn validate_filters(&self, model: &ModelName, filters: &Value) -> Result<ChangeFilter, WebhookError> {
        let models = self.read();
        let schema = models
            .get(model)
            .ok_or_else(|| WebhookError::UnregisteredModel { model: model.clone() })?;
        let filter = ChangeFilter::parse(filters)?;
        for field in filter.field_names() {
            schema.check_field(field)?;
        }
        Ok(filter)
    }

    /// Accept `<Model>.created|updated|deleted` for registered models and any
    /// of `custom` verbatim.
    pub fn validate_event_type(&self, event_type: &str, custom: &[String]) -> Result<(), WebhookError> {
        if custom.iter().any(|allowed| allowed == event_type) {
            return Ok(());
        }
        let valid = event_type
            .split_once('.')
            .filter(|(_, action)| Operation::from_past_tense(action).is_some())
            .map(|(model, _)| self.is_registered(&ModelName::from(model)))
            .unwrap_or(false);
        if valid {
            Ok(())
        } else {
            Err(WebhookError::InvalidEventType(event_type.to_string()))
        }
    }

    /// Canonical form of a selection, as stored on subscriptions.
    pub fn normalize_fields(fields: &str) -> String {
        normalize_fields_string(fields)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<ModelName, ModelSchema>> {
        self.models.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
