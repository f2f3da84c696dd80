//! Slicing of a subscription's pending changes into ordered packs.
//!
//! The packer only reads. Planning is a pure function of the subscription
//! and the change log, so re-running it before the cursor moves reproduces
//! the same packs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SelectorError, WebhookError};
use crate::selector::{ChangeFilter, FieldSelector};
use crate::storage::Storage;
use crate::types::{
    ChangeKey, ChangeRecord, ItemId, ModelName, Operation, Operations, SyncPosition, WebhookSubscription,
};

/// Changes read from the log per storage round-trip.
pub const DEFAULT_SCAN_BATCH: usize = 500;

/// One change as the subscriber sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackedChange {
    pub id: ItemId,
    pub operation: Operation,
    pub changed_at: DateTime<Utc>,

    /// Snapshot projected by the subscription's field selection.
    pub fields: Value,
}

/// Ordered batch of changes delivered in one request.
///
/// A pack with no changes only moves the cursor past changes the
/// subscription filters out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pack {
    pub model: ModelName,

    /// Subscription position the pack was built from.
    pub from: SyncPosition,

    /// Key of the last change the pack covers.
    pub through: ChangeKey,
    pub changes: Vec<PackedChange>,
}

impl Pack {
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn is_cursor_only(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn last_change(&self) -> Option<&PackedChange> {
        self.changes.last()
    }

    /// `<Model>.<operation>` of the newest change in the pack.
    pub fn event_type(&self) -> Option<String> {
        self.last_change()
            .map(|change| format!("{}.{}", self.model, change.operation.past_tense()))
    }
}

/// Compiled selectors of one subscription.
#[derive(Debug, Clone)]
pub struct PackBuilder {
    model: ModelName,
    operations: Operations,
    filter: ChangeFilter,
    selector: Option<FieldSelector>,
    max_pack_size: usize,
}

impl PackBuilder {
    pub fn for_subscription(
        subscription: &WebhookSubscription,
        default_max_pack_size: usize,
    ) -> Result<Self, SelectorError> {
        let selector = match subscription.fields.as_deref() {
            Some(fields) if !fields.trim().is_empty() => Some(FieldSelector::parse(fields)?),
            _ => None,
        };
        Ok(Self {
            model: subscription.model.clone(),
            operations: subscription.operations,
            filter: ChangeFilter::parse(&subscription.filters)?,
            selector,
            max_pack_size: subscription.pack_size(default_max_pack_size),
        })
    }

    pub fn max_pack_size(&self) -> usize {
        self.max_pack_size
    }

    /// Whether the subscription wants to hear about `change`.
    pub fn accepts(&self, change: &ChangeRecord) -> bool {
        change.model == self.model
            && self.operations.allows(change.operation)
            && self.filter.matches(&change.data)
    }

    pub fn pack_change(&self, change: &ChangeRecord) -> PackedChange {
        let fields = match &self.selector {
            Some(selector) => selector.project(&change.data),
            None => change.data.clone(),
        };
        PackedChange {
            id: change.item_id.clone(),
            operation: change.operation,
            changed_at: change.changed_at,
            fields,
        }
    }

    /// Split the changes after `from` into packs.
    ///
    /// Packs with changes end at their last accepted change. Filtered-out
    /// changes at the tail end up in a trailing cursor-only pack.
    pub fn plan(&self, from: &SyncPosition, changes: &[ChangeRecord]) -> Vec<Pack> {
        let mut pending: Vec<&ChangeRecord> = changes
            .iter()
            .filter(|change| change.model == self.model && from.precedes(&change.key()))
            .collect();
        pending.sort_by_key(|change| change.key());

        let mut packs = Vec::new();
        let mut position = from.clone();
        let mut current = Vec::with_capacity(self.max_pack_size.min(pending.len()));
        let mut last_accepted: Option<ChangeKey> = None;
        let mut skipped: Option<ChangeKey> = None;

        for change in pending {
            if !self.accepts(change) {
                skipped = Some(change.key());
                continue;
            }
            current.push(self.pack_change(change));
            last_accepted = Some(change.key());
            skipped = None;

            if current.len() == self.max_pack_size {
                if let Some(through) = last_accepted.take() {
                    packs.push(Pack {
                        model: self.model.clone(),
                        from: position.clone(),
                        through: through.clone(),
                        changes: std::mem::take(&mut current),
                    });
                    position = SyncPosition::advanced_to(&through);
                }
            }
        }

        if let Some(through) = last_accepted {
            packs.push(Pack {
                model: self.model.clone(),
                from: position.clone(),
                through: through.clone(),
                changes: current,
            });
            position = SyncPosition::advanced_to(&through);
        }

        if let Some(through) = skipped {
            packs.push(Pack {
                model: self.model.clone(),
                from: position,
                through,
                changes: Vec::new(),
            });
        }

        packs
    }
}

/// Reads pending changes of a subscription and plans its packs.
#[derive(Debug, Clone)]
pub struct ChangePacker {
    default_max_pack_size: usize,
    scan_batch: usize,
}

impl ChangePacker {
    pub fn new(default_max_pack_size: usize) -> Self {
        Self {
            default_max_pack_size: default_max_pack_size.max(1),
            scan_batch: DEFAULT_SCAN_BATCH,
        }
    }

    pub fn with_scan_batch(mut self, scan_batch: usize) -> Self {
        self.scan_batch = scan_batch.max(1);
        self
    }

    /// Packs for `subscription` out of an in-memory slice of the change log.
    pub fn plan(
        &self,
        subscription: &WebhookSubscription,
        changes: &[ChangeRecord],
    ) -> Result<Vec<Pack>, SelectorError> {
        let builder = PackBuilder::for_subscription(subscription, self.default_max_pack_size)?;
        Ok(builder.plan(&subscription.position(), changes))
    }

    /// The first pack after the subscription cursor, if anything is pending.
    pub async fn next_pack(
        &self,
        storage: &dyn Storage,
        subscription: &WebhookSubscription,
    ) -> Result<Option<Pack>, WebhookError> {
        let builder = PackBuilder::for_subscription(subscription, self.default_max_pack_size)?;
        let limit = self.scan_batch.max(builder.max_pack_size());
        let from = subscription.position();

        let mut position = from.clone();
        let mut scanned: Vec<ChangeRecord> = Vec::new();
        loop {
            let batch = storage.changes_after(&subscription.model, &position, limit).await?;
            let exhausted = batch.len() < limit;
            if let Some(last) = batch.last() {
                position = SyncPosition::advanced_to(&last.key());
            }
            scanned.extend(batch);

            let accepted = scanned.iter().filter(|change| builder.accepts(change)).count();
            // A fully filtered batch is returned as a cursor-only pack right away.
            if exhausted || accepted >= builder.max_pack_size() || accepted == 0 {
                break;
            }
        }

        Ok(builder.plan(&from, &scanned).into_iter().next())
    }

    /// Every pack currently pending for `subscription`, in delivery order.
    pub async fn pending_packs(
        &self,
        storage: &dyn Storage,
        subscription: &WebhookSubscription,
    ) -> Result<Vec<Pack>, WebhookError> {
        let builder = PackBuilder::for_subscription(subscription, self.default_max_pack_size)?;
        let from = subscription.position();

        let mut position = from.clone();
        let mut scanned: Vec<ChangeRecord> = Vec::new();
        loop {
            let batch = storage
                .changes_after(&subscription.model, &position, self.scan_batch)
                .await?;
            let exhausted = batch.len() < self.scan_batch;
            if let Some(last) = batch.last() {
                position = SyncPosition::advanced_to(&last.key());
            }
            scanned.extend(batch);
            if exhausted {
                break;
            }
        }

        tracing::debug!(
            subscription = %subscription.id,
            model = %subscription.model,
            scanned = scanned.len(),
            "planning pending packs"
        );
        Ok(builder.plan(&from, &scanned))
    }
}
