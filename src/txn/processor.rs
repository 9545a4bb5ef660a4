//! The transaction processor.
//!
//! Coordinates writes that must touch one primary record and several proxy
//! rows on a store that only guarantees single-document atomicity. Every
//! transaction follows the same protocol: stamp intent on the primary
//! record, stage the proxy changes, commit with one conditional update,
//! then finalize best-effort. Any writer or reader that encounters a
//! stranded transaction can drive it to the same end state, so a crashed
//! writer never blocks progress.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::collection::helper::{RecordHelper, RecordUpdate};
use crate::collection::proxy::ProxyCollection;
use crate::config::CollectionConfig;
use crate::document::get_path;
use crate::errors::{DuplicateError, RecordStoreError};
use crate::store::DocumentStore;
use crate::txn::{ProxyMarker, TxnDescriptor, TxnKind};
use crate::Document;

/// Attempts per public write before giving up with `RetriesExhausted`.
pub(crate) const MAX_TXN_RETRIES: usize = 10;

/// Rounds of the proxy staging loop before the attempt aborts.
const MAX_STAGE_ROUNDS: usize = 10;

/// One proxy change a transaction must apply before it can commit.
#[derive(Debug, Clone)]
pub(crate) struct StagedOp {
    field: String,
    action: StagedAction,
}

#[derive(Debug, Clone)]
enum StagedAction {
    /// Claim a value: insert a marked proxy row.
    Insert(Value),
    /// Release a value: mark the existing proxy row for deletion.
    Remove(Value),
}

enum StageOutcome {
    Done,
    /// The conflicting row, carrying a foreign transaction marker.
    Blocked(Document),
    /// The conflict vanished mid-flight; try the operation again.
    Retry,
}

pub(crate) struct TxnProcessor {
    helper: RecordHelper,
    proxies: Vec<ProxyCollection>,
}

impl TxnProcessor {
    pub(crate) fn new(store: Arc<dyn DocumentStore>, config: CollectionConfig) -> Self {
        let proxies = config
            .unique_fields
            .iter()
            .map(|field| ProxyCollection::new(store.clone(), &config, field))
            .collect();
        Self {
            helper: RecordHelper::new(store, config),
            proxies,
        }
    }

    pub(crate) fn helper(&self) -> &RecordHelper {
        &self.helper
    }

    fn config(&self) -> &CollectionConfig {
        self.helper.config()
    }

    pub(crate) fn ensure_indexes(&self) -> Result<(), RecordStoreError> {
        self.helper.ensure_indexes()?;
        for proxy in &self.proxies {
            proxy.ensure_indexes()?;
        }
        Ok(())
    }

    fn proxy(&self, field: &str) -> &ProxyCollection {
        self.proxies
            .iter()
            .find(|proxy| proxy.field() == field)
            .expect("staged operations only name configured unique fields")
    }

    fn with_retries<T>(
        &self,
        mut attempt: impl FnMut() -> Result<T, RecordStoreError>,
    ) -> Result<T, RecordStoreError> {
        for _ in 0..MAX_TXN_RETRIES {
            match attempt() {
                Err(RecordStoreError::Abort) => continue,
                other => return other,
            }
        }
        Err(RecordStoreError::RetriesExhausted(MAX_TXN_RETRIES))
    }

    // ---- insert ----------------------------------------------------------

    pub(crate) fn insert(
        &self,
        record_id: &str,
        data: &Document,
        meta: &Document,
    ) -> Result<(), RecordStoreError> {
        let ops = self.claim_ops(data);
        self.with_retries(|| self.try_insert(record_id, data, meta, &ops))
    }

    fn try_insert(
        &self,
        record_id: &str,
        data: &Document,
        meta: &Document,
        ops: &[StagedOp],
    ) -> Result<(), RecordStoreError> {
        if ops.is_empty() {
            // No proxy rows to coordinate: a single insert suffices.
            return match self.helper.insert(self.compose(data, meta, None, false)) {
                Err(RecordStoreError::Duplicate(dup)) => self.after_duplicate(dup),
                other => other,
            };
        }

        let txn = TxnDescriptor::new(TxnKind::Insert, record_id);
        debug!(txn = %txn.id, record = record_id, "insert transaction started");
        match self.helper.insert(self.compose(data, meta, Some(&txn), true)) {
            Ok(()) => {}
            Err(RecordStoreError::Duplicate(dup)) => return self.after_duplicate(dup),
            Err(err) => return Err(err),
        }

        if let Err(err) = self.stage(&txn, ops) {
            return Err(self.fail(&txn, err));
        }

        let committed = txn.with_committed();
        let landed = self.helper.update(&RecordUpdate {
            old_txn: Some(&txn),
            set_txn: Some(&committed),
            toggle_pending: Some(false),
            ..RecordUpdate::new(record_id)
        })?;
        if !landed {
            // Another actor claimed the slot to roll us back; let it finish.
            return Err(RecordStoreError::Abort);
        }
        self.finish(&committed, Some(ops));
        Ok(())
    }

    /// A duplicate on the primary collection is final only once any pending
    /// transaction on the colliding record has been resolved.
    fn after_duplicate(&self, dup: DuplicateError) -> Result<(), RecordStoreError> {
        if self.resolve_duplicate(&dup)? {
            Err(RecordStoreError::Abort)
        } else {
            Err(RecordStoreError::Duplicate(dup))
        }
    }

    /// Locate the record owning the colliding value and drive any pending
    /// transaction on it. Returns whether anything was processed (including
    /// the record having disappeared, which also unblocks a retry).
    fn resolve_duplicate(&self, dup: &DuplicateError) -> Result<bool, RecordStoreError> {
        let conflicting_id = if dup.unique_field == "id" {
            Some(dup.record_id.clone())
        } else {
            self.helper
                .find(None, Some((dup.unique_field.as_str(), &dup.unique_value)), true)?
                .and_then(|doc| {
                    get_path(&doc, &self.config().id_path())
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
        };
        let Some(conflicting_id) = conflicting_id else {
            return Ok(true);
        };
        self.process_any_pending(&conflicting_id, &[])
    }

    // ---- update ----------------------------------------------------------

    pub(crate) fn update(
        &self,
        id: &str,
        data: Option<&Document>,
        meta: Option<&Document>,
        expected_sequence: Option<u64>,
    ) -> Result<bool, RecordStoreError> {
        let Some(expected) = self
            .helper
            .derive_expected(data, meta, expected_sequence)?
        else {
            return Err(RecordStoreError::invalid_request(
                "an expected sequence is required, either explicitly or via the part that carries it",
            ));
        };
        self.with_retries(|| self.try_update(id, data, meta, expected))
    }

    fn try_update(
        &self,
        id: &str,
        data: Option<&Document>,
        meta: Option<&Document>,
        expected: u64,
    ) -> Result<bool, RecordStoreError> {
        let Some(current) = self.helper.find(Some(id), None, false)? else {
            return Err(RecordStoreError::NotFound);
        };
        if let Some(txn) = TxnDescriptor::from_record(&current) {
            self.process_pending(&txn)?;
            return Err(RecordStoreError::Abort);
        }

        let current_data = get_path(&current, &self.config().data_field)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let ops = match data {
            Some(new_data) => self.move_ops(&current_data, new_data),
            None => Vec::new(),
        };

        if ops.is_empty() {
            // No unique value moves: one conditional write, no transaction.
            let modified = self.helper.update(&RecordUpdate {
                data,
                meta,
                expected_sequence: Some(expected),
                ..RecordUpdate::new(id)
            })?;
            if !modified {
                // The sequence still matches, so a transaction slipped in
                // between the read and the write; reprocess and retry.
                return Err(RecordStoreError::Abort);
            }
            return Ok(true);
        }

        let txn = TxnDescriptor::new(TxnKind::Update, id);
        debug!(txn = %txn.id, record = id, "update transaction started");
        let stamped = self.helper.update(&RecordUpdate {
            expected_sequence: Some(expected),
            set_txn: Some(&txn),
            ..RecordUpdate::new(id)
        })?;
        if !stamped {
            return Err(RecordStoreError::Abort);
        }

        if let Err(err) = self.stage(&txn, &ops) {
            return Err(self.fail(&txn, err));
        }

        let committed = txn.with_committed();
        let landed = match self.helper.update(&RecordUpdate {
            data,
            meta,
            expected_sequence: Some(expected),
            old_txn: Some(&txn),
            set_txn: Some(&committed),
            ..RecordUpdate::new(id)
        }) {
            Ok(modified) => modified,
            Err(RecordStoreError::Duplicate(dup)) => {
                // A unique index on the primary collection caught a transient
                // overlap with an incomplete transaction elsewhere; resolve
                // it and retry from the top.
                let _ = self.resolve_duplicate(&dup)?;
                return Err(self.fail(&txn, RecordStoreError::Abort));
            }
            Err(err) => return Err(self.fail(&txn, err)),
        };
        if !landed {
            return Err(RecordStoreError::Abort);
        }
        self.finish(&committed, Some(&ops));
        Ok(true)
    }

    // ---- delete ----------------------------------------------------------

    pub(crate) fn delete(&self, id: &str) -> Result<bool, RecordStoreError> {
        self.with_retries(|| self.try_delete(id))
    }

    fn try_delete(&self, id: &str) -> Result<bool, RecordStoreError> {
        let Some(current) = self.helper.find(Some(id), None, false)? else {
            return Err(RecordStoreError::NotFound);
        };
        if let Some(txn) = TxnDescriptor::from_record(&current) {
            self.process_pending(&txn)?;
            return Err(RecordStoreError::Abort);
        }

        let current_data = get_path(&current, &self.config().data_field)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let ops = self.release_ops(&current_data);

        if ops.is_empty() {
            if self.helper.delete_stable(id)? {
                return Ok(true);
            }
            return Err(RecordStoreError::Abort);
        }

        let txn = TxnDescriptor::new(TxnKind::Delete, id);
        debug!(txn = %txn.id, record = id, "delete transaction started");
        let sequence = get_path(&current, &self.config().sequence_path())
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let stamped = match self.helper.update(&RecordUpdate {
            expected_sequence: Some(sequence),
            set_txn: Some(&txn),
            ..RecordUpdate::new(id)
        }) {
            Ok(modified) => modified,
            // A concurrent update advanced the record between the read and
            // the stamp; deletion has no caller-side sequence contract, so
            // just retry against the fresh state.
            Err(RecordStoreError::InvalidState { .. }) => false,
            Err(err) => return Err(err),
        };
        if !stamped {
            return Err(RecordStoreError::Abort);
        }

        if let Err(err) = self.stage(&txn, &ops) {
            return Err(self.fail(&txn, err));
        }

        let committed = txn.with_committed();
        let landed = self.helper.update(&RecordUpdate {
            old_txn: Some(&txn),
            set_txn: Some(&committed),
            ..RecordUpdate::new(id)
        })?;
        if !landed {
            return Err(RecordStoreError::Abort);
        }
        self.finish(&committed, Some(&ops));
        Ok(true)
    }

    // ---- reads -----------------------------------------------------------

    pub(crate) fn get_by_id(&self, id: &str) -> Result<Document, RecordStoreError> {
        self.with_retries(|| {
            let Some(doc) = self.helper.find(Some(id), None, false)? else {
                return Err(RecordStoreError::NotFound);
            };
            self.settle_read(doc)
        })
    }

    pub(crate) fn get_by_unique(
        &self,
        field: &str,
        value: &Value,
    ) -> Result<Document, RecordStoreError> {
        let Some(proxy) = self.proxies.iter().find(|proxy| proxy.field() == field) else {
            return Err(RecordStoreError::invalid_request(format!(
                "`{field}` is not a unique field of this collection"
            )));
        };
        self.with_retries(|| {
            let row = proxy.get(None, Some(value))?;
            if let Some(marker) = ProxyMarker::from_row(&row) {
                self.process_any_pending(&marker.record_id, std::slice::from_ref(&row))?;
                return Err(RecordStoreError::Abort);
            }
            let Some(owner) = proxy.owner_of(&row) else {
                return Err(RecordStoreError::Abort);
            };
            let Some(doc) = self.helper.find(Some(&owner), Some((field, value)), false)? else {
                // The mapping raced with a writer; re-resolve from the proxy.
                return Err(RecordStoreError::Abort);
            };
            self.settle_read(doc)
        })
    }

    /// Resolve any transaction attached to a fetched record: a committed one
    /// is completed in the background and the record returned as-is, an
    /// uncommitted one is rolled back and the read retried.
    fn settle_read(&self, doc: Document) -> Result<Document, RecordStoreError> {
        match TxnDescriptor::from_record(&doc) {
            None => Ok(doc),
            Some(txn) if txn.committed => {
                self.finish(&txn, None);
                if txn.kind == TxnKind::Delete {
                    // The deletion already committed; only its cleanup was
                    // outstanding.
                    Err(RecordStoreError::NotFound)
                } else {
                    Ok(doc)
                }
            }
            Some(txn) => {
                self.process_pending(&txn)?;
                Err(RecordStoreError::Abort)
            }
        }
    }

    // ---- repair ----------------------------------------------------------

    /// Sweep the primary collection for records still carrying transaction
    /// markers and drive each to its end state. Returns how many
    /// transactions were processed.
    pub(crate) fn repair(&self) -> Result<usize, RecordStoreError> {
        let mut processed = 0;
        for doc in self.helper.find_marked()? {
            let Some(txn) = TxnDescriptor::from_record(&doc) else {
                continue;
            };
            match self.process_pending(&txn) {
                Ok(()) => processed += 1,
                // Another writer reached the record first; its transaction
                // is being handled.
                Err(RecordStoreError::Abort) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(processed)
    }

    // ---- recovery --------------------------------------------------------

    /// Drive whatever transaction is attached to `record_id` to its end
    /// state; with no transaction attached, clean up the given proxy rows
    /// whose markers reference the record (their transactions are dead).
    /// Returns whether anything was processed.
    fn process_any_pending(
        &self,
        record_id: &str,
        blocked: &[Document],
    ) -> Result<bool, RecordStoreError> {
        match self.helper.find(Some(record_id), None, true)? {
            Some(doc) => match TxnDescriptor::from_record(&doc) {
                Some(txn) => {
                    self.process_pending(&txn)?;
                    Ok(true)
                }
                None => {
                    let mut processed = false;
                    for row in blocked {
                        if let Some(marker) = ProxyMarker::from_row(row) {
                            if marker.record_id == record_id {
                                self.rollback_markers(&marker.id)?;
                                processed = true;
                            }
                        }
                    }
                    Ok(processed)
                }
            },
            None => {
                // The record is gone; rows staged under its transactions can
                // never commit and are safe to roll back directly.
                for row in blocked {
                    if let Some(marker) = ProxyMarker::from_row(row) {
                        self.rollback_markers(&marker.id)?;
                    }
                }
                Ok(true)
            }
        }
    }

    /// Finish an abandoned transaction found on a record: complete it if it
    /// committed, roll it back otherwise. Both directions are idempotent.
    fn process_pending(&self, txn: &TxnDescriptor) -> Result<(), RecordStoreError> {
        if txn.committed {
            debug!(txn = %txn.id, record = %txn.record_id, "completing stranded transaction");
            self.complete(txn, None)
        } else {
            debug!(txn = %txn.id, record = %txn.record_id, "rolling back stranded transaction");
            self.roll_back(txn)
        }
    }

    fn roll_back(&self, txn: &TxnDescriptor) -> Result<(), RecordStoreError> {
        let marked = txn.with_rollback();
        if !txn.rollback {
            let stamped = self.helper.update(&RecordUpdate {
                old_txn: Some(txn),
                set_txn: Some(&marked),
                ..RecordUpdate::new(&txn.record_id)
            })?;
            if !stamped {
                // Another actor is racing on the same transaction.
                return Err(RecordStoreError::Abort);
            }
        }
        for proxy in &self.proxies {
            proxy.rollback_change(&txn.id, None, None)?;
        }
        match txn.kind {
            // The record never became visible; remove it.
            TxnKind::Insert => {
                self.helper.delete_by_txn(&txn.record_id, &txn.id)?;
            }
            TxnKind::Update | TxnKind::Delete => {
                self.helper.update(&RecordUpdate {
                    old_txn: Some(&marked),
                    clear_txn: true,
                    ..RecordUpdate::new(&txn.record_id)
                })?;
            }
        }
        Ok(())
    }

    /// Protocol step 4. Safe to repeat: rows and markers that are already
    /// finalized no longer match and are skipped.
    fn complete(
        &self,
        txn: &TxnDescriptor,
        staged: Option<&[StagedOp]>,
    ) -> Result<(), RecordStoreError> {
        match staged {
            Some(ops) => {
                for op in ops {
                    let proxy = self.proxy(&op.field);
                    match &op.action {
                        StagedAction::Insert(value) => {
                            proxy.complete_change(&txn.id, Some(value), None)?
                        }
                        StagedAction::Remove(value) => {
                            proxy.complete_change(&txn.id, None, Some(value))?
                        }
                    }
                }
            }
            // Recovering someone else's transaction: the staged values are
            // unknown, so visit every proxy collection.
            None => {
                for proxy in &self.proxies {
                    proxy.complete_change(&txn.id, None, None)?;
                }
            }
        }
        match txn.kind {
            TxnKind::Delete => {
                self.helper.delete_by_txn(&txn.record_id, &txn.id)?;
            }
            TxnKind::Insert | TxnKind::Update => {
                self.helper.update(&RecordUpdate {
                    old_txn: Some(txn),
                    clear_txn: true,
                    ..RecordUpdate::new(&txn.record_id)
                })?;
            }
        }
        Ok(())
    }

    /// Best-effort completion after commit; a failure here is picked up by
    /// the next reader or writer that touches the record.
    fn finish(&self, txn: &TxnDescriptor, staged: Option<&[StagedOp]>) {
        if let Err(err) = self.complete(txn, staged) {
            warn!(
                txn = %txn.id,
                record = %txn.record_id,
                error = %err,
                "completion failed; deferring to a later reader or writer"
            );
        }
    }

    /// Roll back this writer's own transaction before propagating `err`. A
    /// lost rollback race means another actor already took the transaction
    /// over, so the original error still stands.
    fn fail(&self, txn: &TxnDescriptor, err: RecordStoreError) -> RecordStoreError {
        debug!(txn = %txn.id, error = %err, "attempt failed; rolling back");
        match self.roll_back(txn) {
            Ok(()) | Err(RecordStoreError::Abort) => err,
            Err(other) => other,
        }
    }

    fn rollback_markers(&self, txn_id: &str) -> Result<(), RecordStoreError> {
        for proxy in &self.proxies {
            proxy.rollback_change(txn_id, None, None)?;
        }
        Ok(())
    }

    // ---- proxy staging ---------------------------------------------------

    fn stage(&self, txn: &TxnDescriptor, ops: &[StagedOp]) -> Result<(), RecordStoreError> {
        let mut remaining: Vec<&StagedOp> = ops.iter().collect();
        for _ in 0..MAX_STAGE_ROUNDS {
            let mut blocked: HashMap<String, Vec<Document>> = HashMap::new();
            let mut unfinished = Vec::new();
            for op in remaining {
                match self.apply_staged(txn, op)? {
                    StageOutcome::Done => {}
                    StageOutcome::Retry => unfinished.push(op),
                    StageOutcome::Blocked(row) => {
                        if let Some(marker) = ProxyMarker::from_row(&row) {
                            blocked.entry(marker.record_id).or_default().push(row);
                        }
                        unfinished.push(op);
                    }
                }
            }
            if unfinished.is_empty() {
                return Ok(());
            }
            for (record_id, rows) in &blocked {
                self.process_any_pending(record_id, rows)?;
            }
            remaining = unfinished;
        }
        Err(RecordStoreError::Abort)
    }

    fn apply_staged(
        &self,
        txn: &TxnDescriptor,
        op: &StagedOp,
    ) -> Result<StageOutcome, RecordStoreError> {
        let proxy = self.proxy(&op.field);
        match &op.action {
            StagedAction::Insert(value) => match proxy.insert(value, &txn.record_id, txn) {
                Ok(()) => Ok(StageOutcome::Done),
                Err(RecordStoreError::Duplicate(dup)) => {
                    let Some(row) = proxy.find(None, Some(value))? else {
                        return Ok(StageOutcome::Retry);
                    };
                    match ProxyMarker::from_row(&row) {
                        Some(marker) if marker.id == txn.id => Ok(StageOutcome::Done),
                        Some(marker) if marker.record_id == txn.record_id => {
                            // A dead marker left on our own record by an
                            // earlier, stalled writer; our transaction holds
                            // the record now, so just clean it up.
                            self.rollback_markers(&marker.id)?;
                            Ok(StageOutcome::Retry)
                        }
                        Some(_) => Ok(StageOutcome::Blocked(row)),
                        None => {
                            // A settled owner holds the value. Only after its
                            // record has no transaction left is the conflict
                            // final.
                            let Some(owner) = proxy.owner_of(&row) else {
                                return Ok(StageOutcome::Retry);
                            };
                            if self.process_any_pending(&owner, &[])? {
                                Ok(StageOutcome::Retry)
                            } else {
                                Err(RecordStoreError::Duplicate(dup))
                            }
                        }
                    }
                }
                Err(err) => Err(err),
            },
            StagedAction::Remove(value) => {
                if proxy.prepare_delete(&txn.record_id, txn, Some(value))? {
                    return Ok(StageOutcome::Done);
                }
                let Some(row) = proxy.find(Some(&txn.record_id), Some(value))? else {
                    // Nothing left to release.
                    return Ok(StageOutcome::Done);
                };
                match ProxyMarker::from_row(&row) {
                    Some(marker) if marker.id == txn.id => Ok(StageOutcome::Done),
                    Some(_) => Ok(StageOutcome::Blocked(row)),
                    None => Ok(StageOutcome::Retry),
                }
            }
        }
    }

    // ---- staged-op computation -------------------------------------------

    /// Claims for every unique value present in a new record's payload.
    pub(crate) fn claim_ops(&self, data: &Document) -> Vec<StagedOp> {
        self.config()
            .unique_fields
            .iter()
            .filter_map(|field| {
                let value = data.get(field).filter(|value| !value.is_null())?;
                Some(StagedOp {
                    field: field.clone(),
                    action: StagedAction::Insert(value.clone()),
                })
            })
            .collect()
    }

    /// Releases for every unique value a record currently holds.
    fn release_ops(&self, data: &Document) -> Vec<StagedOp> {
        self.config()
            .unique_fields
            .iter()
            .filter_map(|field| {
                let value = data.get(field).filter(|value| !value.is_null())?;
                Some(StagedOp {
                    field: field.clone(),
                    action: StagedAction::Remove(value.clone()),
                })
            })
            .collect()
    }

    /// Claims and releases for the unique values that differ between the
    /// stored payload and its replacement.
    pub(crate) fn move_ops(&self, current: &Document, new_data: &Document) -> Vec<StagedOp> {
        let mut ops = Vec::new();
        for field in &self.config().unique_fields {
            let old = current.get(field).filter(|value| !value.is_null());
            let new = new_data.get(field).filter(|value| !value.is_null());
            if old == new {
                continue;
            }
            if let Some(new) = new {
                ops.push(StagedOp {
                    field: field.clone(),
                    action: StagedAction::Insert(new.clone()),
                });
            }
            if let Some(old) = old {
                ops.push(StagedOp {
                    field: field.clone(),
                    action: StagedAction::Remove(old.clone()),
                });
            }
        }
        ops
    }

    fn compose(
        &self,
        data: &Document,
        meta: &Document,
        txn: Option<&TxnDescriptor>,
        pending: bool,
    ) -> Document {
        let mut doc = Document::new();
        doc.insert(
            self.config().data_field.clone(),
            Value::Object(data.clone()),
        );
        doc.insert("meta".into(), Value::Object(meta.clone()));
        if pending {
            doc.insert("_pending".into(), Value::Bool(true));
        }
        if let Some(txn) = txn {
            doc.insert("_txn".into(), txn.to_value());
        }
        doc
    }
}

#[cfg(test)]
impl TxnProcessor {
    pub(crate) fn op_summaries(ops: &[StagedOp]) -> Vec<(String, &'static str, Value)> {
        ops.iter()
            .map(|op| match &op.action {
                StagedAction::Insert(value) => (op.field.clone(), "insert", value.clone()),
                StagedAction::Remove(value) => (op.field.clone(), "remove", value.clone()),
            })
            .collect()
    }
}
