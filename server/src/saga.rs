//! Creation saga: upload blobs, then create the record that references them
//!
//! Ordered steps:
//!
//! 1. Reject the request up front if the natural key is already taken, before
//!    any blob is uploaded.
//! 2. Upload every attachment. Each successful upload pushes a compensating
//!    delete onto the stack.
//! 3. Create the record in one atomic write.
//! 4. If anything after the first upload fails, pop the stack and run each
//!    delete once, newest first. A failed delete is logged and recorded as an
//!    orphan; it never replaces the error that caused the unwind.
//!
//! An `Upstream` failure in step 3 does not prove the record is absent: the
//! write may have committed after its deadline expired. Before unwinding, the
//! saga looks the record up again and keeps every blob it references. If that
//! lookup fails too, the blobs go to the orphan ledger instead of being deleted,
//! and the sweep only removes the ones nothing references.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt as _};
use tracing::{error, info, warn};

use crate::blob::{sniff_kind, BlobState, BlobStore, StoredBlob};
use crate::deadline::{bounded, Deadlines};
use crate::errors::{AppError, AppResult};
use crate::models::MediaRef;
use crate::store::{OrphanStore, StoreResult};

/// One attachment of a creation request
#[derive(Debug, Clone)]
pub struct Upload {
    /// Field name the blob ends up in, e.g. `avatar`
    pub slot: &'static str,
    /// A required upload that fails aborts the whole creation
    pub required: bool,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn required(slot: &'static str, bytes: Vec<u8>) -> Self {
        Self {
            slot,
            required: true,
            bytes,
        }
    }

    pub fn optional(slot: &'static str, bytes: Vec<u8>) -> Self {
        Self {
            slot,
            required: false,
            bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedBlob {
    pub slot: &'static str,
    pub blob: StoredBlob,
    pub state: BlobState,
}

impl UploadedBlob {
    pub fn media_ref(&self) -> MediaRef {
        MediaRef {
            blob_id: self.blob.id.clone(),
            url: self.blob.url.clone(),
        }
    }
}

/// Blobs uploaded so far, in upload order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadedAssets {
    blobs: Vec<UploadedBlob>,
}

impl UploadedAssets {
    /// Reference for `slot`, or `None` if nothing was uploaded there
    pub fn get(&self, slot: &str) -> Option<MediaRef> {
        self.blobs
            .iter()
            .find(|b| b.slot == slot)
            .map(UploadedBlob::media_ref)
    }

    pub fn blobs(&self) -> &[UploadedBlob] {
        &self.blobs
    }

    fn commit(&mut self) {
        for blob in &mut self.blobs {
            blob.state = BlobState::Committed;
        }
    }
}

/// The entity-specific half of a creation: the natural key check and the insert
#[async_trait]
pub trait CreationTarget: Send + Sync {
    type Payload: Clone + Send + Sync;
    type Record: Send;

    /// Entity name used in logs and error messages
    fn entity(&self) -> &'static str;

    /// Human-readable natural key of `payload`
    fn natural_key(&self, payload: &Self::Payload) -> String;

    async fn exists(&self, payload: &Self::Payload) -> StoreResult<bool>;

    /// Create the record referencing `assets` in a single atomic write
    async fn create_atomic(&self, payload: Self::Payload, assets: &UploadedAssets) -> AppResult<Self::Record>;

    /// The record stored under `payload`'s natural key, if any
    async fn find_created(&self, payload: &Self::Payload) -> StoreResult<Option<Self::Record>>;

    /// Blob ids `record` points at
    fn referenced_blobs(&self, record: &Self::Record) -> Vec<String>;
}

/// Result of a creation: the record and the blobs it now references
#[derive(Debug)]
pub struct Created<R> {
    pub record: R,
    pub assets: UploadedAssets,
}

/// What a lookup after a failed create says about the record
enum Reconciled<R> {
    /// The write landed after all; `R` references these uploads
    Landed(R),
    /// Nothing references the uploads, so they can be deleted
    Absent,
    /// The store could not tell
    Unknown,
}

type UploadOutcome = (&'static str, bool, AppResult<StoredBlob>);

#[derive(Clone)]
pub struct CreationSaga {
    blobs: Arc<dyn BlobStore>,
    orphans: Arc<dyn OrphanStore>,
    deadlines: Deadlines,
}

impl CreationSaga {
    pub fn new(blobs: Arc<dyn BlobStore>, orphans: Arc<dyn OrphanStore>, deadlines: Deadlines) -> Self {
        Self {
            blobs,
            orphans,
            deadlines,
        }
    }

    #[tracing::instrument(skip_all, fields(entity = target.entity()))]
    pub async fn create<T: CreationTarget>(
        &self,
        target: &T,
        payload: T::Payload,
        uploads: Vec<Upload>,
    ) -> AppResult<Created<T::Record>> {
        let key = target.natural_key(&payload);

        if let Some(missing) = uploads.iter().find(|u| u.required && u.bytes.is_empty()) {
            return Err(AppError::validation(format!("{} file is required", missing.slot)));
        }

        // Step 1: a foregone conflict must not cost any uploads
        let taken = bounded(
            self.deadlines.record,
            "natural key lookup",
            target.exists(&payload),
        )
        .await?;
        if taken {
            info!("{} {} already exists, skipping uploads", target.entity(), key);
            return Err(AppError::conflict(format!(
                "{} {} already exists",
                target.entity(),
                key
            )));
        }

        // Step 2
        let mut assets = self.upload_all(uploads).await?;

        // Step 3
        let lookup = payload.clone();
        let created = bounded(
            self.deadlines.record,
            "record creation",
            target.create_atomic(payload, &assets),
        )
        .await;

        let err = match created {
            Ok(record) => {
                assets.commit();
                info!(
                    "Created {} {} referencing {} blob(s)",
                    target.entity(),
                    key,
                    assets.blobs.len()
                );
                return Ok(Created { record, assets });
            }
            Err(err) => err,
        };

        if matches!(err, AppError::Upstream(_)) && !assets.blobs.is_empty() {
            match self.reconcile(target, &lookup, &assets).await {
                Reconciled::Landed(record) => {
                    assets.commit();
                    warn!(
                        "Creating {} {} reported failure but the record was written: {}",
                        target.entity(),
                        key,
                        err
                    );
                    return Ok(Created { record, assets });
                }
                Reconciled::Unknown => {
                    error!(
                        "Creating {} {} failed and its outcome is unknown, leaving {} upload(s) to the orphan sweep: {}",
                        target.entity(),
                        key,
                        assets.blobs.len(),
                        err
                    );
                    for blob in &assets.blobs {
                        self.record_orphan(blob).await;
                    }
                    return Err(err);
                }
                Reconciled::Absent => {}
            }
        }

        // Step 4
        warn!(
            "Creating {} {} failed, compensating {} upload(s): {}",
            target.entity(),
            key,
            assets.blobs.len(),
            err
        );
        self.compensate(&assets.blobs).await;
        Err(err)
    }

    /// Find out whether a create that reported an upstream failure actually landed
    async fn reconcile<T: CreationTarget>(
        &self,
        target: &T,
        payload: &T::Payload,
        assets: &UploadedAssets,
    ) -> Reconciled<T::Record> {
        let found = bounded(
            self.deadlines.record,
            "creation reconciliation",
            target.find_created(payload),
        )
        .await;

        match found {
            Ok(Some(record)) => {
                let referenced = target.referenced_blobs(&record);
                let ours = assets.blobs.iter().any(|b| referenced.contains(&b.blob.id));
                if ours {
                    Reconciled::Landed(record)
                } else {
                    // Someone else holds the natural key with their own blobs
                    Reconciled::Absent
                }
            }
            Ok(None) => Reconciled::Absent,
            Err(lookup_err) => {
                warn!("Reconciliation lookup failed: {}", lookup_err);
                Reconciled::Unknown
            }
        }
    }

    /// Upload everything concurrently
    ///
    /// The first required failure aborts at once: uploads that already
    /// succeeded are deleted before returning, and uploads still in flight are
    /// deleted in the background as they land. An optional failure only drops
    /// that slot.
    async fn upload_all(&self, uploads: Vec<Upload>) -> AppResult<UploadedAssets> {
        let limit = self.deadlines.blob;

        let mut in_flight: FuturesUnordered<_> = uploads
            .into_iter()
            .filter(|u| u.required || !u.bytes.is_empty())
            .map(|upload| {
                let blobs = self.blobs.clone();
                async move {
                    let kind = sniff_kind(&upload.bytes);
                    let what = format!("{} upload", upload.slot);
                    let result = bounded(limit, &what, blobs.upload(upload.bytes, kind)).await;
                    (upload.slot, upload.required, result)
                }
            })
            .collect();

        let mut assets = UploadedAssets::default();

        while let Some((slot, required, result)) = in_flight.next().await {
            match result {
                Ok(blob) => {
                    info!("Uploaded {} as blob {}", slot, blob.id);
                    assets.blobs.push(UploadedBlob {
                        slot,
                        blob,
                        state: BlobState::Pending,
                    });
                }
                Err(err) if required => {
                    error!("Required upload {} failed: {}", slot, err);
                    if !in_flight.is_empty() {
                        let saga = self.clone();
                        tokio::spawn(async move { saga.compensate_late(in_flight).await });
                    }
                    self.compensate(&assets.blobs).await;
                    return Err(err);
                }
                Err(err) => {
                    warn!("Optional upload {} failed, continuing without it: {}", slot, err);
                }
            }
        }

        Ok(assets)
    }

    /// Delete uploads that finish after the creation was already abandoned
    async fn compensate_late<S>(&self, mut in_flight: S)
    where
        S: futures::Stream<Item = UploadOutcome> + Unpin,
    {
        while let Some((slot, _, result)) = in_flight.next().await {
            if let Ok(blob) = result {
                let late = UploadedBlob {
                    slot,
                    blob,
                    state: BlobState::Pending,
                };
                self.compensate(std::slice::from_ref(&late)).await;
            }
        }
    }

    /// Delete `uploaded` newest first, one attempt each
    async fn compensate(&self, uploaded: &[UploadedBlob]) {
        for blob in uploaded.iter().rev() {
            let deleted = bounded(
                self.deadlines.blob,
                "compensating delete",
                self.blobs.delete(&blob.blob.id),
            )
            .await;

            match deleted {
                Ok(()) => info!("Compensated {} upload, deleted blob {}", blob.slot, blob.blob.id),
                Err(err) => {
                    error!(
                        "Failed to delete blob {} while compensating {} upload: {}",
                        blob.blob.id, blob.slot, err
                    );
                    self.record_orphan(blob).await;
                }
            }
        }
    }

    async fn record_orphan(&self, blob: &UploadedBlob) {
        let recorded = bounded(
            self.deadlines.record,
            "orphan bookkeeping",
            self.orphans.record_orphan(&blob.media_ref()),
        )
        .await;

        if let Err(err) = recorded {
            error!("Failed to record orphaned blob {}: {}", blob.blob.id, err);
        }
    }
}
