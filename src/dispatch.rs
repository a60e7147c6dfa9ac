//! Batch decided work into fixed-size parts for the external transfer
//! engine.
//!
//! The engine is a collaborator behind [`TransferEngine`]; this adapter owns
//! part numbering and the flush rules: non-final parts as batches fill up,
//! copies before deletes in mixed jobs, and always a final part - even an
//! empty one - so the engine can close the job cleanly.

use std::mem;

use anyhow::Result;
use jiff::Timestamp;
use serde_derive::{Deserialize, Serialize};
use tracing::debug;

use crate::config::DeleteDestination;
use crate::counters::{self, Op};
use crate::errors::Error;
use crate::location::combine;
use crate::object::{BlobType, EntityType, ObjectProperties, StoredObject};
use crate::sync::Decision;

/// Copy parts can be big; the engine chews them incrementally anyway.
pub const COPY_PART_SIZE: usize = 10_000;

/// Deletions get smaller parts so they start promptly.
pub const DELETE_PART_SIZE: usize = 1_000;

/// Source/destination pairing for one job, as the engine names them.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum FromTo {
    #[default]
    LocalStore,
    StoreLocal,
    LocalShare,
    ShareLocal,
    StoreStore,
    ShareShare,
    LocalLocal,
    StoreTrash,
    ShareTrash,
    LocalTrash,
}

/// One scheduled transfer, §6.1-shaped.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferItem {
    pub source: String,
    pub destination: String,
    pub entity_type: EntityType,
    pub source_size: u64,
    pub last_modified: Option<Timestamp>,
    pub properties: ObjectProperties,
    pub metadata: std::collections::BTreeMap<String, String>,
    pub blob_type: Option<BlobType>,
    pub blob_tier: Option<String>,
    pub blob_tags: std::collections::BTreeMap<String, String>,
    pub version_id: Option<String>,
    pub snapshot_id: Option<String>,
}

impl TransferItem {
    pub fn from_object(so: &StoredObject, source: String, destination: String) -> Self {
        Self {
            source,
            destination,
            entity_type: so.entity_type,
            source_size: so.size,
            last_modified: so.last_modified,
            properties: so.properties.clone(),
            metadata: so.metadata.clone(),
            blob_type: so.blob_type,
            blob_tier: so.access_tier.clone(),
            blob_tags: so.blob_tags.clone(),
            version_id: so.version_id.clone(),
            snapshot_id: so.snapshot_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartRequest {
    pub job_id: String,
    pub part_number: u32,
    pub is_final: bool,
    pub from_to: FromTo,
    pub source_root: String,
    pub destination_root: String,
    pub transfers: Vec<TransferItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartResponse {
    pub job_started: bool,
    pub error_message: Option<String>,
}

/// `Send` so a dispatcher can ride along inside a traverser's processor.
pub trait TransferEngine: Send {
    fn submit_part(&mut self, part: PartRequest) -> PartResponse;
}

/// Asked once per deletion candidate when `deleteDestination = Prompt`.
pub trait DeletePrompter: Send {
    fn confirm(&mut self, destination: &str) -> bool;
}

/// An engine that just remembers what it was given.
///
/// Great for testing
#[derive(Debug, Default)]
pub struct RecordingEngine {
    pub parts: Vec<PartRequest>,
    /// Reject everything from this part number on, if set.
    pub reject_from: Option<u32>,
}

impl TransferEngine for RecordingEngine {
    fn submit_part(&mut self, part: PartRequest) -> PartResponse {
        if self.reject_from.is_some_and(|from| part.part_number >= from) {
            return PartResponse {
                job_started: false,
                error_message: Some("rejected by test engine".to_owned()),
            };
        }
        self.parts.push(part);
        PartResponse {
            job_started: true,
            error_message: None,
        }
    }
}

pub struct Dispatcher<'a> {
    engine: &'a mut dyn TransferEngine,
    job_id: String,
    from_to: FromTo,
    source_root: String,
    destination_root: String,
    copy_part_size: usize,
    delete_part_size: usize,
    delete_mode: DeleteDestination,
    prompter: Option<&'a mut dyn DeletePrompter>,
    copies: Vec<TransferItem>,
    deletes: Vec<TransferItem>,
    part_number: u32,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        engine: &'a mut dyn TransferEngine,
        job_id: impl Into<String>,
        from_to: FromTo,
        source_root: impl Into<String>,
        destination_root: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            job_id: job_id.into(),
            from_to,
            source_root: source_root.into(),
            destination_root: destination_root.into(),
            copy_part_size: COPY_PART_SIZE,
            delete_part_size: DELETE_PART_SIZE,
            delete_mode: DeleteDestination::True,
            prompter: None,
            copies: Vec::new(),
            deletes: Vec::new(),
            part_number: 0,
        }
    }

    pub fn part_sizes(mut self, copy: usize, delete: usize) -> Self {
        self.copy_part_size = copy.max(1);
        self.delete_part_size = delete.max(1);
        self
    }

    pub fn delete_mode(mut self, mode: DeleteDestination) -> Self {
        self.delete_mode = mode;
        self
    }

    pub fn prompter(mut self, prompter: &'a mut dyn DeletePrompter) -> Self {
        self.prompter = Some(prompter);
        self
    }

    /// Turn one sync decision into a scheduled transfer.
    pub fn decide(&mut self, decision: Decision) -> Result<()> {
        match decision {
            Decision::Copy(so) | Decision::MetadataOnly(so) => {
                let rel = so.relative_path.as_str();
                let item = TransferItem::from_object(
                    &so,
                    combine(&self.source_root, rel),
                    combine(&self.destination_root, rel),
                );
                self.schedule_copy(item)
            }
            Decision::Delete(so) => {
                let destination = combine(&self.destination_root, &so.relative_path);
                if self.delete_mode == DeleteDestination::Prompt {
                    let confirmed = self
                        .prompter
                        .as_mut()
                        .map(|p| p.confirm(&destination))
                        .unwrap_or(false);
                    if !confirmed {
                        debug!("skipping deletion of {destination}");
                        return Ok(());
                    }
                }
                let item = TransferItem::from_object(&so, destination.clone(), destination);
                self.schedule_delete(item)
            }
        }
    }

    pub fn schedule_copy(&mut self, item: TransferItem) -> Result<()> {
        self.copies.push(item);
        if self.copies.len() >= self.copy_part_size {
            let batch = mem::take(&mut self.copies);
            self.flush(batch, false)?;
        }
        Ok(())
    }

    pub fn schedule_delete(&mut self, item: TransferItem) -> Result<()> {
        self.deletes.push(item);
        if self.deletes.len() >= self.delete_part_size {
            let batch = mem::take(&mut self.deletes);
            self.flush(batch, false)?;
        }
        Ok(())
    }

    /// Enumeration is over: flush what's left and close the job with a
    /// final part. The final part always goes, even empty, so the engine
    /// sees `is_final` exactly once.
    pub fn close(mut self) -> Result<u32> {
        let copies = mem::take(&mut self.copies);
        let deletes = mem::take(&mut self.deletes);
        if deletes.is_empty() {
            self.flush(copies, true)?;
        } else {
            if !copies.is_empty() {
                self.flush(copies, false)?;
            }
            self.flush(deletes, true)?;
        }
        Ok(self.part_number)
    }

    fn flush(&mut self, transfers: Vec<TransferItem>, is_final: bool) -> Result<()> {
        let part_number = self.part_number;
        debug!(
            "submitting part {part_number} ({} transfers{})",
            transfers.len(),
            if is_final { ", final" } else { "" }
        );
        let response = self.engine.submit_part(PartRequest {
            job_id: self.job_id.clone(),
            part_number,
            is_final,
            from_to: self.from_to,
            source_root: self.source_root.clone(),
            destination_root: self.destination_root.clone(),
            transfers,
        });
        counters::bump(Op::PartsSubmitted);
        if !response.job_started {
            return Err(Error::DispatchRejected {
                part: part_number,
                message: response.error_message.unwrap_or_default(),
            }
            .into());
        }
        self.part_number += 1;
        Ok(())
    }
}
