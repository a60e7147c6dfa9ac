//! Dry-run output: say what a job would do without doing any of it.
//!
//! Two formats: one-line text for humans, and a JSON surrogate whose field
//! names are stable, machine-parsed API. The JSON is bidirectional - every
//! emitted object parses back into a structurally equal [`DryrunTransfer`].

use std::collections::BTreeMap;
use std::io::Write;

use anyhow::{Context, Result};
use serde_derive::{Deserialize, Serialize};

use crate::dispatch::FromTo;
use crate::location::combine;
use crate::object::{BlobType, EntityType};
use crate::sync::Decision;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DryrunFormat {
    Text,
    Json,
}

/// The persisted surrogate. Enum-typed fields render as their canonical
/// names and parse case-sensitively; serde holds up both ends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DryrunTransfer {
    #[serde(rename = "EntityType")]
    pub entity_type: EntityType,
    #[serde(rename = "BlobType", skip_serializing_if = "Option::is_none", default)]
    pub blob_type: Option<BlobType>,
    #[serde(rename = "FromTo")]
    pub from_to: FromTo,
    #[serde(rename = "Source")]
    pub source: String,
    #[serde(rename = "Destination")]
    pub destination: String,
    #[serde(rename = "SourceSize", skip_serializing_if = "is_zero", default)]
    pub source_size: u64,
    #[serde(rename = "ContentType", skip_serializing_if = "Option::is_none", default)]
    pub content_type: Option<String>,
    #[serde(
        rename = "ContentEncoding",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub content_encoding: Option<String>,
    #[serde(
        rename = "ContentDisposition",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub content_disposition: Option<String>,
    #[serde(
        rename = "ContentLanguage",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub content_language: Option<String>,
    #[serde(rename = "CacheControl", skip_serializing_if = "Option::is_none", default)]
    pub cache_control: Option<String>,
    #[serde(
        rename = "ContentMD5",
        with = "md5_base64",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub content_md5: Option<Vec<u8>>,
    #[serde(rename = "BlobTags")]
    pub blob_tags: BTreeMap<String, String>,
    #[serde(rename = "Metadata")]
    pub metadata: BTreeMap<String, String>,
    #[serde(rename = "BlobTier", skip_serializing_if = "Option::is_none", default)]
    pub blob_tier: Option<String>,
    #[serde(rename = "BlobVersion", skip_serializing_if = "Option::is_none", default)]
    pub blob_version: Option<String>,
    #[serde(
        rename = "BlobSnapshotID",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub blob_snapshot_id: Option<String>,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

mod md5_base64 {
    use data_encoding::BASE64;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        // skip_serializing_if keeps None out of here.
        let bytes = bytes.as_deref().unwrap_or_default();
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let s = Option::<String>::deserialize(deserializer)?;
        s.map(|s| BASE64.decode(s.as_bytes()).map_err(D::Error::custom))
            .transpose()
    }
}

impl DryrunTransfer {
    /// Build the surrogate for one decision, resolving relative paths
    /// against the job's roots.
    pub fn from_decision(
        decision: &Decision,
        from_to: FromTo,
        source_root: &str,
        destination_root: &str,
    ) -> Self {
        let (so, source, destination) = match decision {
            Decision::Copy(so) | Decision::MetadataOnly(so) => (
                so,
                combine(source_root, &so.relative_path),
                combine(destination_root, &so.relative_path),
            ),
            Decision::Delete(so) => {
                let gone = combine(destination_root, &so.relative_path);
                (so, gone.clone(), gone)
            }
        };
        Self {
            entity_type: so.entity_type,
            blob_type: so.blob_type,
            from_to,
            source,
            destination,
            source_size: so.size,
            content_type: so.properties.content_type.clone(),
            content_encoding: so.properties.content_encoding.clone(),
            content_disposition: so.properties.content_disposition.clone(),
            content_language: so.properties.content_language.clone(),
            cache_control: so.properties.cache_control.clone(),
            content_md5: so.properties.content_md5.clone(),
            blob_tags: so.blob_tags.clone(),
            metadata: so.metadata.clone(),
            blob_tier: so.access_tier.clone(),
            blob_version: so.version_id.clone(),
            blob_snapshot_id: so.snapshot_id.clone(),
        }
    }
}

/// Streams dry-run lines for every decision it's handed.
pub struct DryrunWriter<'a> {
    format: DryrunFormat,
    out: &'a mut dyn Write,
    from_to: FromTo,
    source_root: String,
    destination_root: String,
}

impl<'a> DryrunWriter<'a> {
    pub fn new(
        format: DryrunFormat,
        out: &'a mut dyn Write,
        from_to: FromTo,
        source_root: impl Into<String>,
        destination_root: impl Into<String>,
    ) -> Self {
        Self {
            format,
            out,
            from_to,
            source_root: source_root.into(),
            destination_root: destination_root.into(),
        }
    }

    pub fn emit(&mut self, decision: &Decision) -> Result<()> {
        match self.format {
            DryrunFormat::Text => {
                let line = text_line(decision, &self.source_root, &self.destination_root);
                writeln!(self.out, "{line}").context("Couldn't write dry-run line")
            }
            DryrunFormat::Json => {
                let transfer = DryrunTransfer::from_decision(
                    decision,
                    self.from_to,
                    &self.source_root,
                    &self.destination_root,
                );
                serde_json::to_writer(&mut *self.out, &transfer)
                    .context("Couldn't write dry-run JSON")?;
                writeln!(self.out).context("Couldn't write dry-run JSON")
            }
        }
    }
}

fn text_line(decision: &Decision, source_root: &str, destination_root: &str) -> String {
    match decision {
        Decision::Copy(so) => format!(
            "DRYRUN: copy {} to {}",
            combine(source_root, &so.relative_path),
            combine(destination_root, &so.relative_path),
        ),
        Decision::MetadataOnly(so) => format!(
            "DRYRUN: set-properties {}",
            combine(source_root, &so.relative_path),
        ),
        Decision::Delete(so) => format!(
            "DRYRUN: remove {}",
            combine(destination_root, &so.relative_path),
        ),
    }
}
