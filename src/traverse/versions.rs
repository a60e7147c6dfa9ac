//! Emit one stored object per version of a single path.

use anyhow::{Context, Result};

use crate::filter::ObjectFilter;
use crate::object::{EntityType, StoredObject, name_of};
use crate::remote::StoreClient;
use crate::traverse::{Preprocessor, Processor, Traverser, deliver};

pub struct VersionsTraverser<'a> {
    client: &'a dyn StoreClient,
    container: String,
    key: String,
}

impl<'a> VersionsTraverser<'a> {
    pub fn new(
        client: &'a dyn StoreClient,
        container: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            client,
            container: container.into(),
            key: key.into(),
        }
    }
}

impl Traverser for VersionsTraverser<'_> {
    fn is_directory(&self, _as_source: bool) -> Result<bool> {
        Ok(false)
    }

    fn traverse(
        &self,
        preprocessor: Option<&Preprocessor<'_>>,
        processor: &mut Processor<'_>,
        filters: &[Box<dyn ObjectFilter>],
    ) -> Result<()> {
        let versions = self
            .client
            .versions(&self.container, &self.key)
            .with_context(|| format!("Couldn't list versions of {}", self.key))?;

        let mut sink = |so: StoredObject| processor(so);
        for summary in versions {
            let mut so = StoredObject::new(EntityType::File, "");
            so.name = name_of(&self.key).to_owned();
            so.size = summary.size;
            so.last_modified = summary.last_modified;
            so.properties = summary.properties;
            so.metadata = summary.metadata;
            so.blob_type = summary.blob_type;
            so.access_tier = summary.access_tier;
            so.version_id = summary.version_id;
            so.snapshot_id = summary.snapshot_id;
            so.deleted = summary.deleted;
            so.container = Some(self.container.clone());
            deliver(preprocessor, filters, &mut sink, so)?;
        }
        Ok(())
    }
}
