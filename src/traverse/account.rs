//! Fan a traversal out across every container an account holds.

use std::sync::Once;

use anyhow::Result;
use crossbeam_channel::Sender;
use tracing::{info, warn};

use super::store::StoreTraverser;
use crate::filter::{ObjectFilter, wildcard_matcher};
use crate::object::StoredObject;
use crate::pool::{CancelToken, enumeration_workers};
use crate::remote::{ListInclude, StoreClient};
use crate::traverse::{EnumerationFailure, Preprocessor, Processor, Traverser};

static NON_REGIONAL_WARNING: Once = Once::new();

pub struct AccountTraverser<'a> {
    client: &'a dyn StoreClient,
    /// Only kept to grumble about endpoints that aren't region-qualified.
    host: String,
    /// Optional wildcard over container names.
    pattern: Option<String>,
    include: ListInclude,
    include_stubs: bool,
    preserve_tags: bool,
    workers: usize,
    cancel: CancelToken,
    errors: Option<Sender<EnumerationFailure>>,
}

impl<'a> AccountTraverser<'a> {
    pub fn new(client: &'a dyn StoreClient, host: impl Into<String>) -> Self {
        Self {
            client,
            host: host.into(),
            pattern: None,
            include: ListInclude::default(),
            include_stubs: false,
            preserve_tags: false,
            workers: enumeration_workers(),
            cancel: CancelToken::new(),
            errors: None,
        }
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn include(mut self, include: ListInclude) -> Self {
        self.include = include;
        self
    }

    pub fn include_directory_stubs(mut self, include_stubs: bool) -> Self {
        self.include_stubs = include_stubs;
        self
    }

    pub fn preserve_tags(mut self, preserve_tags: bool) -> Self {
        self.preserve_tags = preserve_tags;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn error_channel(mut self, errors: Sender<EnumerationFailure>) -> Self {
        self.errors = Some(errors);
        self
    }
}

impl Traverser for AccountTraverser<'_> {
    fn is_directory(&self, _as_source: bool) -> Result<bool> {
        Ok(true)
    }

    fn traverse(
        &self,
        preprocessor: Option<&Preprocessor<'_>>,
        processor: &mut Processor<'_>,
        filters: &[Box<dyn ObjectFilter>],
    ) -> Result<()> {
        if !self.host.contains('.') {
            NON_REGIONAL_WARNING.call_once(|| {
                warn!(
                    "{} doesn't look like a region-qualified endpoint; \
                     listings may be slower and cost more",
                    self.host
                );
            });
        }

        let matcher = self
            .pattern
            .as_deref()
            .map(wildcard_matcher)
            .transpose()?;

        for container in self.client.containers()? {
            if self.cancel.is_cancelled() {
                break;
            }
            if let Some(matcher) = &matcher {
                if !matcher.is_match(&container) {
                    continue;
                }
            }
            info!("scanning container {container}");

            // Every object this sub-traversal produces belongs to this
            // container; stamp it before any caller-supplied morphing.
            let stamped = container.clone();
            let stamp = move |so: &mut StoredObject| {
                so.container = Some(stamped.clone());
                if let Some(outer) = preprocessor {
                    outer(so);
                }
            };

            let mut sub = StoreTraverser::new(self.client, container.clone(), "")
                .include(self.include)
                .include_directory_stubs(self.include_stubs)
                .preserve_tags(self.preserve_tags)
                .workers(self.workers)
                .cancel(self.cancel.clone());
            if let Some(errors) = &self.errors {
                sub = sub.error_channel(errors.clone());
            }
            sub.traverse(Some(&stamp), processor, filters)?;
        }
        Ok(())
    }
}
