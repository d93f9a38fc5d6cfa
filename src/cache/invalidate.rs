//! Invalidation.
//!
//! Entries can be removed one at a time, by predicate or pattern, in
//! named groups, or in response to a resource mutation (the
//! "wrote-to-`users/1`, drop everything about user 1" case). Registered
//! hooks observe every non-silent invalidation and run strictly before
//! the corresponding event is emitted; a failing hook is logged and
//! never breaks the cache operation.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use regex::Regex;
use uuid::Uuid;

use crate::cache::entry::CacheEntry;
use crate::cache::manager::{CacheManager, InvalidationHook};
use crate::error::{FetchError, FetchResult};
use crate::events::CacheEvent;

/// Keys or patterns cascaded to by [`InvalidateOptions::related`].
#[derive(Debug, Clone)]
pub enum Related {
    /// Regular expression applied to every cached key.
    Pattern(String),
    /// Explicit keys.
    Keys(Vec<String>),
}

/// Options for a single invalidation.
#[derive(Clone)]
pub struct InvalidateOptions<T> {
    /// Suppress hooks and events.
    pub silent: bool,
    /// Also invalidate `related` targets.
    pub cascade: bool,
    /// Targets reached when `cascade` is set.
    pub related: Option<Related>,
    /// Only invalidate when the predicate accepts the live entry.
    pub validator: Option<Arc<dyn Fn(&CacheEntry<T>) -> bool + Send + Sync>>,
}

impl<T> Default for InvalidateOptions<T> {
    fn default() -> Self {
        Self { silent: false, cascade: false, related: None, validator: None }
    }
}

/// One member of a named invalidation group.
#[derive(Debug, Clone)]
pub enum GroupTarget {
    /// An exact fingerprint.
    Key(String),
    /// A regular expression over fingerprints.
    Pattern(String),
}

/// Options for mutation-driven invalidation.
#[derive(Debug, Clone)]
pub struct MutationOptions {
    /// Invalidate only the exact `type/id` resource.
    pub exact_match: bool,
    /// Also invalidate the resource's list key (`type`).
    pub invalidate_list: bool,
    /// Invalidate everything under the resource type.
    pub invalidate_all: bool,
    /// Additional regular expressions to invalidate.
    pub related_patterns: Vec<String>,
}

impl Default for MutationOptions {
    fn default() -> Self {
        Self {
            exact_match: false,
            invalidate_list: true,
            invalidate_all: false,
            related_patterns: Vec::new(),
        }
    }
}

/// Reduce a mutation URL to its resource path: scheme and host go, a
/// leading `api` segment goes, query and trailing slashes go.
pub(crate) fn normalize_mutation_url(raw: &str) -> String {
    let path = match url::Url::parse(raw) {
        Ok(parsed) => parsed.path().to_string(),
        // Not absolute: treat as a path, dropping query and fragment.
        Err(_) => raw
            .split(|c| c == '?' || c == '#')
            .next()
            .unwrap_or("")
            .to_string(),
    };

    let trimmed = path.trim_matches('/');
    let mut segments: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
    if segments.first() == Some(&"api") {
        segments.remove(0);
    }
    segments.join("/")
}

impl<T> CacheManager<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Invalidate one fingerprint.
    ///
    /// Returns false when the entry is missing or the options validator
    /// rejects it. Hooks run before the event is emitted.
    pub fn invalidate(&self, key: &str, options: &InvalidateOptions<T>) -> bool {
        let entry = match self.cache.peek(key) {
            Some(entry) => entry,
            None => return false,
        };

        if let Some(validator) = &options.validator {
            if !validator(&entry) {
                return false;
            }
        }

        self.cache.delete(key);
        self.mirror_delete(key);

        if !options.silent {
            self.run_hooks(key, &entry);
            self.events.emit(&CacheEvent::CacheInvalidate {
                key: key.to_string(),
                entry: Box::new(entry),
            });
        }

        if options.cascade {
            if let Some(related) = &options.related {
                let nested = InvalidateOptions {
                    silent: options.silent,
                    ..InvalidateOptions::default()
                };
                match related {
                    Related::Pattern(pattern) => match Regex::new(pattern) {
                        Ok(regex) => {
                            self.invalidate_by_pattern(&regex, &nested);
                        }
                        Err(err) => {
                            log::warn!("bad cascade pattern '{}': {}", pattern, err);
                        }
                    },
                    Related::Keys(keys) => {
                        for related_key in keys {
                            self.invalidate(related_key, &nested);
                        }
                    }
                }
            }
        }

        true
    }

    /// Invalidate every key accepted by `predicate`. Returns the count.
    pub fn invalidate_matching<P>(&self, predicate: P, options: &InvalidateOptions<T>) -> usize
    where
        P: Fn(&str) -> bool,
    {
        let matching: Vec<String> =
            self.cache.keys().into_iter().filter(|key| predicate(key)).collect();

        let mut count = 0;
        for key in matching {
            if self.invalidate(&key, options) {
                count += 1;
            }
        }
        count
    }

    /// Invalidate every key matching `pattern`. Returns the count.
    pub fn invalidate_by_pattern(&self, pattern: &Regex, options: &InvalidateOptions<T>) -> usize {
        self.invalidate_matching(|key| pattern.is_match(key), options)
    }

    /// Invalidate the cache entries affected by a mutation of
    /// `mutation_url`.
    ///
    /// The URL is normalized to `type[/id[/...]]`. With an id and
    /// default options this removes `type/id`, the `type` list key, and
    /// everything nested under `type/id/`. `invalidate_all` widens to
    /// the whole resource type. `exact_match` narrows to the single
    /// resource and conflicts with `invalidate_all`.
    pub fn invalidate_after_mutation(
        &self,
        mutation_url: &str,
        options: &MutationOptions,
    ) -> FetchResult<usize> {
        if options.exact_match && options.invalidate_all {
            return Err(FetchError::Unknown(
                "invalidate_after_mutation: exact_match and invalidate_all are mutually exclusive"
                    .to_string(),
            ));
        }

        let normalized = normalize_mutation_url(mutation_url);
        let mut segments = normalized.split('/').filter(|s| !s.is_empty());
        let resource_type = match segments.next() {
            Some(segment) => segment.to_string(),
            None => return Ok(0),
        };
        let resource_id = segments.next().map(str::to_string);

        let plain = InvalidateOptions::default();
        let mut count = 0;
        let mut patterns: Vec<String> = Vec::new();

        match (&resource_id, options.exact_match, options.invalidate_all) {
            (Some(id), true, _) => {
                if self.invalidate(&format!("{}/{}", resource_type, id), &plain) {
                    count += 1;
                }
            }
            (_, _, true) => {
                patterns.push(format!("^{}", regex::escape(&resource_type)));
            }
            (Some(id), false, false) => {
                if self.invalidate(&format!("{}/{}", resource_type, id), &plain) {
                    count += 1;
                }
                if options.invalidate_list && self.invalidate(&resource_type, &plain) {
                    count += 1;
                }
                patterns.push(format!(
                    "^{}/{}/",
                    regex::escape(&resource_type),
                    regex::escape(id)
                ));
            }
            (None, _, false) => {
                if self.invalidate(&resource_type, &plain) {
                    count += 1;
                }
                patterns.push(format!("^{}/", regex::escape(&resource_type)));
            }
        }

        patterns.extend(options.related_patterns.iter().cloned());

        for pattern in patterns {
            match Regex::new(&pattern) {
                Ok(regex) => count += self.invalidate_by_pattern(&regex, &plain),
                Err(err) => log::warn!("bad mutation pattern '{}': {}", pattern, err),
            }
        }

        Ok(count)
    }

    /// Name a batch of keys and patterns for one-call invalidation.
    pub fn register_invalidation_group(&self, name: &str, targets: Vec<GroupTarget>) {
        self.groups.insert(name.to_string(), targets);
    }

    /// Invalidate a registered group. Returns the number of entries
    /// removed; an unknown group removes nothing.
    pub fn invalidate_group(&self, name: &str) -> usize {
        let targets = match self.groups.get(name) {
            Some(targets) => targets.clone(),
            None => return 0,
        };

        let plain = InvalidateOptions::default();
        let mut count = 0;
        for target in targets {
            match target {
                GroupTarget::Key(key) => {
                    if self.invalidate(&key, &plain) {
                        count += 1;
                    }
                }
                GroupTarget::Pattern(pattern) => match Regex::new(&pattern) {
                    Ok(regex) => count += self.invalidate_by_pattern(&regex, &plain),
                    Err(err) => log::warn!("bad group pattern '{}': {}", pattern, err),
                },
            }
        }

        self.events
            .emit(&CacheEvent::GroupInvalidated { name: name.to_string(), count });
        count
    }

    /// Register an invalidation hook. Returns its id.
    pub fn on_invalidate<F>(&self, hook: F) -> Uuid
    where
        F: Fn(&str, &CacheEntry<T>) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.hooks.write().push((id, Arc::new(hook)));
        id
    }

    /// Remove a hook by id. Returns whether it existed.
    pub fn remove_invalidation_hook(&self, id: Uuid) -> bool {
        let mut hooks = self.hooks.write();
        let before = hooks.len();
        hooks.retain(|(hook_id, _)| *hook_id != id);
        hooks.len() != before
    }

    /// Drop every registered hook.
    pub fn clear_invalidation_hooks(&self) {
        self.hooks.write().clear();
    }

    fn run_hooks(&self, key: &str, entry: &CacheEntry<T>) {
        let hooks: Vec<InvalidationHook<T>> =
            self.hooks.read().iter().map(|(_, hook)| Arc::clone(hook)).collect();
        for hook in hooks {
            if catch_unwind(AssertUnwindSafe(|| hook(key, entry))).is_err() {
                log::error!("invalidation hook panicked for '{}'", key);
            }
        }
    }
}
