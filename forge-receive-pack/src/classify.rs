//! Sorting ref updates into branch/tag/other × created/deleted/updated/forced buckets.

use crate::git::{GitReader, ReadParams};
use crate::refs::{RefType, RefUpdate};

/// What a single ref update does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Delete,
    Update,
    /// An update whose new tip does not descend from the old one.
    UpdateForce,
}

impl Action {
    /// Decide the action of `update` given its force flag.
    pub fn of(update: &RefUpdate, forced: bool) -> Self {
        match (update.is_create(), update.is_delete()) {
            (true, _) => Action::Create,
            (_, true) => Action::Delete,
            _ if forced => Action::UpdateForce,
            _ => Action::Update,
        }
    }
}

/// The four buckets of one ref category, each in push order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    pub created: Vec<RefUpdate>,
    pub deleted: Vec<RefUpdate>,
    pub updated: Vec<RefUpdate>,
    pub forced: Vec<RefUpdate>,
}

impl Changes {
    fn push(&mut self, action: Action, update: RefUpdate) {
        match action {
            Action::Create => self.created.push(update),
            Action::Delete => self.deleted.push(update),
            Action::Update => self.updated.push(update),
            Action::UpdateForce => self.forced.push(update),
        }
    }

    /// The bucket holding updates of `action`.
    pub fn bucket(&self, action: Action) -> &[RefUpdate] {
        match action {
            Action::Create => &self.created,
            Action::Delete => &self.deleted,
            Action::Update => &self.updated,
            Action::UpdateForce => &self.forced,
        }
    }

    /// All updates of this category.
    pub fn iter(&self) -> impl Iterator<Item = &RefUpdate> {
        self.created
            .iter()
            .chain(&self.deleted)
            .chain(&self.updated)
            .chain(&self.forced)
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.deleted.len() + self.updated.len() + self.forced.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A push's ref updates, classified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangedRefs {
    pub branches: Changes,
    pub tags: Changes,
    pub other: Changes,
}

impl ChangedRefs {
    /// Total number of updates across all categories.
    pub fn len(&self) -> usize {
        self.branches.len() + self.tags.len() + self.other.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Short branch names of `action`, sorted so rule output is deterministic.
    pub fn branch_names(&self, action: Action) -> Vec<String> {
        let mut names: Vec<String> = self
            .branches
            .bucket(action)
            .iter()
            .filter_map(|u| u.branch_name().map(ToOwned::to_owned))
            .collect();
        names.sort();
        names
    }
}

/// Classify `updates`, where `forced[i]` tells whether `updates[i]` is a force update.
///
/// Missing force flags count as `false`.
pub fn classify(updates: &[RefUpdate], forced: &[bool]) -> ChangedRefs {
    let mut changes = ChangedRefs::default();
    for (idx, update) in updates.iter().enumerate() {
        let action = Action::of(update, forced.get(idx).copied().unwrap_or(false));
        let bucket = match update.ref_type() {
            RefType::Branch => &mut changes.branches,
            RefType::Tag => &mut changes.tags,
            RefType::Other => &mut changes.other,
        };
        bucket.push(action, update.clone());
    }
    changes
}

/// Determine force flags for all `updates`, probing ancestry only for branch updates.
pub async fn force_flags(reader: &dyn GitReader, params: &ReadParams, updates: &[RefUpdate]) -> Vec<bool> {
    let mut flags = Vec::with_capacity(updates.len());
    for update in updates {
        let probe = update.ref_type() == RefType::Branch && !update.is_create() && !update.is_delete();
        flags.push(probe && is_forced(reader, params, update).await);
    }
    flags
}

/// Whether `update` moves its ref to a commit that does not descend from the old tip.
///
/// A failing probe counts as forced.
pub async fn is_forced(reader: &dyn GitReader, params: &ReadParams, update: &RefUpdate) -> bool {
    match reader.is_ancestor(params, update.old, update.new).await {
        Ok(is_ancestor) => !is_ancestor,
        Err(err) => {
            tracing::warn!(ref_name = %update.name, error = %err, "ancestry probe failed, treating update as forced");
            true
        }
    }
}
