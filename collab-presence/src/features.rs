//! Statically declared collaboration features.
//!
//! The enabled set is declared in [`CollabConfig`](crate::config::CollabConfig)
//! and resolved once when a session starts. Nothing probes for optional
//! features at runtime.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CollabError;

/// A collaboration capability that can be switched on for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollabFeature {
    /// Room membership, join/leave announcements, heartbeats.
    Presence,
    /// Debounced remote cursor broadcasting.
    Cursors,
    /// Advisory edit-conflict detection on focus/blur/click.
    EditConflicts,
}

impl CollabFeature {
    pub const ALL: [CollabFeature; 3] = [
        CollabFeature::Presence,
        CollabFeature::Cursors,
        CollabFeature::EditConflicts,
    ];

    /// Features that must be enabled before this one.
    pub fn requires(self) -> &'static [CollabFeature] {
        match self {
            CollabFeature::Presence => &[],
            CollabFeature::Cursors | CollabFeature::EditConflicts => &[CollabFeature::Presence],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CollabFeature::Presence => "presence",
            CollabFeature::Cursors => "cursors",
            CollabFeature::EditConflicts => "edit_conflicts",
        }
    }
}

impl fmt::Display for CollabFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated feature list in dependency order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSet {
    ordered: Vec<CollabFeature>,
}

impl FeatureSet {
    /// Validate `declared` and order it so every feature follows its
    /// dependencies. Duplicates are collapsed.
    pub fn resolve(declared: &[CollabFeature]) -> Result<Self, CollabError> {
        for feature in declared {
            for dep in feature.requires() {
                if !declared.contains(dep) {
                    return Err(CollabError::MissingFeatureDependency {
                        feature: *feature,
                        requires: *dep,
                    });
                }
            }
        }

        let mut ordered: Vec<CollabFeature> = Vec::with_capacity(declared.len());
        // Dependency depth is at most one, so a stable sort on depth is enough.
        let mut pending: Vec<CollabFeature> = declared.to_vec();
        pending.sort_by_key(|f| (f.requires().len(), *f));
        for feature in pending {
            if !ordered.contains(&feature) {
                ordered.push(feature);
            }
        }

        Ok(Self { ordered })
    }

    /// Every feature, in dependency order.
    pub fn all() -> Self {
        Self {
            ordered: CollabFeature::ALL.to_vec(),
        }
    }

    pub fn is_enabled(&self, feature: CollabFeature) -> bool {
        self.ordered.contains(&feature)
    }

    pub fn iter(&self) -> impl Iterator<Item = CollabFeature> + '_ {
        self.ordered.iter().copied()
    }
}

impl Default for FeatureSet {
    fn default() -> Self {
        Self::all()
    }
}
