//! Revision files and migration targets.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use super::MigrationError;

/// Opaque revision identifier, ordered by its position in a [`RevisionSet`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevisionId(pub String);

impl RevisionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RevisionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One schema revision with its forward and reverse SQL.
#[derive(Debug, Clone)]
pub struct Revision {
    pub id: RevisionId,
    pub slug: String,
    pub up: String,
    pub down: String,
}

impl Revision {
    pub fn new(id: &str, slug: &str, up: &str, down: &str) -> Self {
        Self {
            id: RevisionId::from(id),
            slug: slug.to_string(),
            up: up.to_string(),
            down: down.to_string(),
        }
    }
}

/// Linear, ordered revision history.
#[derive(Debug, Clone, Default)]
pub struct RevisionSet {
    revisions: Vec<Revision>,
}

impl RevisionSet {
    /// Build a set from revisions already in authored order.
    pub fn new(revisions: Vec<Revision>) -> Result<Self, MigrationError> {
        for (i, rev) in revisions.iter().enumerate() {
            if revisions[..i].iter().any(|r| r.id == rev.id) {
                return Err(MigrationError::InvalidRevisionSet(format!(
                    "duplicate revision id {}",
                    rev.id
                )));
            }
        }
        Ok(Self { revisions })
    }

    /// Revisions compiled into this binary. Their head is the revision every
    /// runtime process expects the store to be at.
    pub fn embedded() -> Self {
        Self {
            revisions: vec![
                Revision::new(
                    "0001",
                    "work_units",
                    include_str!("../../migrations/0001_work_units.up.sql"),
                    include_str!("../../migrations/0001_work_units.down.sql"),
                ),
                Revision::new(
                    "0002",
                    "attempts_and_dedupe",
                    include_str!("../../migrations/0002_attempts_and_dedupe.up.sql"),
                    include_str!("../../migrations/0002_attempts_and_dedupe.down.sql"),
                ),
            ],
        }
    }

    /// Load `<id>_<slug>.up.sql` / `<id>_<slug>.down.sql` pairs from `dir`,
    /// ordered by id.
    pub fn from_dir(dir: &Path) -> Result<Self, MigrationError> {
        let mut ups: Vec<(String, String, String)> = Vec::new();
        let mut downs: Vec<(String, String)> = Vec::new();

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let (stem, is_up) = if let Some(stem) = name.strip_suffix(".up.sql") {
                (stem, true)
            } else if let Some(stem) = name.strip_suffix(".down.sql") {
                (stem, false)
            } else {
                continue;
            };
            let Some((id, slug)) = stem.split_once('_') else {
                return Err(MigrationError::InvalidRevisionSet(format!(
                    "revision file {name} does not match <id>_<slug>"
                )));
            };
            let sql = fs::read_to_string(&path)?;
            if is_up {
                ups.push((id.to_string(), slug.to_string(), sql));
            } else {
                downs.push((id.to_string(), sql));
            }
        }

        ups.sort_by(|a, b| a.0.cmp(&b.0));

        let mut revisions = Vec::with_capacity(ups.len());
        for (id, slug, up) in ups {
            let idx = downs
                .iter()
                .position(|(d, _)| *d == id)
                .ok_or_else(|| {
                    MigrationError::InvalidRevisionSet(format!("revision {id} has no down script"))
                })?;
            let (_, down) = downs.swap_remove(idx);
            revisions.push(Revision::new(&id, &slug, &up, &down));
        }
        if let Some((id, _)) = downs.first() {
            return Err(MigrationError::InvalidRevisionSet(format!(
                "revision {id} has no up script"
            )));
        }

        Self::new(revisions)
    }

    pub fn revisions(&self) -> &[Revision] {
        &self.revisions
    }

    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    /// The latest revision, if any.
    pub fn head(&self) -> Option<&RevisionId> {
        self.revisions.last().map(|r| &r.id)
    }

    /// Position of `id` in the history.
    pub fn position(&self, id: &RevisionId) -> Option<usize> {
        self.revisions.iter().position(|r| &r.id == id)
    }

    pub fn get(&self, idx: usize) -> Option<&Revision> {
        self.revisions.get(idx)
    }
}

/// Where a migration should stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The latest revision.
    Head,
    /// Nothing applied.
    Base,
    /// A specific revision.
    Revision(RevisionId),
    /// A number of steps relative to the current revision.
    Relative(i64),
}

impl FromStr for Target {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "" => Err(MigrationError::InvalidTarget("empty target".to_string())),
            "head" | "heads" => Ok(Self::Head),
            "base" => Ok(Self::Base),
            _ if s.starts_with('+') || s.starts_with('-') => s
                .parse::<i64>()
                .map(Self::Relative)
                .map_err(|_| MigrationError::InvalidTarget(s.to_string())),
            _ => Ok(Self::Revision(RevisionId::from(s))),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Head => f.write_str("head"),
            Self::Base => f.write_str("base"),
            Self::Revision(id) => write!(f, "{id}"),
            Self::Relative(n) => write!(f, "{n:+}"),
        }
    }
}
