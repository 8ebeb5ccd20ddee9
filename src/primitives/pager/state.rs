use std::collections::BTreeMap;

use serde::Serialize;

use super::page::Page;

/// Lifecycle of a vnode pager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Uninitialized,
    Attaching,
    Valid { revoked: bool },
    Dying { relkill: bool },
}

/// Externally visible phase of a pager, derived from its lifecycle and refs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PagerPhase {
    /// Never attached, or fully torn down.
    Uninitialized,
    /// First attach is querying the file size.
    Attaching,
    /// Valid and referenced.
    Active,
    /// Valid, unreferenced, kept for quick reattachment.
    Persisting,
    /// Being torn down.
    Dying,
    /// Backing file terminated while references remain; all I/O fails.
    Revoked,
}

impl PagerPhase {
    /// Lowercase name of the phase.
    pub fn as_str(self) -> &'static str {
        match self {
            PagerPhase::Uninitialized => "uninitialized",
            PagerPhase::Attaching => "attaching",
            PagerPhase::Active => "active",
            PagerPhase::Persisting => "persisting",
            PagerPhase::Dying => "dying",
            PagerPhase::Revoked => "revoked",
        }
    }
}

/// Everything guarded by a pager's object lock.
pub(crate) struct ObjectState {
    pub lifecycle: Lifecycle,
    pub can_persist: bool,
    pub writeable: bool,
    pub iosync: bool,
    pub iosync_wanted: bool,
    /// A terminate holding the file lock is draining this pager.
    pub terminating: bool,
    pub refs: u32,
    pub size: u64,
    pub nio: u32,
    pub generation: u64,
    pub pages: BTreeMap<u64, Page>,
}

impl ObjectState {
    pub fn new() -> Self {
        Self {
            lifecycle: Lifecycle::Uninitialized,
            can_persist: false,
            writeable: false,
            iosync: false,
            iosync_wanted: false,
            terminating: false,
            refs: 0,
            size: 0,
            nio: 0,
            generation: 0,
            pages: BTreeMap::new(),
        }
    }

    /// Valid from initialisation until teardown completes, including while dying.
    pub fn is_valid(&self) -> bool {
        matches!(
            self.lifecycle,
            Lifecycle::Valid { .. } | Lifecycle::Dying { .. }
        )
    }

    /// Attach must wait while the pager is being set up or torn down.
    pub fn is_blocked(&self) -> bool {
        matches!(
            self.lifecycle,
            Lifecycle::Attaching | Lifecycle::Dying { .. }
        )
    }

    pub fn is_dying(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Dying { .. })
    }

    pub fn is_revoked(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Valid { revoked: true })
    }

    pub fn relkill(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Dying { relkill: true })
    }

    /// Back to the never-attached state; resident pages must already be gone.
    pub fn reset(&mut self) {
        debug_assert!(self.pages.is_empty(), "reset with resident pages");
        self.lifecycle = Lifecycle::Uninitialized;
        self.can_persist = false;
        self.writeable = false;
        self.iosync = false;
        self.iosync_wanted = false;
        self.terminating = false;
        self.refs = 0;
        self.nio = 0;
    }

    pub fn phase(&self) -> PagerPhase {
        match self.lifecycle {
            Lifecycle::Uninitialized => PagerPhase::Uninitialized,
            Lifecycle::Attaching => PagerPhase::Attaching,
            Lifecycle::Dying { .. } => PagerPhase::Dying,
            Lifecycle::Valid { revoked: true } => PagerPhase::Revoked,
            Lifecycle::Valid { revoked: false } if self.refs == 0 => PagerPhase::Persisting,
            Lifecycle::Valid { revoked: false } => PagerPhase::Active,
        }
    }

    pub fn dirty_pages(&self) -> usize {
        self.pages.values().filter(|page| page.is_dirty()).count()
    }
}
