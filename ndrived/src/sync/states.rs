use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid state: {0}")]
pub struct InvalidState(String);

/// Last observed condition of the local side of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalState {
    Unknown,
    Synchronized,
    Created,
    Modified,
    Moved,
    Deleted,
    /// User picked "keep local" on a conflict.
    Resolved,
    /// Ignored document; kept in the database but never queued.
    Unsynchronized,
    /// Manufactured by Direct Transfer.
    Direct,
}

impl LocalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocalState::Unknown => "unknown",
            LocalState::Synchronized => "synchronized",
            LocalState::Created => "created",
            LocalState::Modified => "modified",
            LocalState::Moved => "moved",
            LocalState::Deleted => "deleted",
            LocalState::Resolved => "resolved",
            LocalState::Unsynchronized => "unsynchronized",
            LocalState::Direct => "direct",
        }
    }

    pub fn parse(value: &str) -> Result<Self, InvalidState> {
        match value {
            "unknown" => Ok(LocalState::Unknown),
            "synchronized" => Ok(LocalState::Synchronized),
            "created" => Ok(LocalState::Created),
            "modified" => Ok(LocalState::Modified),
            "moved" => Ok(LocalState::Moved),
            "deleted" => Ok(LocalState::Deleted),
            "resolved" => Ok(LocalState::Resolved),
            "unsynchronized" => Ok(LocalState::Unsynchronized),
            "direct" => Ok(LocalState::Direct),
            other => Err(InvalidState(other.to_string())),
        }
    }
}

/// Last observed condition of the remote side of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteState {
    Unknown,
    Synchronized,
    Created,
    Modified,
    Moved,
    Deleted,
    /// Direct Transfer child waiting for its parent folder to exist remotely.
    Todo,
}

impl RemoteState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteState::Unknown => "unknown",
            RemoteState::Synchronized => "synchronized",
            RemoteState::Created => "created",
            RemoteState::Modified => "modified",
            RemoteState::Moved => "moved",
            RemoteState::Deleted => "deleted",
            RemoteState::Todo => "todo",
        }
    }

    pub fn parse(value: &str) -> Result<Self, InvalidState> {
        match value {
            "unknown" => Ok(RemoteState::Unknown),
            "synchronized" => Ok(RemoteState::Synchronized),
            "created" => Ok(RemoteState::Created),
            "modified" => Ok(RemoteState::Modified),
            "moved" => Ok(RemoteState::Moved),
            "deleted" => Ok(RemoteState::Deleted),
            "todo" => Ok(RemoteState::Todo),
            other => Err(InvalidState(other.to_string())),
        }
    }
}

/// Derived tag driving the processor dispatch, computed from
/// `(local_state, remote_state)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairState {
    Unknown,
    Synchronized,
    LocallyCreated,
    RemotelyCreated,
    LocallyModified,
    RemotelyModified,
    LocallyMoved,
    RemotelyMoved,
    LocallyMovedCreated,
    LocallyMovedRemotelyModified,
    LocallyDeleted,
    RemotelyDeleted,
    Deleted,
    LocallyResolved,
    Conflicted,
    UnknownDeleted,
    DeletedUnknown,
    Unsynchronized,
    DirectTransfer,
    /// Direct Transfer child not yet schedulable; never queued.
    Todo,
}

impl PairState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairState::Unknown => "unknown",
            PairState::Synchronized => "synchronized",
            PairState::LocallyCreated => "locally_created",
            PairState::RemotelyCreated => "remotely_created",
            PairState::LocallyModified => "locally_modified",
            PairState::RemotelyModified => "remotely_modified",
            PairState::LocallyMoved => "locally_moved",
            PairState::RemotelyMoved => "remotely_moved",
            PairState::LocallyMovedCreated => "locally_moved_created",
            PairState::LocallyMovedRemotelyModified => "locally_moved_remotely_modified",
            PairState::LocallyDeleted => "locally_deleted",
            PairState::RemotelyDeleted => "remotely_deleted",
            PairState::Deleted => "deleted",
            PairState::LocallyResolved => "locally_resolved",
            PairState::Conflicted => "conflicted",
            PairState::UnknownDeleted => "unknown_deleted",
            PairState::DeletedUnknown => "deleted_unknown",
            PairState::Unsynchronized => "unsynchronized",
            PairState::DirectTransfer => "direct_transfer",
            PairState::Todo => "todo",
        }
    }

    pub fn parse(value: &str) -> Result<Self, InvalidState> {
        match value {
            "unknown" => Ok(PairState::Unknown),
            "synchronized" => Ok(PairState::Synchronized),
            "locally_created" => Ok(PairState::LocallyCreated),
            "remotely_created" => Ok(PairState::RemotelyCreated),
            "locally_modified" => Ok(PairState::LocallyModified),
            "remotely_modified" => Ok(PairState::RemotelyModified),
            "locally_moved" => Ok(PairState::LocallyMoved),
            "remotely_moved" => Ok(PairState::RemotelyMoved),
            "locally_moved_created" => Ok(PairState::LocallyMovedCreated),
            "locally_moved_remotely_modified" => Ok(PairState::LocallyMovedRemotelyModified),
            "locally_deleted" => Ok(PairState::LocallyDeleted),
            "remotely_deleted" => Ok(PairState::RemotelyDeleted),
            "deleted" => Ok(PairState::Deleted),
            "locally_resolved" => Ok(PairState::LocallyResolved),
            "conflicted" => Ok(PairState::Conflicted),
            "unknown_deleted" => Ok(PairState::UnknownDeleted),
            "deleted_unknown" => Ok(PairState::DeletedUnknown),
            "unsynchronized" => Ok(PairState::Unsynchronized),
            "direct_transfer" => Ok(PairState::DirectTransfer),
            "todo" => Ok(PairState::Todo),
            other => Err(InvalidState(other.to_string())),
        }
    }

    /// States that never enter a queue.
    pub fn is_quiescent(&self) -> bool {
        matches!(
            self,
            PairState::Synchronized
                | PairState::Unsynchronized
                | PairState::Conflicted
                | PairState::Todo
        )
    }
}

/// Summary status from the last known pair of side states.
///
/// The mapping is total over the states the watchers can produce; feeding a
/// combination outside it is a programming error surfaced as `Unknown` plus
/// a log line at the call site.
pub fn pair_state_of(local: LocalState, remote: RemoteState) -> PairState {
    use LocalState as L;
    use PairState as P;
    use RemoteState as R;

    match (local, remote) {
        // regular cases
        (L::Unknown, R::Unknown) => P::Unknown,
        (L::Synchronized, R::Synchronized) => P::Synchronized,
        (L::Created, R::Unknown) => P::LocallyCreated,
        (L::Unknown, R::Created) => P::RemotelyCreated,
        (L::Modified, R::Synchronized) => P::LocallyModified,
        (L::Moved, R::Synchronized) => P::LocallyMoved,
        (L::Moved, R::Deleted) => P::LocallyMovedCreated,
        (L::Moved, R::Modified) => P::LocallyMovedRemotelyModified,
        (L::Synchronized, R::Modified) => P::RemotelyModified,
        (L::Modified, R::Unknown) => P::LocallyModified,
        (L::Unknown, R::Modified) => P::RemotelyModified,
        (L::Synchronized, R::Moved) => P::RemotelyMoved,
        (L::Unknown, R::Moved) => P::RemotelyMoved,
        (L::Deleted, R::Synchronized) => P::LocallyDeleted,
        (L::Synchronized, R::Deleted) => P::RemotelyDeleted,
        (L::Deleted, R::Deleted) => P::Deleted,
        (L::Synchronized, R::Unknown) => P::Synchronized,
        // conflicts with automatic resolution
        (L::Created, R::Deleted) => P::LocallyCreated,
        (L::Deleted, R::Created) => P::RemotelyCreated,
        (L::Modified, R::Deleted) => P::RemotelyDeleted,
        (L::Deleted, R::Modified) => P::RemotelyCreated,
        (L::Deleted, R::Moved) => P::RemotelyCreated,
        // conflict cases that need manual resolution
        (L::Modified, R::Created) => P::Conflicted,
        (L::Modified, R::Modified) => P::Conflicted,
        (L::Modified, R::Moved) => P::Conflicted,
        (L::Created, R::Created) => P::Conflicted,
        (L::Created, R::Modified) => P::Conflicted,
        (L::Created, R::Moved) => P::Conflicted,
        (L::Moved, R::Unknown) => P::Conflicted,
        (L::Moved, R::Moved) => P::Conflicted,
        (L::Moved, R::Created) => P::Conflicted,
        (L::Resolved, R::Modified) => P::Conflicted,
        (L::Resolved, R::Moved) => P::Conflicted,
        // conflict cases that have been manually resolved
        (L::Resolved, R::Unknown) => P::LocallyResolved,
        (L::Resolved, R::Synchronized) => P::Synchronized,
        (L::Created, R::Synchronized) => P::Synchronized,
        (L::Unknown, R::Synchronized) => P::Synchronized,
        // inconsistent cases
        (L::Unknown, R::Deleted) => P::UnknownDeleted,
        (L::Deleted, R::Unknown) => P::DeletedUnknown,
        // ignored documents
        (L::Unsynchronized, R::Deleted) => P::RemotelyDeleted,
        (L::Unsynchronized, _) => P::Unsynchronized,
        // Direct Transfer
        (L::Direct, R::Unknown) => P::DirectTransfer,
        (L::Direct, R::Todo) => P::Todo,
        (L::Direct, _) => P::DirectTransfer,
        // remaining combinations are unreachable through the watchers
        _ => P::Unknown,
    }
}
