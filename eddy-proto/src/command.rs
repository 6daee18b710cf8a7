//! Command kinds carried in the frame header.
//!
//! The command space is open-ended: peers running newer revisions may send kinds this build
//! does not know. Unknown codes decode into [`CommandKind::Opaque`] and flow through dispatch
//! untouched, so forward compatibility is preserved.

/// Decoded command kind. Codes are part of the wire contract and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Lookup,
    Read,
    Write,
    Remove,
    Auth,
    Status,
    ReverseLookup,
    Join,
    RouteList,
    Exec,
    Notify,
    MonitorStat,
    Iterator,
    BackendControl,
    BackendStatus,
    DefragStart,
    BulkReadNew,
    BulkRemoveNew,
    /// A kind this build does not know; carried verbatim.
    Opaque(u32),
}

impl CommandKind {
    #[must_use]
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => CommandKind::Lookup,
            2 => CommandKind::Read,
            3 => CommandKind::Write,
            4 => CommandKind::Remove,
            5 => CommandKind::Auth,
            6 => CommandKind::Status,
            7 => CommandKind::ReverseLookup,
            8 => CommandKind::Join,
            9 => CommandKind::RouteList,
            10 => CommandKind::Exec,
            11 => CommandKind::Notify,
            12 => CommandKind::MonitorStat,
            13 => CommandKind::Iterator,
            14 => CommandKind::BackendControl,
            15 => CommandKind::BackendStatus,
            16 => CommandKind::DefragStart,
            17 => CommandKind::BulkReadNew,
            18 => CommandKind::BulkRemoveNew,
            other => CommandKind::Opaque(other),
        }
    }

    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            CommandKind::Lookup => 1,
            CommandKind::Read => 2,
            CommandKind::Write => 3,
            CommandKind::Remove => 4,
            CommandKind::Auth => 5,
            CommandKind::Status => 6,
            CommandKind::ReverseLookup => 7,
            CommandKind::Join => 8,
            CommandKind::RouteList => 9,
            CommandKind::Exec => 10,
            CommandKind::Notify => 11,
            CommandKind::MonitorStat => 12,
            CommandKind::Iterator => 13,
            CommandKind::BackendControl => 14,
            CommandKind::BackendStatus => 15,
            CommandKind::DefragStart => 16,
            CommandKind::BulkReadNew => 17,
            CommandKind::BulkRemoveNew => 18,
            CommandKind::Opaque(code) => code,
        }
    }

    /// Whether dispatch must resolve a storage backend for this kind.
    ///
    /// The listed kinds are served by the node itself from the backend-less system place;
    /// everything else (including opaque kinds) is routed by key.
    #[must_use]
    pub fn needs_backend(self) -> bool {
        !matches!(
            self,
            CommandKind::Auth
                | CommandKind::Status
                | CommandKind::ReverseLookup
                | CommandKind::Join
                | CommandKind::RouteList
                | CommandKind::MonitorStat
                | CommandKind::BackendControl
                | CommandKind::BackendStatus
                | CommandKind::BulkReadNew
                | CommandKind::BulkRemoveNew
        )
    }

    /// Stable name for log lines.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            CommandKind::Lookup => "LOOKUP",
            CommandKind::Read => "READ",
            CommandKind::Write => "WRITE",
            CommandKind::Remove => "REMOVE",
            CommandKind::Auth => "AUTH",
            CommandKind::Status => "STATUS",
            CommandKind::ReverseLookup => "REVERSE_LOOKUP",
            CommandKind::Join => "JOIN",
            CommandKind::RouteList => "ROUTE_LIST",
            CommandKind::Exec => "EXEC",
            CommandKind::Notify => "NOTIFY",
            CommandKind::MonitorStat => "MONITOR_STAT",
            CommandKind::Iterator => "ITERATOR",
            CommandKind::BackendControl => "BACKEND_CONTROL",
            CommandKind::BackendStatus => "BACKEND_STATUS",
            CommandKind::DefragStart => "DEFRAG_START",
            CommandKind::BulkReadNew => "BULK_READ_NEW",
            CommandKind::BulkRemoveNew => "BULK_REMOVE_NEW",
            CommandKind::Opaque(_) => "UNKNOWN",
        }
    }

    /// Number of kinds with fixed codes; sizes per-command statistic arrays.
    pub const KNOWN_MAX: usize = 19;

    /// Index into per-command statistic arrays; opaque kinds share slot 0.
    #[must_use]
    pub fn stat_slot(self) -> usize {
        let code = self.code() as usize;
        if code < Self::KNOWN_MAX { code } else { 0 }
    }
}
