//! Memcached ASCII protocol command types

use std::borrow::Cow;

/// Maximum key length accepted by memcached
pub const MAX_KEY_LENGTH: usize = 250;

/// Largest data block accepted by a storage command (1 MiB)
pub const MAX_VALUE_LENGTH: usize = 1024 * 1024;

/// Storage commands sharing the `<key> <flags> <exptime> <bytes>` layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreVerb {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    /// Carries an extra `<cas unique>` argument
    Cas,
}

impl StoreVerb {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Add => "add",
            Self::Replace => "replace",
            Self::Append => "append",
            Self::Prepend => "prepend",
            Self::Cas => "cas",
        }
    }

    pub(crate) const ALL: [StoreVerb; 6] = [
        Self::Set,
        Self::Add,
        Self::Replace,
        Self::Append,
        Self::Prepend,
        Self::Cas,
    ];
}

/// Parsed memcached command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// get <key>* / gets <key>*
    Get {
        keys: Vec<Cow<'a, [u8]>>,
        with_cas: bool,
    },

    /// <verb> <key> <flags> <exptime> <bytes> [cas unique] [noreply]
    Store {
        verb: StoreVerb,
        key: Cow<'a, [u8]>,
        flags: u32,
        exptime: i64,
        data: Cow<'a, [u8]>,
        cas_unique: u64,
        noreply: bool,
    },

    /// delete <key> [time] [noreply]
    Delete {
        key: Cow<'a, [u8]>,
        hold: i64,
        noreply: bool,
    },

    /// incr <key> <value> [noreply]
    Incr {
        key: Cow<'a, [u8]>,
        delta: u64,
        noreply: bool,
    },

    /// decr <key> <value> [noreply]
    Decr {
        key: Cow<'a, [u8]>,
        delta: u64,
        noreply: bool,
    },

    /// flush_all [delay] [noreply]
    FlushAll { delay: i64, noreply: bool },

    /// stats [arg]
    Stats { arg: Cow<'a, [u8]> },

    /// version
    Version,

    /// verbosity <level> [noreply]
    Verbosity { noreply: bool },

    /// quit
    Quit,
}

impl<'a> Command<'a> {
    /// Returns true if this command should not send a response
    pub fn is_noreply(&self) -> bool {
        match self {
            Command::Store { noreply, .. }
            | Command::Delete { noreply, .. }
            | Command::Incr { noreply, .. }
            | Command::Decr { noreply, .. }
            | Command::FlushAll { noreply, .. }
            | Command::Verbosity { noreply } => *noreply,
            _ => false,
        }
    }

    /// Short name used for metrics labels
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { with_cas: false, .. } => "get",
            Command::Get { with_cas: true, .. } => "gets",
            Command::Store { verb, .. } => verb.as_str(),
            Command::Delete { .. } => "delete",
            Command::Incr { .. } => "incr",
            Command::Decr { .. } => "decr",
            Command::FlushAll { .. } => "flush_all",
            Command::Stats { .. } => "stats",
            Command::Version => "version",
            Command::Verbosity { .. } => "verbosity",
            Command::Quit => "quit",
        }
    }
}

/// Check if a key is valid
pub fn is_valid_key(key: &[u8]) -> bool {
    if key.is_empty() || key.len() > MAX_KEY_LENGTH {
        return false;
    }
    // Keys cannot contain control characters or whitespace
    key.iter().all(|&b| b > 32 && b < 127)
}
