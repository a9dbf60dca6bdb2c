use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const RUNNER_PREFIX: &str = "runner_on_";

/// Event kinds emitted by a playbook run.
///
/// Kinds the dispatcher needs to reason about get their own variant; every
/// `runner_on_*` host-level kind is kept verbatim in [`EventKind::Runner`] and
/// anything unrecognised in [`EventKind::Other`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    PlaybookStart,
    PlayStart,
    TaskStart,
    Setup,
    Stats,
    VarsPrompt,
    Notify,
    NoHostsMatched,
    NoHostsRemaining,
    ImportForHost,
    NotImportForHost,
    Runner(String),
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::PlaybookStart => "playbook_on_start",
            Self::PlayStart => "playbook_on_play_start",
            Self::TaskStart => "playbook_on_task_start",
            Self::Setup => "playbook_on_setup",
            Self::Stats => "playbook_on_stats",
            Self::VarsPrompt => "playbook_on_vars_prompt",
            Self::Notify => "playbook_on_notify",
            Self::NoHostsMatched => "playbook_on_no_hosts_matched",
            Self::NoHostsRemaining => "playbook_on_no_hosts_remaining",
            Self::ImportForHost => "playbook_on_import_for_host",
            Self::NotImportForHost => "playbook_on_not_import_for_host",
            Self::Runner(name) | Self::Other(name) => name.as_str(),
        }
    }

    /// The anchor slot this kind occupies, if it is a structural anchor.
    pub fn anchor(&self) -> Option<AnchorKind> {
        match self {
            Self::PlaybookStart => Some(AnchorKind::PlaybookStart),
            Self::PlayStart => Some(AnchorKind::PlayStart),
            Self::Setup => Some(AnchorKind::Setup),
            Self::TaskStart => Some(AnchorKind::TaskStart),
            _ => None,
        }
    }

    /// Which anchor(s) an event of this kind hangs under.
    pub fn parent_rule(&self) -> ParentRule {
        match self {
            Self::Stats | Self::VarsPrompt | Self::PlayStart => {
                ParentRule::Anchor(AnchorKind::PlaybookStart)
            }
            Self::Notify
            | Self::Setup
            | Self::TaskStart
            | Self::NoHostsMatched
            | Self::NoHostsRemaining
            | Self::ImportForHost
            | Self::NotImportForHost => ParentRule::Anchor(AnchorKind::PlayStart),
            Self::Runner(_) => ParentRule::Latest(&[AnchorKind::Setup, AnchorKind::TaskStart]),
            Self::PlaybookStart | Self::Other(_) => ParentRule::None,
        }
    }

    /// `playbook_on_stats` closes a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stats)
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self.as_str(),
            "runner_on_failed" | "runner_on_error" | "runner_on_unreachable" | "runner_on_async_failed"
        )
    }

    /// Nesting depth in the playbook tree: 0 run, 1 play, 2 task, 3 host.
    pub fn level(&self) -> u8 {
        match self {
            Self::PlaybookStart | Self::Other(_) => 0,
            Self::PlayStart | Self::Stats | Self::VarsPrompt => 1,
            Self::TaskStart
            | Self::Setup
            | Self::Notify
            | Self::NoHostsMatched
            | Self::NoHostsRemaining
            | Self::ImportForHost
            | Self::NotImportForHost => 2,
            Self::Runner(_) => 3,
        }
    }
}

impl From<&str> for EventKind {
    fn from(s: &str) -> Self {
        match s {
            "playbook_on_start" => Self::PlaybookStart,
            "playbook_on_play_start" => Self::PlayStart,
            "playbook_on_task_start" => Self::TaskStart,
            "playbook_on_setup" => Self::Setup,
            "playbook_on_stats" => Self::Stats,
            "playbook_on_vars_prompt" => Self::VarsPrompt,
            "playbook_on_notify" => Self::Notify,
            "playbook_on_no_hosts_matched" => Self::NoHostsMatched,
            "playbook_on_no_hosts_remaining" => Self::NoHostsRemaining,
            "playbook_on_import_for_host" => Self::ImportForHost,
            "playbook_on_not_import_for_host" => Self::NotImportForHost,
            other if other.starts_with(RUNNER_PREFIX) => Self::Runner(other.to_owned()),
            other => Self::Other(other.to_owned()),
        }
    }
}

impl From<String> for EventKind {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Runner(name) | EventKind::Other(name) => name,
            known => known.as_str().to_owned(),
        }
    }
}

impl FromStr for EventKind {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural kinds whose stored row other events reference as parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AnchorKind {
    PlaybookStart,
    PlayStart,
    Setup,
    TaskStart,
}

impl AnchorKind {
    pub const ALL: [AnchorKind; 4] = [
        AnchorKind::PlaybookStart,
        AnchorKind::PlayStart,
        AnchorKind::Setup,
        AnchorKind::TaskStart,
    ];

    pub(crate) fn slot(self) -> usize {
        match self {
            Self::PlaybookStart => 0,
            Self::PlayStart => 1,
            Self::Setup => 2,
            Self::TaskStart => 3,
        }
    }
}

/// Parent classification for an event kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParentRule {
    None,
    Anchor(AnchorKind),
    /// Whichever of the candidates was persisted last (highest row id).
    Latest(&'static [AnchorKind]),
}

/// Fixed-size anchor slots for one run, indexed by [`AnchorKind`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AnchorSlots<T: Copy> {
    slots: [Option<T>; 4],
}

impl<T: Copy> Default for AnchorSlots<T> {
    fn default() -> Self {
        Self { slots: [None; 4] }
    }
}

impl<T: Copy> AnchorSlots<T> {
    pub fn get(&self, kind: AnchorKind) -> Option<T> {
        self.slots[kind.slot()]
    }

    pub fn set(&mut self, kind: AnchorKind, value: T) {
        self.slots[kind.slot()] = Some(value);
    }

    pub fn clear(&mut self, kind: AnchorKind) {
        self.slots[kind.slot()] = None;
    }
}
