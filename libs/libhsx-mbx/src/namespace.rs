//! Mailbox names and the namespace registry
//!
//! Names are `<prefix><base>[@owner]` with one of four prefixes:
//! - `pid:` - per-task control mailbox (`pid:` alone is the caller's)
//! - `svc:` - per-task service mailbox, owned by the caller unless `@<pid>`
//! - `app:` - global, or task-scoped with `@<pid>`
//! - `shared:` - always global
//!
//! The registry exclusively owns every [`Mailbox`]; everything else refers
//! to mailboxes by [`MailboxId`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::abi::{prefix, stdio, MAX_NAME_BYTES, MAX_PREFIX_BYTES};
use crate::error::{MailboxError, Result};
use crate::mailbox::Mailbox;
use crate::Pid;

/// Namespace families
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Pid = 0x00,
    Svc = 0x01,
    App = 0x02,
    Shared = 0x03,
}

impl Namespace {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Pid => prefix::PID,
            Self::Svc => prefix::SVC,
            Self::App => prefix::APP,
            Self::Shared => prefix::SHARED,
        }
    }

    fn from_name(name: &str) -> Option<(Self, &str)> {
        [Self::Pid, Self::Svc, Self::App, Self::Shared]
            .into_iter()
            .find_map(|ns| name.strip_prefix(ns.prefix()).map(|rest| (ns, rest)))
    }
}

/// Registry-unique mailbox identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MailboxId(pub u32);

impl fmt::Display for MailboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mbx#{}", self.0)
    }
}

/// A parsed, caller-resolved mailbox name
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MailboxName {
    pub namespace: Namespace,
    /// Base name without prefix or owner suffix (`pid:` names use the owner)
    pub base: String,
    /// Owning task for task-scoped names
    pub owner: Option<Pid>,
}

impl MailboxName {
    /// Parse `raw` on behalf of `caller`
    pub fn parse(raw: &str, caller: Pid) -> Result<Self> {
        if raw.is_empty() {
            return Err(MailboxError::InvalidName("empty name".into()));
        }
        if raw.len() > MAX_NAME_BYTES {
            return Err(MailboxError::InvalidName(format!(
                "{} bytes exceeds {} byte limit",
                raw.len(),
                MAX_NAME_BYTES
            )));
        }

        let (namespace, rest) = Namespace::from_name(raw)
            .ok_or_else(|| MailboxError::InvalidName(format!("unknown prefix in {:?}", raw)))?;
        debug_assert!(namespace.prefix().len() <= MAX_PREFIX_BYTES);

        match namespace {
            Namespace::Pid => {
                let owner = if rest.is_empty() { caller } else { parse_pid(raw, rest)? };
                Ok(Self { namespace, base: owner.to_string(), owner: Some(owner) })
            }
            Namespace::Svc => {
                let (base, owner) = split_owner(raw, rest)?;
                Ok(Self { namespace, base, owner: Some(owner.unwrap_or(caller)) })
            }
            Namespace::App => {
                let (base, owner) = split_owner(raw, rest)?;
                Ok(Self { namespace, base, owner })
            }
            Namespace::Shared => {
                let (base, _) = split_owner(raw, rest)?;
                Ok(Self { namespace, base, owner: None })
            }
        }
    }

    /// Names implicitly bound on OPEN and kept alive for their owner's lifetime
    pub fn is_well_known(&self) -> bool {
        match self.namespace {
            Namespace::Pid => true,
            Namespace::Svc => stdio::BASES.contains(&self.base.as_str()),
            Namespace::App | Namespace::Shared => false,
        }
    }

    pub fn stdio(stream: &str, owner: Pid) -> Self {
        Self {
            namespace: Namespace::Svc,
            base: stream.to_string(),
            owner: Some(owner),
        }
    }

    pub fn control(owner: Pid) -> Self {
        Self {
            namespace: Namespace::Pid,
            base: owner.to_string(),
            owner: Some(owner),
        }
    }
}

impl fmt::Display for MailboxName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.namespace, self.owner) {
            (Namespace::Pid, _) => write!(f, "{}{}", prefix::PID, self.base),
            (ns, Some(owner)) => write!(f, "{}{}@{}", ns.prefix(), self.base, owner),
            (ns, None) => write!(f, "{}{}", ns.prefix(), self.base),
        }
    }
}

fn parse_pid(raw: &str, digits: &str) -> Result<Pid> {
    digits
        .parse::<Pid>()
        .map_err(|_| MailboxError::InvalidName(format!("bad owner pid in {:?}", raw)))
}

fn split_owner(raw: &str, rest: &str) -> Result<(String, Option<Pid>)> {
    let (base, owner) = match rest.split_once('@') {
        Some((base, "")) => (base, None),
        Some((base, owner)) => (base, Some(parse_pid(raw, owner)?)),
        None => (rest, None),
    };
    if base.is_empty() {
        return Err(MailboxError::InvalidName(format!("empty base in {:?}", raw)));
    }
    Ok((base.to_string(), owner))
}

/// Name -> mailbox registry
#[derive(Debug)]
pub struct Registry {
    max_descriptors: usize,
    next_id: u32,
    names: HashMap<MailboxName, MailboxId>,
    mailboxes: BTreeMap<MailboxId, Mailbox>,
}

impl Registry {
    pub fn new(max_descriptors: usize) -> Self {
        Self {
            max_descriptors: max_descriptors.max(1),
            next_id: 1,
            names: HashMap::new(),
            mailboxes: BTreeMap::new(),
        }
    }

    pub fn max_descriptors(&self) -> usize {
        self.max_descriptors
    }

    pub fn len(&self) -> usize {
        self.mailboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mailboxes.is_empty()
    }

    pub fn resolve(&self, name: &MailboxName) -> Option<MailboxId> {
        self.names.get(name).copied()
    }

    /// Register a new mailbox under `mailbox.name()`
    pub fn insert(&mut self, mailbox: impl FnOnce(MailboxId) -> Mailbox) -> Result<MailboxId> {
        if self.mailboxes.len() >= self.max_descriptors {
            return Err(MailboxError::DescriptorsExhausted);
        }

        let id = MailboxId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(1);

        let mailbox = mailbox(id);
        if self.names.contains_key(mailbox.name()) {
            return Err(MailboxError::Internal(format!(
                "{} registered twice",
                mailbox.name()
            )));
        }

        self.names.insert(mailbox.name().clone(), id);
        self.mailboxes.insert(id, mailbox);
        Ok(id)
    }

    /// Tear a mailbox down, discarding anything still queued
    pub fn remove(&mut self, id: MailboxId) -> Option<Mailbox> {
        let mailbox = self.mailboxes.remove(&id)?;
        self.names.remove(mailbox.name());
        Some(mailbox)
    }

    pub fn get(&self, id: MailboxId) -> Option<&Mailbox> {
        self.mailboxes.get(&id)
    }

    pub fn get_mut(&mut self, id: MailboxId) -> Option<&mut Mailbox> {
        self.mailboxes.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mailbox> {
        self.mailboxes.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Mailbox> {
        self.mailboxes.values_mut()
    }
}
