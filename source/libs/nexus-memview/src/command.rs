// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Text command protocol spoken by the user-level library
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Request, PrivOp, Reply, ParseError, reply_code, AddressSpace::{dispatch, execute}
//! INVARIANTS: Every reply encodes to a single integer; any failure encodes to -1
//!
//! Commands are comma separated, `kind,op,args...`:
//!
//! ```text
//! domain,create                      domain,kill,<d>
//! domain,mmapregister,<d>            domain,queryid,<addr>
//! domain,mainid                      domain,priv,<d>,<c>,get
//! domain,priv,<d>,<c>,add|del|mod,<mask>
//! context,maininit                   context,create
//! context,kill,<c>                   context,exists,<c>
//! context,registerthread,<c>         context,getid
//! context,domain,<c>,join|leave|isin,<d>
//! ```
//!
//! Numbers are decimal or `0x`-prefixed hexadecimal.

use core::str::FromStr;

use thiserror::Error;

use crate::cap::Capability;
use crate::error::Result;
use crate::mm::{AddressSpace, Task};
use crate::types::{ContextId, DomainId};

/// Capability operation carried by a `domain,priv` command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrivOp {
    /// Read the mask.
    Get,
    /// Grant bits.
    Add(Capability),
    /// Revoke bits.
    Del(Capability),
    /// Replace the mask.
    Mod(Capability),
}

/// A parsed command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request {
    /// `domain,create`
    DomainCreate,
    /// `domain,kill,<d>`
    DomainKill(DomainId),
    /// `domain,mmapregister,<d>`
    MmapRegister(DomainId),
    /// `domain,priv,<d>,<c>,<op>[,<mask>]`
    Priv {
        /// Target domain.
        domain: DomainId,
        /// Target context.
        context: ContextId,
        /// Operation.
        op: PrivOp,
    },
    /// `domain,queryid,<addr>`
    QueryDomain(usize),
    /// `domain,mainid`
    GlobalDomain,
    /// `context,maininit`
    EnableIsolation,
    /// `context,create`
    ContextCreate,
    /// `context,kill,<c>`
    ContextKill(ContextId),
    /// `context,domain,<c>,join,<d>`
    Join {
        /// Domain to join.
        domain: DomainId,
        /// Joining context.
        context: ContextId,
    },
    /// `context,domain,<c>,leave,<d>`
    Leave {
        /// Domain to leave.
        domain: DomainId,
        /// Leaving context.
        context: ContextId,
    },
    /// `context,domain,<c>,isin,<d>`
    IsMember {
        /// Domain queried.
        domain: DomainId,
        /// Context queried.
        context: ContextId,
    },
    /// `context,exists,<c>`
    ContextExists(ContextId),
    /// `context,registerthread,<c>`
    RegisterThread(ContextId),
    /// `context,getid`
    CurrentContext,
}

/// Errors raised while parsing a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Nothing to parse.
    #[error("empty command")]
    Empty,
    /// First word is neither `domain` nor `context`.
    #[error("unknown command kind `{0}`")]
    UnknownKind(String),
    /// Operation word not recognised for the kind.
    #[error("unknown operation `{0}`")]
    UnknownOp(String),
    /// A required field is absent.
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    /// A numeric field did not parse.
    #[error("bad number `{0}`")]
    BadNumber(String),
    /// A capability mask carries unknown bits.
    #[error("bad capability mask {0:#x}")]
    BadMask(u32),
    /// Extra fields after a complete command.
    #[error("unexpected trailing field `{0}`")]
    TrailingField(String),
}

struct Fields<'a> {
    inner: core::str::Split<'a, char>,
}

impl<'a> Fields<'a> {
    fn word(&mut self, name: &'static str) -> core::result::Result<&'a str, ParseError> {
        self.inner
            .next()
            .map(str::trim)
            .filter(|word| !word.is_empty())
            .ok_or(ParseError::MissingField(name))
    }

    fn number(&mut self, name: &'static str) -> core::result::Result<u64, ParseError> {
        let word = self.word(name)?;
        let parsed = match word.strip_prefix("0x").or_else(|| word.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => word.parse(),
        };
        parsed.map_err(|_| ParseError::BadNumber(word.to_string()))
    }

    fn id(&mut self, name: &'static str) -> core::result::Result<u32, ParseError> {
        let value = self.number(name)?;
        u32::try_from(value).map_err(|_| ParseError::BadNumber(value.to_string()))
    }

    fn domain(&mut self) -> core::result::Result<DomainId, ParseError> {
        self.id("domain").map(DomainId::new)
    }

    fn context(&mut self) -> core::result::Result<ContextId, ParseError> {
        self.id("context").map(ContextId::new)
    }

    fn mask(&mut self) -> core::result::Result<Capability, ParseError> {
        let bits = self.id("mask")?;
        Capability::from_bits(bits).ok_or(ParseError::BadMask(bits))
    }

    fn finish(mut self, request: Request) -> core::result::Result<Request, ParseError> {
        match self.inner.next().map(str::trim).filter(|word| !word.is_empty()) {
            Some(extra) => Err(ParseError::TrailingField(extra.to_string())),
            None => Ok(request),
        }
    }
}

impl FromStr for Request {
    type Err = ParseError;

    fn from_str(line: &str) -> core::result::Result<Self, Self::Err> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ParseError::Empty);
        }
        let mut fields = Fields { inner: line.split(',') };
        let kind = fields.word("kind")?;
        let op = fields.word("operation")?;
        let request = match (kind, op) {
            ("domain", "create") => Request::DomainCreate,
            ("domain", "kill") => Request::DomainKill(fields.domain()?),
            ("domain", "mmapregister") => Request::MmapRegister(fields.domain()?),
            ("domain", "queryid") => {
                let addr = fields.number("address")?;
                let addr = usize::try_from(addr).map_err(|_| ParseError::BadNumber(addr.to_string()))?;
                Request::QueryDomain(addr)
            }
            ("domain", "mainid") => Request::GlobalDomain,
            ("domain", "priv") => {
                let domain = fields.domain()?;
                let context = fields.context()?;
                let op = match fields.word("privilege operation")? {
                    "get" => PrivOp::Get,
                    "add" => PrivOp::Add(fields.mask()?),
                    "del" => PrivOp::Del(fields.mask()?),
                    "mod" => PrivOp::Mod(fields.mask()?),
                    other => return Err(ParseError::UnknownOp(other.to_string())),
                };
                Request::Priv { domain, context, op }
            }
            ("context", "maininit") => Request::EnableIsolation,
            ("context", "create") => Request::ContextCreate,
            ("context", "kill") => Request::ContextKill(fields.context()?),
            ("context", "exists") => Request::ContextExists(fields.context()?),
            ("context", "registerthread") => Request::RegisterThread(fields.context()?),
            ("context", "getid") => Request::CurrentContext,
            ("context", "domain") => {
                let context = fields.context()?;
                let action = fields.word("membership operation")?;
                let domain = fields.domain()?;
                match action {
                    "join" => Request::Join { domain, context },
                    "leave" => Request::Leave { domain, context },
                    "isin" => Request::IsMember { domain, context },
                    other => return Err(ParseError::UnknownOp(other.to_string())),
                }
            }
            ("domain" | "context", other) => return Err(ParseError::UnknownOp(other.to_string())),
            (other, _) => return Err(ParseError::UnknownKind(other.to_string())),
        };
        fields.finish(request)
    }
}

/// Successful reply to a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reply {
    /// Operation completed.
    Unit,
    /// A domain or context id.
    Id(u32),
    /// Yes/no answer.
    Flag(bool),
    /// A capability mask.
    Caps(Capability),
}

impl Reply {
    /// Integer the transport returns to the caller.
    pub fn code(&self) -> i64 {
        match self {
            Reply::Unit => 0,
            Reply::Id(id) => i64::from(*id),
            Reply::Flag(flag) => i64::from(*flag),
            Reply::Caps(caps) => i64::from(caps.bits()),
        }
    }
}

/// Encodes a dispatch result; any error becomes -1.
pub fn reply_code(result: &Result<Reply>) -> i64 {
    match result {
        Ok(reply) => reply.code(),
        Err(_) => -1,
    }
}

impl AddressSpace {
    /// Runs `request` on behalf of `task`.
    pub fn dispatch(&self, task: &mut Task, request: Request) -> Result<Reply> {
        let reply = match request {
            Request::EnableIsolation => self.enable_isolation(task).map(|()| Reply::Unit)?,
            Request::DomainCreate => Reply::Id(self.isolation()?.domain_create()?.raw()),
            Request::DomainKill(domain) => {
                self.isolation()?.domain_kill(domain)?;
                Reply::Unit
            }
            Request::MmapRegister(domain) => {
                self.mmap_register(task, domain)?;
                Reply::Unit
            }
            Request::Priv { domain, context, op } => {
                let view = self.isolation()?;
                match op {
                    PrivOp::Get => Reply::Caps(view.priv_get(domain, context)?),
                    PrivOp::Add(caps) => view.priv_add(domain, context, caps).map(|()| Reply::Unit)?,
                    PrivOp::Del(caps) => view.priv_del(domain, context, caps).map(|()| Reply::Unit)?,
                    PrivOp::Mod(caps) => view.priv_mod(domain, context, caps).map(|()| Reply::Unit)?,
                }
            }
            Request::QueryDomain(addr) => Reply::Id(self.query_domain(addr)?.raw()),
            Request::GlobalDomain => Reply::Id(self.global_domain()?.raw()),
            Request::ContextCreate => Reply::Id(self.isolation()?.context_create()?.raw()),
            Request::ContextKill(context) => {
                self.isolation()?.context_kill(context)?;
                Reply::Unit
            }
            Request::Join { domain, context } => {
                self.isolation()?.join(domain, context)?;
                Reply::Unit
            }
            Request::Leave { domain, context } => {
                self.isolation()?.leave(domain, context)?;
                Reply::Unit
            }
            Request::IsMember { domain, context } => {
                Reply::Flag(self.isolation()?.is_member(domain, context))
            }
            Request::ContextExists(context) => {
                Reply::Flag(self.isolation()?.context_exists(context))
            }
            Request::RegisterThread(context) => {
                self.isolation()?.register_running(context)?;
                Reply::Unit
            }
            Request::CurrentContext => Reply::Id(self.current_context(task)?.raw()),
        };
        Ok(reply)
    }

    /// Parses, dispatches and encodes one command line.
    pub fn execute(&self, task: &mut Task, line: &str) -> i64 {
        let request = match line.parse::<Request>() {
            Ok(request) => request,
            Err(err) => {
                log::debug!(target: "memview", "CMD: `{line}`: {err}");
                return -1;
            }
        };
        let result = self.dispatch(task, request);
        if let Err(err) = &result {
            log::debug!(target: "memview", "CMD: {request:?}: {err}");
        }
        reply_code(&result)
    }
}
