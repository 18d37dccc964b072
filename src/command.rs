//! Pipe-delimited command grammar shared by client and server
//!
//! Commands are ASCII tokens in the packet's command field, joined with
//! `|`. Arity determines dispatch; a wrong arity or an unrecognized token
//! in a recognized slot is a malformed command, which callers log and
//! ignore - it must never bring down a receive loop.

use std::fmt;

use crate::error::ProtocolError;
use crate::protocol::FAIL_TOKEN;

/// Which directory listing a `flist`/`list` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Client,
    Server,
}

impl Scope {
    fn parse(tok: &str) -> Option<Scope> {
        match tok {
            "client" => Some(Scope::Client),
            "server" => Some(Scope::Server),
            _ => None,
        }
    }

    fn token(self) -> &'static str {
        match self {
            Scope::Client => "client",
            Scope::Server => "server",
        }
    }
}

/// The checksum slot of a transfer command: a whole-file MD5 hex digest,
/// or the literal `fail` meaning the request could not be satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checksum {
    Md5(String),
    Fail,
}

impl Checksum {
    fn parse(tok: &str) -> Checksum {
        if tok == FAIL_TOKEN {
            Checksum::Fail
        } else {
            Checksum::Md5(tok.to_string())
        }
    }

    fn token(&self) -> &str {
        match self {
            Checksum::Md5(sum) => sum,
            Checksum::Fail => FAIL_TOKEN,
        }
    }
}

/// A parsed protocol command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    // 1 token
    Exit,
    Ping,
    Pong,
    /// Request the server's formatted file list.
    Slist,
    /// The sender's full local path list rides in the payload; triggers
    /// reconciliation on the receiver.
    Clist,
    /// Client asks the server to start synchronization.
    GetSyncDir,
    Help,

    // 2 tokens
    /// Delete `path` under the receiver's managed tree.
    Delete { path: String },
    /// Formatted file list for `scope`; the listing rides in the payload.
    Flist { scope: Scope },
    /// Pull request: ask the peer to send `path` into my managed tree.
    Download { path: String },
    /// Ask the server for a copy of `path` delivered outside the sync tree.
    Adownload { path: String },
    /// Client-local listing command; a server receiving it logs and ignores.
    List { scope: Scope },

    // 3 tokens
    /// Client-to-server chunked file transfer.
    Upload { path: String, checksum: Checksum },
    /// Server-to-client chunked file transfer into the sync tree.
    Sdownload { path: String, checksum: Checksum },
    /// Server-to-client chunked transfer answering `adownload`.
    Aupload { path: String, checksum: Checksum },
    /// A delete that could not be satisfied.
    DeleteFail { path: String },
    /// Login handshake, first packet on every connection.
    Login { user: String, machine: String },
    /// Handshake accepted; `sessions` is the user's live session count.
    LoginOk { sessions: u32 },
    /// Handshake refused; the socket is closed right after.
    LoginFail { reason: String },
}

impl Command {
    /// Parse a command field. Paths may not contain `|`.
    pub fn parse(raw: &str) -> Result<Command, ProtocolError> {
        let malformed = || ProtocolError::Malformed { raw: raw.to_string() };
        let toks: Vec<&str> = raw.split('|').collect();
        let cmd = match toks.as_slice() {
            ["exit"] => Command::Exit,
            ["ping"] => Command::Ping,
            ["pong"] => Command::Pong,
            ["slist"] => Command::Slist,
            ["clist"] => Command::Clist,
            ["get_sync_dir"] => Command::GetSyncDir,
            ["help"] => Command::Help,

            ["delete", path] if !path.is_empty() => Command::Delete { path: path.to_string() },
            ["flist", scope] => Command::Flist { scope: Scope::parse(*scope).ok_or_else(malformed)? },
            ["download", path] if !path.is_empty() => {
                Command::Download { path: path.to_string() }
            }
            ["adownload", path] if !path.is_empty() => {
                Command::Adownload { path: path.to_string() }
            }
            ["list", scope] => Command::List { scope: Scope::parse(*scope).ok_or_else(malformed)? },

            ["upload", path, sum] if !path.is_empty() => {
                Command::Upload { path: path.to_string(), checksum: Checksum::parse(*sum) }
            }
            ["sdownload", path, sum] if !path.is_empty() => {
                Command::Sdownload { path: path.to_string(), checksum: Checksum::parse(*sum) }
            }
            ["aupload", path, sum] if !path.is_empty() => {
                Command::Aupload { path: path.to_string(), checksum: Checksum::parse(*sum) }
            }
            ["delete", path, tok] if !path.is_empty() && *tok == FAIL_TOKEN => {
                Command::DeleteFail { path: path.to_string() }
            }
            ["login", "ok", n] => Command::LoginOk { sessions: n.parse().map_err(|_| malformed())? },
            ["login", "fail", reason] => Command::LoginFail { reason: reason.to_string() },
            ["login", user, machine] if !user.is_empty() && !machine.is_empty() => {
                Command::Login { user: user.to_string(), machine: machine.to_string() }
            }

            _ => return Err(malformed()),
        };
        Ok(cmd)
    }

    /// Render back to the wire form.
    pub fn wire(&self) -> String {
        match self {
            Command::Exit => "exit".into(),
            Command::Ping => "ping".into(),
            Command::Pong => "pong".into(),
            Command::Slist => "slist".into(),
            Command::Clist => "clist".into(),
            Command::GetSyncDir => "get_sync_dir".into(),
            Command::Help => "help".into(),
            Command::Delete { path } => format!("delete|{}", path),
            Command::Flist { scope } => format!("flist|{}", scope.token()),
            Command::Download { path } => format!("download|{}", path),
            Command::Adownload { path } => format!("adownload|{}", path),
            Command::List { scope } => format!("list|{}", scope.token()),
            Command::Upload { path, checksum } => format!("upload|{}|{}", path, checksum.token()),
            Command::Sdownload { path, checksum } => {
                format!("sdownload|{}|{}", path, checksum.token())
            }
            Command::Aupload { path, checksum } => {
                format!("aupload|{}|{}", path, checksum.token())
            }
            Command::DeleteFail { path } => format!("delete|{}|{}", path, FAIL_TOKEN),
            Command::Login { user, machine } => format!("login|{}|{}", user, machine),
            Command::LoginOk { sessions } => format!("login|ok|{}", sessions),
            Command::LoginFail { reason } => format!("login|fail|{}", reason),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.wire())
    }
}
