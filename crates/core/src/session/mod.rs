//! The per-connection session engine: greeting, capability negotiation,
//! auth, repository binding, and the ACL-gated command dispatch loop.
//!
//! Mirrors the teacher's connection-handler shape (one task per connection,
//! a small state struct threaded through every command) generalized from a
//! sync-job driver to the svn:// wire protocol's request/response loop.

pub mod auth;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::acl::{AclOracle, AclQuery, AclVerdict};
use crate::commit::CommitBuilder;
use crate::config::DaemonConfig;
use crate::editor::{drive_update, EditorOp, Report};
use crate::errors::{AuthError, BridgeError, CommitError, SessionError};
use crate::identity::IdentityMapper;
use crate::models::{canonicalize_path, AclOperation, Depth, Revision};
use crate::repo::{Repository, RepositoryRegistry};
use crate::wire::{Token, WireReader, WireWriter};

use self::auth::Authenticator;

/// Protocol version this server speaks (ra_svn protocol 2).
const PROTOCOL_VERSION: i64 = 2;

/// Capabilities this server offers in its greeting. `mergeinfo` is included
/// for client compatibility even though `get-mergeinfo` always answers
/// empty (no merge-tracking backend; see that handler).
const SERVER_CAPABILITIES: &[&str] = &[
    "edit-pipeline",
    "svndiff1",
    "absent-entries",
    "depth",
    "mergeinfo",
    "log-revprops",
    "atomic-revprops",
    "partial-replay",
    "inherited-props",
];

// Approximate SVN error codes (`subversion/include/svn_error_codes.h`).
// Good enough to let a real client render a sensible category; this bridge
// doesn't promise byte-exact parity with upstream svn's numbering.
const ERR_RA_NOT_AUTHORIZED: i64 = 170001;
const ERR_FS_NOT_FOUND: i64 = 160013;
const ERR_FS_TXN_OUT_OF_DATE: i64 = 160028;
const ERR_FS_PATH_ALREADY_LOCKED: i64 = 160035;
const ERR_FS_NO_SUCH_LOCK: i64 = 160037;
const ERR_FS_BAD_LOCK_TOKEN: i64 = 160038;
const ERR_RA_SVN_MALFORMED_DATA: i64 = 210004;
const ERR_UNKNOWN: i64 = 200000;

/// A fully authenticated session's fixed context: who's connected, which
/// repository they're bound to, and the collaborators every command
/// consults.
pub struct Session<R, W> {
    reader: WireReader<R>,
    writer: WireWriter<W>,
    registry: Arc<RepositoryRegistry>,
    identity: Arc<IdentityMapper>,
    acl: Arc<dyn AclOracle>,
    authenticator: Arc<Authenticator>,
    idle_timeout: Duration,
    editor_timeout: Duration,
    max_rebase_retries: u32,
    user: String,
    repo: Option<Arc<Repository>>,
    repo_name: String,
    /// Path the client's URL was rooted at below the repository name,
    /// e.g. `/trunk` for `svn://host/myrepo/trunk`. Updated by `reparent`.
    root_path: String,
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(
        reader: R,
        writer: W,
        registry: Arc<RepositoryRegistry>,
        identity: Arc<IdentityMapper>,
        acl: Arc<dyn AclOracle>,
        authenticator: Arc<Authenticator>,
        daemon_cfg: &DaemonConfig,
    ) -> Self {
        Self {
            reader: WireReader::new(reader),
            writer: WireWriter::new(writer),
            registry,
            identity,
            acl,
            authenticator,
            idle_timeout: Duration::from_secs(daemon_cfg.idle_timeout_secs),
            editor_timeout: Duration::from_secs(daemon_cfg.editor_timeout_secs),
            max_rebase_retries: daemon_cfg.max_rebase_retries,
            user: String::new(),
            repo: None,
            repo_name: String::new(),
            root_path: "/".to_string(),
        }
    }

    /// Drive one full connection: greeting, auth, repository binding, then
    /// the command loop until the client disconnects or a protocol error
    /// ends the session.
    #[instrument(skip(self), fields(user = tracing::field::Empty))]
    pub async fn run(mut self) -> Result<(), BridgeError> {
        self.send_greeting().await?;
        self.negotiate_auth().await?;
        self.open_repository().await?;
        tracing::Span::current().record("user", self.user.as_str());
        info!(repo = %self.repo_name, user = %self.user, "session established");

        loop {
            let read = timeout(self.idle_timeout, self.reader.read_token()).await;
            let token = match read {
                Ok(Ok(t)) => t,
                Ok(Err(e)) => {
                    debug!(error = %e, "connection closed");
                    return Ok(());
                }
                Err(_) => {
                    warn!("idle timeout, closing session");
                    return Ok(());
                }
            };
            let Some((cmd, params)) = split_command(&token) else {
                self.write_failure(ERR_RA_SVN_MALFORMED_DATA, "malformed command").await?;
                continue;
            };
            if cmd == "EOF" {
                return Ok(());
            }
            match self.dispatch(&cmd, &params).await {
                Ok(()) => {}
                Err(e) => {
                    self.write_failure(code_for(&e), &e.to_string()).await?;
                }
            }
        }
    }

    // -- greeting / auth / open -----------------------------------------

    async fn send_greeting(&mut self) -> Result<(), BridgeError> {
        self.writer.list_begin().await?;
        self.writer.number(PROTOCOL_VERSION).await?;
        self.writer.number(PROTOCOL_VERSION).await?;
        self.writer.list_begin().await?;
        for cap in SERVER_CAPABILITIES {
            self.writer.word(cap).await?;
        }
        self.writer.list_end().await?;
        self.writer.string(b"").await?;
        self.writer.list_end().await?;
        self.writer.flush().await?;

        // Client's announcement: ( version ( cap ... ) url ( ? client-string version ) )
        let _client_hello = self.reader.read_token().await?;
        Ok(())
    }

    async fn negotiate_auth(&mut self) -> Result<(), BridgeError> {
        let mechs = self.authenticator.offered_mechanisms();
        self.writer.list_begin().await?;
        self.writer.word("success").await?;
        self.writer.list_begin().await?;
        self.writer.list_begin().await?;
        for m in &mechs {
            self.writer.word(m).await?;
        }
        self.writer.list_end().await?;
        self.writer.string(b"svnbridge").await?;
        self.writer.list_end().await?;
        self.writer.list_end().await?;
        self.writer.flush().await?;

        let request = self.reader.read_token().await?;
        let items = request.as_list().ok_or(SessionError::Internal)?;
        let mech = items.first().and_then(|t| t.as_word()).unwrap_or("");

        match mech {
            auth::MECH_ANONYMOUS => {
                if !self.authenticator.anonymous_allowed() {
                    self.write_failure(ERR_RA_NOT_AUTHORIZED, "anonymous access not permitted").await?;
                    return Err(AuthError::AnonymousNotPermitted.into());
                }
                self.user = "$anonymous".to_string();
            }
            auth::MECH_CRAM_MD5 => {
                let challenge = self.authenticator.generate_challenge();
                self.writer.list_begin().await?;
                self.writer.word("success").await?;
                self.writer.list_begin().await?;
                self.writer.string(challenge.as_bytes()).await?;
                self.writer.list_end().await?;
                self.writer.list_end().await?;
                self.writer.flush().await?;

                let response = self.reader.read_token().await?;
                let resp_bytes = response.as_string().ok_or(SessionError::Internal)?;
                let text = String::from_utf8_lossy(resp_bytes);
                let mut parts = text.splitn(2, ' ');
                let username = parts.next().unwrap_or("").to_string();
                let secret = parts.next().unwrap_or("");
                self.authenticator.verify_cram_response(&username, secret)?;
                self.user = username;
            }
            other => {
                self.write_failure(ERR_RA_NOT_AUTHORIZED, "unsupported mechanism").await?;
                return Err(AuthError::UnsupportedMechanism(other.to_string()).into());
            }
        }

        self.writer.list_begin().await?;
        self.writer.word("success").await?;
        self.writer.list_begin().await?;
        self.writer.list_end().await?;
        self.writer.list_end().await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn open_repository(&mut self) -> Result<(), BridgeError> {
        let token = self.reader.read_token().await?;
        let items = token.as_list().ok_or(SessionError::Internal)?;
        // ( reparent-args ) actually: ( url:string ( ? ra-client ver ) )
        let url = items
            .first()
            .and_then(|t| t.as_string())
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default();
        let (name, path) = parse_repo_url(&url);
        let repo = self.registry.get(&name)?;
        self.acl_check(&repo, AclOperation::Read, &path, None)?;
        self.root_path = path;
        self.repo_name = name;
        self.repo = Some(repo.clone());

        let latest = repo.revindex().latest()?;
        self.writer.list_begin().await?;
        self.writer.word("success").await?;
        self.writer.list_begin().await?;
        self.writer.string(repo.uuid().as_bytes()).await?;
        self.writer.string(format!("svn://bridge/{}", repo.name()).as_bytes()).await?;
        self.writer.list_begin().await?;
        self.writer.list_end().await?;
        self.writer.list_end().await?;
        self.writer.list_end().await?;
        self.writer.flush().await?;
        let _ = latest;
        Ok(())
    }

    // -- shared helpers ---------------------------------------------------

    fn repo(&self) -> Result<&Arc<Repository>, SessionError> {
        self.repo.as_ref().ok_or(SessionError::Internal)
    }

    fn full_path(&self, client_path: &str) -> String {
        let joined = if client_path.is_empty() || client_path == "/" {
            self.root_path.clone()
        } else if self.root_path == "/" {
            format!("/{client_path}")
        } else {
            format!("{}/{client_path}", self.root_path)
        };
        canonicalize_path(&joined)
    }

    fn acl_check(
        &self,
        repo: &Repository,
        op: AclOperation,
        path: &str,
        rev: Option<Revision>,
    ) -> Result<(), SessionError> {
        let query = AclQuery { user: &self.user, repo: repo.name(), operation: op, path, revision: rev };
        match self.acl.check(&query) {
            AclVerdict::Allow => Ok(()),
            AclVerdict::Deny => Err(SessionError::NotAuthorized { op: format!("{op:?}"), path: path.to_string() }),
        }
    }

    async fn write_failure(&mut self, code: i64, msg: &str) -> Result<(), BridgeError> {
        self.writer.list_begin().await?;
        self.writer.word("failure").await?;
        self.writer.list_begin().await?;
        self.writer.list_begin().await?;
        self.writer.number(code).await?;
        self.writer.string(msg.as_bytes()).await?;
        self.writer.string(b"").await?;
        self.writer.number(0).await?;
        self.writer.list_end().await?;
        self.writer.list_end().await?;
        self.writer.list_end().await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn write_success(&mut self, body: Token) -> Result<(), BridgeError> {
        self.writer.list_begin().await?;
        self.writer.word("success").await?;
        write_token(&mut self.writer, &body).await?;
        self.writer.list_end().await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn write_editor_op(&mut self, op: &EditorOp) -> Result<(), BridgeError> {
        let (cmd, params) = editor_op_to_tokens(op);
        self.writer.list_begin().await?;
        self.writer.word(cmd).await?;
        write_token(&mut self.writer, &Token::List(params)).await?;
        self.writer.list_end().await?;
        Ok(())
    }

    // -- dispatch ----------------------------------------------------------

    async fn dispatch(&mut self, cmd: &str, params: &[Token]) -> Result<(), BridgeError> {
        match cmd {
            "reparent" => self.cmd_reparent(params).await,
            "get-latest-rev" => self.cmd_get_latest_rev().await,
            "get-dated-rev" => self.cmd_get_dated_rev(params).await,
            "change-rev-prop" => self.cmd_change_rev_prop(params).await,
            "rev-proplist" => self.cmd_rev_proplist(params).await,
            "rev-prop" => self.cmd_rev_prop(params).await,
            "check-path" => self.cmd_check_path(params).await,
            "stat" => self.cmd_stat(params).await,
            "get-file" => self.cmd_get_file(params).await,
            "get-dir" => self.cmd_get_dir(params).await,
            "log" => self.cmd_log(params).await,
            "get-locations" => self.cmd_get_locations(params).await,
            "get-location-segments" => self.cmd_get_location_segments(params).await,
            "get-mergeinfo" => self.cmd_get_mergeinfo(params).await,
            "lock" => self.cmd_lock(params).await,
            "unlock" => self.cmd_unlock(params).await,
            "lock-many" => self.cmd_lock_many(params).await,
            "unlock-many" => self.cmd_unlock_many(params).await,
            "get-lock" => self.cmd_get_lock(params).await,
            "get-locks" => self.cmd_get_locks(params).await,
            "update" => self.cmd_report_drive(params, ReportKind::Update).await,
            "switch" => self.cmd_report_drive(params, ReportKind::Switch).await,
            "status" => self.cmd_report_drive(params, ReportKind::Status).await,
            "diff" => self.cmd_report_drive(params, ReportKind::Diff).await,
            "commit" => self.cmd_commit(params).await,
            "replay" => self.cmd_replay(params).await,
            "replay-range" => self.cmd_replay_range(params).await,
            "get-file-revs" => self.cmd_get_file_revs(params).await,
            other => Err(SessionError::UnsupportedCapability(other.to_string()).into()),
        }
    }

    async fn cmd_reparent(&mut self, params: &[Token]) -> Result<(), BridgeError> {
        let url = string_arg(params, 0)?;
        let (name, path) = parse_repo_url(&url);
        if name != self.repo_name {
            return Err(SessionError::RepositoryNotFound(name).into());
        }
        self.root_path = path;
        self.write_success(Token::List(vec![])).await
    }

    async fn cmd_get_latest_rev(&mut self) -> Result<(), BridgeError> {
        let rev = self.repo()?.revindex().latest()?;
        self.write_success(Token::List(vec![Token::Number(rev as i64)])).await
    }

    async fn cmd_get_dated_rev(&mut self, params: &[Token]) -> Result<(), BridgeError> {
        // Scans revisions (most recent first) for the newest one at or
        // before the requested timestamp; linear, acceptable at bridge
        // scale (thousands, not millions, of revisions).
        let date_str = string_arg(params, 0)?;
        let target = chrono::DateTime::parse_from_rfc3339(&date_str)
            .map(|d| d.with_timezone(&chrono::Utc))
            .map_err(|_| SessionError::Internal)?;
        let repo = self.repo()?;
        let latest = repo.revindex().latest()?;
        let mut found = 0u64;
        for rev in (0..=latest).rev() {
            let meta = repo.revindex().lookup_by_rev(rev)?;
            if meta.date <= target {
                found = rev;
                break;
            }
        }
        self.write_success(Token::List(vec![Token::Number(found as i64)])).await
    }

    async fn cmd_change_rev_prop(&mut self, params: &[Token]) -> Result<(), BridgeError> {
        let rev = number_arg(params, 0)? as Revision;
        let name = word_or_string_arg(params, 1)?;
        let value = params.get(2).and_then(|t| t.as_string()).unwrap_or(b"");
        let repo = self.repo()?;
        self.acl_check(repo, AclOperation::Admin, &self.root_path.clone(), Some(rev))?;
        repo.database().set_rev_prop(repo.name(), rev as i64, &name, value)?;
        self.write_success(Token::List(vec![])).await
    }

    async fn cmd_rev_proplist(&mut self, params: &[Token]) -> Result<(), BridgeError> {
        let rev = number_arg(params, 0)? as Revision;
        let repo = self.repo()?;
        let meta = repo.revindex().lookup_by_rev(rev)?;
        let mut props = repo.database().list_rev_props(repo.name(), rev as i64)?;
        if !props.iter().any(|(n, _)| n == "svn:author") {
            props.push(("svn:author".to_string(), meta.author.into_bytes()));
        }
        if !props.iter().any(|(n, _)| n == "svn:log") {
            props.push(("svn:log".to_string(), meta.message.into_bytes()));
        }
        if !props.iter().any(|(n, _)| n == "svn:date") {
            props.push(("svn:date".to_string(), meta.date.to_rfc3339().into_bytes()));
        }
        let items = props
            .into_iter()
            .map(|(n, v)| Token::List(vec![Token::Word(n), Token::String(v)]))
            .collect();
        self.write_success(Token::List(vec![Token::List(items)])).await
    }

    async fn cmd_rev_prop(&mut self, params: &[Token]) -> Result<(), BridgeError> {
        let rev = number_arg(params, 0)? as Revision;
        let name = word_or_string_arg(params, 1)?;
        let repo = self.repo()?;
        let value = match name.as_str() {
            "svn:author" => Some(repo.revindex().lookup_by_rev(rev)?.author.into_bytes()),
            "svn:log" => Some(repo.revindex().lookup_by_rev(rev)?.message.into_bytes()),
            "svn:date" => Some(repo.revindex().lookup_by_rev(rev)?.date.to_rfc3339().into_bytes()),
            _ => repo.database().get_rev_prop(repo.name(), rev as i64, &name)?,
        };
        let body = match value {
            Some(v) => vec![Token::List(vec![Token::String(v)])],
            None => vec![Token::List(vec![])],
        };
        self.write_success(Token::List(body)).await
    }

    async fn cmd_check_path(&mut self, params: &[Token]) -> Result<(), BridgeError> {
        let path = self.full_path(&string_arg(params, 0)?);
        let rev = opt_number_arg(params, 1)?;
        let repo = self.repo()?;
        self.acl_check(repo, AclOperation::Read, &path, rev.map(|r| r as Revision))?;
        let rev = resolve_rev(repo, rev)?;
        let kind = match repo.fs().stat(rev, &path)? {
            Some(node) => node.kind().as_str(),
            None => "none",
        };
        self.write_success(Token::List(vec![Token::Word(kind.to_string())])).await
    }

    async fn cmd_stat(&mut self, params: &[Token]) -> Result<(), BridgeError> {
        let path = self.full_path(&string_arg(params, 0)?);
        let rev = opt_number_arg(params, 1)?;
        let repo = self.repo()?;
        self.acl_check(repo, AclOperation::Read, &path, rev.map(|r| r as Revision))?;
        let rev = resolve_rev(repo, rev)?;
        let body = match repo.fs().stat(rev, &path)? {
            None => vec![Token::List(vec![])],
            Some(node) => {
                let entry = vec![
                    Token::Word(node.kind().as_str().to_string()),
                    Token::Number(match &node {
                        crate::models::Node::File { size, .. } => *size as i64,
                        crate::models::Node::Dir { .. } => 0,
                    }),
                    Token::Word(if node.properties().is_empty() { "false" } else { "true" }.to_string()),
                    Token::Number(node.last_change_rev() as i64),
                    Token::List(vec![Token::String(node.last_change_author().as_bytes().to_vec())]),
                    Token::List(vec![Token::String(node.last_change_date().to_rfc3339().into_bytes())]),
                ];
                vec![Token::List(entry)]
            }
        };
        self.write_success(Token::List(body)).await
    }

    async fn cmd_get_file(&mut self, params: &[Token]) -> Result<(), BridgeError> {
        let path = self.full_path(&string_arg(params, 0)?);
        let rev = opt_number_arg(params, 1)?;
        let want_props = bool_arg(params, 2).unwrap_or(true);
        let want_contents = bool_arg(params, 3).unwrap_or(true);
        let repo = self.repo()?;
        self.acl_check(repo, AclOperation::Read, &path, rev.map(|r| r as Revision))?;
        let rev = resolve_rev(repo, rev)?;
        let node = repo.fs().stat(rev, &path)?.ok_or_else(|| SessionError::Fs(crate::errors::FsError::PathNotFound { rev, path: path.clone() }))?;
        let md5 = match &node {
            crate::models::Node::File { md5, .. } => md5.clone(),
            _ => String::new(),
        };
        let props = if want_props { props_to_tokens(node.properties()) } else { Vec::new() };
        self.writer.list_begin().await?;
        self.writer.word("success").await?;
        self.writer.list_begin().await?;
        self.writer.string(md5.as_bytes()).await?;
        self.writer.number(rev as i64).await?;
        self.writer.list_begin().await?;
        for t in &props {
            write_token(&mut self.writer, t).await?;
        }
        self.writer.list_end().await?;
        self.writer.list_end().await?;
        self.writer.list_end().await?;
        self.writer.flush().await?;

        if want_contents {
            let content = repo.fs().read(rev, &path)?;
            self.writer.string(&content).await?;
            self.writer.string(b"").await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    async fn cmd_get_dir(&mut self, params: &[Token]) -> Result<(), BridgeError> {
        let path = self.full_path(&string_arg(params, 0)?);
        let rev = opt_number_arg(params, 1)?;
        let want_props = bool_arg(params, 2).unwrap_or(true);
        let want_contents = bool_arg(params, 3).unwrap_or(true);
        let repo = self.repo()?;
        self.acl_check(repo, AclOperation::Read, &path, rev.map(|r| r as Revision))?;
        let rev = resolve_rev(repo, rev)?;
        let node = repo.fs().stat(rev, &path)?.ok_or_else(|| SessionError::Fs(crate::errors::FsError::PathNotFound { rev, path: path.clone() }))?;
        let props = if want_props { props_to_tokens(node.properties()) } else { Vec::new() };
        let entries = if want_contents { repo.fs().list(rev, &path)? } else { Vec::new() };
        let entry_tokens: Vec<Token> = entries
            .into_iter()
            .map(|e| {
                Token::List(vec![
                    Token::String(e.name.into_bytes()),
                    Token::Word(e.kind.as_str().to_string()),
                    Token::Number(0),
                    Token::Word("false".to_string()),
                    Token::Number(e.last_change_rev as i64),
                    Token::List(vec![Token::String(e.last_change_author.into_bytes())]),
                    Token::List(vec![Token::String(e.last_change_date.to_rfc3339().into_bytes())]),
                ])
            })
            .collect();
        self.write_success(Token::List(vec![
            Token::Number(rev as i64),
            Token::List(props),
            Token::List(entry_tokens),
        ]))
        .await
    }

    async fn cmd_log(&mut self, params: &[Token]) -> Result<(), BridgeError> {
        let paths: Vec<String> = params
            .first()
            .and_then(|t| t.as_list())
            .map(|items| items.iter().filter_map(|t| t.as_string()).map(|b| self.full_path(&String::from_utf8_lossy(b))).collect())
            .unwrap_or_default();
        let start = number_arg(params, 1)? as Revision;
        let end = number_arg(params, 2)? as Revision;
        let limit = opt_number_arg(params, 3)?.unwrap_or(0) as u32;
        let repo = self.repo()?;
        self.acl_check(repo, AclOperation::Read, &self.root_path.clone(), None)?;
        let (from, to) = if start <= end { (start, end) } else { (end, start) };
        let entries = repo.fs().log(&paths, from, to, limit)?;
        for entry in &entries {
            let changed: Vec<Token> = entry
                .changed_paths
                .iter()
                .map(|cp| {
                    Token::List(vec![
                        Token::String(cp.path.clone().into_bytes()),
                        Token::Word(change_action_word(cp.action).to_string()),
                        match &cp.copy_from_path {
                            Some(p) => Token::List(vec![Token::String(p.clone().into_bytes())]),
                            None => Token::List(vec![]),
                        },
                        match cp.copy_from_rev {
                            Some(r) => Token::List(vec![Token::Number(r)]),
                            None => Token::List(vec![]),
                        },
                    ])
                })
                .collect();
            let body = Token::List(vec![
                Token::List(changed),
                Token::Number(entry.rev as i64),
                Token::List(vec![Token::String(entry.author.clone().into_bytes())]),
                Token::List(vec![Token::String(entry.date.to_rfc3339().into_bytes())]),
                Token::List(vec![Token::String(entry.message.clone().into_bytes())]),
            ]);
            self.writer.list_begin().await?;
            write_token(&mut self.writer, &body).await?;
            self.writer.list_end().await?;
        }
        self.write_success(Token::List(vec![])).await
    }

    async fn cmd_get_locations(&mut self, params: &[Token]) -> Result<(), BridgeError> {
        let path = self.full_path(&string_arg(params, 0)?);
        let peg_rev = number_arg(params, 1)? as Revision;
        let revs: Vec<Revision> = params
            .get(2)
            .and_then(|t| t.as_list())
            .map(|items| items.iter().filter_map(|t| t.as_number()).map(|n| n as Revision).collect())
            .unwrap_or_default();
        let repo = self.repo()?;
        self.acl_check(repo, AclOperation::Read, &path, Some(peg_rev))?;
        let history = repo.fs().history(peg_rev, &path, 0)?;
        for rev in revs {
            if let Some((_, located_path)) = history.iter().find(|(r, _)| *r <= rev).cloned() {
                self.writer.list_begin().await?;
                self.writer.number(rev as i64).await?;
                self.writer.string(located_path.as_bytes()).await?;
                self.writer.list_end().await?;
            }
        }
        self.write_success(Token::List(vec![])).await
    }

    async fn cmd_get_location_segments(&mut self, params: &[Token]) -> Result<(), BridgeError> {
        let path = self.full_path(&string_arg(params, 0)?);
        let peg_rev = opt_number_arg(params, 1)?;
        let repo = self.repo()?;
        let peg = resolve_rev(repo, peg_rev)?;
        self.acl_check(repo, AclOperation::Read, &path, Some(peg))?;
        let history = repo.fs().history(peg, &path, 0)?;
        // `history` is newest-first; a segment is the inclusive [start,end]
        // range a given path string covered before a copy/rename changed it.
        let mut rev_end = peg;
        for window in history.windows(2) {
            let (rev, p) = &window[0];
            let (_, next_p) = &window[1];
            if next_p != p {
                self.writer.list_begin().await?;
                self.writer.number(*rev as i64).await?;
                self.writer.number(rev_end as i64).await?;
                self.writer.string(p.trim_start_matches('/').as_bytes()).await?;
                self.writer.list_end().await?;
                rev_end = rev.saturating_sub(1);
            }
        }
        if let Some((rev, p)) = history.last() {
            self.writer.list_begin().await?;
            self.writer.number(*rev as i64).await?;
            self.writer.number(rev_end as i64).await?;
            self.writer.string(p.trim_start_matches('/').as_bytes()).await?;
            self.writer.list_end().await?;
        }
        self.write_success(Token::List(vec![])).await
    }

    /// No merge-tracking backend: mergeinfo for a path is empty unless the
    /// latest commit carries a `svn:mergeinfo`-shaped git-note, in which case
    /// that note's content is returned verbatim for every requested path.
    async fn cmd_get_mergeinfo(&mut self, params: &[Token]) -> Result<(), BridgeError> {
        let repo = self.repo()?;
        let paths = params
            .first()
            .and_then(|t| t.as_list())
            .map(|items| items.iter().filter_map(|t| t.as_string()).map(|b| String::from_utf8_lossy(b).into_owned()).collect::<Vec<_>>())
            .unwrap_or_default();
        let latest = repo.revindex().latest()?;
        let note = match repo.revindex().lookup_by_rev(latest)?.commit_sha {
            Some(sha) => repo.git().read_mergeinfo_note(&sha)?,
            None => None,
        };
        let entries = match note {
            Some(mergeinfo) => paths
                .into_iter()
                .map(|p| Token::List(vec![Token::String(p.into_bytes()), Token::String(mergeinfo.clone().into_bytes())]))
                .collect(),
            None => Vec::new(),
        };
        self.write_success(Token::List(vec![Token::List(entries)])).await
    }

    async fn cmd_lock(&mut self, params: &[Token]) -> Result<(), BridgeError> {
        let path = self.full_path(&string_arg(params, 0)?);
        let comment = params.get(1).and_then(|t| t.as_string()).map(|b| String::from_utf8_lossy(b).into_owned());
        let steal = bool_arg(params, 2).unwrap_or(false);
        let repo = self.repo()?;
        self.acl_check(repo, AclOperation::Write, &path, None)?;
        let lock = repo.lock(&path, &self.user, comment.as_deref(), steal)?;
        self.write_success(Token::List(vec![lock_to_token(&lock)])).await
    }

    async fn cmd_unlock(&mut self, params: &[Token]) -> Result<(), BridgeError> {
        let path = self.full_path(&string_arg(params, 0)?);
        let token = string_arg(params, 1).unwrap_or_default();
        let force = bool_arg(params, 2).unwrap_or(false);
        let repo = self.repo()?;
        self.acl_check(repo, AclOperation::Write, &path, None)?;
        repo.unlock(&path, &token, &self.user, force)?;
        self.write_success(Token::List(vec![])).await
    }

    async fn cmd_lock_many(&mut self, params: &[Token]) -> Result<(), BridgeError> {
        let comment = params.first().and_then(|t| t.as_string()).map(|b| String::from_utf8_lossy(b).into_owned());
        let steal = bool_arg(params, 1).unwrap_or(false);
        let paths: Vec<String> = params
            .get(2)
            .and_then(|t| t.as_list())
            .map(|items| items.iter().filter_map(|t| t.as_string()).map(|b| self.full_path(&String::from_utf8_lossy(b))).collect())
            .unwrap_or_default();
        let repo = self.repo()?.clone();
        for path in paths {
            self.acl_check(&repo, AclOperation::Write, &path, None)?;
            match repo.lock(&path, &self.user, comment.as_deref(), steal) {
                Ok(lock) => {
                    self.writer.list_begin().await?;
                    self.writer.word("success").await?;
                    write_token(&mut self.writer, &lock_to_token(&lock)).await?;
                    self.writer.list_end().await?;
                }
                Err(e) => self.write_failure(ERR_FS_PATH_ALREADY_LOCKED, &e.to_string()).await?,
            }
        }
        self.write_success(Token::List(vec![])).await
    }

    async fn cmd_unlock_many(&mut self, params: &[Token]) -> Result<(), BridgeError> {
        let force = bool_arg(params, 0).unwrap_or(false);
        let pairs: Vec<(String, String)> = params
            .get(1)
            .and_then(|t| t.as_list())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|t| t.as_list())
                    .map(|pair| {
                        let path = pair.first().and_then(|t| t.as_string()).map(|b| String::from_utf8_lossy(b).into_owned()).unwrap_or_default();
                        let token = pair.get(1).and_then(|t| t.as_list()).and_then(|l| l.first()).and_then(|t| t.as_string()).map(|b| String::from_utf8_lossy(b).into_owned()).unwrap_or_default();
                        (self.full_path(&path), token)
                    })
                    .collect()
            })
            .unwrap_or_default();
        let repo = self.repo()?.clone();
        for (path, tok) in pairs {
            self.acl_check(&repo, AclOperation::Write, &path, None)?;
            match repo.unlock(&path, &tok, &self.user, force) {
                Ok(()) => {
                    self.writer.list_begin().await?;
                    self.writer.word("success").await?;
                    self.writer.list_begin().await?;
                    self.writer.list_end().await?;
                    self.writer.list_end().await?;
                }
                Err(e) => self.write_failure(ERR_FS_NO_SUCH_LOCK, &e.to_string()).await?,
            }
        }
        self.write_success(Token::List(vec![])).await
    }

    async fn cmd_get_lock(&mut self, params: &[Token]) -> Result<(), BridgeError> {
        let path = self.full_path(&string_arg(params, 0)?);
        let repo = self.repo()?;
        self.acl_check(repo, AclOperation::Read, &path, None)?;
        let body = match repo.get_lock(&path)? {
            Some(lock) => vec![lock_to_token(&lock)],
            None => vec![],
        };
        self.write_success(Token::List(body)).await
    }

    async fn cmd_get_locks(&mut self, params: &[Token]) -> Result<(), BridgeError> {
        let path = self.full_path(&string_arg(params, 0)?);
        let repo = self.repo()?;
        self.acl_check(repo, AclOperation::Read, &path, None)?;
        let locks = repo.list_locks(&path)?;
        let items = locks.iter().map(lock_to_token).collect();
        self.write_success(Token::List(vec![Token::List(items)])).await
    }

    async fn cmd_get_file_revs(&mut self, params: &[Token]) -> Result<(), BridgeError> {
        let path = self.full_path(&string_arg(params, 0)?);
        let start = number_arg(params, 1)? as Revision;
        let end = number_arg(params, 2)? as Revision;
        let repo = self.repo()?;
        self.acl_check(repo, AclOperation::Read, &path, None)?;
        let mut history = repo.fs().history(end, &path, 0)?;
        history.retain(|(r, _)| *r >= start && *r <= end);
        history.reverse();
        let mut prev_content: Vec<u8> = Vec::new();
        for (rev, p) in history {
            let content = repo.fs().read(rev, &p)?;
            let delta = crate::delta::encode(&prev_content, &content);
            let props = repo.fs().properties(rev, &p)?;
            let body = Token::List(vec![
                Token::String(p.trim_start_matches('/').as_bytes().to_vec()),
                Token::Number(rev as i64),
                Token::List(props_to_tokens(&props)),
                Token::List(vec![]),
                Token::Word("true".to_string()),
            ]);
            self.writer.list_begin().await?;
            write_token(&mut self.writer, &body).await?;
            self.writer.list_end().await?;
            self.writer.string(&delta).await?;
            self.writer.string(b"").await?;
            prev_content = content;
        }
        self.write_success(Token::List(vec![])).await
    }

    async fn cmd_replay(&mut self, params: &[Token]) -> Result<(), BridgeError> {
        let rev = number_arg(params, 0)? as Revision;
        self.replay_one(rev).await
    }

    async fn cmd_replay_range(&mut self, params: &[Token]) -> Result<(), BridgeError> {
        let start = number_arg(params, 0)? as Revision;
        let end = number_arg(params, 1)? as Revision;
        for rev in start..=end {
            self.replay_one(rev).await?;
        }
        self.write_success(Token::List(vec![])).await
    }

    async fn replay_one(&mut self, rev: Revision) -> Result<(), BridgeError> {
        let repo = self.repo()?;
        self.acl_check(repo, AclOperation::Read, &self.root_path.clone(), Some(rev))?;
        let mut report = Report::new();
        report.set_path("/", rev.saturating_sub(1), false, None, Depth::Infinity)?;
        report.finish()?;
        let ops = drive_update(repo.fs(), &report, rev, None)?;
        for op in &ops {
            self.write_editor_op(op).await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    async fn cmd_report_drive(&mut self, params: &[Token], kind: ReportKind) -> Result<(), BridgeError> {
        let target_path = self.full_path(&string_arg(params, 0)?);
        let target_rev = opt_number_arg(params, 1)?;
        let repo = self.repo()?;
        self.acl_check(repo, AclOperation::Read, &target_path, None)?;
        let target_rev = resolve_rev(repo, target_rev)?;

        let report = self.read_report().await?;
        let switch_target = match kind {
            ReportKind::Switch => Some(target_path.as_str()),
            _ => None,
        };
        let ops = drive_update(self.repo()?.fs(), &report, target_rev, switch_target)?;
        for op in &ops {
            self.write_editor_op(op).await?;
        }
        self.write_success(Token::List(vec![])).await
    }

    async fn read_report(&mut self) -> Result<Report, BridgeError> {
        let mut report = Report::new();
        loop {
            let token = self.reader.read_token().await?;
            let Some((cmd, params)) = split_command(&token) else {
                return Err(SessionError::Internal.into());
            };
            match cmd.as_str() {
                "set-path" => {
                    let path = string_arg(&params, 0)?;
                    let rev = number_arg(&params, 1)? as Revision;
                    let start_empty = bool_arg(&params, 2).unwrap_or(false);
                    let lock_token = params.get(3).and_then(|t| t.as_list()).and_then(|l| l.first()).and_then(|t| t.as_string()).map(|b| String::from_utf8_lossy(b).into_owned());
                    let depth = params.get(4).and_then(|t| t.as_word()).and_then(Depth::from_wire).unwrap_or(Depth::Infinity);
                    report.set_path(&path, rev, start_empty, lock_token, depth)?;
                }
                "delete-path" => {
                    let path = string_arg(&params, 0)?;
                    report.delete_path(&path)?;
                }
                "link-path" => {
                    // Treated as a plain set-path against the local name;
                    // this bridge doesn't special-case cross-tree pegging.
                    let path = string_arg(&params, 1)?;
                    let rev = number_arg(&params, 2)? as Revision;
                    let start_empty = bool_arg(&params, 3).unwrap_or(false);
                    report.set_path(&path, rev, start_empty, None, Depth::Infinity)?;
                }
                "finish-report" => {
                    report.finish()?;
                    break;
                }
                "abort-report" => return Err(SessionError::Internal.into()),
                other => return Err(SessionError::UnsupportedCapability(other.to_string()).into()),
            }
        }
        Ok(report)
    }

    async fn cmd_commit(&mut self, params: &[Token]) -> Result<(), BridgeError> {
        let message = string_arg(params, 0)?;
        let repo = self.repo()?.clone();
        self.acl_check(&repo, crate::models::AclOperation::Write, &self.root_path.clone(), None)?;

        let identity = self.identity.git_identity_for(&self.user)?;
        let lock_tokens: HashMap<String, String> = params
            .get(3)
            .and_then(|t| t.as_list())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|t| t.as_list())
                    .filter_map(|pair| {
                        let path = pair.first()?.as_string()?;
                        let tok = pair.get(1)?.as_string()?;
                        Some((self.full_path(&String::from_utf8_lossy(path)), String::from_utf8_lossy(tok).into_owned()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let base_rev = repo.revindex().latest()?;
        let mut builder = CommitBuilder::new(
            repo.clone(),
            base_rev,
            identity.name,
            identity.email,
            message,
            lock_tokens,
            self.max_rebase_retries,
        )?;

        self.write_success(Token::List(vec![])).await?;

        let result = loop {
            let elapsed = timeout(self.editor_timeout, self.reader.read_token()).await.map_err(|_| SessionError::Timeout(self.editor_timeout))?;
            let token = elapsed?;
            let Some((cmd, cparams)) = split_command(&token) else {
                return Err(SessionError::Internal.into());
            };
            match drive_commit_command(&mut builder, &cmd, &cparams) {
                Ok(true) => continue,
                Ok(false) => break builder.close_edit()?,
                Err(CommitError::IllegalEditorState(_, _)) if cmd == "abort-edit" => {
                    builder.abort_edit()?;
                    return self.write_success(Token::List(vec![])).await;
                }
                Err(e) => return Err(BridgeError::from(e)),
            }
        };

        repo.refresh()?;
        let body = Token::List(vec![
            Token::Number(result.revision as i64),
            Token::List(vec![]),
            Token::List(vec![]),
        ]);
        self.write_success(body).await
    }
}

#[derive(Clone, Copy)]
enum ReportKind {
    Update,
    Switch,
    Status,
    Diff,
}

/// Drives a single editor-protocol command into the in-progress commit.
/// Returns `Ok(true)` to keep reading, `Ok(false)` on `close-edit`.
fn drive_commit_command(builder: &mut CommitBuilder, cmd: &str, params: &[Token]) -> Result<bool, CommitError> {
    match cmd {
        "open-root" => {
            let token = word_arg(params, 1);
            builder.open_root(&token)?;
        }
        "delete-entry" => {
            let name = path_tail(&string_or_empty(params, 0));
            let parent = word_arg(params, 2);
            builder.delete_entry(&parent, &name)?;
        }
        "add-dir" => {
            let name = path_tail(&string_or_empty(params, 0));
            let parent = word_arg(params, 1);
            let token = word_arg(params, 2);
            let copy_from = copy_from_arg(params, 3);
            builder.add_dir(&parent, &name, &token, copy_from)?;
        }
        "open-dir" => {
            let name = path_tail(&string_or_empty(params, 0));
            let parent = word_arg(params, 1);
            let token = word_arg(params, 2);
            builder.open_dir(&parent, &name, &token)?;
        }
        "change-dir-prop" => {
            let token = word_arg(params, 0);
            let name = string_or_empty(params, 1);
            let value = params.get(2).and_then(|t| t.as_list()).and_then(|l| l.first()).and_then(|t| t.as_string()).map(|b| b.to_vec());
            builder.change_dir_prop(&token, &name, value)?;
        }
        "close-dir" => {
            let token = word_arg(params, 0);
            builder.close_dir(&token)?;
        }
        "add-file" => {
            let name = path_tail(&string_or_empty(params, 0));
            let parent = word_arg(params, 1);
            let token = word_arg(params, 2);
            let copy_from = copy_from_arg(params, 3);
            builder.add_file(&parent, &name, &token, copy_from)?;
        }
        "open-file" => {
            let name = path_tail(&string_or_empty(params, 0));
            let parent = word_arg(params, 1);
            let token = word_arg(params, 2);
            let rev = params.get(3).and_then(|t| t.as_number()).unwrap_or(0) as Revision;
            builder.open_file(&parent, &name, &token, rev)?;
        }
        "apply-textdelta" => {
            let token = word_arg(params, 0);
            let checksum = params.get(1).and_then(|t| t.as_list()).and_then(|l| l.first()).and_then(|t| t.as_string()).map(|b| String::from_utf8_lossy(b).into_owned());
            builder.apply_text_delta(&token, checksum)?;
        }
        "textdelta-chunk" => {
            let token = word_arg(params, 0);
            let chunk = params.get(1).and_then(|t| t.as_string()).unwrap_or(b"");
            builder.text_delta_chunk(&token, chunk)?;
        }
        "textdelta-end" => {
            let token = word_arg(params, 0);
            builder.text_delta_end(&token)?;
        }
        "change-file-prop" => {
            let token = word_arg(params, 0);
            let name = string_or_empty(params, 1);
            let value = params.get(2).and_then(|t| t.as_list()).and_then(|l| l.first()).and_then(|t| t.as_string()).map(|b| b.to_vec());
            builder.change_file_prop(&token, &name, value)?;
        }
        "close-file" => {
            let token = word_arg(params, 0);
            let checksum = params.get(1).and_then(|t| t.as_list()).and_then(|l| l.first()).and_then(|t| t.as_string()).map(|b| String::from_utf8_lossy(b).into_owned());
            builder.close_file(&token, checksum)?;
        }
        "close-edit" => return Ok(false),
        "abort-edit" => return Err(CommitError::IllegalEditorState("abort-edit", "abort")),
        _ => return Err(CommitError::IllegalEditorState("commit", "unknown command")),
    }
    Ok(true)
}

fn copy_from_arg(params: &[Token], idx: usize) -> Option<(String, Revision)> {
    let path = params.get(idx).and_then(|t| t.as_list()).and_then(|l| l.first()).and_then(|t| t.as_string())?;
    let rev = params.get(idx + 1).and_then(|t| t.as_list()).and_then(|l| l.first()).and_then(|t| t.as_number())?;
    Some((String::from_utf8_lossy(path).into_owned(), rev as Revision))
}

fn path_tail(full: &str) -> String {
    full.rsplit('/').next().unwrap_or(full).to_string()
}

fn word_arg(params: &[Token], idx: usize) -> String {
    params.get(idx).and_then(|t| t.as_word()).unwrap_or("").to_string()
}

fn string_or_empty(params: &[Token], idx: usize) -> String {
    params
        .get(idx)
        .and_then(|t| t.as_string())
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default()
}

fn editor_op_to_tokens(op: &EditorOp) -> (&'static str, Vec<Token>) {
    match op {
        EditorOp::OpenRoot { rev } => ("open-root", vec![Token::Number(*rev as i64), Token::Word("r0".into())]),
        EditorOp::DeleteEntry { path } => ("delete-entry", vec![Token::String(path.clone().into_bytes())]),
        EditorOp::AddDir { path, copy_from } => (
            "add-dir",
            vec![
                Token::String(path.clone().into_bytes()),
                Token::Word("d".into()),
                Token::Word(token_for(path)),
                match copy_from {
                    Some((p, r)) => Token::List(vec![Token::String(p.clone().into_bytes()), Token::Number(*r as i64)]),
                    None => Token::List(vec![]),
                },
            ],
        ),
        EditorOp::OpenDir { path, rev } => (
            "open-dir",
            vec![Token::String(path.clone().into_bytes()), Token::Word("d".into()), Token::Word(token_for(path)), Token::Number(*rev as i64)],
        ),
        EditorOp::ChangeDirProp { path, name, value } => (
            "change-dir-prop",
            vec![
                Token::Word(token_for(path)),
                Token::String(name.clone().into_bytes()),
                match value {
                    Some(v) => Token::List(vec![Token::String(v.clone())]),
                    None => Token::List(vec![]),
                },
            ],
        ),
        EditorOp::CloseDir { path } => ("close-dir", vec![Token::Word(token_for(path))]),
        EditorOp::AddFile { path, copy_from } => (
            "add-file",
            vec![
                Token::String(path.clone().into_bytes()),
                Token::Word("d".into()),
                Token::Word(token_for(path)),
                match copy_from {
                    Some((p, r)) => Token::List(vec![Token::String(p.clone().into_bytes()), Token::Number(*r as i64)]),
                    None => Token::List(vec![]),
                },
            ],
        ),
        EditorOp::OpenFile { path, rev } => (
            "open-file",
            vec![Token::String(path.clone().into_bytes()), Token::Word("d".into()), Token::Word(token_for(path)), Token::Number(*rev as i64)],
        ),
        EditorOp::ChangeFileProp { path, name, value } => (
            "change-file-prop",
            vec![
                Token::Word(token_for(path)),
                Token::String(name.clone().into_bytes()),
                match value {
                    Some(v) => Token::List(vec![Token::String(v.clone())]),
                    None => Token::List(vec![]),
                },
            ],
        ),
        EditorOp::ApplyTextDelta { path, base_checksum, delta: _ } => (
            "apply-textdelta",
            vec![
                Token::Word(token_for(path)),
                match base_checksum {
                    Some(c) => Token::List(vec![Token::String(c.clone().into_bytes())]),
                    None => Token::List(vec![]),
                },
            ],
        ),
        EditorOp::CloseFile { path, text_checksum } => (
            "close-file",
            vec![
                Token::Word(token_for(path)),
                match text_checksum {
                    Some(c) => Token::List(vec![Token::String(c.clone().into_bytes())]),
                    None => Token::List(vec![]),
                },
            ],
        ),
    }
}

fn token_for(path: &str) -> String {
    format!("t{:x}", md5::compute(path.as_bytes()))[..9].to_string()
}

fn change_action_word(action: crate::models::ChangeAction) -> &'static str {
    match action {
        crate::models::ChangeAction::Added => "A",
        crate::models::ChangeAction::Deleted => "D",
        crate::models::ChangeAction::Modified => "M",
        crate::models::ChangeAction::Replaced => "R",
    }
}

fn lock_to_token(lock: &crate::models::Lock) -> Token {
    Token::List(vec![
        Token::String(lock.path.clone().into_bytes()),
        Token::String(lock.token.clone().into_bytes()),
        Token::String(lock.owner.clone().into_bytes()),
        match &lock.comment {
            Some(c) => Token::List(vec![Token::String(c.clone().into_bytes())]),
            None => Token::List(vec![]),
        },
        Token::String(lock.created_at.to_rfc3339().into_bytes()),
        Token::List(vec![]),
    ])
}

fn props_to_tokens(props: &crate::models::PropertyMap) -> Vec<Token> {
    props
        .regular()
        .map(|(k, v)| Token::List(vec![Token::Word(k.to_string()), Token::String(v.to_vec())]))
        .collect()
}

fn resolve_rev(repo: &Repository, rev: Option<i64>) -> Result<Revision, SessionError> {
    Ok(match rev {
        Some(r) => r as Revision,
        None => repo.revindex().latest()?,
    })
}

fn split_command(token: &Token) -> Option<(String, Vec<Token>)> {
    let items = token.as_list()?;
    let cmd = items.first()?.as_word()?.to_string();
    let params = items.get(1)?.as_list()?.to_vec();
    Some((cmd, params))
}

fn parse_repo_url(url: &str) -> (String, String) {
    let stripped = url.strip_prefix("svn://").unwrap_or(url);
    let after_host = stripped.splitn(2, '/').nth(1).unwrap_or("");
    let mut parts = after_host.splitn(2, '/');
    let name = parts.next().unwrap_or("").to_string();
    let rest = parts.next().unwrap_or("");
    (name, canonicalize_path(rest))
}

fn string_arg(params: &[Token], idx: usize) -> Result<String, SessionError> {
    params
        .get(idx)
        .and_then(|t| t.as_string())
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .ok_or(SessionError::Internal)
}

fn word_or_string_arg(params: &[Token], idx: usize) -> Result<String, SessionError> {
    match params.get(idx) {
        Some(Token::Word(w)) => Ok(w.clone()),
        Some(Token::String(s)) => Ok(String::from_utf8_lossy(s).into_owned()),
        _ => Err(SessionError::Internal),
    }
}

fn number_arg(params: &[Token], idx: usize) -> Result<i64, SessionError> {
    params.get(idx).and_then(|t| t.as_number()).ok_or(SessionError::Internal)
}

fn opt_number_arg(params: &[Token], idx: usize) -> Result<Option<i64>, SessionError> {
    match params.get(idx) {
        None => Ok(None),
        Some(Token::List(items)) => Ok(items.first().and_then(|t| t.as_number())),
        Some(t) => Ok(t.as_number()),
    }
}

fn bool_arg(params: &[Token], idx: usize) -> Option<bool> {
    match params.get(idx)?.as_word()? {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

fn write_token<'a, W: AsyncWrite + Unpin + Send>(
    w: &'a mut WireWriter<W>,
    token: &'a Token,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), crate::errors::WireError>> + Send + 'a>> {
    Box::pin(async move {
        match token {
            Token::Number(n) => w.number(*n).await,
            Token::Word(s) => w.word(s).await,
            Token::String(s) => w.string(s).await,
            Token::List(items) => {
                w.list_begin().await?;
                for item in items {
                    write_token(w, item).await?;
                }
                w.list_end().await
            }
        }
    })
}

fn code_for(err: &BridgeError) -> i64 {
    match err {
        BridgeError::Auth(_) | BridgeError::Session(SessionError::NotAuthorized { .. }) => ERR_RA_NOT_AUTHORIZED,
        BridgeError::Fs(crate::errors::FsError::PathNotFound { .. }) => ERR_FS_NOT_FOUND,
        BridgeError::Commit(CommitError::OutOfDate(_)) => ERR_FS_TXN_OUT_OF_DATE,
        BridgeError::Commit(CommitError::LockDenied(_)) => ERR_FS_BAD_LOCK_TOKEN,
        BridgeError::Session(SessionError::RepositoryNotFound(_)) => ERR_FS_NOT_FOUND,
        _ => ERR_UNKNOWN,
    }
}

impl IdentityMapper {
    /// Convenience used by the commit handler: `$anonymous` maps to a fixed
    /// placeholder identity rather than going through the mapping chain.
    pub fn git_identity_for(&self, svn_user: &str) -> Result<crate::identity::GitIdentity, crate::errors::IdentityError> {
        if svn_user == "$anonymous" {
            return Ok(crate::identity::GitIdentity { name: "anonymous".to_string(), email: "anonymous@svnbridge.local".to_string() });
        }
        self.svn_to_git(svn_user)
    }
}
