//! The repository engine: registration, update, export.
//!
//! An update moves through
//! `Authenticating -> Ingesting -> Verifying -> Committing -> Done`, or
//! stops in `Rejected`. Nothing durable changes before `Committing`; the
//! account root moves only through a compare-and-swap at its very end.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, info, warn};

use crate::auth::{Action, AuthError, CapabilityVerifier, Did, bearer_token};
use crate::car::{ArchiveReader, CarError, write_car};
use crate::config::LimitsConfig;
use crate::deadline::Deadline;
use crate::graph::verify_completeness;
use crate::metrics::RepoMetrics;
use crate::registry::{AccountRegistry, BindOutcome, RegistryError};
use crate::storage::{BlockStore, MemoryBlockStore, StorageError, copy_all};
use crate::types::{AccountRecord, Cid, empty_posts_node};

use super::error::{ProtocolError, RepoError};

const MAX_NAME_LEN: usize = 64;

/// Checks an account name: 1-64 characters of `[a-z0-9._-]`.
pub fn validate_account_name(name: &str) -> Result<(), ProtocolError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(ProtocolError::InvalidName(name.to_string()))
    }
}

/// Stage of an update request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateState {
    Authenticating,
    Ingesting,
    Verifying,
    Committing,
    Done,
    Rejected,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdateState::Authenticating => "authenticating",
            UpdateState::Ingesting => "ingesting",
            UpdateState::Verifying => "verifying",
            UpdateState::Committing => "committing",
            UpdateState::Done => "done",
            UpdateState::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// Tracks and logs the stage an update has reached.
struct Progress {
    state: UpdateState,
}

impl Progress {
    fn start() -> Self {
        debug!(state = %UpdateState::Authenticating, "update started");
        Self {
            state: UpdateState::Authenticating,
        }
    }

    fn enter(&mut self, next: UpdateState) {
        debug!(from = %self.state, to = %next, "update state");
        self.state = next;
    }
}

/// An update as received from a client.
pub struct UpdateRequest<'a, Rd> {
    /// Raw `Authorization` header value, if any.
    pub authorization: Option<&'a str>,
    /// The archive stream. Not read until the token has been checked.
    pub archive: Rd,
    /// Root the client believes is current. Defaults to the root observed
    /// while the request is processed.
    pub expected_root: Option<Cid>,
}

/// A committed update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub account: String,
    pub previous: Option<Cid>,
    pub root: Cid,
    /// Staged blocks reachable from the root that were not durable before.
    pub introduced: usize,
    /// Staged blocks written to the durable store.
    pub merged: usize,
}

/// A successful registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterOutcome {
    pub name: String,
    pub did: Did,
    pub root: Cid,
    /// `false` when the name was already registered to the same identity.
    pub created: bool,
}

/// Orchestrates the repository protocol over a durable block store and an
/// account registry.
///
/// Generic over:
///
/// - `S`: durable storage implementing [`BlockStore`],
/// - `R`: the name registry implementing [`AccountRegistry`].
pub struct RepoEngine<S, R> {
    durable: S,
    registry: R,
    verifier: CapabilityVerifier,
    limits: LimitsConfig,
    metrics: Option<RepoMetrics>,
}

impl<S, R> RepoEngine<S, R>
where
    S: BlockStore,
    R: AccountRegistry,
{
    pub fn new(durable: S, registry: R, verifier: CapabilityVerifier, limits: LimitsConfig) -> Self {
        Self {
            durable,
            registry,
            verifier,
            limits,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: RepoMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn durable(&self) -> &S {
        &self.durable
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    /// This server's identity, the audience every token must name.
    pub fn server_did(&self) -> &Did {
        self.verifier.server_did()
    }

    /// Current root of `name`.
    pub fn lookup(&self, name: &str) -> Result<Cid, RepoError> {
        self.registry
            .lookup(name)
            .map_err(|e| registry_error(name, e))?
            .ok_or_else(|| RepoError::NotFound(name.to_string()))
    }

    /// Decoded account record at the current root of `name`.
    pub fn account(&self, name: &str) -> Result<AccountRecord, RepoError> {
        let root = self.lookup(name)?;
        self.durable_record(&root)
    }

    /// Binds `name` to the token issuer and gives it an initial graph.
    ///
    /// Registering a name again with the same identity succeeds and returns
    /// the current root.
    pub fn register(
        &self,
        authorization: Option<&str>,
        name: &str,
    ) -> Result<RegisterOutcome, RepoError> {
        let result = self.try_register(authorization, name);
        match &result {
            Ok(outcome) if outcome.created => {
                info!(account = %outcome.name, did = %outcome.did, root = %outcome.root, "account registered")
            }
            Ok(outcome) => debug!(account = %outcome.name, "account already registered"),
            Err(e) => warn!(account = name, error = %e, "registration rejected"),
        }
        result
    }

    fn try_register(
        &self,
        authorization: Option<&str>,
        name: &str,
    ) -> Result<RegisterOutcome, RepoError> {
        let token = self.verifier.verify(bearer_token(authorization)?)?;
        validate_account_name(name)?;
        let did = token.issuer().clone();

        let created = match self.registry.bind(name, &did) {
            Ok(BindOutcome::Created) => true,
            Ok(BindOutcome::AlreadyBound) => false,
            Err(e) => return Err(registry_error(name, e)),
        };

        let root = match self.registry.lookup(name).map_err(|e| registry_error(name, e))? {
            Some(root) => root,
            // Fresh binding, or an earlier registration stopped before its
            // initial root was written.
            None => self.initialize(name, &did)?,
        };

        Ok(RegisterOutcome {
            name: name.to_string(),
            did,
            root,
            created,
        })
    }

    fn initialize(&self, name: &str, did: &Did) -> Result<Cid, RepoError> {
        self.durable.put(empty_posts_node())?;
        let record = AccountRecord::initial(name, did.as_str()).to_block();
        let root = *record.cid();
        self.durable.put(record)?;

        match self.registry.advance(name, None, root) {
            Ok(()) => Ok(root),
            // A concurrent registration of the same identity got there first.
            Err(RegistryError::Conflict { current: Some(current) }) => Ok(current),
            Err(e) => Err(registry_error(name, e)),
        }
    }

    /// Authenticates, ingests, verifies and commits one update.
    ///
    /// Storage calls block; run this on a thread that may block, such as
    /// the runtime's blocking pool.
    pub async fn update<Rd: AsyncRead + Send + Unpin>(
        &self,
        request: UpdateRequest<'_, Rd>,
        deadline: &Deadline,
    ) -> Result<UpdateOutcome, RepoError> {
        let started = Instant::now();
        let mut progress = Progress::start();
        let result = self.run_update(request, deadline, &mut progress).await;

        match &result {
            Ok(outcome) => {
                progress.enter(UpdateState::Done);
                info!(
                    account = %outcome.account,
                    root = %outcome.root,
                    introduced = outcome.introduced,
                    merged = outcome.merged,
                    "update committed"
                );
            }
            Err(e) => {
                let stage = progress.state;
                progress.enter(UpdateState::Rejected);
                warn!(%stage, reason = e.reason(), error = %e, "update rejected");
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics
                .update_seconds
                .observe(started.elapsed().as_secs_f64());
            match &result {
                Ok(_) => metrics.updates_committed.inc(),
                Err(e) => metrics
                    .updates_rejected
                    .with_label_values(&[e.reason()])
                    .inc(),
            }
        }
        result
    }

    async fn run_update<Rd: AsyncRead + Send + Unpin>(
        &self,
        request: UpdateRequest<'_, Rd>,
        deadline: &Deadline,
        progress: &mut Progress,
    ) -> Result<UpdateOutcome, RepoError> {
        let token = self.verifier.verify(bearer_token(request.authorization)?)?;
        deadline.check()?;

        progress.enter(UpdateState::Ingesting);
        let staging = MemoryBlockStore::new();
        let root = self.ingest(request.archive, &staging, deadline).await?;

        // A root that is already durable was committed for some account
        // before. Accepting it lets an owner move back to an earlier record
        // of theirs that carries the same counter; the counter check below
        // still rejects anything older.
        let root_block = match staging.get(&root)? {
            Some(block) => block,
            None => self
                .durable
                .get(&root)?
                .ok_or(RepoError::Integrity { missing: root })?,
        };
        let record =
            AccountRecord::from_block(&root_block).map_err(ProtocolError::BadAccountRecord)?;
        let account = record.name.clone();

        let bound = self
            .registry
            .identity(&account)
            .map_err(|e| registry_error(&account, e))?
            .ok_or_else(|| AuthError::UnknownAccount(account.clone()))?;
        self.verifier
            .authorize(&token, &account, Action::PostUpdate, &bound)?;
        if record.did != bound.as_str() {
            return Err(ProtocolError::IdentityMismatch { account }.into());
        }

        let observed = self
            .registry
            .lookup(&account)
            .map_err(|e| registry_error(&account, e))?;
        if let Some(expected) = request.expected_root {
            if observed != Some(expected) {
                return Err(RepoError::Conflict {
                    account,
                    current: observed,
                });
            }
        }
        if let Some(current_root) = observed {
            let current = self.durable_record(&current_root)?;
            if record.next_post < current.next_post {
                return Err(ProtocolError::CounterRegressed {
                    current: current.next_post,
                    submitted: record.next_post,
                }
                .into());
            }
        }

        progress.enter(UpdateState::Verifying);
        let completeness = verify_completeness(&root, &staging, &self.durable, deadline)?;

        progress.enter(UpdateState::Committing);
        let merged = copy_all(&staging, &self.durable, deadline)?;
        deadline.check()?;
        match self.registry.advance(&account, observed.as_ref(), root) {
            Ok(()) => {}
            Err(RegistryError::Conflict { current }) => {
                return Err(RepoError::Conflict { account, current });
            }
            Err(e) => return Err(registry_error(&account, e)),
        }

        Ok(UpdateOutcome {
            account,
            previous: observed,
            root,
            introduced: completeness.introduced.len(),
            merged,
        })
    }

    /// Reads the archive into `staging` and returns its single root.
    async fn ingest<Rd: AsyncRead + Send + Unpin>(
        &self,
        archive: Rd,
        staging: &MemoryBlockStore,
        deadline: &Deadline,
    ) -> Result<Cid, RepoError> {
        let mut limited = SizeLimited::new(archive, self.limits.max_archive_bytes);
        let result = self.read_archive(&mut limited, staging, deadline).await;
        // The archive decoder folds I/O failures into its own errors, so the
        // wrapper's own count decides whether the bound was hit.
        if limited.exceeded() {
            return Err(ProtocolError::ArchiveTooLarge {
                limit: self.limits.max_archive_bytes,
            }
            .into());
        }
        result
    }

    async fn read_archive<Rd: AsyncRead + Send + Unpin>(
        &self,
        archive: Rd,
        staging: &MemoryBlockStore,
        deadline: &Deadline,
    ) -> Result<Cid, RepoError> {
        let mut reader = ArchiveReader::with_max_block(archive, self.limits.max_block_bytes)
            .await
            .map_err(|e| self.archive_error(e))?;

        let root = match reader.roots() {
            [root] => *root,
            roots => return Err(ProtocolError::RootCount(roots.len()).into()),
        };

        let mut count = 0usize;
        loop {
            deadline.check()?;
            let Some(block) = reader
                .next_block()
                .await
                .map_err(|e| self.archive_error(e))?
            else {
                break;
            };
            count += 1;
            if count > self.limits.max_blocks {
                return Err(ProtocolError::TooManyBlocks {
                    limit: self.limits.max_blocks,
                }
                .into());
            }
            staging.put(block)?;
        }

        if let Some(metrics) = &self.metrics {
            metrics.blocks_ingested.inc_by(count as u64);
        }
        debug!(%root, blocks = count, "archive ingested");
        Ok(root)
    }

    fn archive_error(&self, e: CarError) -> RepoError {
        match e {
            CarError::BlockTooLarge { .. }
            | CarError::Format(iroh_car::Error::LdReadTooLarge(_)) => {
                ProtocolError::BlockTooLarge {
                    limit: self.limits.max_block_bytes,
                }
                .into()
            }
            CarError::Storage(e) => RepoError::Storage(e),
            CarError::Cancelled => RepoError::Cancelled,
            other => ProtocolError::Archive(other).into(),
        }
    }

    /// Writes an archive of `name`'s current graph to `out`.
    ///
    /// Returns the number of blocks written.
    pub async fn export<W: AsyncWrite + Send + Unpin>(
        &self,
        name: &str,
        out: W,
        deadline: &Deadline,
    ) -> Result<usize, RepoError> {
        let root = self.lookup(name)?;
        let written = write_car(&self.durable, &[root], out, deadline)
            .await
            .map_err(|e| match e {
                CarError::Format(iroh_car::Error::Io(e)) => RepoError::Io(e),
                CarError::Format(e) => RepoError::Io(io::Error::other(e)),
                CarError::Storage(e) => RepoError::Storage(e),
                CarError::Cancelled => RepoError::Cancelled,
                CarError::MissingBlock(cid) => RepoError::Storage(StorageError::Corrupted(format!(
                    "block {cid} reachable from {name} is not stored"
                ))),
                other => RepoError::Storage(StorageError::Corrupted(other.to_string())),
            })?;

        if let Some(metrics) = &self.metrics {
            metrics.exports_served.inc();
        }
        debug!(account = name, %root, blocks = written, "account exported");
        Ok(written)
    }

    fn durable_record(&self, root: &Cid) -> Result<AccountRecord, RepoError> {
        let block = self.durable.get(root)?.ok_or_else(|| {
            StorageError::Corrupted(format!("committed root {root} is not stored"))
        })?;
        AccountRecord::from_block(&block).map_err(|e| {
            RepoError::Storage(StorageError::Corrupted(format!("committed root {root}: {e}")))
        })
    }
}

fn registry_error(account: &str, e: RegistryError) -> RepoError {
    match e {
        RegistryError::UnknownAccount(name) => RepoError::NotFound(name),
        RegistryError::NameTaken { name, .. } => RepoError::Auth(AuthError::NameTaken(name)),
        RegistryError::Conflict { current } => RepoError::Conflict {
            account: account.to_string(),
            current,
        },
        RegistryError::Storage(e) => RepoError::Storage(e),
    }
}

/// Fails reads once more than `limit` bytes have come through.
struct SizeLimited<R> {
    inner: R,
    limit: usize,
    read: usize,
}

impl<R> SizeLimited<R> {
    fn new(inner: R, limit: usize) -> Self {
        Self {
            inner,
            limit,
            read: 0,
        }
    }

    fn exceeded(&self) -> bool {
        self.read > self.limit
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for SizeLimited<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.exceeded() {
            return Poll::Ready(Err(io::Error::other("archive size limit exceeded")));
        }
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        self.read += buf.filled().len() - before;
        if self.exceeded() {
            return Poll::Ready(Err(io::Error::other("archive size limit exceeded")));
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{TokenClaims, issue};
    use crate::car::ArchiveWriter;
    use crate::registry::MemoryRegistry;
    use crate::types::{Block, Codec, empty_posts_root};
    use ed25519_dalek::SigningKey;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type TestEngine = RepoEngine<Arc<MemoryBlockStore>, Arc<MemoryRegistry>>;

    const SERVER: &str = "did:web:repo.test";

    fn engine() -> TestEngine {
        engine_with(LimitsConfig::default())
    }

    fn engine_with(limits: LimitsConfig) -> TestEngine {
        let verifier =
            CapabilityVerifier::new(Did::parse(SERVER).unwrap(), Duration::from_secs(60));
        RepoEngine::new(
            Arc::new(MemoryBlockStore::new()),
            Arc::new(MemoryRegistry::new()),
            verifier,
            limits,
        )
    }

    struct User {
        key: SigningKey,
        did: Did,
    }

    impl User {
        fn new(seed: u8) -> Self {
            let key = SigningKey::from_bytes(&[seed; 32]);
            let did = Did::from_verifying_key(&key.verifying_key());
            Self { key, did }
        }

        fn bearer(&self, claims: TokenClaims) -> String {
            format!("Bearer {}", issue(&self.key, &claims).unwrap())
        }

        fn register_token(&self) -> String {
            self.bearer(TokenClaims::new(&self.did, &Did::parse(SERVER).unwrap()))
        }

        fn update_token(&self, account: &str) -> String {
            self.bearer(
                TokenClaims::new(&self.did, &Did::parse(SERVER).unwrap())
                    .with_attenuation(format!("account:{account}"), "post/update"),
            )
        }
    }

    async fn archive(roots: &[Cid], blocks: &[Block]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut writer = ArchiveWriter::new(&mut out, roots);
        for block in blocks {
            writer.write_block(block).await.unwrap();
        }
        writer.finish().await.unwrap();
        out
    }

    /// A record for `name` owned by `did` whose posts node links two
    /// fresh children. Returns (root, all blocks with the root first).
    fn graph(name: &str, did: &Did, next_post: u64, tag: &str) -> (Block, Vec<Block>) {
        let first = Block::new(Codec::Raw, format!("{tag}: first post").into_bytes());
        let second = Block::new(Codec::Raw, format!("{tag}: second post").into_bytes());
        let posts = Block::encode(&vec![*first.cid(), *second.cid()]).unwrap();
        let record = AccountRecord {
            name: name.to_string(),
            did: did.to_string(),
            posts: *posts.cid(),
            next_post,
        }
        .to_block();
        (record.clone(), vec![record, posts, first, second])
    }

    async fn update(
        engine: &TestEngine,
        auth: &str,
        body: &[u8],
    ) -> Result<UpdateOutcome, RepoError> {
        engine
            .update(
                UpdateRequest {
                    authorization: Some(auth),
                    archive: body,
                    expected_root: None,
                },
                &Deadline::none(),
            )
            .await
    }

    #[test]
    fn account_names_are_validated() {
        let longest = "a".repeat(64);
        let too_long = "a".repeat(65);
        for ok in ["alice", "a", "bob.smith", "x_1-2", longest.as_str()] {
            assert!(validate_account_name(ok).is_ok(), "{ok}");
        }
        for bad in ["", "Alice", "al ice", "al/ice", "ålice", too_long.as_str()] {
            assert!(validate_account_name(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn registration_binds_and_points_at_the_initial_record() {
        let engine = engine();
        let alice = User::new(1);

        let outcome = engine.register(Some(&alice.register_token()), "alice").unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.did, alice.did);
        assert_eq!(engine.registry().identity("alice").unwrap(), Some(alice.did.clone()));
        assert_eq!(engine.lookup("alice").unwrap(), outcome.root);

        let record = engine.account("alice").unwrap();
        assert_eq!(record, AccountRecord::initial("alice", alice.did.as_str()));
        assert_eq!(record.posts, empty_posts_root());
        assert!(engine.durable().has(&empty_posts_root()).unwrap());
    }

    #[test]
    fn re_registration_is_idempotent_for_the_owner_only() {
        let engine = engine();
        let alice = User::new(1);
        let mallory = User::new(2);

        let first = engine.register(Some(&alice.register_token()), "alice").unwrap();
        let again = engine.register(Some(&alice.register_token()), "alice").unwrap();
        assert!(!again.created);
        assert_eq!(again.root, first.root);

        let err = engine
            .register(Some(&mallory.register_token()), "alice")
            .unwrap_err();
        assert!(matches!(err, RepoError::Auth(AuthError::NameTaken(_))));
    }

    #[test]
    fn registration_rejects_bad_names_and_tokens() {
        let engine = engine();
        let alice = User::new(1);

        let err = engine.register(Some(&alice.register_token()), "Alice").unwrap_err();
        assert!(matches!(err, RepoError::Protocol(ProtocolError::InvalidName(_))));

        let err = engine.register(None, "alice").unwrap_err();
        assert!(matches!(err, RepoError::Auth(AuthError::MissingToken)));
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn complete_update_commits_and_exports() {
        let engine = engine();
        let alice = User::new(1);
        let registered = engine.register(Some(&alice.register_token()), "alice").unwrap();

        let (root, blocks) = graph("alice", &alice.did, 2, "v1");
        let body = archive(&[*root.cid()], &blocks).await;
        let outcome = update(&engine, &alice.update_token("alice"), &body).await.unwrap();
        assert_eq!(outcome.account, "alice");
        assert_eq!(outcome.previous, Some(registered.root));
        assert_eq!(outcome.root, *root.cid());
        assert_eq!(outcome.introduced, 4);
        assert_eq!(engine.lookup("alice").unwrap(), *root.cid());

        let mut exported = Vec::new();
        let written = engine
            .export("alice", &mut exported, &Deadline::none())
            .await
            .unwrap();
        assert_eq!(written, 4);
        let reader = ArchiveReader::new(&exported[..]).await.unwrap();
        assert_eq!(reader.roots(), &[*root.cid()]);
        let got = reader.collect_blocks().await.unwrap();
        assert_eq!(got[0], root);
        let mut got_cids: Vec<Cid> = got.iter().map(|b| *b.cid()).collect();
        let mut want: Vec<Cid> = blocks.iter().map(|b| *b.cid()).collect();
        got_cids.sort();
        want.sort();
        assert_eq!(got_cids, want);
    }

    #[tokio::test]
    async fn incomplete_update_leaves_the_root_alone() {
        let engine = engine();
        let alice = User::new(1);
        let registered = engine.register(Some(&alice.register_token()), "alice").unwrap();
        let durable_before = engine.durable().len();

        let (root, mut blocks) = graph("alice", &alice.did, 1, "v1");
        let omitted = blocks.pop().unwrap();
        let body = archive(&[*root.cid()], &blocks).await;
        let err = update(&engine, &alice.update_token("alice"), &body)
            .await
            .unwrap_err();

        assert!(matches!(err, RepoError::Integrity { missing } if missing == *omitted.cid()));
        assert_eq!(engine.lookup("alice").unwrap(), registered.root);
        assert_eq!(engine.durable().len(), durable_before);
    }

    /// Counts bytes pulled from the archive.
    struct Tap<'a> {
        data: &'a [u8],
        read: &'a AtomicUsize,
    }

    impl AsyncRead for Tap<'_> {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let before = buf.filled().len();
            ready!(Pin::new(&mut self.data).poll_read(cx, buf))?;
            self.read
                .fetch_add(buf.filled().len() - before, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn two_roots_are_rejected_before_any_block() {
        let registry = prometheus::Registry::new();
        let metrics = RepoMetrics::register(&registry).unwrap();
        let engine = engine().with_metrics(metrics.clone());
        let alice = User::new(1);
        engine.register(Some(&alice.register_token()), "alice").unwrap();
        let durable_before = engine.durable().len();

        let (root, blocks) = graph("alice", &alice.did, 1, "v1");
        let body = archive(&[*root.cid(), *blocks[1].cid()], &blocks).await;

        let err = update(&engine, &alice.update_token("alice"), &body)
            .await
            .unwrap_err();

        assert!(matches!(err, RepoError::Protocol(ProtocolError::RootCount(2))));
        assert_eq!(metrics.blocks_ingested.get(), 0);
        assert_eq!(engine.durable().len(), durable_before);
    }

    #[tokio::test]
    async fn foreign_audience_is_rejected_before_reading_the_archive() {
        let engine = engine();
        let alice = User::new(1);
        engine.register(Some(&alice.register_token()), "alice").unwrap();
        let durable_before = engine.durable().len();

        let elsewhere = Did::parse("did:web:other.test").unwrap();
        let token = alice.bearer(
            TokenClaims::new(&alice.did, &elsewhere).with_attenuation("account:alice", "post/update"),
        );
        let (root, blocks) = graph("alice", &alice.did, 1, "v1");
        let body = archive(&[*root.cid()], &blocks).await;
        let read = AtomicUsize::new(0);

        let err = engine
            .update(
                UpdateRequest {
                    authorization: Some(&token),
                    archive: Tap { data: &body, read: &read },
                    expected_root: None,
                },
                &Deadline::none(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RepoError::Auth(AuthError::AudienceMismatch { .. })));
        assert_eq!(read.load(Ordering::SeqCst), 0);
        assert_eq!(engine.durable().len(), durable_before);
    }

    #[tokio::test]
    async fn unauthorized_updates_write_nothing() {
        let engine = engine();
        let alice = User::new(1);
        let mallory = User::new(2);
        engine.register(Some(&alice.register_token()), "alice").unwrap();
        engine.register(Some(&mallory.register_token()), "mallory").unwrap();
        let durable_before = engine.durable().len();
        let root_before = engine.lookup("alice").unwrap();

        let (root, blocks) = graph("alice", &alice.did, 1, "evil");
        let body = archive(&[*root.cid()], &blocks).await;

        // Right issuer, token scoped to another account.
        let err = update(&engine, &alice.update_token("mallory"), &body)
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Auth(AuthError::MissingAttenuation { .. })));

        // Token names alice, but the issuer is not alice's identity.
        let err = update(&engine, &mallory.update_token("alice"), &body)
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Auth(AuthError::IssuerMismatch { .. })));

        // Unknown account.
        let (ghost, ghost_blocks) = graph("ghost", &alice.did, 1, "ghost");
        let ghost_body = archive(&[*ghost.cid()], &ghost_blocks).await;
        let err = update(&engine, &alice.update_token("ghost"), &ghost_body)
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Auth(AuthError::UnknownAccount(_))));

        assert_eq!(engine.durable().len(), durable_before);
        assert_eq!(engine.lookup("alice").unwrap(), root_before);
    }

    #[tokio::test]
    async fn record_must_keep_owner_and_counter() {
        let engine = engine();
        let alice = User::new(1);
        let bob = User::new(2);
        let auth = alice.update_token("alice");
        engine.register(Some(&alice.register_token()), "alice").unwrap();

        let (root, blocks) = graph("alice", &bob.did, 1, "v1");
        let err = update(&engine, &auth, &archive(&[*root.cid()], &blocks).await)
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Protocol(ProtocolError::IdentityMismatch { .. })));

        let (root, blocks) = graph("alice", &alice.did, 5, "v1");
        update(&engine, &auth, &archive(&[*root.cid()], &blocks).await)
            .await
            .unwrap();

        let (root, blocks) = graph("alice", &alice.did, 4, "v2");
        let err = update(&engine, &auth, &archive(&[*root.cid()], &blocks).await)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RepoError::Protocol(ProtocolError::CounterRegressed { current: 5, submitted: 4 })
        ));
    }

    #[tokio::test]
    async fn durable_root_with_the_same_counter_can_be_restored() {
        let engine = engine();
        let alice = User::new(1);
        let auth = alice.update_token("alice");
        engine.register(Some(&alice.register_token()), "alice").unwrap();

        let (v1, v1_blocks) = graph("alice", &alice.did, 3, "v1");
        update(&engine, &auth, &archive(&[*v1.cid()], &v1_blocks).await)
            .await
            .unwrap();
        let (v2, v2_blocks) = graph("alice", &alice.did, 3, "v2");
        update(&engine, &auth, &archive(&[*v2.cid()], &v2_blocks).await)
            .await
            .unwrap();

        // Header only: the root resolves from the durable store.
        let outcome = update(&engine, &auth, &archive(&[*v1.cid()], &[]).await)
            .await
            .unwrap();
        assert_eq!(outcome.previous, Some(*v2.cid()));
        assert_eq!(outcome.introduced, 0);
        assert_eq!(engine.lookup("alice").unwrap(), *v1.cid());

        // An older durable record with a lower counter is still refused.
        let (v3, v3_blocks) = graph("alice", &alice.did, 4, "v3");
        update(&engine, &auth, &archive(&[*v3.cid()], &v3_blocks).await)
            .await
            .unwrap();
        let err = update(&engine, &auth, &archive(&[*v2.cid()], &[]).await)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RepoError::Protocol(ProtocolError::CounterRegressed { current: 4, submitted: 3 })
        ));
    }

    #[tokio::test]
    async fn second_update_only_needs_new_blocks() {
        let engine = engine();
        let alice = User::new(1);
        engine.register(Some(&alice.register_token()), "alice").unwrap();

        let (v1, v1_blocks) = graph("alice", &alice.did, 2, "v1");
        update(&engine, &alice.update_token("alice"), &archive(&[*v1.cid()], &v1_blocks).await)
            .await
            .unwrap();

        // v2 reuses v1's posts node, which is already durable.
        let record = AccountRecord {
            name: "alice".into(),
            did: alice.did.to_string(),
            posts: *v1_blocks[1].cid(),
            next_post: 3,
        }
        .to_block();
        let body = archive(&[*record.cid()], std::slice::from_ref(&record)).await;
        let outcome = update(&engine, &alice.update_token("alice"), &body)
            .await
            .unwrap();
        assert_eq!(outcome.introduced, 1);
        assert_eq!(outcome.previous, Some(*v1.cid()));
    }

    #[tokio::test]
    async fn stale_expected_root_conflicts() {
        let engine = engine();
        let alice = User::new(1);
        let registered = engine.register(Some(&alice.register_token()), "alice").unwrap();

        let (v1, v1_blocks) = graph("alice", &alice.did, 1, "v1");
        update(&engine, &alice.update_token("alice"), &archive(&[*v1.cid()], &v1_blocks).await)
            .await
            .unwrap();

        let (v2, v2_blocks) = graph("alice", &alice.did, 2, "v2");
        let auth = alice.update_token("alice");
        let body = archive(&[*v2.cid()], &v2_blocks).await;
        let err = engine
            .update(
                UpdateRequest {
                    authorization: Some(&auth),
                    archive: &body[..],
                    expected_root: Some(registered.root),
                },
                &Deadline::none(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RepoError::Conflict { current: Some(c), .. } if c == *v1.cid()));
        assert_eq!(engine.lookup("alice").unwrap(), *v1.cid());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_from_one_snapshot_have_one_winner() {
        let engine = Arc::new(engine());
        let alice = User::new(1);
        let registered = engine.register(Some(&alice.register_token()), "alice").unwrap();
        let auth = alice.update_token("alice");

        let mut tasks = Vec::new();
        for i in 0..6 {
            let (root, blocks) = graph("alice", &alice.did, 1, &format!("writer {i}"));
            let body = archive(&[*root.cid()], &blocks).await;
            let engine = engine.clone();
            let auth = auth.clone();
            tasks.push(tokio::spawn(async move {
                engine
                    .update(
                        UpdateRequest {
                            authorization: Some(&auth),
                            archive: &body[..],
                            expected_root: Some(registered.root),
                        },
                        &Deadline::none(),
                    )
                    .await
            }));
        }
        let mut results: Vec<Result<UpdateOutcome, RepoError>> = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }

        let winners: Vec<&UpdateOutcome> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, RepoError::Conflict { .. })));
        assert_eq!(engine.lookup("alice").unwrap(), winners[0].root);
    }

    #[tokio::test]
    async fn limits_are_enforced() {
        let alice = User::new(1);
        let (root, blocks) = graph("alice", &alice.did, 1, "v1");
        let body = archive(&[*root.cid()], &blocks).await;

        let engine = engine_with(LimitsConfig {
            max_blocks: 3,
            ..LimitsConfig::default()
        });
        engine.register(Some(&alice.register_token()), "alice").unwrap();
        let err = update(&engine, &alice.update_token("alice"), &body)
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Protocol(ProtocolError::TooManyBlocks { limit: 3 })));
        assert_eq!(err.reason(), "limit");

        let engine = engine_with(LimitsConfig {
            max_archive_bytes: body.len() - 1,
            ..LimitsConfig::default()
        });
        engine.register(Some(&alice.register_token()), "alice").unwrap();
        let err = update(&engine, &alice.update_token("alice"), &body)
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Protocol(ProtocolError::ArchiveTooLarge { .. })));

        let engine = engine_with(LimitsConfig {
            max_archive_bytes: body.len(),
            max_block_bytes: 8,
            ..LimitsConfig::default()
        });
        engine.register(Some(&alice.register_token()), "alice").unwrap();
        let err = update(&engine, &alice.update_token("alice"), &body)
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Protocol(ProtocolError::BlockTooLarge { limit: 8 })));
    }

    #[tokio::test]
    async fn archive_at_exactly_the_size_limit_is_accepted() {
        let alice = User::new(1);
        let (root, blocks) = graph("alice", &alice.did, 1, "v1");
        let body = archive(&[*root.cid()], &blocks).await;

        let engine = engine_with(LimitsConfig {
            max_archive_bytes: body.len(),
            ..LimitsConfig::default()
        });
        engine.register(Some(&alice.register_token()), "alice").unwrap();
        update(&engine, &alice.update_token("alice"), &body)
            .await
            .unwrap();
        assert_eq!(engine.lookup("alice").unwrap(), *root.cid());
    }

    #[tokio::test]
    async fn cancelled_update_does_not_advance() {
        let engine = engine();
        let alice = User::new(1);
        let registered = engine.register(Some(&alice.register_token()), "alice").unwrap();

        let (root, blocks) = graph("alice", &alice.did, 1, "v1");
        let body = archive(&[*root.cid()], &blocks).await;
        let auth = alice.update_token("alice");
        let (deadline, guard) = Deadline::none().cancel_on_drop();
        drop(guard);

        let err = engine
            .update(
                UpdateRequest {
                    authorization: Some(&auth),
                    archive: &body[..],
                    expected_root: None,
                },
                &deadline,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Cancelled));
        assert_eq!(engine.lookup("alice").unwrap(), registered.root);
    }

    #[tokio::test]
    async fn export_of_unknown_account_is_not_found() {
        let engine = engine();
        let err = engine
            .export("nobody", Vec::new(), &Deadline::none())
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::NotFound(name) if name == "nobody"));
    }

    #[tokio::test]
    async fn metrics_follow_outcomes() {
        let registry = prometheus::Registry::new();
        let metrics = RepoMetrics::register(&registry).unwrap();
        let engine = engine().with_metrics(metrics.clone());
        let alice = User::new(1);
        engine.register(Some(&alice.register_token()), "alice").unwrap();

        let (root, blocks) = graph("alice", &alice.did, 1, "v1");
        let body = archive(&[*root.cid()], &blocks).await;
        update(&engine, &alice.update_token("alice"), &body)
            .await
            .unwrap();
        let _ = update(&engine, "Bearer nonsense", &[]).await;
        engine
            .export("alice", Vec::new(), &Deadline::none())
            .await
            .unwrap();

        assert_eq!(metrics.updates_committed.get(), 1);
        assert_eq!(metrics.updates_rejected.with_label_values(&["auth"]).get(), 1);
        assert_eq!(metrics.blocks_ingested.get(), 4);
        assert_eq!(metrics.exports_served.get(), 1);
        assert_eq!(metrics.update_seconds.get_sample_count(), 2);
    }
}
