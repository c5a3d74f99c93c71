//! Shared fixtures: a small guild/channel/user domain and an instrumented
//! store provider.
//!
//! - `Guild` is a plain sized entity with a global store.
//! - `dyn Channel` is an unsized base entity. It constructs text and voice
//!   channels itself and routes category channels to the `CategoryChannel`
//!   broker. Its models live in a per-guild "channels" store, except
//!   categories, which live in a per-guild "categories" store.
//! - `User` carries the self-user reconciliation.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use parking_lot::RwLock;

use muninn::store::{
    Direction, MemoryStoreProvider, Store, StoreHierarchy, StoreKey, StoreProvider, StoreSpec,
    StoreType,
};
use muninn::{
    BrokerHierarchy, CachePath, CacheableEntity, ConstructionContext, Model, ModelKind,
    MuninnError, PartialModel, Reconcile, Result, Scope, StateConfig, StateController,
};

// ============================================================================
// Client
// ============================================================================

#[derive(Default)]
pub struct TestClient {
    pub constructions: AtomicUsize,
}

impl TestClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }
}

fn count_construction<A>(context: &ConstructionContext<'_, A>) {
    if let Some(client) = context.client::<TestClient>() {
        client.constructions.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Guilds
// ============================================================================

pub const GUILDS: StoreType = StoreType::new("guilds");

#[derive(Debug, Clone, PartialEq)]
pub struct GuildModel {
    pub id: u64,
    pub name: String,
}

impl Model for GuildModel {
    type Id = u64;

    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> ModelKind {
        ModelKind::new("guild")
    }
}

pub struct GuildActor {
    pub tag: String,
}

pub struct Guild {
    pub id: u64,
    pub name: RwLock<String>,
    pub actor_tag: Option<String>,
}

impl CacheableEntity for Guild {
    type Id = u64;
    type Model = GuildModel;
    type Actor = GuildActor;
    const NAME: &'static str = "Guild";

    fn construct(
        context: &ConstructionContext<'_, GuildActor>,
        model: &GuildModel,
    ) -> Result<Arc<Self>> {
        count_construction(context);
        Ok(Arc::new(Guild {
            id: model.id,
            name: RwLock::new(model.name.clone()),
            actor_tag: context.actor().map(|actor| actor.tag.clone()),
        }))
    }

    fn to_model(&self) -> GuildModel {
        GuildModel {
            id: self.id,
            name: self.name.read().clone(),
        }
    }

    fn update(&self, model: &GuildModel) -> Result<()> {
        *self.name.write() = model.name.clone();
        Ok(())
    }

    fn store_hierarchy() -> StoreHierarchy {
        StoreHierarchy::new(StoreSpec::global(GUILDS))
    }
}

pub fn guild(id: u64, name: &str) -> GuildModel {
    GuildModel {
        id,
        name: name.to_owned(),
    }
}

// ============================================================================
// Channels
// ============================================================================

pub const CHANNELS: StoreType = StoreType::new("channels");
pub const CATEGORIES: StoreType = StoreType::new("categories");

pub const TEXT: ModelKind = ModelKind::new("text");
pub const VOICE: ModelKind = ModelKind::new("voice");
pub const CATEGORY: ModelKind = ModelKind::new("category");
pub const THREAD: ModelKind = ModelKind::new("thread");

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelModel {
    pub id: u64,
    pub guild_id: u64,
    pub kind: ModelKind,
    pub name: String,
    pub position: u32,
}

impl Model for ChannelModel {
    type Id = u64;

    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> ModelKind {
        self.kind
    }
}

pub fn channel(id: u64, kind: ModelKind, name: &str) -> ChannelModel {
    ChannelModel {
        id,
        guild_id: 1,
        kind,
        name: name.to_owned(),
        position: 0,
    }
}

/// Sparse channel update.
#[derive(Debug, Default)]
pub struct ChannelPatch {
    pub id: Option<u64>,
    pub name: Option<String>,
    pub position: Option<u32>,
}

impl PartialModel for ChannelPatch {
    type Model = ChannelModel;

    fn id(&self) -> Option<u64> {
        self.id
    }

    fn is_specified(&self, field: &str) -> bool {
        match field {
            "name" => self.name.is_some(),
            "position" => self.position.is_some(),
            _ => false,
        }
    }

    fn apply_to(&self, base: &mut ChannelModel) -> bool {
        let mut changed = false;
        if let Some(name) = &self.name
            && &base.name != name
        {
            base.name = name.clone();
            changed = true;
        }
        if let Some(position) = self.position
            && base.position != position
        {
            base.position = position;
            changed = true;
        }
        changed
    }
}

pub trait Channel: Send + Sync {
    fn id(&self) -> u64;
    fn kind(&self) -> ModelKind;
    fn name(&self) -> String;
    fn snapshot(&self) -> ChannelModel;
    fn apply(&self, model: &ChannelModel);
}

/// Shared channel state.
struct ChannelState {
    id: u64,
    guild_id: u64,
    kind: ModelKind,
    fields: RwLock<(String, u32)>,
}

impl ChannelState {
    fn new(model: &ChannelModel) -> Self {
        Self {
            id: model.id,
            guild_id: model.guild_id,
            kind: model.kind,
            fields: RwLock::new((model.name.clone(), model.position)),
        }
    }

    fn snapshot(&self) -> ChannelModel {
        let fields = self.fields.read();
        ChannelModel {
            id: self.id,
            guild_id: self.guild_id,
            kind: self.kind,
            name: fields.0.clone(),
            position: fields.1,
        }
    }

    fn apply(&self, model: &ChannelModel) {
        *self.fields.write() = (model.name.clone(), model.position);
    }
}

/// Text or voice channel, constructed by the base broker.
pub struct GuildChannel {
    state: ChannelState,
}

impl Channel for GuildChannel {
    fn id(&self) -> u64 {
        self.state.id
    }

    fn kind(&self) -> ModelKind {
        self.state.kind
    }

    fn name(&self) -> String {
        self.state.fields.read().0.clone()
    }

    fn snapshot(&self) -> ChannelModel {
        self.state.snapshot()
    }

    fn apply(&self, model: &ChannelModel) {
        self.state.apply(model)
    }
}

/// Category channel, owned by its own broker.
pub struct CategoryChannel {
    state: ChannelState,
}

impl Channel for CategoryChannel {
    fn id(&self) -> u64 {
        self.state.id
    }

    fn kind(&self) -> ModelKind {
        CATEGORY
    }

    fn name(&self) -> String {
        self.state.fields.read().0.clone()
    }

    fn snapshot(&self) -> ChannelModel {
        self.state.snapshot()
    }

    fn apply(&self, model: &ChannelModel) {
        self.state.apply(model)
    }
}

fn upcast_category(category: Arc<CategoryChannel>) -> Arc<dyn Channel> {
    category
}

impl CacheableEntity for dyn Channel {
    type Id = u64;
    type Model = ChannelModel;
    type Actor = ();
    const NAME: &'static str = "Channel";

    fn construct(context: &ConstructionContext<'_, ()>, model: &ChannelModel) -> Result<Arc<Self>> {
        if model.name == "poison" {
            return Err(MuninnError::Construction(format!(
                "channel {} cannot be built",
                model.id
            )));
        }
        count_construction(context);
        let channel: Arc<dyn Channel> = Arc::new(GuildChannel {
            state: ChannelState::new(model),
        });
        Ok(channel)
    }

    fn to_model(&self) -> ChannelModel {
        self.snapshot()
    }

    fn update(&self, model: &ChannelModel) -> Result<()> {
        self.apply(model);
        Ok(())
    }

    fn store_hierarchy() -> StoreHierarchy {
        StoreHierarchy::new(StoreSpec::scoped::<Guild>(CHANNELS))
            .with(CATEGORY, StoreSpec::scoped::<Guild>(CATEGORIES))
    }

    fn broker_hierarchy() -> BrokerHierarchy<Self> {
        BrokerHierarchy::new().route::<CategoryChannel>(&[CATEGORY], upcast_category)
    }

    fn accepts(kind: ModelKind) -> bool {
        kind == TEXT || kind == VOICE
    }
}

impl CacheableEntity for CategoryChannel {
    type Id = u64;
    type Model = ChannelModel;
    type Actor = ();
    const NAME: &'static str = "CategoryChannel";

    fn construct(context: &ConstructionContext<'_, ()>, model: &ChannelModel) -> Result<Arc<Self>> {
        count_construction(context);
        Ok(Arc::new(CategoryChannel {
            state: ChannelState::new(model),
        }))
    }

    fn to_model(&self) -> ChannelModel {
        self.snapshot()
    }

    fn update(&self, model: &ChannelModel) -> Result<()> {
        self.apply(model);
        Ok(())
    }

    fn store_hierarchy() -> StoreHierarchy {
        StoreHierarchy::new(StoreSpec::scoped::<Guild>(CATEGORIES))
    }

    fn accepts(kind: ModelKind) -> bool {
        kind == CATEGORY
    }
}

pub fn guild_path(guild_id: u64) -> CachePath {
    CachePath::new()
        .with::<Guild>(guild_id)
        .expect("fresh path has no guild entry")
}

pub fn channels_key(guild_id: u64) -> StoreKey {
    StoreKey::scoped(CHANNELS, Scope::of::<Guild>(&guild_id))
}

pub fn categories_key(guild_id: u64) -> StoreKey {
    StoreKey::scoped(CATEGORIES, Scope::of::<Guild>(&guild_id))
}

// ============================================================================
// Users
// ============================================================================

pub const USERS: StoreType = StoreType::new("users");

#[derive(Debug, Clone, PartialEq)]
pub struct UserModel {
    pub id: u64,
    pub username: String,
    /// Only present on the current user's full profile.
    pub email: Option<String>,
    pub verified: Option<bool>,
}

impl Model for UserModel {
    type Id = u64;

    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> ModelKind {
        ModelKind::new("user")
    }
}

impl Reconcile for UserModel {
    fn reconcile(&mut self, incoming: &Self) {
        self.username = incoming.username.clone();
        if incoming.email.is_some() {
            self.email = incoming.email.clone();
        }
        if incoming.verified.is_some() {
            self.verified = incoming.verified;
        }
    }
}

pub fn public_user(id: u64, username: &str) -> UserModel {
    UserModel {
        id,
        username: username.to_owned(),
        email: None,
        verified: None,
    }
}

pub struct User {
    model: RwLock<UserModel>,
}

impl User {
    pub fn username(&self) -> String {
        self.model.read().username.clone()
    }

    pub fn email(&self) -> Option<String> {
        self.model.read().email.clone()
    }
}

impl CacheableEntity for User {
    type Id = u64;
    type Model = UserModel;
    type Actor = ();
    const NAME: &'static str = "User";

    fn construct(context: &ConstructionContext<'_, ()>, model: &UserModel) -> Result<Arc<Self>> {
        count_construction(context);
        Ok(Arc::new(User {
            model: RwLock::new(model.clone()),
        }))
    }

    fn to_model(&self) -> UserModel {
        self.model.read().clone()
    }

    fn update(&self, model: &UserModel) -> Result<()> {
        *self.model.write() = model.clone();
        Ok(())
    }

    fn store_hierarchy() -> StoreHierarchy {
        StoreHierarchy::new(StoreSpec::global(USERS))
    }
}

// ============================================================================
// Instrumented store provider
// ============================================================================

#[derive(Debug, Default)]
pub struct ReadStats {
    pub started: AtomicUsize,
    pub completed: AtomicUsize,
    pub cancelled: AtomicUsize,
}

impl ReadStats {
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Counts a read as cancelled if dropped before completion.
struct ReadTracker {
    stats: Arc<ReadStats>,
    completed: bool,
}

impl Drop for ReadTracker {
    fn drop(&mut self) {
        if self.completed {
            self.stats.completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.stats.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Memory-backed provider with per-store read delays and failures.
pub struct InstrumentedProvider<M: Model> {
    inner: MemoryStoreProvider<M::Id, M>,
    delays: HashMap<StoreType, Duration>,
    failing: HashSet<StoreType>,
    pub stats: Arc<ReadStats>,
    pub opens: AtomicUsize,
}

impl<M: Model> InstrumentedProvider<M> {
    pub fn new() -> Self {
        Self {
            inner: MemoryStoreProvider::new(None),
            delays: HashMap::new(),
            failing: HashSet::new(),
            stats: Arc::new(ReadStats::default()),
            opens: AtomicUsize::new(0),
        }
    }

    /// Reads from `store` answer after `delay`, with what was stored when
    /// they started.
    pub fn delay(mut self, store: StoreType, delay: Duration) -> Self {
        self.delays.insert(store, delay);
        self
    }

    pub fn failing(mut self, store: StoreType) -> Self {
        self.failing.insert(store);
        self
    }

    /// Write directly to the backing store, bypassing delays.
    pub async fn seed(&self, key: &StoreKey, model: M) {
        let store = self.inner.open(key).await.expect("memory stores always open");
        store.add_or_update(model).await.expect("memory writes succeed");
    }

    /// Read directly from the backing store.
    pub async fn stored(&self, key: &StoreKey, id: &M::Id) -> Option<M> {
        let store = self.inner.open(key).await.expect("memory stores always open");
        store.get(id).await.expect("memory reads succeed")
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<M: Model> StoreProvider<M::Id, M> for InstrumentedProvider<M> {
    async fn open(&self, key: &StoreKey) -> Result<Arc<dyn Store<M::Id, M>>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.open(key).await?;
        Ok(Arc::new(InstrumentedStore {
            inner,
            delay: self
                .delays
                .get(&key.store_type)
                .copied()
                .unwrap_or_default(),
            fail: self.failing.contains(&key.store_type),
            stats: Arc::clone(&self.stats),
        }))
    }
}

struct InstrumentedStore<M: Model> {
    inner: Arc<dyn Store<M::Id, M>>,
    delay: Duration,
    fail: bool,
    stats: Arc<ReadStats>,
}

#[async_trait]
impl<M: Model> Store<M::Id, M> for InstrumentedStore<M> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, id: &M::Id) -> Result<Option<M>> {
        self.stats.started.fetch_add(1, Ordering::SeqCst);
        let mut tracker = ReadTracker {
            stats: Arc::clone(&self.stats),
            completed: false,
        };
        // the answer reflects the store when the read started
        let found = self.inner.get(id).await;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        tracker.completed = true;
        if self.fail {
            return Err(MuninnError::Store(format!("{} is unavailable", self.name())));
        }
        found
    }

    fn get_all(&self) -> BoxStream<'static, Result<M>> {
        self.inner.get_all()
    }

    fn get_all_ids(&self) -> BoxStream<'static, Result<M::Id>> {
        self.inner.get_all_ids()
    }

    fn query(
        &self,
        from: M::Id,
        to: Option<M::Id>,
        direction: Direction,
        limit: Option<usize>,
    ) -> BoxStream<'static, Result<M>> {
        self.inner.query(from, to, direction, limit)
    }

    async fn add_or_update(&self, model: M) -> Result<()> {
        self.inner.add_or_update(model).await
    }

    async fn remove(&self, id: &M::Id) -> Result<bool> {
        self.inner.remove(id).await
    }
}

// ============================================================================
// Controllers
// ============================================================================

pub fn controller(client: Arc<TestClient>) -> StateController {
    controller_with(client, StateConfig::default())
}

pub fn controller_with(client: Arc<TestClient>, config: StateConfig) -> StateController {
    StateController::builder()
        .client(client)
        .config(config)
        .build()
        .expect("valid controller configuration")
}

/// Controller whose channel models go through `provider`.
pub fn controller_with_channels(
    client: Arc<TestClient>,
    provider: Arc<InstrumentedProvider<ChannelModel>>,
    config: StateConfig,
) -> StateController {
    StateController::builder()
        .client(client)
        .config(config)
        .store_provider::<ChannelModel>(provider)
        .build()
        .expect("valid controller configuration")
}
