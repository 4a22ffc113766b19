//! Session manager
//!
//! A [`SessionManager`] is the runtime root of one client session. The root
//! manager owns the authoritative tree, the interaction mutex and the host
//! event loop. Fragment managers (created with [`SessionManager::fragment`])
//! own nothing but a view address: they translate fragment-local patches into
//! root addresses and forward them.
//!
//! Interaction lifecycle:
//!
//! ```text
//! handle_event ─► reserve lock ─► send ─► stream items ─┬─► bare action ─► batcher ─┐
//!                                                       └─► response ──► flush ──────┴─► apply
//! ```
//!
//! Everything shared is behind `Arc` + std locks; no lock is held across an
//! `.await`.

mod subscription;

pub use subscription::Subscription;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use futures::future::{AbortHandle, AbortRegistration, Abortable, BoxFuture};
use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use url::Url;
use uuid::Uuid;

use crate::batch::{ActionBatcher, BatchSink};
use crate::config::ClientConfig;
use crate::error::{Result, SyncError, TransportError};
use crate::host::Host;
use crate::mutex::{LockFuture, TargetMutex};
use crate::transport::{
    build_request, send_interaction, OutboundRequest, Transport, UiEventPayload,
    BROWSER_NAVIGATION_ID,
};
use crate::tree::{ActionsResponse, Address, Component, ResponseItem, Target, Tree};
use subscription::{Callback, Listeners};

/// Lock target used by the root manager.
const APP_TARGET: &str = "app";

/// Where a manager is in its interaction cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerPhase {
    Idle,
    /// Request sent, waiting for the response head.
    Loading,
    /// Response items are being applied.
    Applying,
    /// A failure is being recorded and reported.
    Erroring,
}

// ---------------------------------------------------------------------------
// Shared session state
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum HostEvent {
    Interaction(UiEventPayload),
    PopState,
}

struct EventLoop {
    sender: mpsc::UnboundedSender<HostEvent>,
    receiver: Option<mpsc::UnboundedReceiver<HostEvent>>,
    task: Option<JoinHandle<()>>,
}

/// State a root manager shares with all of its fragments.
struct SessionCore {
    session_id: Uuid,
    tree: RwLock<Tree>,
    mutex: TargetMutex,
    transport: Arc<dyn Transport>,
    host: Arc<dyn Host>,
    config: ClientConfig,
    terminated: AtomicBool,
    events: Mutex<EventLoop>,
    /// Every fragment created under this session, at any depth.
    fragments: Mutex<Vec<Weak<ManagerInner>>>,
}

impl SessionCore {
    fn tree(&self) -> RwLockReadGuard<'_, Tree> {
        self.tree.read().unwrap_or_else(|e| e.into_inner())
    }

    fn tree_mut(&self) -> RwLockWriteGuard<'_, Tree> {
        self.tree.write().unwrap_or_else(|e| e.into_inner())
    }

    fn events(&self) -> MutexGuard<'_, EventLoop> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register_fragment(&self, fragment: &Arc<ManagerInner>) {
        let mut fragments = self.fragments.lock().unwrap_or_else(|e| e.into_inner());
        fragments.retain(|f| f.strong_count() > 0);
        fragments.push(Arc::downgrade(fragment));
    }

    fn live_fragments(&self) -> Vec<Arc<ManagerInner>> {
        self.fragments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Per-manager state
// ---------------------------------------------------------------------------

struct ManagerState {
    loading: bool,
    error: Option<SyncError>,
    /// Only tracked on the root; fragments ask their parent.
    last_url: Option<Url>,
    phase: ManagerPhase,
    initialized: bool,
    terminated: bool,
    in_flight: Vec<(u64, AbortHandle)>,
    next_dispatch: u64,
}

struct ManagerInner {
    core: Arc<SessionCore>,
    parent: Option<SessionManager>,
    fragment_id: Option<String>,
    address: Address,
    /// `address` translated into root coordinates.
    resolved: Address,
    state: Mutex<ManagerState>,
    listeners: Listeners<Arc<Component>>,
    loading_listeners: Listeners<bool>,
    error_listeners: Listeners<SyncError>,
    batcher: ActionBatcher,
}

/// Prepared half of an interaction, produced synchronously by `handle_event`.
struct Dispatch {
    id: u64,
    lock: LockFuture,
    request: std::result::Result<OutboundRequest, TransportError>,
    registration: AbortRegistration,
    span: Span,
}

impl ManagerInner {
    fn new(
        core: Arc<SessionCore>,
        parent: Option<SessionManager>,
        fragment_id: Option<String>,
        address: Address,
        resolved: Address,
        last_url: Option<Url>,
    ) -> Arc<Self> {
        let throttle = core.config.throttle;
        Arc::new_cyclic(|weak: &Weak<ManagerInner>| {
            let sink: Weak<dyn BatchSink> = weak.clone();
            ManagerInner {
                core,
                parent,
                fragment_id,
                address,
                resolved,
                state: Mutex::new(ManagerState {
                    loading: false,
                    error: None,
                    last_url,
                    phase: ManagerPhase::Idle,
                    initialized: false,
                    terminated: false,
                    in_flight: Vec::new(),
                    next_dispatch: 0,
                }),
                listeners: Listeners::new(),
                loading_listeners: Listeners::new(),
                error_listeners: Listeners::new(),
                batcher: ActionBatcher::new(sink, throttle),
            }
        })
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn root(&self) -> &ManagerInner {
        match &self.parent {
            Some(parent) => parent.inner.root(),
            None => self,
        }
    }

    fn lock_target(&self) -> &str {
        self.fragment_id.as_deref().unwrap_or(APP_TARGET)
    }

    fn is_terminated(&self) -> bool {
        if self.state().terminated {
            return true;
        }
        match &self.parent {
            Some(parent) => parent.inner.is_terminated(),
            None => self.core.terminated.load(Ordering::Acquire),
        }
    }

    fn is_loading(&self) -> bool {
        let inherited = self
            .parent
            .as_ref()
            .map(|p| p.inner.is_loading())
            .unwrap_or(false);
        inherited || self.state().loading
    }

    fn error(&self) -> Option<SyncError> {
        self.parent
            .as_ref()
            .and_then(|p| p.inner.error())
            .or_else(|| self.state().error.clone())
    }

    fn last_url(&self) -> Url {
        match &self.parent {
            Some(parent) => parent.inner.last_url(),
            None => self
                .state()
                .last_url
                .clone()
                .unwrap_or_else(|| self.core.host.location()),
        }
    }

    fn set_phase(&self, phase: ManagerPhase) {
        self.state().phase = phase;
    }

    /// Current view: the whole tree on the root, the fragment subtree otherwise.
    fn view(&self) -> Result<Arc<Component>> {
        let tree = self.core.tree();
        if self.parent.is_none() {
            return Ok(tree.snapshot());
        }
        Ok(tree.get_shared(&self.resolved)?)
    }

    fn at_address(&self, address: &Address) -> Result<Arc<Component>> {
        let absolute = self.resolved.join(address);
        Ok(self.core.tree().get_shared(&absolute)?)
    }

    // -- notifications ------------------------------------------------------

    fn notify_listeners(&self) {
        match self.view() {
            Ok(view) => self.listeners.notify(view),
            Err(e) => warn!(
                fragment = ?self.fragment_id,
                address = %self.resolved,
                error = %e,
                "fragment view unavailable, skipping notification"
            ),
        }
    }

    fn notify_loading(&self) {
        self.loading_listeners.notify(self.is_loading());
    }

    fn notify_error(&self) {
        if let Some(error) = self.error() {
            self.error_listeners.notify(error);
        }
    }

    fn record_error(&self, error: SyncError) {
        error!(
            session = %self.core.session_id,
            fragment = ?self.fragment_id,
            error = %error,
            "interaction failed"
        );
        {
            let mut state = self.state();
            state.error = Some(error);
            state.phase = ManagerPhase::Erroring;
        }
        self.notify_error();
        let mut state = self.state();
        state.phase = if state.loading {
            ManagerPhase::Applying
        } else {
            ManagerPhase::Idle
        };
    }

    // -- patch application --------------------------------------------------

    fn apply_actions(&self, response: ActionsResponse, should_notify: bool) -> Result<()> {
        if response.is_empty() {
            return Ok(());
        }
        if self.parent.is_some() {
            let root = self.root();
            if response.target == Target::App {
                return root.apply_actions(response, true);
            }
            root.apply_actions(response.prefixed(&self.resolved), false)?;
            if should_notify {
                self.notify_listeners();
            }
            return Ok(());
        }

        let count = response.actions.len();
        let version = {
            let mut tree = self.core.tree_mut();
            tree.apply(&response.actions)?;
            tree.version()
        };
        debug!(actions = count, version, "applied actions");
        if should_notify {
            self.notify_listeners();
        }
        Ok(())
    }

    // -- interaction dispatch -----------------------------------------------

    /// Synchronous half of `handle_event`: state updates, request building
    /// and lock reservation, in call order.
    fn prepare(&self, payload: UiEventPayload) -> Result<Option<Dispatch>> {
        if self.is_terminated() {
            return Err(SyncError::Terminated);
        }
        let navigation = payload.is_navigation();
        if navigation && self.fragment_id.is_some() {
            debug!(fragment = ?self.fragment_id, "navigation left to the root manager");
            return Ok(None);
        }

        let location = self.core.host.location();
        let mut referer = None;
        if navigation {
            if let Some(target) = payload.href().and_then(|href| location.join(href).ok()) {
                let previous = std::mem::replace(&mut self.state().last_url, Some(target));
                referer = previous.map(|url| url.to_string());
            }
        }

        let span = info_span!(
            "interaction",
            session = %self.core.session_id,
            lock = self.lock_target(),
            component = %payload.id,
            event = %payload.event_type,
        );
        let request = build_request(
            payload,
            self.fragment_id.as_deref(),
            &location,
            referer.as_deref(),
        );

        let (handle, registration) = AbortHandle::new_pair();
        let (id, superseded) = {
            let mut state = self.state();
            let superseded = if navigation {
                std::mem::take(&mut state.in_flight)
            } else {
                Vec::new()
            };
            let id = state.next_dispatch;
            state.next_dispatch += 1;
            state.in_flight.push((id, handle));
            state.error = None;
            state.loading = true;
            state.phase = ManagerPhase::Loading;
            (id, superseded)
        };
        if !superseded.is_empty() {
            for (_, handle) in superseded {
                handle.abort();
            }
            self.batcher.discard();
        }
        self.notify_loading();

        let lock = self.core.mutex.lock(self.lock_target());
        Ok(Some(Dispatch {
            id,
            lock,
            request,
            registration,
            span,
        }))
    }

    async fn dispatch(self: Arc<Self>, dispatch: Dispatch) -> Result<()> {
        let Dispatch {
            id,
            lock,
            request,
            registration,
            span,
        } = dispatch;

        let this = Arc::clone(&self);
        let work = async move {
            let guard = lock.await;
            let streamed = match request {
                Ok(request) => this.stream_into_tree(request).await,
                Err(e) => Err(e.into()),
            };
            // Still under the lock: land what is buffered, or drop it on failure.
            let result = match streamed {
                Ok(()) => this.batcher.flush(),
                Err(e) => {
                    this.batcher.discard();
                    Err(e)
                }
            };
            (result, guard)
        };

        match Abortable::new(work, registration).instrument(span.clone()).await {
            Ok((result, guard)) => {
                span.in_scope(|| self.finish(id, &result));
                drop(guard);
                result
            }
            Err(_aborted) => {
                span.in_scope(|| {
                    debug!("interaction cancelled");
                    self.finish(id, &Ok(()));
                });
                Err(SyncError::Cancelled)
            }
        }
    }

    async fn stream_into_tree(&self, request: OutboundRequest) -> Result<()> {
        let mut stream = send_interaction(
            self.core.transport.as_ref(),
            Arc::clone(&self.core.host),
            request,
        )
        .await?;
        self.set_phase(ManagerPhase::Applying);

        while let Some(item) = stream.next().await {
            match item? {
                ResponseItem::Action(action) => self.batcher.batch_action(action)?,
                ResponseItem::Actions(response) => {
                    // Keep arrival order: earlier bare actions land first.
                    self.batcher.flush()?;
                    self.apply_actions(response, true)?;
                }
            }
        }
        Ok(())
    }

    fn finish(&self, id: u64, result: &Result<()>) {
        {
            let mut state = self.state();
            state.in_flight.retain(|(dispatch, _)| *dispatch != id);
            state.loading = !state.in_flight.is_empty();
            if !state.loading {
                state.phase = ManagerPhase::Idle;
            }
        }
        self.notify_loading();
        if let Err(e) = result {
            self.record_error(e.clone());
        }
    }

    /// Flush, cancel in-flight dispatches and detach listeners.
    fn shutdown(&self) {
        if let Err(e) = self.batcher.flush() {
            self.record_error(e);
        }
        let in_flight = {
            let mut state = self.state();
            state.terminated = true;
            state.loading = false;
            state.phase = ManagerPhase::Idle;
            std::mem::take(&mut state.in_flight)
        };
        for (_, handle) in in_flight {
            handle.abort();
        }
        self.batcher.discard();

        self.listeners.clear();
        self.loading_listeners.clear();
        self.error_listeners.clear();
        info!(
            session = %self.core.session_id,
            fragment = ?self.fragment_id,
            "manager terminated"
        );
    }
}

impl BatchSink for ManagerInner {
    fn apply_batch(&self, batch: ActionsResponse) -> Result<()> {
        if self.is_terminated() {
            debug!(actions = batch.actions.len(), "session terminated, batch refused");
            return Err(SyncError::Terminated);
        }
        self.apply_actions(batch, true)
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Handle to a root or fragment manager. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

/// Builder for a root [`SessionManager`].
pub struct SessionManagerBuilder {
    transport: Arc<dyn Transport>,
    host: Arc<dyn Host>,
    initial_tree: Option<Component>,
    config: ClientConfig,
}

impl SessionManagerBuilder {
    /// Tree to start from (server-rendered state). Defaults to an empty root.
    pub fn initial_tree(mut self, root: Component) -> Self {
        self.initial_tree = Some(root);
        self
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> SessionManager {
        let (sender, receiver) = mpsc::unbounded_channel();
        let last_url = self.host.location();
        let core = Arc::new(SessionCore {
            session_id: Uuid::new_v4(),
            tree: RwLock::new(Tree::new(
                self.initial_tree.unwrap_or_else(Component::root),
            )),
            mutex: TargetMutex::new(),
            transport: self.transport,
            host: self.host,
            config: self.config,
            terminated: AtomicBool::new(false),
            events: Mutex::new(EventLoop {
                sender,
                receiver: Some(receiver),
                task: None,
            }),
            fragments: Mutex::new(Vec::new()),
        });
        debug!(session = %core.session_id, url = %last_url, "session created");
        SessionManager {
            inner: ManagerInner::new(core, None, None, Address::new(), Address::new(), Some(last_url)),
        }
    }
}

impl SessionManager {
    pub fn builder(transport: Arc<dyn Transport>, host: Arc<dyn Host>) -> SessionManagerBuilder {
        SessionManagerBuilder {
            transport,
            host,
            initial_tree: None,
            config: ClientConfig::default(),
        }
    }

    /// Create a delegate for the fragment `id` living at `address`.
    ///
    /// On the root, `address` is used as is. Under another fragment, its
    /// first segment names the parent fragment and is replaced by the
    /// parent's resolved address.
    pub fn fragment(&self, id: impl Into<String>, address: impl Into<Address>) -> SessionManager {
        let address = address.into();
        let resolved = match &self.inner.parent {
            None => address.clone(),
            Some(_) => self.inner.resolved.join(&address.skip(1)),
        };
        let inner = ManagerInner::new(
            Arc::clone(&self.inner.core),
            Some(self.clone()),
            Some(id.into()),
            address,
            resolved,
            None,
        );
        self.inner.core.register_fragment(&inner);
        SessionManager { inner }
    }

    // -- identity -----------------------------------------------------------

    pub fn session_id(&self) -> Uuid {
        self.inner.core.session_id
    }

    pub fn is_root(&self) -> bool {
        self.inner.parent.is_none()
    }

    pub fn fragment_id(&self) -> Option<&str> {
        self.inner.fragment_id.as_deref()
    }

    /// Address as declared at creation.
    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    /// Address of this manager's view in the root tree.
    pub fn resolved_address(&self) -> &Address {
        &self.inner.resolved
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.core.config
    }

    /// The session-wide interaction mutex.
    pub fn mutex(&self) -> &TargetMutex {
        &self.inner.core.mutex
    }

    // -- state --------------------------------------------------------------

    pub fn is_loading(&self) -> bool {
        self.inner.is_loading()
    }

    /// Error of the nearest ancestor that has one, else this manager's.
    pub fn error(&self) -> Option<SyncError> {
        self.inner.error()
    }

    pub fn phase(&self) -> ManagerPhase {
        self.inner.state().phase
    }

    pub fn last_url(&self) -> Url {
        self.inner.last_url()
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.is_terminated()
    }

    /// Version of the session tree; bumps on every applied batch.
    pub fn tree_version(&self) -> u64 {
        self.inner.core.tree().version()
    }

    /// Actions waiting in this manager's throttle buffer.
    pub fn pending_actions(&self) -> usize {
        self.inner.batcher.pending()
    }

    // -- tree access --------------------------------------------------------

    /// The current view: the whole tree on the root, the fragment node
    /// otherwise.
    pub fn get_root_component(&self) -> Result<Arc<Component>> {
        self.inner.view()
    }

    /// Node at `address`, relative to this manager's view.
    pub fn get_at_address(&self, address: impl Into<Address>) -> Result<Arc<Component>> {
        self.inner.at_address(&address.into())
    }

    /// Apply `response` through this manager (see module docs for routing).
    pub fn apply_actions(&self, response: ActionsResponse, should_notify: bool) -> Result<()> {
        self.inner.apply_actions(response, should_notify)
    }

    // -- subscriptions ------------------------------------------------------

    /// Called with the current view after every notified change.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(Arc<Component>) + Send + Sync + 'static,
    {
        self.subscribe_view(Arc::new(listener))
    }

    /// Called with the combined loading flag whenever it may have changed.
    pub fn subscribe_is_loading<F>(&self, listener: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.subscribe_loading(Arc::new(listener))
    }

    /// Called with every surfaced error, own or inherited.
    pub fn subscribe_error<F>(&self, listener: F) -> Subscription
    where
        F: Fn(SyncError) + Send + Sync + 'static,
    {
        self.subscribe_errors(Arc::new(listener))
    }

    fn subscribe_view(&self, listener: Callback<Arc<Component>>) -> Subscription {
        let local = self.inner.listeners.add(Arc::clone(&listener));
        let Some(parent) = &self.inner.parent else {
            return local;
        };
        let weak = Arc::downgrade(&self.inner);
        let inherited = parent.subscribe_view(Arc::new(move |_: Arc<Component>| {
            if let Some(this) = weak.upgrade() {
                if let Ok(view) = this.view() {
                    listener(view);
                }
            }
        }));
        local.join(inherited)
    }

    fn subscribe_loading(&self, listener: Callback<bool>) -> Subscription {
        let local = self.inner.loading_listeners.add(Arc::clone(&listener));
        let Some(parent) = &self.inner.parent else {
            return local;
        };
        let weak = Arc::downgrade(&self.inner);
        let inherited = parent.subscribe_loading(Arc::new(move |_: bool| {
            if let Some(this) = weak.upgrade() {
                listener(this.is_loading());
            }
        }));
        local.join(inherited)
    }

    fn subscribe_errors(&self, listener: Callback<SyncError>) -> Subscription {
        let local = self.inner.error_listeners.add(Arc::clone(&listener));
        match &self.inner.parent {
            Some(parent) => local.join(parent.subscribe_errors(listener)),
            None => local,
        }
    }

    // -- interactions -------------------------------------------------------

    /// Dispatch one interaction.
    ///
    /// State changes and the mutex reservation happen before this returns,
    /// so interactions are serialized in call order even if the futures are
    /// polled in another order. The future resolves once the response has
    /// been fully applied; a superseded or terminated dispatch resolves to
    /// [`SyncError::Cancelled`].
    pub fn handle_event(
        &self,
        payload: UiEventPayload,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let prepared = self.inner.prepare(payload);
        let inner = Arc::clone(&self.inner);
        async move {
            match prepared? {
                Some(dispatch) => inner.dispatch(dispatch).await,
                None => Ok(()),
            }
        }
    }

    /// Re-sync with the host's current location after a history move.
    pub fn handle_pop_state(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let location = self.inner.core.host.location();
        let payload = UiEventPayload::navigate(BROWSER_NAVIGATION_ID, location.to_string())
            .with_data("replace", true)
            .with_data("lastURL", self.last_url().to_string());
        self.handle_event(payload)
    }

    /// Start the host event loop and fetch the initial tree. Root only;
    /// repeated calls are no-ops.
    pub async fn initialize(&self) -> Result<()> {
        if !self.is_root() {
            return Err(SyncError::InvalidState(
                "initialize is only valid on the root manager".to_string(),
            ));
        }
        if self.is_terminated() {
            return Err(SyncError::Terminated);
        }
        {
            let mut state = self.inner.state();
            if state.initialized {
                return Ok(());
            }
            state.initialized = true;
        }
        self.start_event_loop();
        info!(session = %self.session_id(), url = %self.last_url(), "initializing session");
        self.handle_event(UiEventPayload::initialize()).await
    }

    /// Handle for feeding host events (interactions and history moves) into
    /// the session. Events queue until [`SessionManager::initialize`].
    pub fn event_sender(&self) -> EventSender {
        let root = self.inner.root();
        EventSender {
            tx: root.core.events().sender.clone(),
            core: Arc::downgrade(&root.core),
        }
    }

    /// Flush pending actions, cancel in-flight interactions and detach every
    /// listener. On the root this also stops the event loop and ends the
    /// session for every fragment, cancelling their interactions too.
    pub fn terminate(&self) {
        let inner = &self.inner;
        if inner.parent.is_some() {
            inner.shutdown();
            return;
        }

        for fragment in inner.core.live_fragments() {
            fragment.shutdown();
        }
        inner.shutdown();
        inner.core.terminated.store(true, Ordering::Release);
        let mut events = inner.core.events();
        events.receiver = None;
        if let Some(task) = events.task.take() {
            task.abort();
        }
    }

    fn start_event_loop(&self) {
        let mut events = self.inner.core.events();
        let Some(mut receiver) = events.receiver.take() else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        events.task = Some(tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = SessionManager { inner };
                let dispatch: BoxFuture<'static, Result<()>> = match event {
                    HostEvent::Interaction(payload) => manager.handle_event(payload).boxed(),
                    HostEvent::PopState => manager.handle_pop_state().boxed(),
                };
                tokio::spawn(async move {
                    if let Err(e) = dispatch.await {
                        debug!(error = %e, "host event dispatch ended with error");
                    }
                });
            }
            debug!("host event loop stopped");
        }));
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("session_id", &self.inner.core.session_id)
            .field("fragment_id", &self.inner.fragment_id)
            .field("address", &self.inner.resolved)
            .field("loading", &self.is_loading())
            .finish()
    }
}

/// Sender half of the host event loop.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<HostEvent>,
    core: Weak<SessionCore>,
}

impl EventSender {
    fn send(&self, event: HostEvent) -> Result<()> {
        let alive = self
            .core
            .upgrade()
            .map(|core| !core.terminated.load(Ordering::Acquire))
            .unwrap_or(false);
        if !alive {
            return Err(SyncError::Terminated);
        }
        self.tx.send(event).map_err(|_| SyncError::Terminated)
    }

    /// Queue an interaction raised by the rendering layer.
    pub fn dispatch(&self, payload: UiEventPayload) -> Result<()> {
        self.send(HostEvent::Interaction(payload))
    }

    /// Report that the host moved through its history.
    pub fn pop_state(&self) -> Result<()> {
        self.send(HostEvent::PopState)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryHost;
    use crate::transport::ResponseStream;
    use crate::tree::Action;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Answers every request with the same canned items.
    struct Canned {
        items: Vec<ResponseItem>,
        requests: Mutex<Vec<OutboundRequest>>,
    }

    impl Canned {
        fn new(items: Vec<ResponseItem>) -> Arc<Self> {
            Arc::new(Self {
                items,
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for Canned {
        async fn send(&self, request: OutboundRequest) -> std::result::Result<ResponseStream, TransportError> {
            self.requests.lock().unwrap().push(request);
            Ok(futures::stream::iter(self.items.clone().into_iter().map(Ok)).boxed())
        }
    }

    fn host() -> Arc<MemoryHost> {
        Arc::new(MemoryHost::new(Url::parse("http://localhost:8000/").unwrap()))
    }

    fn sample() -> Component {
        Component::root()
            .with_child(Component::new("a", "text"))
            .with_child(
                Component::new("box", "container")
                    .with_child(Component::new("b1", "text"))
                    .with_child(Component::new("b2", "text")),
            )
    }

    #[tokio::test]
    async fn test_root_apply_notifies_with_full_tree() {
        let manager = SessionManager::builder(Canned::new(vec![]), host())
            .initial_tree(sample())
            .build();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = manager.subscribe(move |tree| sink.lock().unwrap().push(tree.child_keys().len()));

        manager
            .apply_actions(
                ActionsResponse::app(vec![Action::add([2], Component::new("c", "text"))]),
                true,
            )
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![3]);
        assert_eq!(manager.tree_version(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let manager = SessionManager::builder(Canned::new(vec![]), host()).build();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let _sub = manager.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        manager.apply_actions(ActionsResponse::app(vec![]), true).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(manager.tree_version(), 0);
    }

    #[tokio::test]
    async fn test_fragment_actions_are_prefixed() {
        let manager = SessionManager::builder(Canned::new(vec![]), host())
            .initial_tree(sample())
            .build();
        let fragment = manager.fragment("f1", [1]);
        fragment
            .apply_actions(
                ActionsResponse::fragment(vec![Action::add([0], Component::new("b0", "text"))]),
                true,
            )
            .unwrap();
        let view = fragment.get_root_component().unwrap();
        assert_eq!(view.child_keys(), vec!["b0", "b1", "b2"]);
        assert_eq!(manager.get_at_address([1, 0]).unwrap().key, "b0");
        assert_eq!(fragment.get_at_address([0]).unwrap().key, "b0");
    }

    #[tokio::test]
    async fn test_fragment_resolved_addresses() {
        let manager = SessionManager::builder(Canned::new(vec![]), host()).build();
        let outer = manager.fragment("outer", [2, 3]);
        assert_eq!(outer.resolved_address(), &Address::from([2, 3]));
        let inner = outer.fragment("inner", [7, 0]);
        assert_eq!(inner.resolved_address(), &Address::from([2, 3, 0]));
    }

    #[tokio::test]
    async fn test_fragment_local_apply_skips_root_listeners() {
        let manager = SessionManager::builder(Canned::new(vec![]), host())
            .initial_tree(sample())
            .build();
        let fragment = manager.fragment("f1", [1]);
        let root_hits = Arc::new(AtomicUsize::new(0));
        let fragment_views = Arc::new(Mutex::new(Vec::new()));
        let counter = root_hits.clone();
        let _root = manager.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let views = fragment_views.clone();
        let _frag = fragment.subscribe(move |view| views.lock().unwrap().push(view.key.clone()));

        fragment
            .apply_actions(ActionsResponse::fragment(vec![Action::remove([0])]), true)
            .unwrap();
        assert_eq!(root_hits.load(Ordering::SeqCst), 0);
        assert_eq!(*fragment_views.lock().unwrap(), vec!["box".to_string()]);

        // App-targeted batches go through the root; the fragment hears it
        // through its inherited subscription, scoped to its own view.
        fragment
            .apply_actions(ActionsResponse::app(vec![Action::no_change([0])]), true)
            .unwrap();
        assert_eq!(root_hits.load(Ordering::SeqCst), 1);
        assert_eq!(fragment_views.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_patch_failure_keeps_last_good_tree() {
        let manager = SessionManager::builder(Canned::new(vec![]), host())
            .initial_tree(sample())
            .build();
        let before = manager.get_root_component().unwrap();
        let err = manager
            .apply_actions(
                ActionsResponse::app(vec![Action::remove([0]), Action::remove([9])]),
                true,
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::Patch(_)));
        assert!(Arc::ptr_eq(&before, &manager.get_root_component().unwrap()));
    }

    #[tokio::test]
    async fn test_handle_event_applies_response() {
        let transport = Canned::new(vec![ActionsResponse::app(vec![Action::add(
            [0],
            Component::new("a", "text"),
        )])
        .into()]);
        let manager = SessionManager::builder(transport.clone(), host()).build();
        manager
            .handle_event(UiEventPayload::new("btn", "click"))
            .await
            .unwrap();
        assert_eq!(manager.get_at_address([0]).unwrap().key, "a");
        assert!(!manager.is_loading());
        assert_eq!(manager.phase(), ManagerPhase::Idle);
        assert_eq!(manager.mutex().owner(), None);
    }

    #[tokio::test]
    async fn test_fragment_navigation_is_suppressed() {
        let transport = Canned::new(vec![]);
        let manager = SessionManager::builder(transport.clone(), host()).build();
        let fragment = manager.fragment("f1", [0]);
        fragment
            .handle_event(UiEventPayload::navigate("link", "/elsewhere"))
            .await
            .unwrap();
        assert!(transport.requests.lock().unwrap().is_empty());
        assert!(!fragment.is_loading());
    }

    #[tokio::test]
    async fn test_navigation_updates_last_url_and_referer() {
        let transport = Canned::new(vec![]);
        let host = host();
        let manager = SessionManager::builder(transport.clone(), host.clone()).build();
        manager
            .handle_event(UiEventPayload::navigate("link", "/next"))
            .await
            .unwrap();
        assert_eq!(manager.last_url().as_str(), "http://localhost:8000/next");
        assert_eq!(host.location().as_str(), "http://localhost:8000/next");
        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].referer.as_deref(), Some("http://localhost:8000/"));
        assert_eq!(requests[0].url.as_str(), "http://localhost:8000/next");
    }

    #[tokio::test]
    async fn test_terminate_rejects_later_dispatches() {
        let manager = SessionManager::builder(Canned::new(vec![]), host()).build();
        let fragment = manager.fragment("f1", [0]);
        manager.terminate();
        assert!(fragment.is_terminated());
        let err = fragment
            .handle_event(UiEventPayload::new("btn", "click"))
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::Terminated);
        assert_eq!(
            manager.event_sender().dispatch(UiEventPayload::new("btn", "click")),
            Err(SyncError::Terminated)
        );
    }

    /// Never answers.
    struct Stalled;

    #[async_trait]
    impl Transport for Stalled {
        async fn send(&self, _request: OutboundRequest) -> std::result::Result<ResponseStream, TransportError> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_root_terminate_cancels_fragment_dispatch() {
        let manager = SessionManager::builder(Arc::new(Stalled), host())
            .initial_tree(sample())
            .build();
        let fragment = manager.fragment("f1", [1]);
        let nested = fragment.fragment("f2", [0, 1]);
        let dispatch = tokio::spawn(fragment.handle_event(UiEventPayload::new("btn", "click")));
        assert!(fragment.is_loading());

        manager.terminate();

        assert_eq!(dispatch.await.unwrap(), Err(SyncError::Cancelled));
        assert!(fragment.inner.state().in_flight.is_empty());
        assert!(fragment.inner.state().terminated);
        assert!(nested.inner.state().terminated);
        assert!(!fragment.is_loading());
    }

    #[tokio::test]
    async fn test_batches_refused_after_terminate() {
        let manager = SessionManager::builder(Canned::new(vec![]), host())
            .initial_tree(sample())
            .build();
        let fragment = manager.fragment("f1", [1]);
        manager.terminate();

        let err = fragment
            .inner
            .apply_batch(ActionsResponse::fragment(vec![Action::remove([0])]))
            .unwrap_err();
        assert_eq!(err, SyncError::Terminated);
        assert_eq!(manager.get_at_address([1]).unwrap().child_keys(), vec!["b1", "b2"]);
    }

    #[tokio::test]
    async fn test_dropped_fragments_leave_the_registry() {
        let manager = SessionManager::builder(Canned::new(vec![]), host()).build();
        let kept = manager.fragment("f1", [0]);
        drop(manager.fragment("f2", [1]));
        let _third = manager.fragment("f3", [2]);
        let live = manager.inner.core.live_fragments();
        assert_eq!(live.len(), 2);
        assert!(live.iter().any(|f| Arc::ptr_eq(f, &kept.inner)));
    }

    #[tokio::test]
    async fn test_initialize_is_root_only() {
        let manager = SessionManager::builder(Canned::new(vec![]), host()).build();
        let fragment = manager.fragment("f1", [0]);
        assert!(matches!(
            fragment.initialize().await,
            Err(SyncError::InvalidState(_))
        ));
    }
}
