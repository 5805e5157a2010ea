//! The uniform operation surface over one data source.
//!
//! Every operation is registered under an opid, queued on the backend's
//! [`DispatchQueue`] and returned to the caller as an [`OperationHandle`].
//! The wrapped [`BackendOps`] implementation only sees operations that
//! passed the open and read-only checks; change notification happens here.

mod ops;
mod property;

pub use ops::{
    BackendOps, ConflictResolution, ModifiedObject, ObjModType, OperationFlags, RemovedObject,
};
pub use property::BackendProperty;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::component::{Component, ComponentId, ComponentKind};
use crate::dispatch::{DispatchQueue, dispatch_fn};
use crate::error::{BackendError, BackendResult};
use crate::ics;
use crate::notify::{ChangeNotifier, NotifySettings, View, ViewReceiver};
use crate::operation::{FromReply, OpId, OperationHandle, Reply};
use crate::query::Query;
use crate::timezone::TimezoneCache;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Default worker count for backends whose operations are independent.
pub const DEFAULT_MAX_WORKERS: usize = 4;

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub source_uid: String,
    pub kind: ComponentKind,
    pub cache_dir: PathBuf,
    pub writable: bool,
    pub online: bool,
    /// Run every operation on a single worker.
    pub serial: bool,
    pub max_workers: usize,
    pub notify: NotifySettings,
}

impl BackendSettings {
    pub fn new(source_uid: impl Into<String>, kind: ComponentKind, cache_dir: PathBuf) -> Self {
        BackendSettings {
            source_uid: source_uid.into(),
            kind,
            cache_dir,
            writable: true,
            online: true,
            serial: false,
            max_workers: DEFAULT_MAX_WORKERS,
            notify: NotifySettings::default(),
        }
    }

    fn worker_count(&self) -> usize {
        if self.serial { 1 } else { self.max_workers.max(1) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Unopened,
    Opening,
    Opened,
    Closed,
}

/// Out-of-band notifications, independent of any single operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// A fault not tied to a caller's operation, e.g. a failed background
    /// refresh.
    Error(String),
    PropertyChanged {
        property: BackendProperty,
        value: String,
    },
    Closed,
}

struct BackendInner {
    source_uid: String,
    kind: ComponentKind,
    cache_dir: PathBuf,
    ops: Arc<dyn BackendOps>,
    queue: Arc<DispatchQueue>,
    notifier: ChangeNotifier,
    timezones: TimezoneCache,
    state: Mutex<BackendState>,
    writable: AtomicBool,
    online: AtomicBool,
    events: broadcast::Sender<BackendEvent>,
    runtime: Handle,
}

#[derive(Clone)]
pub struct Backend {
    inner: Arc<BackendInner>,
}

/// Per-operation context handed to [`BackendOps`] methods.
#[derive(Clone)]
pub struct OpContext {
    cancel: CancellationToken,
    backend: Backend,
}

impl OpContext {
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check_cancelled(&self) -> BackendResult<()> {
        if self.cancel.is_cancelled() {
            Err(BackendError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run `fut` until it finishes or the operation is cancelled.
    pub async fn run<T, F>(&self, fut: F) -> BackendResult<T>
    where
        F: Future<Output = BackendResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BackendError::Cancelled),
            result = fut => result,
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn timezones(&self) -> &TimezoneCache {
        &self.backend.inner.timezones
    }
}

/// Resets a backend stuck in `Opening` when the open future is dropped.
struct OpeningGuard<'a> {
    backend: &'a Backend,
}

impl Drop for OpeningGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.backend.inner.state.lock();
        if *state == BackendState::Opening {
            *state = BackendState::Unopened;
        }
    }
}

impl Backend {
    /// Create a backend. Must be called from within a tokio runtime.
    pub fn new(settings: BackendSettings, ops: Arc<dyn BackendOps>) -> BackendResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| BackendError::Other(format!("No async runtime: {e}")))?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Backend {
            inner: Arc::new(BackendInner {
                queue: DispatchQueue::new(settings.worker_count(), runtime.clone()),
                notifier: ChangeNotifier::new(settings.notify, runtime.clone()),
                timezones: TimezoneCache::new(),
                state: Mutex::new(BackendState::Unopened),
                writable: AtomicBool::new(settings.writable),
                online: AtomicBool::new(settings.online),
                source_uid: settings.source_uid,
                kind: settings.kind,
                cache_dir: settings.cache_dir,
                ops,
                events,
                runtime,
            }),
        })
    }

    pub fn source_uid(&self) -> &str {
        &self.inner.source_uid
    }

    pub fn kind(&self) -> ComponentKind {
        self.inner.kind
    }

    pub fn cache_dir(&self) -> &Path {
        &self.inner.cache_dir
    }

    pub fn state(&self) -> BackendState {
        *self.inner.state.lock()
    }

    pub fn is_opened(&self) -> bool {
        self.state() == BackendState::Opened
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::Acquire)
    }

    pub fn is_writable(&self) -> bool {
        self.inner.writable.load(Ordering::Acquire)
    }

    pub fn timezones(&self) -> &TimezoneCache {
        &self.inner.timezones
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.inner.notifier
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.inner.events.subscribe()
    }

    fn downgrade(&self) -> Weak<BackendInner> {
        Arc::downgrade(&self.inner)
    }

    /// Queue `f` as an operation. The queued closure only holds a weak
    /// reference, so a dropped backend fails its leftover work as cancelled.
    fn submit<T, F, Fut>(&self, blocking: bool, f: F) -> OperationHandle<T>
    where
        T: FromReply,
        F: FnOnce(Backend, OpContext) -> Fut + Send + 'static,
        Fut: Future<Output = BackendResult<Reply>> + Send + 'static,
    {
        let weak = self.downgrade();
        self.inner.queue.submit(
            blocking,
            dispatch_fn(move |cancel| async move {
                let Some(inner) = weak.upgrade() else {
                    return Err(BackendError::Cancelled);
                };
                let backend = Backend { inner };
                let ctx = OpContext {
                    cancel,
                    backend: backend.clone(),
                };
                f(backend, ctx).await
            }),
        )
    }

    fn ensure_opened(&self) -> BackendResult<()> {
        if self.is_opened() {
            Ok(())
        } else {
            Err(BackendError::NotOpened)
        }
    }

    fn ensure_writable(&self) -> BackendResult<()> {
        if self.is_writable() {
            Ok(())
        } else {
            Err(BackendError::PermissionDenied)
        }
    }

    /// Parse one object of this backend's kind. Timezones sent along with
    /// it are added to the timezone cache.
    fn parse_object(&self, text: &str) -> BackendResult<Component> {
        let mut objects = Vec::new();
        for component in ics::parse_components(text)? {
            match component.kind() {
                Some(ComponentKind::Timezone) => {
                    self.inner.timezones.add(&component)?;
                }
                Some(kind) if kind == self.inner.kind => objects.push(component),
                _ => {
                    return Err(BackendError::InvalidObject(format!(
                        "Expected {}, got {}",
                        self.inner.kind.ics_name(),
                        component.name
                    )));
                }
            }
        }

        match objects.len() {
            1 => Ok(objects.remove(0)),
            0 => Err(BackendError::InvalidObject(format!(
                "No {} in object",
                self.inner.kind.ics_name()
            ))),
            n => Err(BackendError::InvalidObject(format!(
                "Expected a single {}, found {n}",
                self.inner.kind.ics_name()
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Open the backend. Blocking and idempotent: once opened, further
    /// calls complete immediately without touching the implementation.
    pub fn open(&self) -> OperationHandle<()> {
        self.submit(true, |backend, ctx| async move {
            backend.open_sync(&ctx).await.map(|_| Reply::Done)
        })
    }

    async fn open_sync(&self, ctx: &OpContext) -> BackendResult<()> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                BackendState::Opened => return Ok(()),
                BackendState::Closed => {
                    return Err(BackendError::Other("Backend has been shut down".into()));
                }
                BackendState::Unopened | BackendState::Opening => {
                    *state = BackendState::Opening;
                }
            }
        }
        self.property_changed(BackendProperty::Opening);

        let guard = OpeningGuard { backend: self };
        let result = self.inner.ops.open(ctx).await;
        {
            let mut state = self.inner.state.lock();
            if *state == BackendState::Opening {
                *state = if result.is_ok() {
                    BackendState::Opened
                } else {
                    BackendState::Unopened
                };
            }
        }
        drop(guard);

        match &result {
            Ok(()) => info!(source = %self.inner.source_uid, "backend opened"),
            Err(e) => warn!(source = %self.inner.source_uid, error = %e, "backend open failed"),
        }
        self.property_changed(BackendProperty::Opening);
        self.property_changed(BackendProperty::Opened);
        result
    }

    pub fn refresh(&self) -> OperationHandle<()> {
        self.submit(false, |backend, ctx| async move {
            backend.ensure_opened()?;
            backend.inner.ops.refresh(&ctx).await?;
            Ok(Reply::Done)
        })
    }

    /// Text of the object; a VCALENDAR when a master comes with detached
    /// instances.
    pub fn get_object(&self, uid: &str, rid: Option<&str>) -> OperationHandle<String> {
        let id = ComponentId::new(uid, rid.map(str::to_string));
        self.submit(false, move |backend, ctx| async move {
            backend.ensure_opened()?;
            let mut instances = backend.inner.ops.get_object(&ctx, &id).await?;
            match instances.len() {
                0 => Err(BackendError::ObjectNotFound(id.to_string())),
                1 => Ok(Reply::Text(instances.remove(0).to_ics())),
                _ => Ok(Reply::Text(ics::to_vcalendar(&instances))),
            }
        })
    }

    pub fn get_object_list(&self, query: &str) -> OperationHandle<Vec<String>> {
        let query = query.to_string();
        self.submit(false, move |backend, ctx| async move {
            backend.ensure_opened()?;
            let query = Query::parse(&query)?;
            let objects = backend.inner.ops.get_object_list(&ctx, &query).await?;
            Ok(Reply::List(objects.iter().map(Component::to_ics).collect()))
        })
    }

    /// Create objects; resolves to the uids of the stored objects.
    pub fn create_objects(
        &self,
        objects: Vec<String>,
        flags: OperationFlags,
    ) -> OperationHandle<Vec<String>> {
        self.submit(false, move |backend, ctx| async move {
            backend.ensure_opened()?;
            backend.ensure_writable()?;
            let components = objects
                .iter()
                .map(|text| backend.parse_object(text))
                .collect::<BackendResult<Vec<_>>>()?;

            let created = backend
                .inner
                .ops
                .create_objects(&ctx, components, flags)
                .await?;

            let uids = created
                .iter()
                .filter_map(|c| c.uid().map(str::to_string))
                .collect();
            for component in created {
                backend.inner.notifier.component_created(component);
            }
            Ok(Reply::List(uids))
        })
    }

    pub fn modify_objects(
        &self,
        objects: Vec<String>,
        mod_type: ObjModType,
        flags: OperationFlags,
    ) -> OperationHandle<()> {
        self.submit(false, move |backend, ctx| async move {
            backend.ensure_opened()?;
            backend.ensure_writable()?;
            let components = objects
                .iter()
                .map(|text| backend.parse_object(text))
                .collect::<BackendResult<Vec<_>>>()?;

            let modified = backend
                .inner
                .ops
                .modify_objects(&ctx, components, mod_type, flags)
                .await?;

            for ModifiedObject { old, new } in modified {
                backend.inner.notifier.component_modified(old, new);
            }
            Ok(Reply::Done)
        })
    }

    pub fn remove_objects(
        &self,
        ids: Vec<ComponentId>,
        mod_type: ObjModType,
        flags: OperationFlags,
    ) -> OperationHandle<()> {
        self.submit(false, move |backend, ctx| async move {
            backend.ensure_opened()?;
            backend.ensure_writable()?;

            let removed = backend
                .inner
                .ops
                .remove_objects(&ctx, ids, mod_type, flags)
                .await?;

            for RemovedObject { id, old, new } in removed {
                backend.inner.notifier.component_removed(id, old, new);
            }
            Ok(Reply::Done)
        })
    }

    pub fn get_free_busy(
        &self,
        users: Vec<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> OperationHandle<Vec<String>> {
        self.submit(false, move |backend, ctx| async move {
            backend.ensure_opened()?;
            if start >= end {
                return Err(BackendError::InvalidArgument(
                    "Free/busy range must end after it starts".into(),
                ));
            }
            let blocks = backend
                .inner
                .ops
                .get_free_busy(&ctx, &users, start, end)
                .await?;
            Ok(Reply::List(blocks.iter().map(Component::to_ics).collect()))
        })
    }

    pub fn discard_alarm(
        &self,
        uid: &str,
        rid: Option<&str>,
        alarm_uid: &str,
        flags: OperationFlags,
    ) -> OperationHandle<()> {
        let id = ComponentId::new(uid, rid.map(str::to_string));
        let alarm_uid = alarm_uid.to_string();
        self.submit(false, move |backend, ctx| async move {
            backend.ensure_opened()?;
            backend
                .inner
                .ops
                .discard_alarm(&ctx, &id, &alarm_uid, flags)
                .await?;
            Ok(Reply::Done)
        })
    }

    pub fn add_timezone(&self, text: &str) -> OperationHandle<()> {
        let text = text.to_string();
        self.submit(false, move |backend, ctx| async move {
            backend.ensure_opened()?;
            let zone = ics::parse_components(&text)?
                .into_iter()
                .find(|c| c.kind() == Some(ComponentKind::Timezone))
                .ok_or_else(|| BackendError::InvalidObject("No VTIMEZONE in object".into()))?;
            backend.inner.ops.add_timezone(&ctx, zone).await?;
            Ok(Reply::Done)
        })
    }

    pub fn get_timezone(&self, tzid: &str) -> OperationHandle<String> {
        let tzid = tzid.to_string();
        self.submit(false, move |backend, ctx| async move {
            backend.ensure_opened()?;
            let zone = backend.inner.ops.get_timezone(&ctx, &tzid).await?;
            Ok(Reply::Text(zone.to_ics()))
        })
    }

    /// Register a live view and start populating it.
    ///
    /// The view is registered before this returns, so no change made after
    /// the call is missed. Existing matches arrive as `Added` notifications
    /// followed by `Complete`.
    pub fn start_view(&self, query: Query) -> (View, ViewReceiver) {
        let (view, receiver) = View::new(query);
        self.inner.notifier.add_view(&view);

        let populating = view.clone();
        let _: OperationHandle<()> = self.submit(false, move |backend, ctx| async move {
            let result = match backend.ensure_opened() {
                Ok(()) => backend.inner.ops.start_view(&ctx, &populating).await,
                Err(e) => Err(e),
            };
            populating.notify_complete(result.clone());
            result.map(|_| Reply::Done)
        });

        (view, receiver)
    }

    /// Unregister a view. No notification reaches it after this returns.
    pub fn stop_view(&self, view: &View) {
        self.inner.notifier.remove_view(view);
        self.inner.ops.stop_view(view);
    }

    /// Queue engine-internal work (background refresh, maintenance). A
    /// failure is also broadcast as [`BackendEvent::Error`], since nobody
    /// may be waiting on the handle.
    pub fn schedule_custom_operation<F, Fut>(&self, blocking: bool, f: F) -> OperationHandle<()>
    where
        F: FnOnce(Backend, OpContext) -> Fut + Send + 'static,
        Fut: Future<Output = BackendResult<()>> + Send + 'static,
    {
        self.submit(blocking, move |backend, ctx| async move {
            match f(backend.clone(), ctx).await {
                Ok(()) => Ok(Reply::Done),
                Err(BackendError::Cancelled) => Err(BackendError::Cancelled),
                Err(e) => {
                    backend.notify_error(&e.to_string());
                    Err(e)
                }
            }
        })
    }

    /// Refresh in the background once the backend is open.
    pub fn schedule_refresh(&self) -> OperationHandle<()> {
        self.schedule_custom_operation(false, |backend, ctx| async move {
            backend.ensure_opened()?;
            backend.inner.ops.refresh(&ctx).await
        })
    }

    /// Refresh every `interval` while the backend is open and online. The
    /// timer stops on shutdown or when the backend is dropped.
    pub fn start_refresh_timer(&self, interval: Duration) -> JoinHandle<()> {
        let weak = self.downgrade();
        self.inner.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let backend = Backend { inner };
                match backend.state() {
                    BackendState::Closed => break,
                    BackendState::Opened if backend.is_online() => {
                        debug!(source = %backend.source_uid(), "periodic refresh");
                        let _ = backend.schedule_refresh();
                    }
                    _ => {}
                }
            }
        })
    }

    pub fn cancel(&self, opid: OpId) {
        self.inner.queue.cancel(opid);
    }

    pub fn set_online(&self, online: bool) {
        if self.inner.online.swap(online, Ordering::AcqRel) == online {
            return;
        }
        info!(source = %self.inner.source_uid, online, "online state changed");
        self.property_changed(BackendProperty::Online);

        if self.is_opened() {
            let _ = self.schedule_custom_operation(false, move |backend, ctx| async move {
                backend.inner.ops.online_changed(&ctx, online).await
            });
        }
    }

    pub fn set_writable(&self, writable: bool) {
        if self.inner.writable.swap(writable, Ordering::AcqRel) != writable {
            self.property_changed(BackendProperty::Readonly);
        }
    }

    pub fn get_backend_property(&self, name: &str) -> Option<String> {
        BackendProperty::from_name(name).map(|property| self.property_value(property))
    }

    pub fn property_value(&self, property: BackendProperty) -> String {
        match property {
            BackendProperty::Opened => self.is_opened().to_string(),
            BackendProperty::Opening => (self.state() == BackendState::Opening).to_string(),
            BackendProperty::Revision => self.inner.notifier.revision(),
            BackendProperty::Online => self.is_online().to_string(),
            BackendProperty::Readonly => (!self.is_writable()).to_string(),
            BackendProperty::CacheDir => self.inner.cache_dir.display().to_string(),
            BackendProperty::Capabilities => self.inner.ops.capabilities().join(","),
            BackendProperty::Kind => self.inner.kind.to_string(),
        }
    }

    fn property_changed(&self, property: BackendProperty) {
        let value = self.property_value(property);
        let _ = self
            .inner
            .events
            .send(BackendEvent::PropertyChanged { property, value });
    }

    /// Report a backend-global fault to every listener.
    pub fn notify_error(&self, message: &str) {
        warn!(source = %self.inner.source_uid, error = message, "backend error");
        let _ = self
            .inner
            .events
            .send(BackendEvent::Error(message.to_string()));
    }

    pub fn notify_component_created(&self, component: Component) {
        self.inner.notifier.component_created(component);
    }

    pub fn notify_component_modified(&self, old: Option<Component>, new: Component) {
        self.inner.notifier.component_modified(old, new);
    }

    pub fn notify_component_removed(
        &self,
        id: ComponentId,
        old: Option<Component>,
        new: Option<Component>,
    ) {
        self.inner.notifier.component_removed(id, old, new);
    }

    /// Stop all views, cancel queued and running operations and move to the
    /// terminal `Closed` state.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == BackendState::Closed {
                return;
            }
            *state = BackendState::Closed;
        }
        for view in self.inner.notifier.views() {
            self.inner.ops.stop_view(&view);
        }
        self.inner.notifier.shutdown();
        self.inner.queue.shutdown();
        info!(source = %self.inner.source_uid, "backend shut down");
        let _ = self.inner.events.send(BackendEvent::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::ViewNotification;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    /// Minimal in-memory implementation keyed by uid.
    #[derive(Default)]
    struct StoreOps {
        objects: Mutex<BTreeMap<String, Component>>,
        opens: AtomicUsize,
    }

    #[async_trait]
    impl BackendOps for StoreOps {
        async fn open(&self, _ctx: &OpContext) -> BackendResult<()> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        }

        async fn get_object(
            &self,
            _ctx: &OpContext,
            id: &ComponentId,
        ) -> BackendResult<Vec<Component>> {
            Ok(self.objects.lock().get(&id.uid).cloned().into_iter().collect())
        }

        async fn get_object_list(
            &self,
            _ctx: &OpContext,
            query: &Query,
        ) -> BackendResult<Vec<Component>> {
            Ok(self
                .objects
                .lock()
                .values()
                .filter(|c| query.matches(c))
                .cloned()
                .collect())
        }

        async fn create_objects(
            &self,
            _ctx: &OpContext,
            objects: Vec<Component>,
            _flags: OperationFlags,
        ) -> BackendResult<Vec<Component>> {
            let mut store = self.objects.lock();
            for object in &objects {
                let uid = object.uid().unwrap_or_default().to_string();
                store.insert(uid, object.clone());
            }
            Ok(objects)
        }

        async fn modify_objects(
            &self,
            _ctx: &OpContext,
            objects: Vec<Component>,
            _mod_type: ObjModType,
            _flags: OperationFlags,
        ) -> BackendResult<Vec<ModifiedObject>> {
            let mut store = self.objects.lock();
            Ok(objects
                .into_iter()
                .map(|new| {
                    let uid = new.uid().unwrap_or_default().to_string();
                    let old = store.insert(uid, new.clone());
                    ModifiedObject { old, new }
                })
                .collect())
        }

        async fn remove_objects(
            &self,
            _ctx: &OpContext,
            ids: Vec<ComponentId>,
            _mod_type: ObjModType,
            _flags: OperationFlags,
        ) -> BackendResult<Vec<RemovedObject>> {
            let mut store = self.objects.lock();
            Ok(ids
                .into_iter()
                .map(|id| RemovedObject {
                    old: store.remove(&id.uid),
                    id,
                    new: None,
                })
                .collect())
        }

        async fn start_view(&self, _ctx: &OpContext, view: &View) -> BackendResult<()> {
            let matching: Vec<Component> = self
                .objects
                .lock()
                .values()
                .filter(|c| view.matches(c))
                .cloned()
                .collect();
            for component in matching {
                view.notify_added(component);
            }
            Ok(())
        }
    }

    fn backend_with(ops: Arc<StoreOps>) -> Backend {
        let mut settings = BackendSettings::new(
            "personal",
            ComponentKind::Event,
            PathBuf::from("/tmp/pimd-test"),
        );
        settings.notify.debounce = Duration::from_millis(5);
        Backend::new(settings, ops).unwrap()
    }

    const ABC: &str = "BEGIN:VEVENT\r\nUID:abc\r\nSUMMARY:Lunch\r\nEND:VEVENT\r\n";

    #[tokio::test]
    async fn test_create_before_open_is_not_opened_then_succeeds() {
        let backend = backend_with(Arc::new(StoreOps::default()));

        let early = backend.create_objects(vec![ABC.into()], OperationFlags::default());
        assert_eq!(early.wait().await, Err(BackendError::NotOpened));

        backend.open().wait().await.unwrap();
        let (_view, mut rx) = backend.start_view(Query::all());
        assert_eq!(
            rx.recv().await,
            Some(ViewNotification::Complete(Ok(()))),
            "empty backend populates nothing"
        );

        let uids = backend
            .create_objects(vec![ABC.into()], OperationFlags::default())
            .wait()
            .await
            .unwrap();
        assert_eq!(uids, vec!["abc"]);

        backend.notifier().flush().await;
        match rx.recv().await {
            Some(ViewNotification::Added(c)) => assert_eq!(c.uid(), Some("abc")),
            other => panic!("expected Added, got {other:?}"),
        }
        assert!(rx.try_recv().is_err(), "exactly one notification");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_open_runs_once() {
        let ops = Arc::new(StoreOps::default());
        let backend = backend_with(ops.clone());

        let first = backend.open();
        let second = backend.open();
        let (a, b) = tokio::join!(first.wait(), second.wait());

        assert_eq!(a, Ok(()));
        assert_eq!(b, Ok(()));
        assert_eq!(ops.opens.load(Ordering::SeqCst), 1);
        assert_eq!(backend.state(), BackendState::Opened);
    }

    #[tokio::test]
    async fn test_read_only_backend_rejects_writes() {
        let backend = backend_with(Arc::new(StoreOps::default()));
        backend.open().wait().await.unwrap();
        backend.set_writable(false);

        let result = backend
            .create_objects(vec![ABC.into()], OperationFlags::default())
            .wait()
            .await;
        assert_eq!(result, Err(BackendError::PermissionDenied));
        assert_eq!(backend.get_backend_property("readonly").as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn test_wrong_kind_is_invalid_object() {
        let backend = backend_with(Arc::new(StoreOps::default()));
        backend.open().wait().await.unwrap();

        let todo = "BEGIN:VTODO\r\nUID:t\r\nEND:VTODO\r\n".to_string();
        let result = backend
            .create_objects(vec![todo], OperationFlags::default())
            .wait()
            .await;
        assert!(matches!(result, Err(BackendError::InvalidObject(_))));
    }

    #[tokio::test]
    async fn test_properties() {
        let backend = backend_with(Arc::new(StoreOps::default()));
        assert_eq!(backend.get_backend_property("opened").as_deref(), Some("false"));

        backend.open().wait().await.unwrap();
        assert_eq!(backend.get_backend_property("opened").as_deref(), Some("true"));
        assert_eq!(backend.get_backend_property("kind").as_deref(), Some("event"));
        assert_eq!(
            backend.get_backend_property("cache-dir").as_deref(),
            Some("/tmp/pimd-test")
        );
        assert_eq!(backend.get_backend_property("nonsense"), None);

        let before = backend.get_backend_property("revision");
        backend
            .create_objects(vec![ABC.into()], OperationFlags::default())
            .wait()
            .await
            .unwrap();
        assert_ne!(backend.get_backend_property("revision"), before);
    }

    #[tokio::test]
    async fn test_refresh_not_supported_by_default() {
        let backend = backend_with(Arc::new(StoreOps::default()));
        assert_eq!(backend.refresh().wait().await, Err(BackendError::NotOpened));

        backend.open().wait().await.unwrap();
        assert!(matches!(
            backend.refresh().wait().await,
            Err(BackendError::NotSupported(_))
        ));
    }

    #[tokio::test]
    async fn test_get_object_and_list() {
        let backend = backend_with(Arc::new(StoreOps::default()));
        backend.open().wait().await.unwrap();
        backend
            .create_objects(vec![ABC.into()], OperationFlags::default())
            .wait()
            .await
            .unwrap();

        let text = backend.get_object("abc", None).wait().await.unwrap();
        assert!(text.contains("SUMMARY:Lunch"));

        let missing = backend.get_object("nope", None).wait().await;
        assert!(matches!(missing, Err(BackendError::ObjectNotFound(_))));

        let list = backend
            .get_object_list(r#"(contains? "summary" "lunch")"#)
            .wait()
            .await
            .unwrap();
        assert_eq!(list.len(), 1);

        let bad = backend.get_object_list("(bogus?)").wait().await;
        assert!(matches!(bad, Err(BackendError::InvalidQuery(_))));
    }

    #[tokio::test]
    async fn test_timezones_round_trip() {
        let backend = backend_with(Arc::new(StoreOps::default()));
        backend.open().wait().await.unwrap();

        let zone = "BEGIN:VTIMEZONE\r\nTZID:Europe/Berlin\r\nEND:VTIMEZONE\r\n";
        backend.add_timezone(zone).wait().await.unwrap();
        let text = backend.get_timezone("Europe/Berlin").wait().await.unwrap();
        assert!(text.contains("TZID:Europe/Berlin"));

        let missing = backend.get_timezone("Mars/Olympus").wait().await;
        assert!(matches!(missing, Err(BackendError::ObjectNotFound(_))));
    }

    #[tokio::test]
    async fn test_stopped_view_receives_nothing() {
        let backend = backend_with(Arc::new(StoreOps::default()));
        backend.open().wait().await.unwrap();
        let (view, mut rx) = backend.start_view(Query::all());
        assert_eq!(rx.recv().await, Some(ViewNotification::Complete(Ok(()))));

        backend
            .create_objects(vec![ABC.into()], OperationFlags::default())
            .wait()
            .await
            .unwrap();
        backend.stop_view(&view);
        backend.notifier().flush().await;

        assert_eq!(rx.recv().await, None, "channel closed without deliveries");
    }

    #[tokio::test]
    async fn test_shutdown_is_terminal() {
        let backend = backend_with(Arc::new(StoreOps::default()));
        let mut events = backend.subscribe();
        backend.open().wait().await.unwrap();
        backend.shutdown();

        assert_eq!(backend.state(), BackendState::Closed);
        assert_eq!(backend.open().wait().await, Err(BackendError::Cancelled));

        let mut saw_closed = false;
        while let Ok(event) = events.try_recv() {
            saw_closed |= event == BackendEvent::Closed;
        }
        assert!(saw_closed);
    }
}
