//! Batched change notification for live views.
//!
//! Backends report every content change here. Changes are buffered and
//! flushed to the registered views either after a short quiet period or as
//! soon as the buffer grows past a threshold. Each view only ever sees
//! changes made after it was registered, in the order they were reported.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::component::{Component, ComponentId};
use crate::error::BackendResult;
use crate::query::Query;

/// Default quiet period before buffered changes are delivered.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(333);

/// Default buffer size above which changes are delivered immediately.
pub const DEFAULT_THRESHOLD: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifySettings {
    pub debounce: Duration,
    pub threshold: usize,
}

impl Default for NotifySettings {
    fn default() -> Self {
        NotifySettings {
            debounce: DEFAULT_DEBOUNCE,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

/// A content change as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Created(Component),
    Modified {
        old: Option<Component>,
        new: Component,
    },
    /// `new` is set when removing a single instance left a modified master
    /// behind.
    Removed {
        id: ComponentId,
        old: Option<Component>,
        new: Option<Component>,
    },
}

/// What a view receiver sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewNotification {
    Added(Component),
    Modified(Component),
    Removed(ComponentId),
    /// Initial population finished (or failed).
    Complete(BackendResult<()>),
}

pub type ViewReceiver = mpsc::UnboundedReceiver<ViewNotification>;

static NEXT_VIEW_ID: AtomicU64 = AtomicU64::new(1);

struct ViewInner {
    id: u64,
    query: Query,
    registered_at: AtomicU64,
    sender: Mutex<Option<mpsc::UnboundedSender<ViewNotification>>>,
}

/// A live query subscription.
#[derive(Clone)]
pub struct View {
    inner: Arc<ViewInner>,
}

impl View {
    pub fn new(query: Query) -> (View, ViewReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let view = View {
            inner: Arc::new(ViewInner {
                id: NEXT_VIEW_ID.fetch_add(1, Ordering::Relaxed),
                query,
                registered_at: AtomicU64::new(0),
                sender: Mutex::new(Some(sender)),
            }),
        };
        (view, receiver)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn query(&self) -> &Query {
        &self.inner.query
    }

    pub fn matches(&self, component: &Component) -> bool {
        self.inner.query.matches(component)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.sender.lock().is_none()
    }

    pub fn notify_added(&self, component: Component) -> bool {
        self.send(ViewNotification::Added(component))
    }

    pub fn notify_modified(&self, component: Component) -> bool {
        self.send(ViewNotification::Modified(component))
    }

    pub fn notify_removed(&self, id: ComponentId) -> bool {
        self.send(ViewNotification::Removed(id))
    }

    pub fn notify_complete(&self, result: BackendResult<()>) -> bool {
        self.send(ViewNotification::Complete(result))
    }

    fn send(&self, notification: ViewNotification) -> bool {
        match self.inner.sender.lock().as_ref() {
            Some(sender) => sender.send(notification).is_ok(),
            None => false,
        }
    }

    /// Close the channel. Once this returns no further notification can be
    /// delivered, including from a flush already in progress.
    pub(crate) fn stop(&self) {
        self.inner.sender.lock().take();
    }

    /// Deliver one change, translating it against this view's query.
    fn deliver(&self, change: &ChangeEvent) {
        match change {
            ChangeEvent::Created(component) => {
                if self.matches(component) {
                    self.notify_added(component.clone());
                }
            }
            ChangeEvent::Modified { old, new } => self.deliver_modified(old.as_ref(), new),
            ChangeEvent::Removed {
                old,
                new: Some(new),
                ..
            } => self.deliver_modified(old.as_ref(), new),
            ChangeEvent::Removed { id, old, new: None } => {
                if old.as_ref().is_none_or(|old| self.matches(old)) {
                    self.notify_removed(id.clone());
                }
            }
        }
    }

    fn deliver_modified(&self, old: Option<&Component>, new: &Component) {
        let old_match = old.is_some_and(|old| self.matches(old));
        let new_match = self.matches(new);

        if old_match && new_match {
            self.notify_modified(new.clone());
        } else if new_match {
            self.notify_added(new.clone());
        } else if old_match {
            if let Some(id) = old.and_then(Component::id) {
                self.notify_removed(id);
            }
        }
    }
}

struct SequencedChange {
    seq: u64,
    change: ChangeEvent,
}

struct NotifierState {
    pending: Vec<SequencedChange>,
    next_seq: u64,
    timer: Option<JoinHandle<()>>,
    revision: String,
}

struct NotifierInner {
    settings: NotifySettings,
    state: Mutex<NotifierState>,
    views: Mutex<Vec<View>>,
    flush_lock: tokio::sync::Mutex<()>,
    runtime: Handle,
}

#[derive(Clone)]
pub struct ChangeNotifier {
    inner: Arc<NotifierInner>,
}

impl ChangeNotifier {
    pub fn new(settings: NotifySettings, runtime: Handle) -> Self {
        ChangeNotifier {
            inner: Arc::new(NotifierInner {
                settings,
                state: Mutex::new(NotifierState {
                    pending: Vec::new(),
                    next_seq: 0,
                    timer: None,
                    revision: revision_string(0),
                }),
                views: Mutex::new(Vec::new()),
                flush_lock: tokio::sync::Mutex::new(()),
                runtime,
            }),
        }
    }

    /// Opaque token that changes whenever a change is reported.
    pub fn revision(&self) -> String {
        self.inner.state.lock().revision.clone()
    }

    pub fn component_created(&self, component: Component) {
        self.notify(ChangeEvent::Created(component));
    }

    pub fn component_modified(&self, old: Option<Component>, new: Component) {
        self.notify(ChangeEvent::Modified { old, new });
    }

    pub fn component_removed(
        &self,
        id: ComponentId,
        old: Option<Component>,
        new: Option<Component>,
    ) {
        self.notify(ChangeEvent::Removed { id, old, new });
    }

    pub fn notify(&self, change: ChangeEvent) {
        let flush_now = {
            let mut state = self.inner.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.revision = revision_string(state.next_seq);
            state.pending.push(SequencedChange { seq, change });

            if state.pending.len() > self.inner.settings.threshold {
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                }
                true
            } else {
                if state.timer.is_none() {
                    state.timer = Some(self.spawn_timer());
                }
                false
            }
        };

        if flush_now {
            trace!("change buffer over threshold, flushing now");
            let notifier = self.clone();
            self.inner
                .runtime
                .spawn(async move { notifier.flush().await });
        }
    }

    fn spawn_timer(&self) -> JoinHandle<()> {
        let weak: Weak<NotifierInner> = Arc::downgrade(&self.inner);
        let debounce = self.inner.settings.debounce;
        self.inner.runtime.spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Some(inner) = weak.upgrade() {
                ChangeNotifier { inner }.flush().await;
            }
        })
    }

    /// Deliver everything buffered so far. Concurrent flushes are
    /// serialized, so batches reach each view in the order they were taken.
    pub async fn flush(&self) {
        let _guard = self.inner.flush_lock.lock().await;

        let batch = {
            let mut state = self.inner.state.lock();
            state.timer = None;
            std::mem::take(&mut state.pending)
        };
        if batch.is_empty() {
            return;
        }

        let views = self.inner.views.lock().clone();
        debug!(changes = batch.len(), views = views.len(), "flushing changes");

        for entry in &batch {
            for view in &views {
                if entry.seq >= view.inner.registered_at.load(Ordering::Acquire) {
                    view.deliver(&entry.change);
                }
            }
        }
    }

    /// Register a view. It receives only changes reported from now on.
    pub fn add_view(&self, view: &View) {
        let state = self.inner.state.lock();
        view.inner
            .registered_at
            .store(state.next_seq, Ordering::Release);
        self.inner.views.lock().push(view.clone());
    }

    /// Unregister and stop a view. Returns whether it was registered.
    pub fn remove_view(&self, view: &View) -> bool {
        let removed = {
            let mut views = self.inner.views.lock();
            let before = views.len();
            views.retain(|v| v.id() != view.id());
            views.len() != before
        };
        view.stop();
        removed
    }

    pub fn views(&self) -> Vec<View> {
        self.inner.views.lock().clone()
    }

    /// Stop every view and drop buffered changes.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.pending.clear();
        }
        let views = std::mem::take(&mut *self.inner.views.lock());
        for view in views {
            view.stop();
        }
    }
}

fn revision_string(counter: u64) -> String {
    format!("{}({})", Utc::now().format("%Y-%m-%dT%H:%M:%SZ"), counter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentKind;

    fn event(uid: &str, summary: &str) -> Component {
        let mut c = Component::new(ComponentKind::Event);
        c.set_uid(uid);
        c.set_property("SUMMARY", summary);
        c
    }

    fn notifier(threshold: usize) -> ChangeNotifier {
        ChangeNotifier::new(
            NotifySettings {
                debounce: Duration::from_millis(20),
                threshold,
            },
            Handle::current(),
        )
    }

    fn drain(rx: &mut ViewReceiver) -> Vec<ViewNotification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    #[tokio::test]
    async fn test_changes_delivered_in_order() {
        let notifier = notifier(50);
        let (view, mut rx) = View::new(Query::all());
        notifier.add_view(&view);

        notifier.component_created(event("a", "one"));
        notifier.component_created(event("b", "two"));
        notifier.flush().await;

        let ids: Vec<_> = drain(&mut rx)
            .into_iter()
            .map(|n| match n {
                ViewNotification::Added(c) => c.uid().unwrap().to_string(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_late_view_gets_no_replay() {
        let notifier = notifier(50);
        notifier.component_created(event("before", "x"));

        let (view, mut rx) = View::new(Query::all());
        notifier.add_view(&view);
        notifier.component_created(event("after", "x"));
        notifier.flush().await;

        let notes = drain(&mut rx);
        assert_eq!(notes, vec![ViewNotification::Added(event("after", "x"))]);
    }

    #[tokio::test]
    async fn test_debounce_timer_flushes() {
        let notifier = notifier(50);
        let (view, mut rx) = View::new(Query::all());
        notifier.add_view(&view);

        notifier.component_created(event("a", "x"));
        assert!(drain(&mut rx).is_empty(), "nothing before the quiet period");

        let note = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timer should flush")
            .expect("channel open");
        assert_eq!(note, ViewNotification::Added(event("a", "x")));
    }

    #[tokio::test]
    async fn test_threshold_flushes_without_waiting() {
        let notifier = ChangeNotifier::new(
            NotifySettings {
                debounce: Duration::from_secs(3600),
                threshold: 2,
            },
            Handle::current(),
        );
        let (view, mut rx) = View::new(Query::all());
        notifier.add_view(&view);

        for uid in ["a", "b", "c"] {
            notifier.component_created(event(uid, "x"));
        }

        for expected in ["a", "b", "c"] {
            let note = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("threshold flush should not wait for debounce")
                .expect("channel open");
            assert_eq!(note, ViewNotification::Added(event(expected, "x")));
        }
    }

    #[tokio::test]
    async fn test_modify_translated_per_view() {
        let notifier = notifier(50);
        let (view, mut rx) = View::new(Query::parse(r#"(contains? "summary" "lunch")"#).unwrap());
        notifier.add_view(&view);

        // enters the view
        notifier.component_modified(Some(event("a", "standup")), event("a", "lunch"));
        // stays in the view
        notifier.component_modified(Some(event("a", "lunch")), event("a", "late lunch"));
        // leaves the view
        notifier.component_modified(Some(event("a", "late lunch")), event("a", "standup"));
        // never in the view
        notifier.component_modified(Some(event("b", "x")), event("b", "y"));
        notifier.flush().await;

        assert_eq!(
            drain(&mut rx),
            vec![
                ViewNotification::Added(event("a", "lunch")),
                ViewNotification::Modified(event("a", "late lunch")),
                ViewNotification::Removed(ComponentId::master("a")),
            ]
        );
    }

    #[tokio::test]
    async fn test_instance_removal_with_master_is_modify() {
        let notifier = notifier(50);
        let (view, mut rx) = View::new(Query::all());
        notifier.add_view(&view);

        let id = ComponentId::new("a", Some("20250101T100000Z".into()));
        notifier.component_removed(id.clone(), Some(event("a", "x")), Some(event("a", "x2")));
        notifier.component_removed(ComponentId::master("gone"), None, None);
        notifier.flush().await;

        assert_eq!(
            drain(&mut rx),
            vec![
                ViewNotification::Modified(event("a", "x2")),
                ViewNotification::Removed(ComponentId::master("gone")),
            ]
        );
    }

    #[tokio::test]
    async fn test_removed_view_receives_nothing() {
        let notifier = notifier(50);
        let (view, mut rx) = View::new(Query::all());
        notifier.add_view(&view);

        notifier.component_created(event("a", "x"));
        assert!(notifier.remove_view(&view));
        notifier.flush().await;

        assert!(drain(&mut rx).is_empty());
        assert!(view.is_stopped());
        assert!(!notifier.remove_view(&view));
    }

    #[tokio::test]
    async fn test_revision_changes_on_every_report() {
        let notifier = notifier(50);
        let before = notifier.revision();
        notifier.component_created(event("a", "x"));
        assert_ne!(notifier.revision(), before);
    }
}
