//! Selection controller: owns the active category filter and page state and
//! sequences store queries so the page list and the three histograms always
//! describe the same filter.
//!
//! Every refresh takes a generation number under the state lock. Store
//! queries run on the blocking pool without the lock held; when they
//! return, the results are applied in one critical section only if no newer
//! refresh has started since. Older results are dropped.

use std::sync::Arc;

use chrono::{Local, NaiveDate};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::{EngineError, StoreError};
use crate::models::LogRecord;
use crate::pager::{Direction, PageState};
use crate::projections::{densify, Bucket, Domain};
use crate::store::RecordStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Uninitialized,
    Loading,
    Ready,
}

/// Everything the UI shows for one filter, computed in one refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub category_id: Option<i64>,
    pub page_items: Vec<LogRecord>,
    pub page_state: PageState,
    pub hour_histogram: Vec<Bucket>,
    pub day_histogram: Vec<Bucket>,
    pub month_histogram: Vec<Bucket>,
}

impl Snapshot {
    /// Snapshot for "no categories at all".
    pub fn empty(page_size: u64, today: NaiveDate) -> Self {
        Self {
            category_id: None,
            page_items: Vec::new(),
            page_state: PageState::empty(page_size),
            hour_histogram: densify(&Domain::Hours, &[]),
            day_histogram: densify(&Domain::days_of_month(today), &[]),
            month_histogram: densify(&Domain::Months, &[]),
        }
    }
}

/// Read-only view for callers. `stale` is set while a refresh is loading or
/// after the latest refresh failed.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerView {
    pub phase: Phase,
    pub snapshot: Option<Snapshot>,
    pub stale: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    Applied(Snapshot),
    /// A newer refresh started before this one finished; nothing applied.
    Superseded,
    /// The event did not concern the active filter.
    Skipped,
}

struct State {
    filter: Option<i64>,
    pager: PageState,
    generation: u64,
    phase: Phase,
    snapshot: Option<Snapshot>,
    last_error: Option<String>,
}

pub struct SelectionController<S> {
    store: Arc<S>,
    page_size: u64,
    state: Mutex<State>,
}

impl<S: RecordStore> SelectionController<S> {
    pub fn new(store: Arc<S>, page_size: u64) -> Self {
        let page_size = page_size.max(1);
        Self {
            store,
            page_size,
            state: Mutex::new(State {
                filter: None,
                pager: PageState::empty(page_size),
                generation: 0,
                phase: Phase::Uninitialized,
                snapshot: None,
                last_error: None,
            }),
        }
    }

    pub async fn view(&self) -> ControllerView {
        let state = self.state.lock().await;
        ControllerView {
            phase: state.phase,
            snapshot: state.snapshot.clone(),
            stale: state.phase == Phase::Loading || state.last_error.is_some(),
            last_error: state.last_error.clone(),
        }
    }

    pub async fn active_filter(&self) -> Option<i64> {
        self.state.lock().await.filter
    }

    /// Switches the filter and reloads everything from page 1.
    ///
    /// `None` picks the first category by name; with no categories at all
    /// the result is an empty snapshot. The generation is taken before the
    /// category is resolved, so a later selection always wins.
    pub async fn select_category(
        &self,
        requested: Option<i64>,
    ) -> Result<RefreshOutcome, EngineError> {
        let generation = {
            let mut state = self.state.lock().await;
            state.filter = requested;
            state.pager = PageState::empty(self.page_size);
            begin(&mut state)
        };
        info!(generation, ?requested, "selecting category");

        let result = match self.resolve_category(requested).await {
            Ok(Some(id)) => self.load(id, 1).await,
            Ok(None) => Ok(Snapshot::empty(self.page_size, today())),
            Err(err) => Err(err),
        };
        self.finish(generation, result).await
    }

    /// Moves one page and reloads only the page window; histograms cover
    /// the whole filtered set and are carried over.
    pub async fn go_to_page(&self, direction: Direction) -> Result<RefreshOutcome, EngineError> {
        let (generation, id, pager, base) = {
            let mut state = self.state.lock().await;
            let base = match (state.phase, &state.snapshot) {
                (Phase::Ready, Some(snapshot)) => snapshot.clone(),
                _ => return Err(EngineError::NotReady),
            };
            let mut pager = state.pager;
            let id = match state.filter {
                Some(id) if pager.advance(direction) => id,
                _ => return Ok(RefreshOutcome::Applied(base)),
            };
            state.pager = pager;
            (begin(&mut state), id, pager, base)
        };
        debug!(generation, category_id = id, page = pager.current_page, "loading page");

        let result = self
            .blocking(move |store| store.page(id, pager.offset(), pager.limit()))
            .await
            .map(|page_items| Snapshot {
                page_items,
                page_state: pager,
                ..base
            });
        self.finish(generation, result).await
    }

    /// Called after a record owned by `category_id` was inserted or deleted.
    /// Reloads counts, the current page (clamped) and histograms when that
    /// category is the active filter; otherwise does nothing.
    pub async fn record_mutated(
        &self,
        category_id: Option<i64>,
    ) -> Result<RefreshOutcome, EngineError> {
        let (generation, id, requested) = {
            let mut state = self.state.lock().await;
            let id = match category_id {
                Some(id) if state.filter == Some(id) => id,
                _ => return Ok(RefreshOutcome::Skipped),
            };
            let requested = state.pager.current_page;
            (begin(&mut state), id, requested)
        };
        debug!(generation, category_id = id, "record mutated, refreshing");

        let result = self.load(id, requested).await;
        self.finish(generation, result).await
    }

    /// Checks `requested` against the current categories, or picks the
    /// first one when nothing was requested.
    async fn resolve_category(&self, requested: Option<i64>) -> Result<Option<i64>, EngineError> {
        let categories = self.blocking(|store| store.categories()).await?;
        match requested {
            Some(id) if categories.iter().any(|c| c.id == id) => Ok(Some(id)),
            Some(id) => Err(EngineError::UnknownCategory(id)),
            None => Ok(categories.first().map(|c| c.id)),
        }
    }

    /// Full refresh: count then page window, alongside the three bucket
    /// queries, all for the same category.
    async fn load(&self, id: i64, requested_page: u64) -> Result<Snapshot, EngineError> {
        let today = today();
        let page_size = self.page_size;

        let window = async {
            let total = self.blocking(move |store| store.count(id)).await?;
            let page_state = PageState::recompute(total, page_size, requested_page);
            let items = self
                .blocking(move |store| store.page(id, page_state.offset(), page_state.limit()))
                .await?;
            Ok::<_, EngineError>((page_state, items))
        };

        let ((page_state, page_items), hours, days, months) = tokio::try_join!(
            window,
            self.blocking(move |store| store.hour_buckets(id)),
            self.blocking(move |store| store.day_buckets(id, today)),
            self.blocking(move |store| store.month_buckets(id, today)),
        )?;

        Ok(Snapshot {
            category_id: Some(id),
            page_items,
            page_state,
            hour_histogram: densify(&Domain::Hours, &hours),
            day_histogram: densify(&Domain::days_of_month(today), &days),
            month_histogram: densify(&Domain::Months, &months),
        })
    }

    async fn finish(
        &self,
        generation: u64,
        result: Result<Snapshot, EngineError>,
    ) -> Result<RefreshOutcome, EngineError> {
        let mut state = self.state.lock().await;
        if state.generation != generation {
            debug!(generation, current = state.generation, "discarding superseded refresh");
            return Ok(RefreshOutcome::Superseded);
        }

        match result {
            Ok(snapshot) => {
                state.filter = snapshot.category_id;
                state.pager = snapshot.page_state;
                state.phase = Phase::Ready;
                state.last_error = None;
                state.snapshot = Some(snapshot.clone());
                debug!(
                    generation,
                    category_id = ?snapshot.category_id,
                    page = snapshot.page_state.current_page,
                    total_items = snapshot.page_state.total_items,
                    "refresh applied"
                );
                Ok(RefreshOutcome::Applied(snapshot))
            }
            Err(err) => {
                warn!(generation, error = %err, "refresh failed, keeping last snapshot");
                // A bad selection is the caller's mistake; the data is not stale
                if !matches!(err, EngineError::UnknownCategory(_)) {
                    state.last_error = Some(err.to_string());
                }
                restore_last_good(&mut state, self.page_size);
                Err(err)
            }
        }
    }

    async fn blocking<T, F>(&self, query: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&S) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || query(store.as_ref()))
            .await
            .map_err(|err| EngineError::Task(err.to_string()))?
            .map_err(EngineError::from)
    }
}

fn begin(state: &mut MutexGuard<'_, State>) -> u64 {
    state.generation += 1;
    state.phase = Phase::Loading;
    state.generation
}

/// Puts filter and pager back to what the last good snapshot was built for.
fn restore_last_good(state: &mut MutexGuard<'_, State>, page_size: u64) {
    match state.snapshot.as_ref().map(|s| (s.category_id, s.page_state)) {
        Some((filter, pager)) => {
            state.filter = filter;
            state.pager = pager;
            state.phase = Phase::Ready;
        }
        None => {
            state.filter = None;
            state.pager = PageState::empty(page_size);
            state.phase = Phase::Uninitialized;
        }
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Category, NewRecord};
    use crate::projections::SparseCounts;
    use crate::store::SqliteStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Wraps the SQLite store to inject latency, failures and call counting.
    struct TestStore {
        inner: SqliteStore,
        slow_category: Option<i64>,
        delay: Duration,
        categories_delay: Duration,
        failing: AtomicBool,
        calls: AtomicUsize,
    }

    impl TestStore {
        fn new(inner: SqliteStore) -> Self {
            Self {
                inner,
                slow_category: None,
                delay: Duration::ZERO,
                categories_delay: Duration::ZERO,
                failing: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            }
        }

        fn slow_for(mut self, category_id: i64, delay: Duration) -> Self {
            self.slow_category = Some(category_id);
            self.delay = delay;
            self
        }

        fn slow_categories(mut self, delay: Duration) -> Self {
            self.categories_delay = delay;
            self
        }

        fn enter(&self, category_id: i64) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.slow_category == Some(category_id) {
                std::thread::sleep(self.delay);
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Poisoned);
            }
            Ok(())
        }
    }

    impl RecordStore for TestStore {
        fn count(&self, category_id: i64) -> Result<u64, StoreError> {
            self.enter(category_id)?;
            self.inner.count(category_id)
        }

        fn page(&self, category_id: i64, offset: u64, limit: u64) -> Result<Vec<LogRecord>, StoreError> {
            self.enter(category_id)?;
            self.inner.page(category_id, offset, limit)
        }

        fn hour_buckets(&self, category_id: i64) -> Result<SparseCounts, StoreError> {
            self.enter(category_id)?;
            self.inner.hour_buckets(category_id)
        }

        fn day_buckets(&self, category_id: i64, today: NaiveDate) -> Result<SparseCounts, StoreError> {
            self.enter(category_id)?;
            self.inner.day_buckets(category_id, today)
        }

        fn month_buckets(&self, category_id: i64, today: NaiveDate) -> Result<SparseCounts, StoreError> {
            self.enter(category_id)?;
            self.inner.month_buckets(category_id, today)
        }

        fn categories(&self) -> Result<Vec<Category>, StoreError> {
            std::thread::sleep(self.categories_delay);
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Poisoned);
            }
            self.inner.categories()
        }
    }

    fn now_ms() -> i64 {
        Local::now().timestamp_millis()
    }

    fn add_records(store: &SqliteStore, category_id: i64, n: usize) {
        let base = now_ms();
        for i in 0..n {
            store
                .insert(&NewRecord {
                    timestamp: base - i as i64 * 1_000,
                    label: format!("event {i}"),
                    notes: None,
                    category_id: Some(category_id),
                })
                .unwrap();
        }
    }

    /// Store with categories "Alpha" and "Beta" (plus the seeded default).
    fn seeded() -> (SqliteStore, i64, i64) {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store.create_category("Alpha").unwrap().id;
        let b = store.create_category("Beta").unwrap().id;
        (store, a, b)
    }

    fn applied(outcome: RefreshOutcome) -> Snapshot {
        match outcome {
            RefreshOutcome::Applied(snapshot) => snapshot,
            other => panic!("expected applied refresh, got {other:?}"),
        }
    }

    fn total(histogram: &[Bucket]) -> u64 {
        histogram.iter().map(|b| b.count).sum()
    }

    #[tokio::test]
    async fn test_select_category_builds_consistent_snapshot() {
        let (store, a, b) = seeded();
        add_records(&store, a, 8);
        add_records(&store, b, 3);
        let controller = SelectionController::new(Arc::new(store), 5);

        assert_eq!(controller.view().await.phase, Phase::Uninitialized);

        let snapshot = applied(controller.select_category(Some(a)).await.unwrap());
        assert_eq!(snapshot.category_id, Some(a));
        assert_eq!(snapshot.page_items.len(), 5);
        assert!(snapshot.page_items.iter().all(|r| r.category_id == Some(a)));
        assert_eq!(snapshot.page_state, PageState::recompute(8, 5, 1));
        assert_eq!(snapshot.hour_histogram.len(), 24);
        assert_eq!(snapshot.month_histogram.len(), 12);
        assert_eq!(snapshot.day_histogram.len(), Domain::days_of_month(today()).len());
        assert_eq!(total(&snapshot.hour_histogram), 8);

        let view = controller.view().await;
        assert_eq!(view.phase, Phase::Ready);
        assert!(!view.stale);
        assert_eq!(view.snapshot, Some(snapshot));
    }

    #[tokio::test]
    async fn test_page_navigation_reloads_window_only() {
        let (store, a, _) = seeded();
        add_records(&store, a, 8);
        let store = Arc::new(TestStore::new(store));
        let controller = SelectionController::new(Arc::clone(&store), 5);

        let first = applied(controller.select_category(Some(a)).await.unwrap());
        let calls_before = store.calls.load(Ordering::SeqCst);

        let second = applied(controller.go_to_page(Direction::Next).await.unwrap());
        assert_eq!(store.calls.load(Ordering::SeqCst), calls_before + 1);
        assert_eq!(second.page_state.current_page, 2);
        assert_eq!(second.page_state.offset(), 5);
        assert_eq!(second.page_items.len(), 3);
        assert_eq!(second.hour_histogram, first.hour_histogram);

        // Last page: next is a no-op without a query
        let again = applied(controller.go_to_page(Direction::Next).await.unwrap());
        assert_eq!(again, second);
        assert_eq!(store.calls.load(Ordering::SeqCst), calls_before + 1);

        let back = applied(controller.go_to_page(Direction::Previous).await.unwrap());
        assert_eq!(back.page_items, first.page_items);
    }

    #[tokio::test]
    async fn test_page_navigation_requires_ready() {
        let (store, _, _) = seeded();
        let controller = SelectionController::new(Arc::new(store), 5);
        let err = controller.go_to_page(Direction::Next).await.unwrap_err();
        assert!(matches!(err, EngineError::NotReady));
    }

    #[tokio::test]
    async fn test_insert_under_active_filter_keeps_page() {
        let (store, a, _) = seeded();
        add_records(&store, a, 4);
        let store = Arc::new(store);
        let controller = SelectionController::new(Arc::clone(&store), 5);
        controller.select_category(Some(a)).await.unwrap();

        add_records(&store, a, 1);
        let snapshot = applied(controller.record_mutated(Some(a)).await.unwrap());
        assert_eq!(snapshot.page_state.total_items, 5);
        assert_eq!(snapshot.page_state.total_pages, 1);
        assert_eq!(snapshot.page_state.current_page, 1);
        assert_eq!(total(&snapshot.hour_histogram), 5);
    }

    #[tokio::test]
    async fn test_delete_clamps_current_page() {
        let (store, a, _) = seeded();
        add_records(&store, a, 6);
        let store = Arc::new(store);
        let controller = SelectionController::new(Arc::clone(&store), 5);
        controller.select_category(Some(a)).await.unwrap();
        let on_second = applied(controller.go_to_page(Direction::Next).await.unwrap());
        assert_eq!(on_second.page_items.len(), 1);

        store.delete(on_second.page_items[0].id).unwrap();
        let snapshot = applied(controller.record_mutated(Some(a)).await.unwrap());
        assert_eq!(snapshot.page_state.total_pages, 1);
        assert_eq!(snapshot.page_state.current_page, 1);
        assert_eq!(snapshot.page_items.len(), 5);
    }

    #[tokio::test]
    async fn test_mutation_of_other_filter_skipped() {
        let (store, a, b) = seeded();
        add_records(&store, a, 2);
        let store = Arc::new(TestStore::new(store));
        let controller = SelectionController::new(Arc::clone(&store), 5);
        let before = applied(controller.select_category(Some(a)).await.unwrap());
        let calls = store.calls.load(Ordering::SeqCst);

        assert_eq!(controller.record_mutated(Some(b)).await.unwrap(), RefreshOutcome::Skipped);
        assert_eq!(controller.record_mutated(None).await.unwrap(), RefreshOutcome::Skipped);
        assert_eq!(store.calls.load(Ordering::SeqCst), calls);
        assert_eq!(controller.view().await.snapshot, Some(before));
    }

    #[tokio::test]
    async fn test_default_selection_picks_first_category_by_name() {
        let (store, a, _) = seeded();
        add_records(&store, a, 1);
        let controller = SelectionController::new(Arc::new(store), 5);

        let snapshot = applied(controller.select_category(None).await.unwrap());
        assert_eq!(snapshot.category_id, Some(a));
        assert_eq!(controller.active_filter().await, Some(a));
    }

    #[tokio::test]
    async fn test_no_categories_gives_empty_ready_snapshot() {
        let store = SqliteStore::open_in_memory().unwrap();
        for category in store.categories().unwrap() {
            store.delete_category(category.id).unwrap();
        }
        let controller = SelectionController::new(Arc::new(store), 5);

        let snapshot = applied(controller.select_category(None).await.unwrap());
        assert_eq!(snapshot, Snapshot::empty(5, today()));
        assert_eq!(snapshot.page_state.total_pages, 1);
        assert_eq!(controller.view().await.phase, Phase::Ready);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_stale_selection_is_discarded() {
        let (store, a, b) = seeded();
        add_records(&store, a, 3);
        add_records(&store, b, 7);
        let store = TestStore::new(store).slow_for(b, Duration::from_millis(300));
        let controller = Arc::new(SelectionController::new(Arc::new(store), 5));

        let slow = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.select_category(Some(b)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let fast = applied(controller.select_category(Some(a)).await.unwrap());
        assert_eq!(fast.category_id, Some(a));

        let slow = slow.await.unwrap().unwrap();
        assert_eq!(slow, RefreshOutcome::Superseded);

        let view = controller.view().await;
        assert_eq!(view.phase, Phase::Ready);
        let snapshot = view.snapshot.unwrap();
        assert_eq!(snapshot.category_id, Some(a));
        assert_eq!(snapshot.page_state.total_items, 3);
        assert_eq!(controller.active_filter().await, Some(a));
    }

    #[tokio::test]
    async fn test_store_failure_keeps_last_snapshot() {
        let (store, a, b) = seeded();
        add_records(&store, a, 2);
        let store = Arc::new(TestStore::new(store));
        let controller = SelectionController::new(Arc::clone(&store), 5);
        let good = applied(controller.select_category(Some(a)).await.unwrap());

        store.failing.store(true, Ordering::SeqCst);
        let err = controller.select_category(Some(b)).await.unwrap_err();
        assert!(matches!(err, EngineError::StoreUnavailable(_)));

        let view = controller.view().await;
        assert_eq!(view.phase, Phase::Ready);
        assert!(view.stale);
        assert!(view.last_error.is_some());
        assert_eq!(view.snapshot, Some(good.clone()));
        assert_eq!(controller.active_filter().await, Some(a));

        // Recovery clears the error
        store.failing.store(false, Ordering::SeqCst);
        applied(controller.record_mutated(Some(a)).await.unwrap());
        let view = controller.view().await;
        assert!(!view.stale);
        assert_eq!(view.last_error, None);
    }

    #[tokio::test]
    async fn test_failure_before_first_snapshot_stays_uninitialized() {
        let (store, a, _) = seeded();
        let store = Arc::new(TestStore::new(store));
        store.failing.store(true, Ordering::SeqCst);
        let controller = SelectionController::new(Arc::clone(&store), 5);

        assert!(controller.select_category(Some(a)).await.is_err());
        let view = controller.view().await;
        assert_eq!(view.phase, Phase::Uninitialized);
        assert_eq!(view.snapshot, None);
        assert_eq!(controller.active_filter().await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_default_lookup_loses_to_later_selection() {
        let (store, a, b) = seeded();
        add_records(&store, a, 2);
        add_records(&store, b, 4);
        let store = TestStore::new(store).slow_categories(Duration::from_millis(300));
        let controller = Arc::new(SelectionController::new(Arc::new(store), 5));

        let default = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.select_category(None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let explicit = applied(controller.select_category(Some(b)).await.unwrap());
        assert_eq!(explicit.category_id, Some(b));
        assert_eq!(default.await.unwrap().unwrap(), RefreshOutcome::Superseded);

        let snapshot = controller.view().await.snapshot.unwrap();
        assert_eq!(snapshot.category_id, Some(b));
        assert_eq!(snapshot.page_state.total_items, 4);
        assert_eq!(controller.active_filter().await, Some(b));
    }

    #[tokio::test]
    async fn test_failed_default_lookup_marks_snapshot_stale() {
        let (store, a, _) = seeded();
        add_records(&store, a, 1);
        let store = Arc::new(TestStore::new(store));
        let controller = SelectionController::new(Arc::clone(&store), 5);
        let good = applied(controller.select_category(Some(a)).await.unwrap());

        store.failing.store(true, Ordering::SeqCst);
        let err = controller.select_category(None).await.unwrap_err();
        assert!(matches!(err, EngineError::StoreUnavailable(_)));

        let view = controller.view().await;
        assert_eq!(view.phase, Phase::Ready);
        assert!(view.stale);
        assert!(view.last_error.is_some());
        assert_eq!(view.snapshot, Some(good));
        assert_eq!(controller.active_filter().await, Some(a));
    }

    #[tokio::test]
    async fn test_unknown_category_rejected_without_staleness() {
        let (store, a, _) = seeded();
        let store = Arc::new(store);
        let controller = SelectionController::new(Arc::clone(&store), 5);
        let good = applied(controller.select_category(Some(a)).await.unwrap());

        let err = controller.select_category(Some(9_999)).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownCategory(9_999)));

        // Deleted between request and refresh
        let doomed = store.create_category("Doomed").unwrap().id;
        store.delete_category(doomed).unwrap();
        let err = controller.select_category(Some(doomed)).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownCategory(id) if id == doomed));

        let view = controller.view().await;
        assert!(!view.stale);
        assert_eq!(view.snapshot, Some(good));
        assert_eq!(controller.active_filter().await, Some(a));
    }
}
