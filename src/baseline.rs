//! Per-person rolling baselines.
//!
//! Each person's baseline is a contiguous run of local calendar months
//! (oldest first, the last one still open) over a trailing window, plus
//! Welford running statistics of the closed monthly totals. Appends are
//! O(1) amortized; late arrivals rebuild only the affected person from the
//! transaction source.

use crate::error::{PipelineError, PipelineResult};
use crate::source::TransactionSource;
use crate::types::calendar::{Calendar, MonthKey};
use crate::types::transaction::Transaction;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, warn};

/// Welford running mean/variance that also supports removal.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    /// Reverse a previous `push(x)`.
    pub fn remove(&mut self, x: f64) {
        if self.count <= 1 {
            *self = Self::default();
            return;
        }
        let remaining = (self.count - 1) as f64;
        let delta = x - self.mean;
        let previous_mean = self.mean - delta / remaining;
        self.m2 = (self.m2 - (x - previous_mean) * delta).max(0.0);
        self.mean = previous_mean;
        self.count -= 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population variance
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Transactions aggregated over one local calendar month
#[derive(Debug, Clone, PartialEq)]
pub struct MonthAggregate {
    pub month: MonthKey,
    pub count: u64,
    pub total: f64,
    pub sources: HashMap<String, f64>,
}

impl MonthAggregate {
    fn empty(month: MonthKey) -> Self {
        Self {
            month,
            count: 0,
            total: 0.0,
            sources: HashMap::new(),
        }
    }
}

/// Comparison point drawn from baseline months that precede a window
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BaselineReference {
    pub months: u64,
    pub mean_monthly_total: f64,
    pub std_monthly_total: f64,
    pub transaction_count: u64,
    pub mean_transaction_amount: f64,
}

impl BaselineReference {
    pub fn is_empty(&self) -> bool {
        self.months == 0
    }
}

/// Rolling statistics for one person. Owned by [`BaselineStore`].
#[derive(Debug, Clone)]
pub struct WorkerBaseline {
    person_id: String,
    window_months: u32,
    months: VecDeque<MonthAggregate>,
    source_totals: HashMap<String, f64>,
    /// Totals of every month in `months` except the open (last) one
    monthly_stats: RunningStats,
    transaction_count: u64,
    total_amount: f64,
    first_seen: Option<DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
}

impl WorkerBaseline {
    pub fn new(person_id: impl Into<String>, window_months: u32) -> Self {
        Self {
            person_id: person_id.into(),
            window_months: window_months.max(1),
            months: VecDeque::new(),
            source_totals: HashMap::new(),
            monthly_stats: RunningStats::default(),
            transaction_count: 0,
            total_amount: 0.0,
            first_seen: None,
            last_seen: None,
        }
    }

    pub fn person_id(&self) -> &str {
        &self.person_id
    }

    pub fn months(&self) -> impl Iterator<Item = &MonthAggregate> {
        self.months.iter()
    }

    pub fn current_month(&self) -> Option<MonthKey> {
        self.months.back().map(|m| m.month)
    }

    /// Running statistics of closed monthly totals
    pub fn monthly_stats(&self) -> &RunningStats {
        &self.monthly_stats
    }

    pub fn source_totals(&self) -> &HashMap<String, f64> {
        &self.source_totals
    }

    /// Share of the trailing-window amount paid by the largest source
    pub fn source_concentration(&self) -> f64 {
        if self.total_amount <= 0.0 {
            return 0.0;
        }
        let max = self.source_totals.values().copied().fold(0.0, f64::max);
        (max / self.total_amount).clamp(0.0, 1.0)
    }

    pub fn transaction_count(&self) -> u64 {
        self.transaction_count
    }

    pub fn total_amount(&self) -> f64 {
        self.total_amount
    }

    pub fn first_seen(&self) -> Option<DateTime<Utc>> {
        self.first_seen
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }

    /// Apply a transaction at or after `last_seen`.
    fn apply(&mut self, tx: &Transaction, month: MonthKey) {
        match self.current_month() {
            None => self.months.push_back(MonthAggregate::empty(month)),
            Some(current) if month > current => {
                // Close the open month and any skipped months as zero-total months
                if let Some(open) = self.months.back() {
                    self.monthly_stats.push(open.total);
                }
                let mut next = current.next();
                while next < month {
                    self.months.push_back(MonthAggregate::empty(next));
                    self.monthly_stats.push(0.0);
                    self.evict();
                    next = next.next();
                }
                self.months.push_back(MonthAggregate::empty(month));
            }
            Some(_) => {}
        }
        self.evict();

        if let Some(open) = self.months.back_mut() {
            open.count += 1;
            open.total += tx.amount;
            *open.sources.entry(tx.source_id.clone()).or_insert(0.0) += tx.amount;
        }
        *self.source_totals.entry(tx.source_id.clone()).or_insert(0.0) += tx.amount;
        self.transaction_count += 1;
        self.total_amount += tx.amount;
        self.first_seen = Some(self.first_seen.map_or(tx.timestamp, |f| f.min(tx.timestamp)));
        self.last_seen = Some(self.last_seen.map_or(tx.timestamp, |l| l.max(tx.timestamp)));
    }

    fn evict(&mut self) {
        while self.months.len() > self.window_months as usize {
            let Some(oldest) = self.months.pop_front() else {
                break;
            };
            self.monthly_stats.remove(oldest.total);
            self.transaction_count -= oldest.count;
            self.total_amount = (self.total_amount - oldest.total).max(0.0);
            for (source, amount) in oldest.sources {
                if let Some(total) = self.source_totals.get_mut(&source) {
                    *total -= amount;
                    if *total <= f64::EPSILON {
                        self.source_totals.remove(&source);
                    }
                }
            }
        }
    }

    /// Statistics over the tracked months strictly before `month`.
    pub fn reference_before(&self, month: MonthKey) -> BaselineReference {
        let Some(current) = self.current_month() else {
            return BaselineReference::default();
        };

        if current < month {
            // Every tracked month precedes the window: reuse the running stats
            let mut stats = self.monthly_stats;
            if let Some(open) = self.months.back() {
                stats.push(open.total);
            }
            return Self::reference(stats, self.transaction_count, self.total_amount);
        }

        let mut stats = RunningStats::default();
        let mut count = 0;
        let mut amount = 0.0;
        for aggregate in self.months.iter().take_while(|m| m.month < month) {
            stats.push(aggregate.total);
            count += aggregate.count;
            amount += aggregate.total;
        }
        Self::reference(stats, count, amount)
    }

    fn reference(stats: RunningStats, transaction_count: u64, amount: f64) -> BaselineReference {
        BaselineReference {
            months: stats.count(),
            mean_monthly_total: stats.mean(),
            std_monthly_total: stats.std_dev(),
            transaction_count,
            mean_transaction_amount: if transaction_count > 0 {
                amount / transaction_count as f64
            } else {
                0.0
            },
        }
    }
}

/// How an append was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Folded into the open month, or the person's first baseline was built
    Applied,
    /// The transaction arrived late and the person was rebuilt
    Recomputed,
}

type BaselineSlot = Arc<Mutex<Option<WorkerBaseline>>>;

/// Baselines keyed by person, single writer per person.
///
/// Appends for the same person serialize on that person's lock; different
/// people never contend beyond the brief map lookup.
pub struct BaselineStore {
    source: Arc<dyn TransactionSource>,
    calendar: Calendar,
    window_months: u32,
    people: RwLock<HashMap<String, BaselineSlot>>,
}

impl BaselineStore {
    pub fn new(source: Arc<dyn TransactionSource>, calendar: Calendar, window_months: u32) -> Self {
        Self {
            source,
            calendar,
            window_months: window_months.max(1),
            people: RwLock::new(HashMap::new()),
        }
    }

    pub fn window_months(&self) -> u32 {
        self.window_months
    }

    pub fn calendar(&self) -> Calendar {
        self.calendar
    }

    fn slot(&self, person_id: &str) -> BaselineSlot {
        if let Some(slot) = self
            .people
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(person_id)
        {
            return slot.clone();
        }
        self.people
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(person_id.to_string())
            .or_default()
            .clone()
    }

    /// Append one transaction to its person's baseline.
    pub fn append(&self, tx: &Transaction) -> PipelineResult<AppendOutcome> {
        validate(tx, &tx.person_id)?;

        let slot = self.slot(&tx.person_id);
        let mut state = slot.lock().unwrap_or_else(PoisonError::into_inner);

        let late = state
            .as_ref()
            .and_then(WorkerBaseline::last_seen)
            .is_some_and(|last| tx.timestamp < last);

        if late {
            warn!(
                person_id = %tx.person_id,
                transaction_id = %tx.id,
                "Late transaction, recomputing baseline"
            );
            let rebuilt = self.rebuild(&tx.person_id, Some(tx), state.as_ref())?;
            *state = Some(rebuilt);
            return Ok(AppendOutcome::Recomputed);
        }

        match state.as_mut() {
            Some(baseline) => baseline.apply(tx, self.calendar.month_of(tx.timestamp)),
            None => *state = Some(self.first_sight(tx)?),
        }
        Ok(AppendOutcome::Applied)
    }

    /// Snapshot of the person's baseline, built from the source if none exists yet.
    ///
    /// The check and the build happen under the person's lock, so a
    /// concurrent append is never overwritten. Returns `None` when the source
    /// holds no transactions for the person.
    pub fn ensure(&self, person_id: &str) -> PipelineResult<Option<WorkerBaseline>> {
        let slot = self.slot(person_id);
        let mut state = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_none() {
            let built = match self.rebuild(person_id, None, None) {
                Ok(baseline) => baseline,
                Err(PipelineError::UnknownPerson(_)) => return Ok(None),
                Err(e) => return Err(e),
            };
            if built.transaction_count == 0 {
                return Ok(None);
            }
            debug!(
                person_id = %person_id,
                months = built.months.len(),
                transactions = built.transaction_count,
                "Baseline backfilled from source"
            );
            *state = Some(built);
        }
        Ok(state.clone())
    }

    /// Replace a person's baseline with one built from `transactions` (cold start).
    pub fn backfill(&self, person_id: &str, transactions: Vec<Transaction>) -> PipelineResult<()> {
        let baseline = self.build(person_id, transactions)?;
        debug!(
            person_id = %person_id,
            months = baseline.months.len(),
            transactions = baseline.transaction_count,
            "Baseline backfilled"
        );
        let slot = self.slot(person_id);
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(baseline);
        Ok(())
    }

    /// Rebuild a person's baseline from the transaction source.
    pub fn recompute(&self, person_id: &str) -> PipelineResult<()> {
        let slot = self.slot(person_id);
        let mut state = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let rebuilt = self.rebuild(person_id, None, state.as_ref())?;
        *state = Some(rebuilt);
        Ok(())
    }

    /// Copy of the person's current baseline
    pub fn snapshot(&self, person_id: &str) -> Option<WorkerBaseline> {
        let slot = self
            .people
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(person_id)
            .cloned()?;
        let state = slot.lock().unwrap_or_else(PoisonError::into_inner);
        state.clone()
    }

    pub fn person_count(&self) -> usize {
        self.people.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn rebuild(
        &self,
        person_id: &str,
        late: Option<&Transaction>,
        current: Option<&WorkerBaseline>,
    ) -> PipelineResult<WorkerBaseline> {
        // The source may hold later transactions than we have seen; eviction
        // trims the history to the trailing window either way.
        let latest = [current.and_then(WorkerBaseline::last_seen), late.map(|t| t.timestamp)]
            .into_iter()
            .flatten()
            .max();
        let start = latest
            .and_then(|l| self.calendar.month_start(self.calendar.month_of(l).back(self.window_months)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut history = match self.source.transactions(person_id, start, DateTime::<Utc>::MAX_UTC) {
            Ok(history) => history,
            Err(PipelineError::UnknownPerson(_)) if late.is_some() => Vec::new(),
            Err(e) => return Err(e),
        };
        if let Some(tx) = late {
            if !history.iter().any(|t| t.id == tx.id) {
                history.push(tx.clone());
            }
        }
        self.build(person_id, history)
    }

    /// Baseline for a person seen for the first time: the source's history
    /// before `tx`, then `tx`. Later transactions arrive through their own appends.
    fn first_sight(&self, tx: &Transaction) -> PipelineResult<WorkerBaseline> {
        let start = self
            .calendar
            .month_start(self.calendar.month_of(tx.timestamp).back(self.window_months))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut history = match self.source.transactions(&tx.person_id, start, tx.timestamp) {
            Ok(history) => history,
            Err(PipelineError::UnknownPerson(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        history.retain(|t| t.id != tx.id);
        history.push(tx.clone());
        self.build(&tx.person_id, history)
    }

    fn build(&self, person_id: &str, mut transactions: Vec<Transaction>) -> PipelineResult<WorkerBaseline> {
        for tx in &transactions {
            validate(tx, person_id)?;
        }
        transactions.sort_by_key(|t| t.timestamp);

        let mut baseline = WorkerBaseline::new(person_id, self.window_months);
        for tx in &transactions {
            baseline.apply(tx, self.calendar.month_of(tx.timestamp));
        }
        Ok(baseline)
    }
}

fn validate(tx: &Transaction, person_id: &str) -> PipelineResult<()> {
    if !tx.has_valid_amount() {
        return Err(PipelineError::InvalidTransaction(format!(
            "transaction {} has invalid amount {}",
            tx.id, tx.amount
        )));
    }
    if tx.person_id != person_id {
        return Err(PipelineError::InvalidTransaction(format!(
            "transaction {} belongs to {}, not {}",
            tx.id, tx.person_id, person_id
        )));
    }
    Ok(())
}
