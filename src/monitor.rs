use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::account::AccountId;

/// Cumulative transferred bytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub download: u64,
    pub upload: u64,
}

/// Bytes per second over the last sampling window.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Rates {
    pub download: u64,
    pub upload: u64,
}

#[derive(Default)]
struct CounterState {
    total: Transfer,
    sampled: Transfer,
    rates: Rates,
}

/// One pair of thread-safe byte counters with an optional rate window.
/// The relay keeps one per account; the client keeps a single one for
/// its own link.
#[derive(Default)]
pub struct TransferCounter {
    state: Mutex<CounterState>,
}

impl TransferCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_download(&self, bytes: usize) {
        self.state.lock().total.download += bytes as u64;
    }

    pub fn record_upload(&self, bytes: usize) {
        self.state.lock().total.upload += bytes as u64;
    }

    pub fn totals(&self) -> Transfer {
        self.state.lock().total
    }

    pub fn rates(&self) -> Rates {
        self.state.lock().rates
    }

    /// Closes the current window: the rate becomes the delta since the
    /// previous sample.
    fn sample(&self) {
        let mut state = self.state.lock();
        state.rates = Rates {
            download: state.total.download - state.sampled.download,
            upload: state.total.upload - state.sampled.upload,
        };
        state.sampled = state.total;
    }
}

/// Per-account transfer accounting, updated by the relay on every
/// forwarded datagram and read by reporting commands.
#[derive(Default)]
pub struct TransferMonitor {
    accounts: Mutex<HashMap<AccountId, Arc<TransferCounter>>>,
}

impl TransferMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, account: AccountId) -> Arc<TransferCounter> {
        Arc::clone(
            self.accounts
                .lock()
                .entry(account)
                .or_insert_with(|| Arc::new(TransferCounter::new())),
        )
    }

    pub fn record_download(&self, account: AccountId, bytes: usize) {
        self.counter(account).record_download(bytes);
    }

    pub fn record_upload(&self, account: AccountId, bytes: usize) {
        self.counter(account).record_upload(bytes);
    }

    pub fn totals(&self, account: AccountId) -> Transfer {
        self.counter(account).totals()
    }

    pub fn rates(&self, account: AccountId) -> Rates {
        self.counter(account).rates()
    }

    pub fn all_totals(&self) -> Vec<(AccountId, Transfer)> {
        let mut totals: Vec<_> = self
            .accounts
            .lock()
            .iter()
            .map(|(id, counter)| (*id, counter.totals()))
            .collect();
        totals.sort_by_key(|(id, _)| *id);
        totals
    }

    fn sample_all(&self) {
        for counter in self.accounts.lock().values() {
            counter.sample();
        }
    }

    /// Spawns the periodic rate sampler. One second is the canonical
    /// window; the task runs until the token is cancelled.
    pub fn spawn_sampler(
        self: &Arc<Self>,
        period: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => monitor.sample_all(),
                }
            }
        })
    }
}
