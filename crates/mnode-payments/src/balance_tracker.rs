//! Provider Balance Tracker
//!
//! `balance = total promised - cost of the time consumed so far`, never
//! below zero.

use std::time::{Duration, Instant};

/// Measures how long the session has been billed for
pub trait TimeKeeper: Send {
    fn start_tracking(&mut self);
    fn elapsed(&self) -> Duration;
}

/// Cost of the service for a given elapsed time
pub trait AmountCalculator: Send + Sync {
    fn total_amount(&self, elapsed: Duration) -> u64;
}

/// What the provider payment loop needs from a balance tracker
pub trait BalanceTracker: Send {
    /// Begin charging
    fn start(&mut self);
    /// Promised but not yet consumed amount
    fn balance(&self) -> u64;
    /// Credit a newly promised amount
    fn add(&mut self, amount: u64);
}

/// Monotonic clock [`TimeKeeper`]; reports zero until started
#[derive(Debug, Default)]
pub struct ElapsedTimeKeeper {
    started: Option<Instant>,
}

impl ElapsedTimeKeeper {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeKeeper for ElapsedTimeKeeper {
    fn start_tracking(&mut self) {
        self.started = Some(Instant::now());
    }

    fn elapsed(&self) -> Duration {
        self.started.map_or(Duration::ZERO, |started| started.elapsed())
    }
}

/// `price` per `per` of service, prorated and rounded down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerTimeAmountCalculator {
    pub price: u64,
    pub per: Duration,
}

impl PerTimeAmountCalculator {
    pub fn new(price: u64, per: Duration) -> Self {
        Self { price, per }
    }
}

impl AmountCalculator for PerTimeAmountCalculator {
    fn total_amount(&self, elapsed: Duration) -> u64 {
        let per = self.per.as_nanos();
        if per == 0 {
            return 0;
        }
        let total = elapsed.as_nanos().saturating_mul(u128::from(self.price)) / per;
        u64::try_from(total).unwrap_or(u64::MAX)
    }
}

/// Default [`BalanceTracker`] built from a clock and a price
pub struct ProviderBalanceTracker {
    time_keeper: Box<dyn TimeKeeper>,
    calculator: Box<dyn AmountCalculator>,
    total_promised: u64,
}

impl ProviderBalanceTracker {
    pub fn new(
        time_keeper: Box<dyn TimeKeeper>,
        calculator: Box<dyn AmountCalculator>,
        initial: u64,
    ) -> Self {
        Self {
            time_keeper,
            calculator,
            total_promised: initial,
        }
    }

    /// Tracker charging `calculator` against the wall clock
    pub fn with_calculator(calculator: impl AmountCalculator + 'static) -> Self {
        Self::new(Box::new(ElapsedTimeKeeper::new()), Box::new(calculator), 0)
    }

    /// Everything promised so far
    pub fn total_promised(&self) -> u64 {
        self.total_promised
    }
}

impl BalanceTracker for ProviderBalanceTracker {
    fn start(&mut self) {
        self.time_keeper.start_tracking();
    }

    fn balance(&self) -> u64 {
        let cost = self.calculator.total_amount(self.time_keeper.elapsed());
        self.total_promised.saturating_sub(cost)
    }

    fn add(&mut self, amount: u64) {
        self.total_promised = self.total_promised.saturating_add(amount);
    }
}
