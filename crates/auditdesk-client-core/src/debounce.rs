use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Generation-counting debouncer. Every call to [`Debouncer::settle`]
/// supersedes the previous ones; only a caller whose generation is still the
/// newest after the quiet period gets a ticket.
#[derive(Debug)]
pub struct Debouncer {
    generation: AtomicU64,
    delay: Duration,
}

/// Proof that a caller won the debounce. Check [`Ticket::is_current`] again
/// after any await to drop responses that a newer call has overtaken.
#[derive(Debug)]
pub struct Ticket<'a> {
    debouncer: &'a Debouncer,
    generation: u64,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            generation: AtomicU64::new(0),
            delay,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Takes a ticket immediately, superseding pending callers without
    /// waiting out the delay.
    pub fn bump(&self) -> Ticket<'_> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Ticket {
            debouncer: self,
            generation,
        }
    }

    pub async fn settle(&self) -> Option<Ticket<'_>> {
        let ticket = self.bump();
        tokio::time::sleep(self.delay).await;
        ticket.is_current().then_some(ticket)
    }
}

impl Ticket<'_> {
    pub fn is_current(&self) -> bool {
        self.debouncer.generation.load(Ordering::SeqCst) == self.generation
    }
}
