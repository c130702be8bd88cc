//! Stage processors: one consumer thread per pipeline stage.
//!
//! A processor drains one or more input rings (fan-in) into an
//! [`EventHandler`]. Each cycle it visits every ring, hands over every event
//! between its cursor and the ring's visible point, and releases the slots.
//! When nothing was found it parks for `park` (blocking on the ring when
//! there is only one); small batches yield the thread; large ones loop again
//! straight away.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::error::RingError;
use crate::event::Event;
use crate::ring::{Ring, Sequence};

pub trait EventHandler: Send {
    fn on_start(&mut self) {}

    /// Called once per event. `end_of_batch` marks the last event taken
    /// from a ring in this cycle, so handlers can defer flush-type work.
    fn on_event(&mut self, event: Event, sequence: Sequence, end_of_batch: bool);

    /// Called after a cycle that found no events.
    fn on_idle(&mut self) {}

    fn on_shutdown(&mut self) {}
}

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub yield_threshold: usize,
    pub park: Duration,
}

struct Cursor {
    ring: Arc<Ring<Event>>,
    next: Sequence,
    lagging_since: Option<Instant>,
}

pub struct StageProcessor<H> {
    name: String,
    cursors: Vec<Cursor>,
    handler: H,
    backoff: Backoff,
}

impl<H: EventHandler + 'static> StageProcessor<H> {
    pub fn new(
        name: impl Into<String>,
        inputs: Vec<Arc<Ring<Event>>>,
        handler: H,
        backoff: Backoff,
    ) -> Self {
        let cursors = inputs
            .into_iter()
            .map(|ring| Cursor {
                next: ring.released() + 1,
                ring,
                lagging_since: None,
            })
            .collect();
        Self {
            name: name.into(),
            cursors,
            handler,
            backoff,
        }
    }

    /// Runs the processor on a named thread.
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        let name = self.name.clone();
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || self.run())
            .with_context(|| format!("failed to spawn stage {name}"))
    }

    /// Consumes events until any input ring is halted.
    pub fn run(mut self) {
        debug!(stage = %self.name, inputs = self.cursors.len(), "stage started");
        self.handler.on_start();
        loop {
            if self.cursors.iter().any(|cursor| cursor.ring.is_halted()) {
                break;
            }
            let found = self.drain_once();
            if found == 0 {
                if !self.park() {
                    break;
                }
                self.handler.on_idle();
            } else if found < self.backoff.yield_threshold {
                thread::yield_now();
            }
        }
        self.handler.on_shutdown();
        debug!(stage = %self.name, "stage stopped");
    }

    fn drain_once(&mut self) -> usize {
        let mut found = 0;
        for cursor in &mut self.cursors {
            let available = cursor.ring.available(cursor.next);
            if available < cursor.next {
                continue;
            }
            for sequence in cursor.next..=available {
                let event = cursor.ring.take(sequence);
                self.handler.on_event(event, sequence, sequence == available);
            }
            found += (available - cursor.next + 1) as usize;
            cursor.ring.release(available);
            cursor.next = available + 1;
            cursor.lagging_since = None;
        }
        found
    }

    /// Waits for more input. Returns `false` once the stage must stop.
    fn park(&mut self) -> bool {
        let park = self.backoff.park;
        if let [cursor] = self.cursors.as_mut_slice() {
            match cursor.ring.wait_for(cursor.next, park) {
                Err(RingError::Halted) => return false,
                Ok(_) | Err(RingError::Full) => {}
            }
        } else {
            thread::sleep(park);
        }

        for cursor in &mut self.cursors {
            let claimed = cursor.ring.claimed();
            if claimed < cursor.next || cursor.ring.available(cursor.next) >= cursor.next {
                cursor.lagging_since = None;
                continue;
            }
            // Claimed but not yet published.
            match cursor.lagging_since {
                None => cursor.lagging_since = Some(Instant::now()),
                Some(since) if since.elapsed() >= park => {
                    warn!(
                        stage = %self.name,
                        ring = cursor.ring.name(),
                        expected = claimed,
                        available = cursor.next - 1,
                        "ring deficit"
                    );
                    cursor.lagging_since = Some(Instant::now());
                }
                Some(_) => {}
            }
        }
        true
    }
}
