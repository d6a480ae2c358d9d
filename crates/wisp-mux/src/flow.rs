//! Flow control.
//!
//! Credit governs data moving towards the proxied destination: the client
//! spends one credit per `DATA` packet and the server replenishes credit with
//! `CONTINUE` as it drains packets into the destination socket. The opposite
//! direction is throttled by pausing upstream reads while the transport's
//! outbound buffer sits above a high-water mark.

use std::collections::VecDeque;

use bytes::Bytes;

/// Sender-side credit for one stream.
#[derive(Debug)]
pub struct SendCredit {
    /// `None` for streams exempt from flow control.
    credit: Option<u32>,
    pending: VecDeque<Bytes>,
}

impl SendCredit {
    /// Credit-limited stream starting with `window` credits.
    pub fn limited(window: u32) -> Self {
        Self {
            credit: Some(window),
            pending: VecDeque::new(),
        }
    }

    /// Stream that never waits for credit (UDP).
    pub fn unlimited() -> Self {
        Self {
            credit: None,
            pending: VecDeque::new(),
        }
    }

    pub fn credit(&self) -> Option<u32> {
        self.credit
    }

    /// Number of payloads waiting for credit.
    pub fn queued(&self) -> usize {
        self.pending.len()
    }

    /// Offer a payload for sending. Returns it back if it may go out now,
    /// otherwise keeps it queued behind earlier payloads.
    pub fn submit(&mut self, data: Bytes) -> Option<Bytes> {
        match &mut self.credit {
            None => Some(data),
            Some(credit) if *credit > 0 && self.pending.is_empty() => {
                *credit -= 1;
                Some(data)
            }
            Some(_) => {
                self.pending.push_back(data);
                None
            }
        }
    }

    /// Apply a `CONTINUE` grant and return the queued payloads that may now
    /// be sent, oldest first.
    pub fn grant(&mut self, buffer_remaining: u32) -> Vec<Bytes> {
        let Some(credit) = &mut self.credit else {
            return Vec::new();
        };
        *credit = buffer_remaining;

        let mut ready = Vec::new();
        while *credit > 0 {
            let Some(data) = self.pending.pop_front() else {
                break;
            };
            *credit -= 1;
            ready.push(data);
        }
        ready
    }
}

/// Receiver-side cadence for `CONTINUE` grants on one stream.
#[derive(Debug)]
pub struct ReceiveWindow {
    window: u32,
    threshold: u32,
    delivered: u32,
}

impl ReceiveWindow {
    pub fn new(window: u32) -> Self {
        Self {
            window,
            threshold: (window / 2).max(1),
            delivered: 0,
        }
    }

    /// Record one packet delivered to the destination while `queued` more
    /// are still buffered. Returns the `buffer_remaining` to grant when a
    /// `CONTINUE` is due.
    pub fn on_delivered(&mut self, queued: usize) -> Option<u32> {
        self.delivered += 1;
        if self.delivered < self.threshold {
            return None;
        }
        self.delivered = 0;
        let queued = u32::try_from(queued).unwrap_or(u32::MAX);
        Some(self.window.saturating_sub(queued))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateTransition {
    Pause,
    Resume,
}

/// High/low water hysteresis over the transport's outbound depth.
#[derive(Debug)]
pub struct BackpressureGate {
    high: usize,
    low: usize,
    paused: bool,
}

impl BackpressureGate {
    /// Pause at `high` bytes, resume at or below half of it.
    pub fn new(high: usize) -> Self {
        Self {
            high,
            low: high / 2,
            paused: false,
        }
    }

    pub fn low_water(&self) -> usize {
        self.low
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn observe(&mut self, depth: usize) -> Option<GateTransition> {
        if !self.paused && depth > self.high {
            self.paused = true;
            Some(GateTransition::Pause)
        } else if self.paused && depth <= self.low {
            self.paused = false;
            Some(GateTransition::Resume)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n: u8) -> Bytes {
        Bytes::copy_from_slice(&[n])
    }

    #[test]
    fn queues_once_credit_runs_out() {
        let mut credit = SendCredit::limited(4);
        for n in 0..4 {
            assert_eq!(credit.submit(payload(n)), Some(payload(n)));
        }
        assert_eq!(credit.credit(), Some(0));
        assert_eq!(credit.submit(payload(4)), None);
        assert_eq!(credit.submit(payload(5)), None);
        assert_eq!(credit.queued(), 2);
    }

    #[test]
    fn grant_flushes_in_order_and_keeps_remainder() {
        let mut credit = SendCredit::limited(0);
        for n in 0..5 {
            assert!(credit.submit(payload(n)).is_none());
        }
        assert_eq!(credit.grant(3), vec![payload(0), payload(1), payload(2)]);
        assert_eq!(credit.credit(), Some(0));
        assert_eq!(credit.queued(), 2);

        // later payloads still wait behind the queue
        assert!(credit.submit(payload(5)).is_none());
        assert_eq!(credit.grant(10), vec![payload(3), payload(4), payload(5)]);
        assert_eq!(credit.credit(), Some(7));
        assert_eq!(credit.queued(), 0);
    }

    #[test]
    fn credit_never_underflows() {
        let mut credit = SendCredit::limited(2);
        let mut blocked = 0;
        for step in 0..200u32 {
            if step % 7 == 0 {
                credit.grant(step % 3);
            } else if credit.submit(payload(0)).is_none() {
                blocked += 1;
            }
            assert!(credit.queued() <= blocked);
        }
    }

    #[test]
    fn unlimited_ignores_grants() {
        let mut credit = SendCredit::unlimited();
        for n in 0..1000u32 {
            assert!(credit.submit(payload(n as u8)).is_some());
        }
        assert!(credit.grant(0).is_empty());
        assert_eq!(credit.credit(), None);
    }

    #[test]
    fn continue_every_half_window() {
        let mut window = ReceiveWindow::new(128);
        for _ in 0..63 {
            assert_eq!(window.on_delivered(0), None);
        }
        assert_eq!(window.on_delivered(5), Some(123));
        for _ in 0..63 {
            assert_eq!(window.on_delivered(0), None);
        }
        assert_eq!(window.on_delivered(0), Some(128));
    }

    #[test]
    fn tiny_window_grants_every_packet() {
        let mut window = ReceiveWindow::new(1);
        assert_eq!(window.on_delivered(0), Some(1));
        assert_eq!(window.on_delivered(3), Some(0));
    }

    #[test]
    fn gate_has_hysteresis() {
        let mut gate = BackpressureGate::new(100);
        assert_eq!(gate.observe(100), None);
        assert_eq!(gate.observe(101), Some(GateTransition::Pause));
        assert_eq!(gate.observe(75), None);
        assert!(gate.is_paused());
        assert_eq!(gate.observe(50), Some(GateTransition::Resume));
        assert_eq!(gate.observe(60), None);
        assert!(!gate.is_paused());
    }
}
