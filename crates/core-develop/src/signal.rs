//! Lifecycle signals.
//!
//! A small enum over a channel instead of a GUI signal registry: the
//! consumer (UI shell, headless driver, tests) drains one receiver. Sends
//! never block and are dropped silently once the consumer goes away.

use crossbeam_channel::{Receiver, Sender, unbounded};

use core_pipeline::PipeKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevelopSignal {
    /// The history stack changed (append, pop, reload); widgets re-read
    /// module parameters.
    HistoryChange,
    /// A pipeline finished a run and published a back-buffer.
    PipeFinished(PipeKind),
    /// Image-level metadata changed (flags, change timestamp).
    ImageChanged,
    /// User-visible notice (autosave disabled, load problems).
    Toast(String),
}

pub struct SignalBus {
    tx: Sender<DevelopSignal>,
    rx: Receiver<DevelopSignal>,
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalBus {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn emit(&self, signal: DevelopSignal) {
        let _ = self.tx.send(signal);
    }

    /// The consuming end. One consumer; clone the receiver only for tests.
    pub fn receiver(&self) -> Receiver<DevelopSignal> {
        self.rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitted_signals_arrive_in_order() {
        let bus = SignalBus::new();
        bus.emit(DevelopSignal::HistoryChange);
        bus.emit(DevelopSignal::PipeFinished(PipeKind::Preview));
        let rx = bus.receiver();
        assert_eq!(rx.try_recv().unwrap(), DevelopSignal::HistoryChange);
        assert_eq!(
            rx.try_recv().unwrap(),
            DevelopSignal::PipeFinished(PipeKind::Preview)
        );
        assert!(rx.try_recv().is_err());
    }
}
