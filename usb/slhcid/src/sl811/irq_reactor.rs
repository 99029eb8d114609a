//! Polling mode, for boards where the chip's interrupt line is not wired up.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::debug;

use super::{ChipPort, HostController};

pub struct IrqReactor<P: ChipPort> {
    hc: Arc<HostController<P>>,
    interval: Duration,
}

impl<P: ChipPort> IrqReactor<P> {
    pub fn new(hc: Arc<HostController<P>>) -> Self {
        let interval = hc.config.poll_interval();
        Self { hc, interval }
    }

    fn pause(&self) {
        thread::sleep(self.interval);
    }

    pub fn run(self) {
        debug!("running IRQ reactor in polling mode, every {:?}", self.interval);
        while !self.hc.is_shutting_down() {
            self.pause();
            self.hc.poll_now();
        }
        debug!("IRQ reactor stopped");
    }
}
