//! Wiring of the full stack: Fair-Loss → Stubborn → Perfect (→ detector).

use crate::config::LinkConfig;
use crate::detector::PerfectFailureDetector;
use crate::error::{LinkError, Result};
use crate::fair_loss::FairLossLink;
use crate::perfect::PerfectLink;
use crate::stubborn::StubbornLink;
use crate::tasks::TaskGroup;
use crate::{AddressTable, ProcessId};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// A process's complete link stack and the workers behind it.
pub struct LinkStack {
    config: LinkConfig,
    tasks: TaskGroup,
    fair_loss: FairLossLink,
    stubborn: StubbornLink,
    perfect: PerfectLink,
    detector: Option<PerfectFailureDetector>,
}

impl LinkStack {
    /// Bind `config.listen` and start every link layer.
    pub async fn bind(pid: ProcessId, addresses: AddressTable, config: LinkConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|source| LinkError::Bind {
                addr: config.listen,
                source,
            })?;
        Self::start(pid, addresses, listener, config)
    }

    /// Start every link layer on an already-bound listener.
    pub fn start(
        pid: ProcessId,
        addresses: AddressTable,
        listener: TcpListener,
        config: LinkConfig,
    ) -> Result<Self> {
        let tasks = TaskGroup::new();
        let fair_loss =
            FairLossLink::start(pid, addresses, listener, config.fair_loss.clone(), &tasks)?;
        let stubborn = StubbornLink::new(fair_loss.clone(), config.stubborn.clone(), &tasks)?;
        let perfect = PerfectLink::new(stubborn.clone(), config.perfect.clone(), &tasks)?;

        Ok(Self {
            config,
            tasks,
            fair_loss,
            stubborn,
            perfect,
            detector: None,
        })
    }

    /// Start the failure detector over every process in the address table.
    /// Starting it a second time returns the running detector.
    pub fn start_detector(&mut self) -> Result<PerfectFailureDetector> {
        if let Some(detector) = &self.detector {
            return Ok(detector.clone());
        }

        // A heartbeat round trip is two connects
        let period = self.config.detector.period();
        let connect_timeout = self.config.fair_loss.connect_timeout();
        if connect_timeout * 2 >= period {
            warn!(
                "Detector period {:?} leaves no margin over two connect timeouts of {:?}",
                period, connect_timeout
            );
        }

        let peers: Vec<ProcessId> = self.fair_loss.addresses().ids().cloned().collect();
        let detector = PerfectFailureDetector::start(
            &self.perfect,
            peers,
            self.config.detector.clone(),
            &self.tasks,
        )?;
        info!(
            "Failure detector for {} started, period {:?}",
            self.pid(),
            self.config.detector.period()
        );
        self.detector = Some(detector.clone());
        Ok(detector)
    }

    pub fn pid(&self) -> &ProcessId {
        self.fair_loss.pid()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.fair_loss.local_addr()
    }

    pub fn fair_loss(&self) -> &FairLossLink {
        &self.fair_loss
    }

    pub fn stubborn(&self) -> &StubbornLink {
        &self.stubborn
    }

    pub fn perfect(&self) -> &PerfectLink {
        &self.perfect
    }

    pub fn detector(&self) -> Option<&PerfectFailureDetector> {
        self.detector.as_ref()
    }

    pub fn tasks(&self) -> &TaskGroup {
        &self.tasks
    }

    /// Stop every worker of the stack and wait for them.
    pub async fn shutdown(self) {
        info!("Shutting down link stack for {}", self.pid());
        self.tasks.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let pid: ProcessId = "0".parse().unwrap();
        let addresses = AddressTable::new().insert(pid.clone(), addr);

        let mut stack = LinkStack::start(pid, addresses, listener, LinkConfig::default()).unwrap();
        assert_eq!(stack.local_addr(), addr);
        assert!(stack.detector().is_none());

        stack.start_detector().unwrap();
        // Second call hands back the same detector instead of resubscribing
        assert!(stack.start_detector().is_ok());
        assert!(stack.detector().is_some());

        let tasks = stack.tasks().clone();
        stack.shutdown().await;
        assert!(tasks.is_cancelled());
    }
}
