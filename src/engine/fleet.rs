//! Parallel fan-out over a fleet of hosts.
//!
//! Every host gets its own [`HostHandler`]. Hosts are brought up, stopped
//! and shut down concurrently, and a failure on one host never touches the
//! others: it only shows up in that host's [`HostReport`].

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tracing::{error, info, warn};

use super::config::EngineConfig;
use super::connection::Connector;
use super::handler::HostHandler;
use super::host::Host;
use super::notify::Notifier;
use super::registry::{CommandTokenStrategy, StopStrategy};
use super::types::HostReport;

pub struct Fleet {
    subsystem: String,
    config: EngineConfig,
    notifier: Arc<dyn Notifier>,
    connector: Arc<dyn Connector>,
    strategy: Arc<dyn StopStrategy>,
    /// Ready handlers keyed by `user@host:port`.
    handlers: DashMap<String, Arc<HostHandler>>,
}

impl Fleet {
    pub fn new(
        subsystem: impl Into<String>,
        config: EngineConfig,
        notifier: Arc<dyn Notifier>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            subsystem: subsystem.into(),
            config,
            notifier,
            connector,
            strategy: Arc::new(CommandTokenStrategy::new()),
            handlers: DashMap::new(),
        }
    }

    pub fn with_stop_strategy(mut self, strategy: Arc<dyn StopStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Bring every host up concurrently.
    ///
    /// Reports come back in the order of `hosts`. Only hosts that reached
    /// a started pipeline are kept.
    pub async fn deploy(&self, hosts: Vec<Host>) -> Vec<HostReport> {
        let reports = join_all(hosts.into_iter().map(|host| self.deploy_host(host))).await;

        let ready = reports.iter().filter(|r| r.ready).count();
        info!(
            subsystem = %self.subsystem,
            "{} of {} host(s) ready",
            ready,
            reports.len()
        );
        reports
    }

    async fn deploy_host(&self, host: Host) -> HostReport {
        let host = Arc::new(host);
        let key = host.to_string();

        let handler = match HostHandler::new(
            host,
            self.subsystem.clone(),
            self.config.clone(),
            self.notifier.clone(),
        ) {
            Ok(handler) => Arc::new(handler.with_stop_strategy(self.strategy.clone())),
            Err(e) => {
                error!(host = %key, "Unable to prepare host: {}", e);
                return HostReport::failed(key, &e);
            }
        };

        let started = async {
            handler.setup(self.connector.as_ref()).await?;
            handler.start().await
        }
        .await;

        match started {
            Ok(()) => {
                let report = HostReport::ready(&key, handler.output_file().to_path_buf());
                self.handlers.insert(key, handler);
                report
            }
            Err(e) => {
                if let Err(close_err) = handler.close().await {
                    warn!(host = %key, "Failed to close after setup error: {}", close_err);
                }
                HostReport::failed(key, &e)
            }
        }
    }

    /// Handler by `user@host:port`, or by bare hostname when unambiguous.
    ///
    /// A host that hit a fatal error is no longer handed out.
    pub fn handler(&self, name: &str) -> Option<Arc<HostHandler>> {
        let handler = self.lookup(name)?;
        if let Some(fault) = handler.fault() {
            warn!(host = %handler.host(), "Host is out of service: {}", fault);
            return None;
        }
        Some(handler)
    }

    fn lookup(&self, name: &str) -> Option<Arc<HostHandler>> {
        if let Some(handler) = self.handlers.get(name) {
            return Some(handler.value().clone());
        }

        let mut matches = self
            .handlers
            .iter()
            .filter(|entry| entry.value().host().hostname == name)
            .map(|entry| entry.value().clone());
        let first = matches.next()?;
        match matches.next() {
            Some(_) => {
                warn!("Hostname '{}' matches several hosts, use user@host:port", name);
                None
            }
            None => Some(first),
        }
    }

    pub fn handlers(&self) -> Vec<Arc<HostHandler>> {
        self.handlers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Stop tracked executions on every host still in service; returns the
    /// total stopped, including components stopped before a failure.
    pub async fn stop_executions(&self) -> usize {
        let handlers: Vec<_> = self
            .handlers()
            .into_iter()
            .filter(|h| h.fault().is_none())
            .collect();
        let results = join_all(handlers.iter().map(|h| h.stop_executions())).await;

        handlers
            .iter()
            .zip(results)
            .map(|(handler, result)| match result {
                Ok(count) => count,
                Err(e) => {
                    error!(host = %handler.host(), "Stopping executions failed: {}", e);
                    e.stopped_before_failure().unwrap_or(0)
                }
            })
            .sum()
    }

    /// Drain every queue, then close every session.
    pub async fn shutdown(&self) {
        let handlers = self.handlers();
        join_all(handlers.iter().map(|handler| async move {
            handler.shutdown_task_queue().await;
            if let Err(e) = handler.close().await {
                warn!(host = %handler.host(), "Close failed: {}", e);
            }
        }))
        .await;
        info!(subsystem = %self.subsystem, "Fleet shut down");
    }
}
