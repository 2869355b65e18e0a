//! # Session border controller core
//!
//! `sbc-core` sits on top of the transaction layer and turns it into a
//! back-to-back user agent: every request terminated on one leg is
//! re-originated on the other after the method's behavior has routed and
//! rewritten it.
//!
//! ```text
//!   TransportEvent ──▶ TransactionDispatcher ──▶ B2bTransactionManager
//!                                                     │ handler per method
//!                                                     ▼
//!                       behavior::{invite, bye, cancel, prack, subscribe, ...}
//!                         │            │                 │
//!                DialogStateManager  SubscriptionCache  ReliableResponseEngine
//! ```
//!
//! [`SbcManager`] assembles the pieces from an [`SbcConfig`]:
//!
//! ```ignore
//! let config = SbcConfig::from_file("sbc.toml")?;
//! let transports = Arc::new(TransportTable::new());
//! transports.add(my_udp_transport)?;
//!
//! let sbc = SbcManager::builder(config).transports(transports).build()?;
//! sbc.start().await?;
//! sbc.attach(transport_events);
//! ```

pub mod b2bua;
pub mod behavior;
pub mod cdr;
pub mod config;
pub mod contact;
pub mod context;
pub mod dialog_state;
pub mod disconnect;
pub mod error;
pub mod limits;
pub mod logging;
pub mod registrar;
pub mod reliable;
pub mod routing;
pub mod store;
pub mod subscription;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sbc_sip_core::{TransportEvent, TransportTable};
use sbc_transaction_core::{TransactionDispatcher, TransactionUser};

pub use b2bua::{B2bTransactionManager, Handler, ManagerConfig, ManagerStats, MessageType, RouteOutcome};
pub use behavior::{Authenticator, Services};
pub use config::SbcConfig;
pub use disconnect::{CallTimers, DisconnectPolicy};
pub use error::{Result, SbcError};
pub use routing::{Resolver, RoutePolicy};
pub use store::{KeyValueStore, MemoryStore};

/// How often aged-out subscriptions and transaction blocks are swept
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

type Task = (oneshot::Sender<()>, JoinHandle<()>);

/// Builder for [`SbcManager`]
pub struct SbcManagerBuilder {
    config: SbcConfig,
    transports: Option<Arc<TransportTable>>,
    store: Option<Arc<dyn KeyValueStore>>,
    route_policy: Option<Arc<dyn RoutePolicy>>,
    resolver: Option<Arc<dyn Resolver>>,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl SbcManagerBuilder {
    pub fn transports(mut self, transports: Arc<TransportTable>) -> Self {
        self.transports = Some(transports);
        self
    }

    /// Store for dialog records; an in-memory store when unset
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replaces the static routes of the configuration
    pub fn route_policy(mut self, policy: Arc<dyn RoutePolicy>) -> Self {
        self.route_policy = Some(policy);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn build(self) -> Result<Arc<SbcManager>> {
        self.config.validate()?;
        let transports = self.transports.unwrap_or_else(|| Arc::new(TransportTable::new()));
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));

        let dispatcher = TransactionDispatcher::new(transports.clone(), self.config.timer_settings());
        let call_timers = Arc::new(CallTimers::new());
        let manager = B2bTransactionManager::new(
            dispatcher.clone(),
            ManagerConfig {
                pool_size: self.config.workers.pool_size,
                use_source_address: self.config.use_source_address_for_responses,
                disconnect: self.config.disconnect.as_ref().map(DisconnectPolicy::from),
            },
            call_timers.clone(),
        );
        let user: Arc<dyn TransactionUser> = manager.clone();
        dispatcher.set_transaction_user(Arc::downgrade(&user));

        let mut services = Services::new(self.config.clone(), dispatcher.clone(), store, call_timers);
        if let Some(policy) = self.route_policy {
            services = services.with_route_policy(policy);
        }
        if let Some(resolver) = self.resolver {
            services = services.with_resolver(resolver);
        }
        if let Some(authenticator) = self.authenticator {
            services = services.with_authenticator(authenticator);
        }
        let services = Arc::new(services);
        behavior::register_all(&manager, &services);

        let restored = services.dialogs.load()?;
        if restored > 0 {
            info!(restored, "Restored dialogs from the store");
        }

        Ok(Arc::new(SbcManager {
            config: self.config,
            transports,
            dispatcher,
            manager,
            services,
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }))
    }
}

/// A complete SBC: transaction layer, B2B manager and behaviors
pub struct SbcManager {
    config: SbcConfig,
    transports: Arc<TransportTable>,
    dispatcher: Arc<TransactionDispatcher>,
    manager: Arc<B2bTransactionManager>,
    services: Arc<Services>,
    running: AtomicBool,
    tasks: Mutex<Vec<Task>>,
}

impl SbcManager {
    pub fn builder(config: SbcConfig) -> SbcManagerBuilder {
        SbcManagerBuilder {
            config,
            transports: None,
            store: None,
            route_policy: None,
            resolver: None,
            authenticator: None,
        }
    }

    pub fn config(&self) -> &SbcConfig {
        &self.config
    }

    pub fn transports(&self) -> &Arc<TransportTable> {
        &self.transports
    }

    pub fn dispatcher(&self) -> &Arc<TransactionDispatcher> {
        &self.dispatcher
    }

    pub fn manager(&self) -> &Arc<B2bTransactionManager> {
        &self.manager
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn stats(&self) -> ManagerStats {
        self.manager.stats()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Starts the reliable response engine and the sweeper for expired
    /// subscriptions, registrations, stale call records and transaction blocks
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SbcError::AlreadyRunning);
        }
        self.services.reliable.start();

        let subscriptions = self.services.subscriptions.clone();
        let registrar = self.services.registrar.clone();
        let cdr = self.services.cdr.clone();
        let pool = self.dispatcher.pool().clone();
        self.spawn_task(|mut stop| async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = interval.tick() => {
                        let purged = subscriptions.purge_expired();
                        if purged > 0 {
                            debug!(purged, "Swept expired subscriptions");
                        }
                        let purged = registrar.purge_expired();
                        if purged > 0 {
                            debug!(purged, "Swept expired registrations");
                        }
                        let purged = cdr.purge_stale();
                        if purged > 0 {
                            debug!(purged, "Flushed stale call records");
                        }
                        pool.purge_blocked();
                    }
                }
            }
        });

        info!(
            version = env!("CARGO_PKG_VERSION"),
            interfaces = self.transports.len(),
            workers = self.config.workers.pool_size,
            "SBC started"
        );
        Ok(())
    }

    /// Feeds a transport's event stream into the dispatcher until the
    /// stream ends or the SBC stops
    pub fn attach(&self, mut events: mpsc::Receiver<TransportEvent>) {
        let dispatcher = self.dispatcher.clone();
        self.spawn_task(|mut stop| async move {
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    event = events.recv() => match event {
                        Some(event) => dispatcher.handle_transport_event(event).await,
                        None => break,
                    },
                }
            }
        });
    }

    /// Processes a single transport event
    pub async fn handle_transport_event(&self, event: TransportEvent) -> Result<()> {
        if !self.is_running() {
            return Err(SbcError::NotRunning);
        }
        self.dispatcher.handle_transport_event(event).await;
        Ok(())
    }

    /// Stops every background task and waits for it; nothing is sent after
    /// this returns
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SbcError::NotRunning);
        }
        let tasks: Vec<Task> = std::mem::take(&mut *self.tasks.lock());
        for (stop, handle) in tasks {
            let _ = stop.send(());
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task failed");
            }
        }
        self.services.reliable.stop().await;
        self.dispatcher.stop().await;
        self.transports.close_all().await;
        info!("SBC stopped");
        Ok(())
    }

    fn spawn_task<F, Fut>(&self, task: F)
    where
        F: FnOnce(oneshot::Receiver<()>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(task(stop_rx));
        self.tasks.lock().push((stop_tx, handle));
    }
}
