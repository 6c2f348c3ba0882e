//! Process wiring shared by the binaries.
//!
//! A process runs one or more service [`Roles`]. For each role it builds the
//! domain objects on the configured backends, an [`EventConsumer`] for the
//! role's topics, its deadline sweeps and its HTTP routes. [`Application::run`]
//! serves HTTP until a shutdown signal, then stops consumers and sweeps.

use crate::api::{self, DeadLetterProbe, HealthProbe, PostgresProbe};
use crate::config::{BusBackend, Config, StorageBackend};
use crate::events::topics;
use crate::field::{self, HoldExpirySweep, SlotCommandHandler};
use crate::ledger::{HttpSlotStatusView, InMemorySlotLedger, PostgresSlotLedger, SlotLedger, SlotStatusView};
use crate::payment::{
    self, CallbackStatus, CallbackVerifier, GatewayCallback, HttpPaymentGateway, InMemoryPaymentIntentRepository,
    MockPaymentGateway, PaymentGateway, PaymentIntentRepository, PaymentRequestHandler,
    PostgresPaymentIntentRepository, SettlementAdapter, SettlementExpirySweep,
};
use crate::publisher::Publisher;
use crate::reservation::{
    self, InMemoryReservationRepository, OrderEventHandler, PaymentTimeoutSweep, PostgresReservationRepository,
    ReconciliationSweep, ReservationEnvironment, ReservationRepository, ReservationService,
};
use crate::types::Money;
use anyhow::Context;
use axum::Router;
use fieldbook_core::environment::{Clock, SystemClock};
use fieldbook_core::event_bus::EventBus;
use fieldbook_core::inbox::Inbox;
use fieldbook_postgres::{DeadLetterQueue, PoolSettings, PostgresInbox};
use fieldbook_redpanda::RedpandaEventBus;
use fieldbook_runtime::metrics::MetricsServer;
use fieldbook_runtime::{DeadLetterSink, EventConsumer, EventHandler, InMemoryDeadLetterQueue, InMemoryInbox, Sweep, Sweeper};
use fieldbook_testing::InMemoryEventBus;
use sqlx::PgPool;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Services a process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roles {
    /// Slot ledger and slot commands
    pub field: bool,
    /// Reservations
    pub order: bool,
    /// Payment intents and gateway callbacks
    pub payment: bool,
}

impl Roles {
    /// Field service only.
    pub const FIELD: Self = Self {
        field: true,
        order: false,
        payment: false,
    };
    /// Order service only.
    pub const ORDER: Self = Self {
        field: false,
        order: true,
        payment: false,
    };
    /// Payment service only.
    pub const PAYMENT: Self = Self {
        field: false,
        order: false,
        payment: true,
    };
    /// All three services in one process.
    pub const ALL: Self = Self {
        field: true,
        order: true,
        payment: true,
    };

    const fn is_all(self) -> bool {
        self.field && self.order && self.payment
    }
}

/// Install the tracing subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "booking=info,fieldbook_runtime=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Resolve on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal"),
        () = terminate => info!("Received SIGTERM signal"),
    }
}

/// Storage handles for one process.
enum Storage {
    Memory {
        ledger: InMemorySlotLedger,
        reservations: InMemoryReservationRepository,
        intents: InMemoryPaymentIntentRepository,
    },
    Postgres(PgPool),
}

impl Storage {
    async fn connect(config: &Config) -> anyhow::Result<Self> {
        match config.backend.storage {
            StorageBackend::Memory => Ok(Self::Memory {
                ledger: InMemorySlotLedger::new(),
                reservations: InMemoryReservationRepository::new(),
                intents: InMemoryPaymentIntentRepository::new(),
            }),
            StorageBackend::Postgres => {
                let settings = PoolSettings {
                    max_connections: config.postgres.max_connections,
                    min_connections: config.postgres.min_connections,
                    acquire_timeout: Duration::from_secs(config.postgres.connect_timeout_secs),
                    connect_attempts: config.postgres.connect_attempts,
                };
                let pool = fieldbook_postgres::connect(&config.postgres.url, &settings)
                    .await
                    .context("connecting to Postgres")?;
                fieldbook_postgres::migrate(&pool)
                    .await
                    .context("migrating consumer tables")?;
                crate::migrate(&pool).await.context("migrating booking tables")?;
                Ok(Self::Postgres(pool))
            }
        }
    }

    fn ledger(&self) -> Arc<dyn SlotLedger> {
        match self {
            Self::Memory { ledger, .. } => Arc::new(ledger.clone()),
            Self::Postgres(pool) => Arc::new(PostgresSlotLedger::new(pool.clone())),
        }
    }

    fn slot_view(&self) -> Arc<dyn SlotStatusView> {
        match self {
            Self::Memory { ledger, .. } => Arc::new(ledger.clone()),
            Self::Postgres(pool) => Arc::new(PostgresSlotLedger::new(pool.clone())),
        }
    }

    fn reservations(&self) -> Arc<dyn ReservationRepository> {
        match self {
            Self::Memory { reservations, .. } => Arc::new(reservations.clone()),
            Self::Postgres(pool) => Arc::new(PostgresReservationRepository::new(pool.clone())),
        }
    }

    fn intents(&self) -> Arc<dyn PaymentIntentRepository> {
        match self {
            Self::Memory { intents, .. } => Arc::new(intents.clone()),
            Self::Postgres(pool) => Arc::new(PostgresPaymentIntentRepository::new(pool.clone())),
        }
    }

    fn inbox(&self) -> Arc<dyn Inbox> {
        match self {
            Self::Memory { .. } => Arc::new(InMemoryInbox::new()),
            Self::Postgres(pool) => Arc::new(PostgresInbox::new(pool.clone())),
        }
    }

    fn dead_letters(&self, capacity: usize) -> (Arc<dyn DeadLetterSink>, DeadLetterProbe) {
        match self {
            Self::Memory { .. } => {
                let queue = InMemoryDeadLetterQueue::new(capacity);
                (Arc::new(queue.clone()), DeadLetterProbe::Memory(queue))
            }
            Self::Postgres(pool) => (
                Arc::new(DeadLetterQueue::new(pool.clone())),
                DeadLetterProbe::Postgres(DeadLetterQueue::new(pool.clone())),
            ),
        }
    }

    fn probe(&self) -> Option<Arc<dyn HealthProbe>> {
        match self {
            Self::Memory { .. } => None,
            Self::Postgres(pool) => Some(Arc::new(PostgresProbe::new(pool.clone()))),
        }
    }
}

/// Event buses for one process.
///
/// On Redpanda every service gets its own client so each subscribes in its
/// own consumer group. The in-memory bus is shared by the whole process.
enum Buses {
    Memory(InMemoryEventBus),
    Redpanda,
}

impl Buses {
    fn for_service(&self, config: &Config, service: &str) -> anyhow::Result<Arc<dyn EventBus>> {
        match self {
            Self::Memory(bus) => Ok(Arc::new(bus.clone())),
            Self::Redpanda => {
                let bus = RedpandaEventBus::builder()
                    .brokers(config.redpanda.brokers.clone())
                    .consumer_group(config.redpanda.consumer_group(service))
                    .producer_acks(config.redpanda.producer_acks.clone())
                    .compression(config.redpanda.compression.clone())
                    .build()
                    .with_context(|| format!("connecting {service} to Redpanda"))?;
                Ok(Arc::new(bus))
            }
        }
    }
}

/// A wired process, ready to serve.
pub struct Application {
    config: Config,
    router: Router,
    consumers: Vec<EventConsumer>,
    sweeper: Sweeper,
    background: Vec<JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Pieces each role adds to the process.
struct Assembly<'a> {
    config: &'a Config,
    storage: &'a Storage,
    buses: &'a Buses,
    clock: Arc<dyn Clock>,
    shutdown_tx: &'a broadcast::Sender<()>,
    routes: Router,
    probes: Vec<Arc<dyn HealthProbe>>,
    consumers: Vec<EventConsumer>,
    sweeps: Vec<Arc<dyn Sweep>>,
    background: Vec<JoinHandle<()>>,
}

impl Assembly<'_> {
    fn publisher(&self, bus: &Arc<dyn EventBus>) -> Publisher {
        Publisher::new(Arc::clone(bus), self.config.consumer.retry_policy())
    }

    fn consumer(
        &mut self,
        name: &str,
        topics: &[&str],
        bus: Arc<dyn EventBus>,
        handler: Arc<dyn EventHandler>,
    ) -> anyhow::Result<()> {
        let (dead_letters, probe) = self.storage.dead_letters(self.config.consumer.dead_letter_capacity);
        let consumer = EventConsumer::builder()
            .name(name)
            .topics(topics.iter().map(ToString::to_string).collect())
            .event_bus(bus)
            .handler(handler)
            .inbox(self.storage.inbox())
            .dead_letters(dead_letters)
            .retry(self.config.consumer.retry_policy())
            .clock(Arc::clone(&self.clock))
            .workers(self.config.consumer.workers)
            .queue_depth(self.config.consumer.queue_depth)
            .shutdown(self.shutdown_tx.subscribe())
            .build()
            .with_context(|| format!("building the {name} consumer"))?;
        self.consumers.push(consumer);
        self.probes.push(Arc::new(probe));
        Ok(())
    }

    fn field(&mut self) -> anyhow::Result<()> {
        let bus = self.buses.for_service(self.config, field::CONSUMER)?;
        let ledger = self.storage.ledger();
        let publisher = self.publisher(&bus);

        let handler = SlotCommandHandler::new(Arc::clone(&ledger), publisher.clone(), Arc::clone(&self.clock));
        self.consumer(field::CONSUMER, &[topics::SLOT_COMMANDS], bus, Arc::new(handler))?;
        self.sweeps.push(Arc::new(HoldExpirySweep::new(
            Arc::clone(&ledger),
            publisher,
            self.config.booking.sweep_batch_size,
        )));
        self.merge(api::slots::routes(ledger, Arc::clone(&self.clock)));
        Ok(())
    }

    fn order(&mut self, local_ledger: bool) -> anyhow::Result<()> {
        let config = self.config;
        let bus = self.buses.for_service(config, reservation::CONSUMER)?;
        let booking = &config.booking;
        let service = ReservationService::new(
            self.storage.reservations(),
            self.publisher(&bus),
            ReservationEnvironment {
                clock: Arc::clone(&self.clock),
                hold_ttl: booking.hold_ttl(),
                payment_timeout: booking.payment_timeout(),
            },
            Money::new(booking.slot_price_cents, booking.currency.clone()),
        );
        let slots: Arc<dyn SlotStatusView> = if local_ledger {
            self.storage.slot_view()
        } else {
            Arc::new(
                HttpSlotStatusView::new(booking.field_service_url.clone(), Duration::from_secs(5))
                    .context("building the field service client")?,
            )
        };

        self.sweeps.push(Arc::new(PaymentTimeoutSweep::new(service.clone(), booking.sweep_batch_size)));
        self.sweeps.push(Arc::new(ReconciliationSweep::new(
            service.clone(),
            slots,
            booking.reconciliation_grace(),
            booking.sweep_batch_size,
        )));
        // Slot events and payment outcomes are both keyed by reservation, so
        // one consumer keeps each reservation's history on one worker.
        self.consumer(
            reservation::CONSUMER,
            &[topics::SLOT_EVENTS, topics::PAYMENT_OUTCOMES],
            bus,
            Arc::new(OrderEventHandler::new(service.clone())),
        )?;
        self.merge(api::bookings::routes(service));
        Ok(())
    }

    fn payment(&mut self) -> anyhow::Result<()> {
        let config = self.config;
        let bus = self.buses.for_service(config, payment::CONSUMER)?;
        let gateway_config = &config.gateway;
        let verifier = CallbackVerifier::new(&gateway_config.webhook_secret, gateway_config.signature_tolerance())
            .context("keying the webhook verifier")?;

        let mut settlements = None;
        let gateway: Arc<dyn PaymentGateway> = if gateway_config.is_remote() {
            Arc::new(
                HttpPaymentGateway::new(
                    gateway_config.base_url.clone(),
                    gateway_config.api_key.clone(),
                    Duration::from_secs(gateway_config.request_timeout_secs),
                )
                .context("building the gateway client")?,
            )
        } else {
            warn!("No GATEWAY_BASE_URL set, using the mock gateway; every charge succeeds");
            let (tx, rx) = mpsc::unbounded_channel();
            settlements = Some(rx);
            Arc::new(MockPaymentGateway::new().settling_into(tx))
        };

        let adapter = SettlementAdapter::new(
            self.storage.intents(),
            gateway,
            self.publisher(&bus),
            verifier,
            Arc::clone(&self.clock),
            self.config.consumer.retry_policy(),
            self.config.booking.settlement_timeout(),
        );
        if let Some(rx) = settlements {
            self.background.push(spawn_mock_settlement(
                adapter.clone(),
                Arc::clone(&self.clock),
                rx,
                self.shutdown_tx.subscribe(),
            ));
        }

        self.consumer(
            payment::CONSUMER,
            &[topics::PAYMENT_REQUESTS],
            bus,
            Arc::new(PaymentRequestHandler::new(adapter.clone())),
        )?;
        self.sweeps.push(Arc::new(SettlementExpirySweep::new(
            adapter.clone(),
            self.config.booking.sweep_batch_size,
        )));
        self.merge(api::webhooks::routes(adapter));
        Ok(())
    }

    fn merge(&mut self, routes: Router) {
        self.routes = std::mem::take(&mut self.routes).merge(routes);
    }
}

/// Deliver a signed success callback for every mock charge, the way a real
/// gateway would call the webhook.
fn spawn_mock_settlement(
    adapter: SettlementAdapter,
    clock: Arc<dyn Clock>,
    mut charges: mpsc::UnboundedReceiver<String>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let gateway_ref = tokio::select! {
                _ = shutdown.recv() => break,
                charge = charges.recv() => match charge {
                    Some(gateway_ref) => gateway_ref,
                    None => break,
                },
            };
            let callback = GatewayCallback {
                gateway_ref,
                status: CallbackStatus::Succeeded,
                failure_reason: None,
            };
            let body = match serde_json::to_vec(&callback) {
                Ok(body) => body,
                Err(e) => {
                    error!(error = %e, "Could not encode mock callback");
                    continue;
                }
            };
            let signature = adapter.verifier().sign(&body, clock.now());
            if let Err(e) = adapter.handle_webhook(&signature, &body).await {
                warn!(gateway_ref = %callback.gateway_ref, error = %e, "Mock settlement failed");
            }
        }
    })
}

impl Application {
    /// Wire `roles` on the configured backends.
    ///
    /// # Errors
    ///
    /// Fails if a backend cannot be reached or a component cannot be built.
    pub async fn build(config: Config, roles: Roles) -> anyhow::Result<Self> {
        if config.backend.bus == BusBackend::Memory && !roles.is_all() {
            warn!("The in-memory bus only connects services in this process; use BUS_BACKEND=redpanda");
        }
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let (shutdown_tx, _) = broadcast::channel(1);
        let storage = Storage::connect(&config).await?;
        let buses = match config.backend.bus {
            BusBackend::Memory => Buses::Memory(InMemoryEventBus::new()),
            BusBackend::Redpanda => Buses::Redpanda,
        };

        let mut assembly = Assembly {
            config: &config,
            storage: &storage,
            buses: &buses,
            clock: Arc::clone(&clock),
            shutdown_tx: &shutdown_tx,
            routes: Router::new(),
            probes: storage.probe().into_iter().collect(),
            consumers: Vec::new(),
            sweeps: Vec::new(),
            background: Vec::new(),
        };
        if roles.field {
            assembly.field()?;
        }
        if roles.order {
            let local_ledger = roles.field || config.backend.storage == StorageBackend::Postgres;
            assembly.order(local_ledger)?;
        }
        if roles.payment {
            assembly.payment()?;
        }

        let Assembly {
            routes,
            probes,
            consumers,
            sweeps,
            background,
            ..
        } = assembly;
        let sweeper = sweeps.into_iter().fold(
            Sweeper::new(Arc::clone(&clock), config.booking.sweep_interval(), shutdown_tx.subscribe()),
            Sweeper::with_sweep,
        );

        info!(
            storage = %config.backend.storage,
            bus = %config.backend.bus,
            consumers = consumers.len(),
            ?roles,
            "Application wired"
        );
        Ok(Self {
            router: api::app(routes, probes, clock),
            config,
            consumers,
            sweeper,
            background,
            shutdown_tx,
        })
    }

    /// Start the metrics exporter, consumers and sweeps, then serve HTTP
    /// until a shutdown signal.
    ///
    /// # Errors
    ///
    /// Fails if the metrics exporter or the HTTP listener cannot bind.
    pub async fn run(self) -> anyhow::Result<()> {
        let server = &self.config.server;
        if server.metrics_port != 0 {
            let addr: SocketAddr = server.metrics_address().parse().context("parsing the metrics address")?;
            MetricsServer::new(addr).start().context("starting the metrics exporter")?;
            crate::metrics::register_business_metrics();
        }

        let mut tasks: Vec<JoinHandle<()>> = self.consumers.into_iter().map(EventConsumer::spawn).collect();
        tasks.push(self.sweeper.spawn());
        tasks.extend(self.background);

        let listener = TcpListener::bind(server.bind_address())
            .await
            .with_context(|| format!("binding {}", server.bind_address()))?;
        info!(address = %server.bind_address(), "HTTP server listening");
        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("serving HTTP")?;

        info!("HTTP server stopped, shutting down background tasks");
        let _ = self.shutdown_tx.send(());
        let timeout = Duration::from_secs(server.shutdown_timeout_secs);
        for (index, task) in tasks.into_iter().enumerate() {
            match tokio::time::timeout(timeout, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = index, error = %e, "Background task failed"),
                Err(_) => warn!(task = index, "Background task did not stop in time"),
            }
        }
        info!("Shutdown complete");
        Ok(())
    }

    /// The HTTP application, for in-process tests.
    #[must_use]
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}
