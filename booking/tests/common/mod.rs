//! In-process wiring of all three services for integration tests.
//!
//! Everything runs on the in-memory backends with a [`ManualClock`]. The
//! consumers run as background tasks like in production; sweeps are run by
//! hand so tests decide when deadlines are checked.

#![allow(dead_code, clippy::unwrap_used, clippy::panic)]

use booking::events::topics;
use booking::field::{self, HoldExpirySweep, SlotCommandHandler};
use booking::ledger::{InMemorySlotLedger, Slot, SlotLedger, SlotStatus};
use booking::payment::{
    self, CallbackStatus, CallbackVerifier, GatewayCallback, InMemoryPaymentIntentRepository, MockPaymentGateway,
    PaymentRequestHandler, SettlementAdapter, SettlementExpirySweep,
};
use booking::publisher::Publisher;
use booking::reservation::{
    self, BookingRequest, InMemoryReservationRepository, OrderEventHandler, PaymentTimeoutSweep,
    ReconciliationSweep, Reservation, ReservationEnvironment, ReservationService, ReservationStatus,
};
use booking::types::{FieldId, Money, ReservationId, SlotId, TimeRange, UserId};
use chrono::Duration;
use fieldbook_core::environment::Clock;
use fieldbook_core::event_bus::EventBus;
use fieldbook_runtime::{EventConsumer, EventHandler, InMemoryDeadLetterQueue, RetryPolicy, Sweep};
use fieldbook_testing::{InMemoryEventBus, ManualClock, eventually, test_clock};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

pub const HOLD_TTL: i64 = 15;
pub const PAYMENT_TIMEOUT: i64 = 10;
pub const SETTLEMENT_TIMEOUT: i64 = 5;
pub const WEBHOOK_SECRET: &str = "whsec_test";

const WAIT: std::time::Duration = std::time::Duration::from_secs(5);

pub struct Harness {
    pub clock: ManualClock,
    pub bus: InMemoryEventBus,
    pub ledger: InMemorySlotLedger,
    pub gateway: MockPaymentGateway,
    pub service: ReservationService,
    pub adapter: SettlementAdapter,
    pub dead_letters: InMemoryDeadLetterQueue,
    pub hold_expiry: HoldExpirySweep,
    pub payment_timeout: PaymentTimeoutSweep,
    pub reconciliation: ReconciliationSweep,
    pub settlement_expiry: SettlementExpirySweep,
    charges: mpsc::UnboundedReceiver<String>,
    shutdown: broadcast::Sender<()>,
}

impl Harness {
    pub async fn start() -> Self {
        let clock = ManualClock::starting_at(test_clock().now());
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let bus = InMemoryEventBus::new();
        let dyn_bus: Arc<dyn EventBus> = Arc::new(bus.clone());
        let publisher = Publisher::new(Arc::clone(&dyn_bus), RetryPolicy::none());
        let ledger = InMemorySlotLedger::new();
        let (tx, charges) = mpsc::unbounded_channel();
        let gateway = MockPaymentGateway::new().settling_into(tx);

        let service = ReservationService::new(
            Arc::new(InMemoryReservationRepository::new()),
            publisher.clone(),
            ReservationEnvironment {
                clock: Arc::clone(&shared_clock),
                hold_ttl: Duration::minutes(HOLD_TTL),
                payment_timeout: Duration::minutes(PAYMENT_TIMEOUT),
            },
            Money::new(4500, "EUR"),
        );
        let adapter = SettlementAdapter::new(
            Arc::new(InMemoryPaymentIntentRepository::new()),
            Arc::new(gateway.clone()),
            publisher.clone(),
            CallbackVerifier::new(WEBHOOK_SECRET, Duration::minutes(5)).unwrap(),
            Arc::clone(&shared_clock),
            RetryPolicy::none(),
            Duration::minutes(SETTLEMENT_TIMEOUT),
        );

        let (shutdown, _) = broadcast::channel(1);
        let dead_letters = InMemoryDeadLetterQueue::new(100);
        let consumers: [(&str, Vec<String>, Arc<dyn EventHandler>); 3] = [
            (
                field::CONSUMER,
                vec![topics::SLOT_COMMANDS.to_string()],
                Arc::new(SlotCommandHandler::new(
                    Arc::new(ledger.clone()),
                    publisher.clone(),
                    Arc::clone(&shared_clock),
                )),
            ),
            (
                reservation::CONSUMER,
                vec![topics::SLOT_EVENTS.to_string(), topics::PAYMENT_OUTCOMES.to_string()],
                Arc::new(OrderEventHandler::new(service.clone())),
            ),
            (
                payment::CONSUMER,
                vec![topics::PAYMENT_REQUESTS.to_string()],
                Arc::new(PaymentRequestHandler::new(adapter.clone())),
            ),
        ];
        for (name, topics, handler) in consumers {
            EventConsumer::builder()
                .name(name)
                .topics(topics)
                .event_bus(Arc::clone(&dyn_bus))
                .handler(handler)
                .dead_letters(Arc::new(dead_letters.clone()))
                .retry(RetryPolicy::none())
                .clock(Arc::clone(&shared_clock))
                .workers(2)
                .shutdown(shutdown.subscribe())
                .build()
                .unwrap()
                .spawn();
        }
        assert!(eventually(WAIT, || async { bus.subscriber_count() == 3 }).await);

        Self {
            hold_expiry: HoldExpirySweep::new(Arc::new(ledger.clone()), publisher, 100),
            payment_timeout: PaymentTimeoutSweep::new(service.clone(), 100),
            reconciliation: ReconciliationSweep::new(
                service.clone(),
                Arc::new(ledger.clone()),
                Duration::minutes(1),
                100,
            ),
            settlement_expiry: SettlementExpirySweep::new(adapter.clone(), 100),
            clock,
            bus,
            ledger,
            gateway,
            service,
            adapter,
            dead_letters,
            charges,
            shutdown,
        }
    }

    pub async fn slot(&self) -> SlotId {
        let now = self.clock.now();
        let time = TimeRange::new(now + Duration::days(1), now + Duration::days(1) + Duration::hours(1)).unwrap();
        let id = SlotId::new();
        self.ledger.create_slot(Slot::new(id, FieldId::new(), time, now)).await.unwrap();
        id
    }

    pub async fn book(&self, slot_id: SlotId, key: &str) -> Reservation {
        self.service
            .book(BookingRequest {
                slot_id,
                user_id: UserId::new(),
                idempotency_key: key.to_string(),
            })
            .await
            .unwrap()
    }

    pub async fn reservation(&self, id: ReservationId) -> Reservation {
        self.service.get(id).await.unwrap().unwrap()
    }

    pub async fn slot_status(&self, id: SlotId) -> SlotStatus {
        self.ledger.get(id).await.unwrap().unwrap().status
    }

    /// Wait until the reservation reaches `status`.
    pub async fn reaches(&self, id: ReservationId, status: ReservationStatus) -> bool {
        eventually(WAIT, || async { self.reservation(id).await.status == status }).await
    }

    /// Wait until the slot reaches `status`.
    pub async fn slot_reaches(&self, id: SlotId, status: SlotStatus) -> bool {
        eventually(WAIT, || async { self.slot_status(id).await == status }).await
    }

    /// Gateway reference of the next charge the payment service creates.
    pub async fn next_charge(&mut self) -> String {
        tokio::time::timeout(WAIT, self.charges.recv())
            .await
            .unwrap_or_else(|_| panic!("no charge created"))
            .unwrap()
    }

    /// Deliver a signed gateway callback through the webhook entry point.
    pub async fn callback(&self, gateway_ref: &str, status: CallbackStatus) -> payment::CallbackOutcome {
        let body = serde_json::to_vec(&GatewayCallback {
            gateway_ref: gateway_ref.to_string(),
            status,
            failure_reason: None,
        })
        .unwrap();
        let signature = self.adapter.verifier().sign(&body, self.clock.now());
        self.adapter.handle_webhook(&signature, &body).await.unwrap()
    }

    pub async fn run_sweep(&self, sweep: &dyn Sweep) -> usize {
        sweep.run(self.clock.now()).await.unwrap()
    }

    /// Every deadline sweep once, in the order the sweeper registers them.
    pub async fn sweep_all(&self) {
        self.run_sweep(&self.hold_expiry).await;
        self.run_sweep(&self.payment_timeout).await;
        self.run_sweep(&self.reconciliation).await;
        self.run_sweep(&self.settlement_expiry).await;
    }

    /// Distinct event ids published with `event_type` on `topic`.
    pub fn distinct_events(&self, topic: &str, event_type: &str) -> usize {
        let mut ids: Vec<_> = self
            .bus
            .published(topic)
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .map(|e| e.event_id)
            .collect();
        ids.sort();
        ids.dedup();
        ids.len()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}
