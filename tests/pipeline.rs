use std::sync::Arc;
use std::time::Duration;

use rust_decimal_macros::dec;
use serde_json::json;
use settlement_worker::{
    bootstrap::{build_pipeline, Pipeline},
    config::Config,
    ledger::{
        models::{NewPayment, NewRefund, PaymentStatus, RefundStatus, Tenant, WebhookStatus},
        InMemoryLedger, LedgerStore,
    },
    queue::{EnqueueOptions, InMemoryJobQueue, JobPayload, JobQueue, QueueName},
    retry::{RetryPolicies, RetryPolicy},
    settlement::{ScriptedSettlement, SettlementStrategy},
    webhook::{HttpWebhookClient, WebhookTransport},
    worker::{Consumer, Disposition, JobHandler, WorkerRole, WorkerSupervisor},
};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Fixture {
    ledger: Arc<InMemoryLedger>,
    queue: Arc<InMemoryJobQueue>,
    pipeline: Pipeline,
}

fn test_config() -> Config {
    let mut config = Config::from_env().expect("default configuration");
    config.settlement_timeout_secs = 2;
    config.webhook_timeout_secs = 2;
    config.poll_interval_ms = 10;
    config
}

async fn fixture(webhook_url: Option<String>, strategy: ScriptedSettlement) -> Fixture {
    let ledger = Arc::new(InMemoryLedger::new());
    ledger
        .insert_tenant(Tenant {
            id: "t_1".into(),
            name: "Acme Stores".into(),
            webhook_url,
        })
        .await;

    let queue = Arc::new(InMemoryJobQueue::new(RetryPolicies::uniform(
        RetryPolicy::immediate(3),
    )));
    let strategy: Arc<dyn SettlementStrategy> = Arc::new(strategy);
    let transport: Arc<dyn WebhookTransport> =
        Arc::new(HttpWebhookClient::new(Duration::from_secs(2), None).unwrap());

    let pipeline = build_pipeline(
        &test_config(),
        ledger.clone(),
        queue.clone(),
        strategy,
        transport,
    );

    Fixture {
        ledger,
        queue,
        pipeline,
    }
}

impl Fixture {
    fn consumer(&self, role: WorkerRole) -> Consumer {
        let handler: Arc<dyn JobHandler> = self
            .pipeline
            .handlers
            .iter()
            .find(|handler| handler.role() == role)
            .cloned()
            .unwrap();
        Consumer::new(
            self.pipeline.queue.clone(),
            handler,
            self.pipeline.registry.clone(),
            format!("{}-test", role),
            Duration::from_millis(10),
        )
    }

    async fn submit_payment(&self, id: &str, amount: rust_decimal::Decimal) {
        self.pipeline
            .intake
            .submit_payment(NewPayment {
                id: id.into(),
                tenant_id: "t_1".into(),
                amount,
                currency: "INR".into(),
                method: Some("card".into()),
                metadata: json!({}),
            })
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn payment_settles_and_tenant_is_notified() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks"))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let f = fixture(
        Some(format!("{}/hooks", server.uri())),
        ScriptedSettlement::default(),
    )
    .await;
    f.submit_payment("pay_1", dec!(500)).await;

    let payments = f.consumer(WorkerRole::Payment);
    assert_eq!(payments.process_next().await.unwrap(), Some(Disposition::Acked));

    let payment = f.ledger.get_payment("pay_1").await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);

    let events = f.queue.jobs(QueueName::WebhookDelivery);
    assert_eq!(events.len(), 1);
    let JobPayload::Webhook(event) = &events[0].0.payload else {
        panic!("expected a webhook event");
    };
    assert_eq!(event.event_type, "payment.completed");

    let webhooks = f.consumer(WorkerRole::Webhook);
    assert_eq!(webhooks.process_next().await.unwrap(), Some(Disposition::Acked));

    let log = f.ledger.get_webhook_log(event.log_id).await.unwrap().unwrap();
    assert_eq!(log.status, WebhookStatus::Delivered);
    assert_eq!(log.attempts, 1);

    let received = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(body["eventType"], "payment.completed");
    assert_eq!(body["payload"]["id"], "pay_1");
    assert_eq!(body["payload"]["amount"], 500.0);
    assert_eq!(body["payload"]["currency"], "INR");
}

#[tokio::test]
async fn transient_failures_recover_within_budget() {
    let f = fixture(None, ScriptedSettlement::fail_then_succeed(2)).await;
    f.submit_payment("pay_2", dec!(250)).await;

    let payments = f.consumer(WorkerRole::Payment);
    let mut dispositions = Vec::new();
    while let Some(disposition) = payments.process_next().await.unwrap() {
        dispositions.push(disposition);
    }

    assert_eq!(dispositions.len(), 3);
    assert_eq!(dispositions.last(), Some(&Disposition::Acked));

    let payment = f.ledger.get_payment("pay_2").await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);

    let jobs = f.queue.jobs(QueueName::PaymentProcessing);
    assert_eq!(jobs[0].0.attempts, 3);
    assert!(f
        .queue
        .dead_letters(QueueName::PaymentProcessing, 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn refund_against_pending_payment_fails_permanently() {
    let f = fixture(None, ScriptedSettlement::default()).await;
    f.submit_payment("pay_3", dec!(500)).await;

    f.pipeline
        .intake
        .submit_refund(NewRefund {
            id: "rfnd_1".into(),
            payment_id: "pay_3".into(),
            tenant_id: "t_1".into(),
            amount: dec!(100),
            reason: Some("customer request".into()),
        })
        .await
        .unwrap();

    let refunds = f.consumer(WorkerRole::Refund);
    assert_eq!(refunds.process_next().await.unwrap(), Some(Disposition::Acked));
    assert_eq!(refunds.process_next().await.unwrap(), None);

    let refund = f.ledger.get_refund("rfnd_1").await.unwrap().unwrap();
    assert_eq!(refund.status, RefundStatus::Failed);
    assert_eq!(refund.reason.as_deref(), Some("customer request"));
    assert!(refund
        .failure_reason
        .is_some_and(|reason| reason.contains("pending")));

    let stats = f.queue.stats(QueueName::RefundProcessing).await.unwrap();
    assert_eq!((stats.waiting, stats.failed), (0, 0));
}

#[tokio::test]
async fn store_outage_dead_letters_on_third_attempt() {
    let f = fixture(None, ScriptedSettlement::default()).await;
    f.submit_payment("pay_4", dec!(75)).await;
    f.ledger.set_unavailable(true);

    let payments = f.consumer(WorkerRole::Payment);
    let first = payments.process_next().await.unwrap();
    let second = payments.process_next().await.unwrap();
    let third = payments.process_next().await.unwrap();

    assert!(matches!(first, Some(Disposition::Requeued(_))));
    assert!(matches!(second, Some(Disposition::Requeued(_))));
    assert_eq!(third, Some(Disposition::DeadLettered));
    assert_eq!(payments.process_next().await.unwrap(), None);

    let dead = f
        .queue
        .dead_letters(QueueName::PaymentProcessing, 10)
        .await
        .unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 3);
}

#[tokio::test]
async fn redelivered_webhook_is_logged_as_another_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_json(json!({"eventType": "payment.completed", "payload": {"id": "pay_5"}})))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let f = fixture(Some(server.uri()), ScriptedSettlement::default()).await;
    let event = settlement_worker::queue::WebhookEvent::new(
        "t_1",
        "payment.completed",
        json!({"id": "pay_5"}),
    );

    // Same event twice, as after a lost acknowledgement
    for _ in 0..2 {
        f.queue
            .enqueue(
                QueueName::WebhookDelivery,
                JobPayload::Webhook(event.clone()),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();
    }

    let webhooks = f.consumer(WorkerRole::Webhook);
    assert_eq!(webhooks.process_next().await.unwrap(), Some(Disposition::Acked));
    assert_eq!(webhooks.process_next().await.unwrap(), Some(Disposition::Acked));

    let log = f.ledger.get_webhook_log(event.log_id).await.unwrap().unwrap();
    assert_eq!(log.status, WebhookStatus::Delivered);
    assert_eq!(log.attempts, 2);
    assert_eq!(
        f.ledger.list_webhook_attempts(event.log_id).await.unwrap().len(),
        2
    );

    let received = server.received_requests().await.unwrap();
    assert_eq!(received[0].body, received[1].body);
    assert_eq!(
        received[0].headers.get("x-webhook-id"),
        received[1].headers.get("x-webhook-id")
    );
}

#[tokio::test]
async fn supervisor_drives_payment_to_delivered_notification() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let f = fixture(Some(server.uri()), ScriptedSettlement::default()).await;
    f.submit_payment("pay_6", dec!(42)).await;

    let cancel = CancellationToken::new();
    let supervisor = WorkerSupervisor::start(
        f.pipeline.queue.clone(),
        f.pipeline.handlers.clone(),
        f.pipeline.registry.clone(),
        1,
        Duration::from_millis(10),
        cancel.clone(),
    );

    let delivered = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let page = f.ledger.list_webhook_logs("t_1", 10, 0).await.unwrap();
            if page
                .data
                .iter()
                .any(|log| log.status == WebhookStatus::Delivered)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    supervisor.shutdown().await;

    assert!(delivered.is_ok(), "notification was not delivered in time");
    let status = f.pipeline.status.pipeline_status().await.unwrap();
    assert_eq!(status.worker_status, "stopped");
    assert!(status.stuck.payments.is_empty());
}
