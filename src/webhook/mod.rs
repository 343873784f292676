// Webhook delivery - outbound transport and the dispatch worker
pub mod client;
pub mod dispatcher;

pub use client::{DeliveryReceipt, HttpWebhookClient, WebhookRequest, WebhookTransport};
pub use dispatcher::WebhookDispatchWorker;
